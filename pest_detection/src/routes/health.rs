use axum::{response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
    version: &'static str,
}

pub async fn healthcheck() -> impl IntoResponse {
    Json(Health {
        status: "Available",
        version: env!("CARGO_PKG_VERSION"),
    })
}
