use crate::{
    overlay::DetectionSummary, prediction_service::PredictionServiceError,
    server::SharedState, storage::StorageError,
};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

const ROUTE: &str = "/detect";
const IMAGE_FIELD: &str = "image";

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("No file uploaded")]
    MissingImage,
    #[error("No file selected")]
    NoFileSelected,
    #[error("Invalid multipart request: {0}")]
    InvalidRequest(#[from] MultipartRejection),
    #[error("Failed to read upload: {0}")]
    Upload(#[from] MultipartError),
    #[error("Failed to decode image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error(transparent)]
    PredictionService(#[from] PredictionServiceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Rendering task failed: {0}")]
    Render(#[from] tokio::task::JoinError),
}

impl IntoResponse for DetectError {
    fn into_response(self) -> Response {
        let status = match self {
            DetectError::MissingImage
            | DetectError::NoFileSelected
            | DetectError::InvalidRequest(_)
            | DetectError::Upload(_)
            | DetectError::InvalidImage(_) => StatusCode::BAD_REQUEST,
            DetectError::PredictionService(_)
            | DetectError::Storage(_)
            | DetectError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!("Detection failed: {}", self);
        } else {
            tracing::warn!("Rejected detection request: {}", self);
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct DetectResponse {
    pub message: &'static str,
    pub output_file: String,
    pub pests: Vec<DetectionSummary>,
}

struct Upload {
    file_name: String,
    data: Bytes,
}

async fn read_image_field(multipart: &mut Multipart) -> Result<Upload, DetectError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        if file_name.is_empty() {
            return Err(DetectError::NoFileSelected);
        }

        let data = field.bytes().await?;
        return Ok(Upload { file_name, data });
    }

    Err(DetectError::MissingImage)
}

#[instrument(skip(state, multipart))]
pub async fn detect(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectResponse>, DetectError> {
    state.metrics.record_request(ROUTE);

    let upload = read_image_field(&mut multipart?).await?;
    let key = state.storage.new_key();
    tracing::debug!(
        "Saving upload {} ({} bytes) as {}",
        upload.file_name,
        upload.data.len(),
        key
    );
    state
        .storage
        .save_upload(&key, &upload.file_name, &upload.data)
        .await?;

    let data = upload.data.clone();
    let mut image = tokio::task::spawn_blocking(move || image::load_from_memory(&data))
        .await??
        .into_rgb8();
    tracing::debug!("Image size: {}x{}", image.width(), image.height());

    let started = Instant::now();
    let predictions = state
        .prediction_service
        .predict(upload.data.to_vec())
        .await?;
    state
        .metrics
        .record_prediction_duration(started.elapsed().as_millis() as u64, ROUTE);

    let renderer = state.renderer.clone();
    let storage = state.storage.clone();
    let (file_name, pests) = tokio::task::spawn_blocking(move || {
        let pests = renderer.render(&mut image, &predictions);
        storage
            .save_annotated(&key, &image)
            .map(|file_name| (file_name, pests))
    })
    .await??;

    for pest in &pests {
        state.metrics.record_detection(&pest.name);
    }
    tracing::info!("Detection complete: {} pests, output {}", pests.len(), file_name);

    Ok(Json(DetectResponse {
        message: "Detection complete",
        output_file: state.storage.public_path(&file_name),
        pests,
    }))
}
