mod custom_vision;
mod overlay;
mod prediction;
mod prediction_service;
mod routes;
mod server;
mod storage;
mod telemetry;

pub mod app;
pub mod config;

pub use app::start_app;
