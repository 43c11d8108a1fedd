use crate::prediction::{Prediction, PredictionError};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictionServiceError {
    #[error("Prediction request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Prediction service answered {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("Invalid prediction response: {0}")]
    InvalidResponse(#[from] PredictionError),
}

impl PredictionServiceError {
    /// Whether sending the same request again may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PredictionServiceError::RequestFailed(e) => e.is_timeout() || e.is_connect(),
            PredictionServiceError::UnexpectedStatus { status, .. } => {
                *status == 429 || *status >= 500
            }
            PredictionServiceError::InvalidResponse(_) => false,
        }
    }
}

#[async_trait]
pub trait PredictionService: Send + Sync + 'static {
    async fn predict(&self, image_data: Vec<u8>) -> Result<Vec<Prediction>, PredictionServiceError>;
}
