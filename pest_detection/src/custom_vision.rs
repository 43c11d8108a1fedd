use crate::{
    config::CustomVisionConfig,
    prediction::{parse_predictions, Prediction},
    prediction_service::{PredictionService, PredictionServiceError},
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::CONTENT_TYPE, Client};
use tokio::time::{sleep, Duration};
use tracing::instrument;

const PREDICTION_KEY_HEADER: &str = "Prediction-Key";

/// Client for the Custom Vision "detect image" prediction endpoint.
pub struct CustomVisionClient {
    client: Client,
    detect_url: String,
    prediction_key: String,
    max_retries: u32,
}

impl CustomVisionClient {
    pub fn new(config: &CustomVisionConfig) -> Result<Self, PredictionServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let detect_url = detect_url(config);
        tracing::info!(
            "Custom Vision client configured: url={}, max_retries={}",
            detect_url,
            config.max_retries
        );

        Ok(Self {
            client,
            detect_url,
            prediction_key: config.prediction_key.clone(),
            max_retries: config.max_retries,
        })
    }

    async fn send(&self, image_data: Bytes) -> Result<Vec<Prediction>, PredictionServiceError> {
        let response = self
            .client
            .post(&self.detect_url)
            .header(PREDICTION_KEY_HEADER, &self.prediction_key)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(image_data)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PredictionServiceError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let payload: serde_json::Value = response.json().await?;
        Ok(parse_predictions(&payload)?)
    }
}

fn detect_url(config: &CustomVisionConfig) -> String {
    format!(
        "{}/customvision/v3.0/Prediction/{}/detect/iterations/{}/image",
        config.endpoint.trim_end_matches('/'),
        config.project_id,
        config.model_name
    )
}

#[async_trait]
impl PredictionService for CustomVisionClient {
    #[instrument(skip(self, image_data), fields(bytes = image_data.len()))]
    async fn predict(&self, image_data: Vec<u8>) -> Result<Vec<Prediction>, PredictionServiceError> {
        let image_data = Bytes::from(image_data);
        let mut retry_delay = Duration::from_millis(50);
        let max_retry_delay = Duration::from_secs(1);
        let mut retry_count = 0;

        loop {
            match self.send(image_data.clone()).await {
                Ok(predictions) => {
                    tracing::debug!("Received {} predictions", predictions.len());
                    return Ok(predictions);
                }
                Err(e) if e.is_transient() && retry_count < self.max_retries => {
                    retry_count += 1;
                    tracing::warn!(
                        "Prediction request failed, retrying (attempt {}/{}): {}",
                        retry_count,
                        self.max_retries,
                        e
                    );
                }
                Err(e) => {
                    tracing::error!("Prediction request failed: {}", e);
                    return Err(e);
                }
            }

            let jitter = rand::random::<f32>() * 0.2 + 0.9;
            sleep(retry_delay.mul_f32(jitter)).await;
            retry_delay = (retry_delay * 2).min(max_retry_delay);
        }
    }
}
