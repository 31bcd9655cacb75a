// HTTP InferenceClient
// reason: reqwest for async HTTP, 503 retried with a fixed delay

use async_trait::async_trait;
use gateway_core::domain::{InferenceConfig, InferenceId};
use gateway_core::port::{InferenceClient, InferenceError, InferenceStatus};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the shared secret on every request
pub const AUTH_HEADER: &str = "API_AUTH_SECRET";

#[derive(Deserialize)]
struct StartResponse {
    inference_id: String,
}

/// Client of the remote inference service
pub struct HttpInferenceClient {
    client: Client,
    base_url: String,
    auth_secret: String,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig) -> Result<Self, InferenceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| InferenceError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(config, client))
    }

    /// Use a preconfigured reqwest client
    pub fn with_client(config: &InferenceConfig, client: Client) -> Self {
        Self {
            client,
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            auth_secret: config.auth_secret.clone(),
            retry_attempts: config.unavailable_retry_attempts.max(1),
            retry_delay: Duration::from_millis(config.unavailable_retry_delay_ms),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request, retrying while the service answers 503
    async fn send_with_retry<F>(&self, build: F) -> Result<Response, InferenceError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 1;
        loop {
            let response = build()
                .header(AUTH_HEADER, &self.auth_secret)
                .send()
                .await
                .map_err(|e| InferenceError::Transport(e.to_string()))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                let body = response.text().await.unwrap_or_default();
                return Err(InferenceError::Unauthorized(format!("{} {}", status.as_u16(), body)));
            }
            if status != StatusCode::SERVICE_UNAVAILABLE {
                return Ok(response);
            }

            if attempt >= self.retry_attempts {
                return Err(InferenceError::Unavailable(format!(
                    "{} after {} attempts",
                    response.url(),
                    attempt
                )));
            }
            warn!(
                url = %response.url(),
                attempt,
                max_attempts = self.retry_attempts,
                delay_ms = self.retry_delay.as_millis() as u64,
                "Inference service unavailable, retrying"
            );
            attempt += 1;
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    async fn rejected(response: Response) -> InferenceError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        InferenceError::Rejected { status, message }
    }
}

/// Start responses carry either `{"inference_id": ...}` or the bare id
fn parse_inference_id(body: &str) -> Result<InferenceId, InferenceError> {
    let id = match serde_json::from_str::<StartResponse>(body) {
        Ok(parsed) => parsed.inference_id,
        Err(_) => body.trim().trim_matches('"').to_string(),
    };
    if id.is_empty() {
        return Err(InferenceError::Transport(
            "start response did not contain an inference id".to_string(),
        ));
    }
    Ok(id)
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn ping(&self) -> Result<(), InferenceError> {
        let url = self.url("/v1/ping");
        let response = self.send_with_retry(|| self.client.get(&url)).await?;
        if response.status().is_success() {
            debug!(base_url = %self.base_url, "Inference service reachable");
            Ok(())
        } else {
            Err(Self::rejected(response).await)
        }
    }

    async fn start_inference(
        &self,
        model_id: &str,
        archive: Vec<u8>,
    ) -> Result<InferenceId, InferenceError> {
        let url = self.url(&format!("/v1/model/start/{}", model_id));
        let response = self
            .send_with_retry(|| {
                self.client
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(archive.clone())
            })
            .await?;

        if !response.status().is_success() {
            return Err(Self::rejected(response).await);
        }
        let body = response
            .text()
            .await
            .map_err(|e| InferenceError::Transport(e.to_string()))?;
        parse_inference_id(&body)
    }

    async fn get_result(&self, inference_id: &str) -> Result<InferenceStatus, InferenceError> {
        let url = self.url(&format!("/v1/model/results/{}", inference_id));
        let response = self.send_with_retry(|| self.client.get(&url)).await?;

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            return Ok(InferenceStatus::Running);
        }
        if status.is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| InferenceError::Transport(e.to_string()))?;
            return Ok(InferenceStatus::Completed(bytes.to_vec()));
        }
        if status.is_client_error() {
            let message = response.text().await.unwrap_or_default();
            return Ok(InferenceStatus::Failed(format!(
                "{}: {}",
                status.as_u16(),
                message
            )));
        }
        Err(Self::rejected(response).await)
    }
}
