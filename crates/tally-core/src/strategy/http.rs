//! JSON-over-HTTP recognition backends.
//!
//! Each backend is a single endpoint: the normalized PNG is POSTed as the
//! request body and the endpoint answers with the backend's native JSON
//! output (`VisionAnswer`, `OcrPage`, `[Detection]` or `[RowMatch]`).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::classical::{ClassicalPipeline, RowMatch};
use super::detection::{Detection, Detector};
use super::ocr::{OcrEngine, OcrPage};
use super::vision::{VisionAnswer, VisionModelClient};
use super::BackendError;
use crate::domain::BallotTemplate;

const TEMPLATE_HEADER: &str = "x-ballot-template";

/// A remote recognition backend reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            token: None,
            client,
        })
    }

    /// Send a bearer token with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post<T: DeserializeOwned>(
        &self,
        png: &[u8],
        template: Option<&str>,
    ) -> Result<T, BackendError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(png.to_vec());
        if let Some(template) = template {
            request = request.header(TEMPLATE_HEADER, template);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        debug!(endpoint = %self.endpoint, bytes = bytes.len(), "backend responded");
        serde_json::from_slice(&bytes).map_err(|e| BackendError::Decode(e.to_string()))
    }
}

#[async_trait]
impl VisionModelClient for HttpBackend {
    async fn analyze(
        &self,
        png: &[u8],
        template: &BallotTemplate,
    ) -> Result<VisionAnswer, BackendError> {
        self.post(png, Some(&template.id)).await
    }
}

#[async_trait]
impl OcrEngine for HttpBackend {
    async fn recognize(&self, png: &[u8]) -> Result<OcrPage, BackendError> {
        self.post(png, None).await
    }
}

#[async_trait]
impl Detector for HttpBackend {
    async fn detect(&self, png: &[u8]) -> Result<Vec<Detection>, BackendError> {
        self.post(png, None).await
    }
}

#[async_trait]
impl ClassicalPipeline for HttpBackend {
    async fn match_rows(&self, png: &[u8]) -> Result<Vec<RowMatch>, BackendError> {
        self.post(png, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        // Nothing listens on the discard port locally.
        let backend = HttpBackend::new("http://127.0.0.1:9/ocr").unwrap();
        let err = backend.recognize(b"png").await.unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)));

        let strategy_err: crate::strategy::StrategyError = err.into();
        assert!(strategy_err.is_transient());
    }

    #[test]
    fn test_token_is_kept() {
        let backend = HttpBackend::new("http://localhost/vision")
            .unwrap()
            .with_token("secret");
        assert_eq!(backend.endpoint(), "http://localhost/vision");
        assert_eq!(backend.token.as_deref(), Some("secret"));
    }
}
