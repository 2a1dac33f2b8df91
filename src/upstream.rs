use bytes::Bytes;
use futures_util::stream::Stream;
use futures_util::TryStreamExt;
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;

use crate::normalize::{Effort, NormalizedInput};

/// Default inference worker.
pub const DEFAULT_UPSTREAM_URL: &str = "https://lxd.morttzia-me-3600.workers.dev/";
/// Model identifier sent with every upstream call.
pub const DEFAULT_MODEL: &str = "@cf/openai/gpt-oss-120b";

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream returned status {status}")]
    Status { status: u16, body: String },
    #[error("upstream response was not valid JSON: {0}")]
    Malformed(String),
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct Reasoning<'a> {
    effort: &'a Effort,
}

/// Wire body accepted by the inference worker.
#[derive(Debug, Serialize)]
struct UpstreamRequest<'a> {
    model: &'a str,
    input: &'a str,
    reasoning: Reasoning<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    url: String,
    model: String,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            model: model.into(),
            timeout,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn payload(&self, input: &NormalizedInput, stream: bool) -> serde_json::Value {
        let body = UpstreamRequest {
            model: &self.model,
            input: &input.text,
            reasoning: Reasoning {
                effort: &input.effort,
            },
            stream: stream.then_some(true),
        };
        serde_json::to_value(body).unwrap_or_default()
    }

    /// Buffered exchange: one POST, one JSON document back.
    pub async fn complete(&self, input: &NormalizedInput) -> Result<serde_json::Value, UpstreamError> {
        let body = self.payload(input, false);
        let exchange = async {
            let resp = self
                .http
                .post(&self.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .json(&body)
                .send()
                .await?;
            let status = resp.status();
            let bytes = resp.bytes().await?;
            Ok::<_, reqwest::Error>((status, bytes))
        };
        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| UpstreamError::Timeout(self.timeout))??;

        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| UpstreamError::Malformed(e.to_string()))
    }

    /// Streaming exchange. Only the wait for response headers is bounded.
    pub async fn open_stream(&self, input: &NormalizedInput) -> Result<ByteStream, UpstreamError> {
        let body = self.payload(input, true);
        let send = self
            .http
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send();
        let resp = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| UpstreamError::Timeout(self.timeout))??;

        let status = resp.status();
        if !status.is_success() {
            // The error body only feeds the log; a stalled one is dropped.
            let bytes = tokio::time::timeout(self.timeout, resp.bytes())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        Ok(Box::pin(stream))
    }
}
