use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

const LOG_TARGET: &str = "pontoon::transport";

/// Transport-level failures. The client sorts these into fatal and
/// recoverable according to the relay's status contract.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("relay request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
}

impl TransportError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One POST exchange with the relay. The relay multiplexes handshakes
/// and batch rounds over a single URL, so this one shape covers both.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn exchange(&self, body: &Value, timeout: Duration) -> Result<Value, TransportError>;
}

/// Production transport speaking JSON over HTTP via reqwest.
#[derive(Debug, Clone)]
pub struct HttpRelayTransport {
    endpoint: Url,
    http: reqwest::Client,
}

impl HttpRelayTransport {
    pub fn new(endpoint: Url) -> Result<Self, TransportError> {
        // A hung connect would stall the whole batch cadence; the widget
        // host also gives us no proxy worth honoring.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .no_proxy()
            .build()
            .map_err(|err| TransportError::Network(err.to_string()))?;
        Ok(Self { endpoint, http })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn exchange(&self, body: &Value, timeout: Duration) -> Result<Value, TransportError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            debug!(target: LOG_TARGET, status = %status, "relay answered with a failure status");
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }
        response.json::<Value>().await.map_err(classify)
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.to_string())
    }
}
