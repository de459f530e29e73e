use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::model::Record;

use super::api_types::{parse_rows, parse_write_response, WriteRequest};

/// Why a remote call did not succeed.
///
/// Every variant is retried the same way by the sync engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
  #[error("network error: {0}")]
  Network(String),
  #[error("endpoint returned HTTP {status}")]
  Http { status: u16 },
  #[error("malformed response: {0}")]
  Malformed(String),
  #[error("endpoint rejected the request: {0}")]
  Rejected(String),
}

/// The spreadsheet-backed endpoint records are mirrored to.
pub trait RemoteEndpoint: Send + Sync + 'static {
  /// POST a single write.
  fn send(&self, request: WriteRequest) -> impl Future<Output = Result<(), RemoteError>> + Send;

  /// GET every row.
  fn fetch_rows(&self) -> impl Future<Output = Result<Vec<Record>, RemoteError>> + Send;

  /// Cheap reachability check used by the connectivity probe.
  fn ping(&self) -> impl Future<Output = bool> + Send;
}

/// reqwest-based client for the endpoint
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  endpoint: url::Url,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let endpoint = url::Url::parse(&config.endpoint)
      .map_err(|e| eyre!("Invalid endpoint URL {}: {}", config.endpoint, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, endpoint })
  }

  async fn read_body(response: reqwest::Response) -> Result<String, RemoteError> {
    let status = response.status();
    if !status.is_success() {
      return Err(RemoteError::Http {
        status: status.as_u16(),
      });
    }
    response
      .text()
      .await
      .map_err(|e| RemoteError::Network(e.to_string()))
  }
}

impl RemoteEndpoint for HttpRemote {
  async fn send(&self, request: WriteRequest) -> Result<(), RemoteError> {
    let body = serde_json::to_string(&request)
      .map_err(|e| RemoteError::Malformed(format!("request: {}", e)))?;

    debug!(action = ?request.action, id = %request.id, "Posting write");

    let response = self
      .client
      .post(self.endpoint.clone())
      .header(reqwest::header::CONTENT_TYPE, "application/json")
      .header("Idempotency-Key", &request.idempotency_key)
      .body(body)
      .send()
      .await
      .map_err(|e| RemoteError::Network(e.to_string()))?;

    let body = Self::read_body(response).await?;
    parse_write_response(&body)
  }

  async fn fetch_rows(&self) -> Result<Vec<Record>, RemoteError> {
    let response = self
      .client
      .get(self.endpoint.clone())
      .send()
      .await
      .map_err(|e| RemoteError::Network(e.to_string()))?;

    let body = Self::read_body(response).await?;
    parse_rows(&body)
  }

  async fn ping(&self) -> bool {
    match self.client.head(self.endpoint.clone()).send().await {
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, "Endpoint unreachable");
        false
      }
    }
  }
}
