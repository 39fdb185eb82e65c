// ABOUTME: HTTP client for calling a peer's bridge API (handshake, steps, finalize, cleanup)
// ABOUTME: Decodes peer rejections separately from transport failures; streams artifact downloads

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::diagnostics::transport_error;
use super::models::{
    CleanupRequest, CleanupResponse, DownloadQuery, ErrorBody, FinalizeBatchRequest,
    FinalizeBatchResponse, FinalizeRequest, FinalizeResponse, HandshakeRequest,
    HandshakeResponse, ProcessStepRequest, ProcessStepResponse, API_PREFIX,
    ARTIFACT_SIZE_HEADER,
};
use crate::config::Timeouts;
use crate::error::{AuthFailure, BridgeError, Result};
use crate::types::{MigrationStatus, StepKind};

pub struct RemoteClient {
    client: Client,
    base_url: String,
    timeouts: Timeouts,
}

impl RemoteClient {
    pub fn new(base_url: &str, timeouts: Timeouts) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("site-bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeouts,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("{}/{}/{}", self.base_url, API_PREFIX, operation)
    }

    async fn post_json<B, R>(&self, operation: &str, body: &B, timeout: Duration) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint(operation);
        debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(e, &url))?;
        decode(response, &url).await
    }

    /// Confirms the peer trusts `token` and returns its identity.
    pub async fn handshake(&self, token: &str) -> Result<HandshakeResponse> {
        let body = HandshakeRequest {
            token: Some(token.to_string()),
        };
        let response: HandshakeResponse = self
            .post_json("handshake", &body, self.timeouts.handshake())
            .await?;
        if !response.success {
            return Err(BridgeError::Remote {
                status: 200,
                code: "handshake_failed".to_string(),
                message: "Handshake failed. Invalid response from destination site".to_string(),
            });
        }
        Ok(response)
    }

    pub async fn process_step(
        &self,
        step: StepKind,
        source_url: &str,
        source_token: &str,
        token: &str,
    ) -> Result<ProcessStepResponse> {
        let body = ProcessStepRequest {
            step: step.as_str().to_string(),
            source_url: source_url.to_string(),
            source_token: source_token.to_string(),
            token: Some(token.to_string()),
        };
        self.post_json("process_step", &body, self.timeouts.step())
            .await
    }

    pub async fn finalize(&self, old_url: &str, token: &str) -> Result<FinalizeResponse> {
        let body = FinalizeRequest {
            old_url: old_url.to_string(),
            token: Some(token.to_string()),
        };
        self.post_json("finalize_migration", &body, self.timeouts.finalize())
            .await
    }

    pub async fn finalize_batch(
        &self,
        old_url: &str,
        table_name: Option<&str>,
        offset: u64,
        token: &str,
    ) -> Result<FinalizeBatchResponse> {
        let body = FinalizeBatchRequest {
            old_url: old_url.to_string(),
            table_name: table_name.map(str::to_string),
            offset,
            token: Some(token.to_string()),
        };
        self.post_json("finalize_migration_batch", &body, self.timeouts.batch())
            .await
    }

    pub async fn cleanup(&self, token: &str) -> Result<CleanupResponse> {
        let body = CleanupRequest {
            token: Some(token.to_string()),
        };
        self.post_json("cleanup", &body, self.timeouts.cleanup())
            .await
    }

    pub async fn migration_status(&self) -> Result<MigrationStatus> {
        let url = self.endpoint("migration_status");
        let response = self
            .client
            .get(&url)
            .timeout(self.timeouts.handshake())
            .send()
            .await
            .map_err(|e| transport_error(e, &url))?;
        decode(response, &url).await
    }

    /// Streams the `kind` artifact from this peer into `dest`, returning bytes written.
    pub async fn download(&self, kind: StepKind, token: &str, dest: &Path) -> Result<u64> {
        let url = self.endpoint("download");
        let query = DownloadQuery {
            file_type: Some(kind.as_str().to_string()),
            token: Some(token.to_string()),
        };
        let response = self
            .client
            .get(&url)
            .timeout(self.timeouts.step())
            .query(&query)
            .send()
            .await
            .map_err(|e| transport_error(e, &url))?;

        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        let expected = response
            .headers()
            .get(ARTIFACT_SIZE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .or_else(|| response.content_length());
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport_error(e, &url))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if let Some(expected) = expected {
            if expected != written {
                return Err(BridgeError::step(
                    kind,
                    format!("download truncated: expected {expected} bytes, got {written}"),
                ));
            }
        }
        debug!("Downloaded {} ({} bytes)", kind, written);
        Ok(written)
    }
}

async fn decode<R: DeserializeOwned>(response: Response, url: &str) -> Result<R> {
    if !response.status().is_success() {
        return Err(rejection(response).await);
    }
    let status = response.status().as_u16();
    response.json::<R>().await.map_err(|e| {
        if e.is_decode() {
            BridgeError::Remote {
                status,
                code: "invalid_response".to_string(),
                message: format!("Invalid response from {url}: {e}"),
            }
        } else {
            transport_error(e, url)
        }
    })
}

/// Builds the error for a peer that answered with a non-success status.
async fn rejection(response: Response) -> BridgeError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if let Ok(err) = serde_json::from_str::<ErrorBody>(&body) {
        match err.code.as_str() {
            "missing_token" => return BridgeError::Auth(AuthFailure::Missing),
            "invalid_token" => return BridgeError::Auth(AuthFailure::Invalid),
            _ => {}
        }
        return BridgeError::Remote {
            status: status.as_u16(),
            code: err.code,
            message: err.message,
        };
    }
    if status == StatusCode::FORBIDDEN {
        return BridgeError::Auth(AuthFailure::Invalid);
    }
    let message = match status {
        StatusCode::NOT_FOUND => {
            "Bridge API not found at the remote site. Is the bridge server running there?"
                .to_string()
        }
        _ if body.is_empty() => format!("Request failed with status {status}"),
        _ => body,
    };
    BridgeError::Remote {
        status: status.as_u16(),
        code: "http_error".to_string(),
        message,
    }
}
