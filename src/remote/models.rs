// ABOUTME: Request and response bodies for the bridge HTTP API
// ABOUTME: Shared by the reqwest client on one host and the warp server on the other

use serde::{Deserialize, Serialize};

pub const API_PREFIX: &str = "bridge/v1";

/// Artifact size in bytes; downloads are sent chunked so the body can end with file deletion.
pub const ARTIFACT_SIZE_HEADER: &str = "x-artifact-size";

/// Requests that carry a bearer token checked before the handler runs.
pub trait Authenticated {
    fn token(&self) -> Option<&str>;
}

macro_rules! authenticated {
    ($($ty:ty),* $(,)?) => {
        $(impl Authenticated for $ty {
            fn token(&self) -> Option<&str> {
                self.token.as_deref()
            }
        })*
    };
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeRequest {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub success: bool,
    pub version: String,
    pub site_name: String,
    pub site_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadQuery {
    pub file_type: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessStepRequest {
    pub step: String,
    pub source_url: String,
    pub source_token: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStepResponse {
    pub success: bool,
    pub step: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizeRequest {
    pub old_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub success: bool,
    pub old_url: String,
    pub new_url: String,
    pub rows_updated: u64,
    #[serde(default)]
    pub values_skipped: u64,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizeBatchRequest {
    pub old_url: String,
    pub table_name: Option<String>,
    pub offset: u64,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeBatchResponse {
    pub success: bool,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_offset: Option<u64>,
    #[serde(default)]
    pub rows_updated: u64,
    #[serde(default)]
    pub values_skipped: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupRequest {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub success: bool,
    pub message: String,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

authenticated!(
    HandshakeRequest,
    DownloadQuery,
    ProcessStepRequest,
    FinalizeRequest,
    FinalizeBatchRequest,
    CleanupRequest,
);
