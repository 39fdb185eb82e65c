// ABOUTME: Error types shared by the source and destination sides of the bridge
// ABOUTME: Each variant carries a stable machine code and an HTTP status for the server

use std::fmt;

use thiserror::Error;

use crate::types::StepKind;

/// Why a bearer token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Missing,
    Invalid,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthFailure::Missing => write!(f, "token is required"),
            AuthFailure::Invalid => write!(f, "invalid token"),
        }
    }
}

/// Network-level failure classes, used to pick an operator hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    Dns,
    Tls,
    ConnectionRefused,
    Other,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            TransportKind::Timeout => "timed out",
            TransportKind::Dns => "DNS resolution failed",
            TransportKind::Tls => "TLS/certificate failure",
            TransportKind::ConnectionRefused => "connection refused",
            TransportKind::Other => "connection failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Authentication failed: {0}")]
    Auth(AuthFailure),

    #[error("Invalid migration key format")]
    MalformedKey,

    #[error("Invalid input: {0}")]
    MalformedInput(String),

    /// The peer was never reached.
    #[error("Connection to {url} {kind}: {message}{}", hint_suffix(.hint))]
    Transport {
        kind: TransportKind,
        url: String,
        message: String,
        hint: Option<String>,
    },

    /// The peer was reached and refused the request.
    #[error("Remote site rejected the request ({status}, {code}): {message}")]
    Remote {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Capability missing: {0}")]
    CapabilityMissing(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(StepKind),

    #[error("Failed to process {step} step: {message}")]
    StepExecution { step: StepKind, message: String },

    #[error("This action is only available for {expected} sites (current role: {actual})")]
    WrongRole { expected: String, actual: String },

    #[error("Not connected to a destination site. Run `connect` first")]
    NotConnected,

    #[error("Another migration is already in progress: {0}")]
    MigrationInProgress(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Option store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

fn hint_suffix(hint: &Option<String>) -> String {
    hint.as_deref().map(|h| format!(". {h}")).unwrap_or_default()
}

impl BridgeError {
    pub fn step(step: StepKind, message: impl Into<String>) -> Self {
        BridgeError::StepExecution {
            step,
            message: message.into(),
        }
    }

    /// Stable identifier sent over the wire in `{code, message}` bodies.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Auth(AuthFailure::Missing) => "missing_token",
            BridgeError::Auth(AuthFailure::Invalid) => "invalid_token",
            BridgeError::MalformedKey => "invalid_key",
            BridgeError::MalformedInput(_) => "invalid_input",
            BridgeError::Transport { .. } => "transport_failure",
            BridgeError::Remote { .. } => "remote_failure",
            BridgeError::CapabilityMissing(_) => "capability_missing",
            BridgeError::ArtifactNotFound(_) => "artifact_not_found",
            BridgeError::StepExecution { .. } => "process_failed",
            BridgeError::WrongRole { .. } => "wrong_role",
            BridgeError::NotConnected => "not_connected",
            BridgeError::MigrationInProgress(_) => "migration_in_progress",
            BridgeError::Config(_) => "config_error",
            BridgeError::Store(_)
            | BridgeError::Database(_)
            | BridgeError::Io(_)
            | BridgeError::Serialization(_) => "internal_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::Auth(AuthFailure::Missing)
            | BridgeError::MalformedKey
            | BridgeError::MalformedInput(_) => 400,
            BridgeError::Auth(AuthFailure::Invalid) | BridgeError::WrongRole { .. } => 403,
            BridgeError::ArtifactNotFound(_) => 404,
            BridgeError::MigrationInProgress(_) => 409,
            BridgeError::Transport { .. } => 502,
            _ => 500,
        }
    }
}
