// ABOUTME: Domain records shared by packaging, restoration and the credential store
// ABOUTME: Step kinds, roles, artifacts, connection and destination status records

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Which half of a migration this host plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Source,
    Destination,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Destination => "destination",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(Role::Source),
            "destination" => Ok(Role::Destination),
            other => Err(BridgeError::MalformedInput(format!(
                "invalid site role: {other}"
            ))),
        }
    }
}

/// One unit of packaging/restoration work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Database,
    Plugins,
    Themes,
    Uploads,
}

impl StepKind {
    /// Fixed execution order for both the local and the remote phase.
    pub const ALL: [StepKind; 4] = [
        StepKind::Database,
        StepKind::Plugins,
        StepKind::Themes,
        StepKind::Uploads,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Database => "database",
            StepKind::Plugins => "plugins",
            StepKind::Themes => "themes",
            StepKind::Uploads => "uploads",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            StepKind::Database => "database.sql",
            StepKind::Plugins => "plugins.zip",
            StepKind::Themes => "themes.zip",
            StepKind::Uploads => "uploads.zip",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            StepKind::Database => "application/sql",
            _ => "application/zip",
        }
    }

    pub fn is_archive(&self) -> bool {
        !matches!(self, StepKind::Database)
    }

    pub fn title(&self) -> &'static str {
        match self {
            StepKind::Database => "Database",
            StepKind::Plugins => "Plugins",
            StepKind::Themes => "Themes",
            StepKind::Uploads => "Uploads",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" => Ok(StepKind::Database),
            "plugins" => Ok(StepKind::Plugins),
            "themes" => Ok(StepKind::Themes),
            "uploads" => Ok(StepKind::Uploads),
            other => Err(BridgeError::MalformedInput(format!(
                "invalid step type: {other}"
            ))),
        }
    }
}

/// A packaged unit of transferable state sitting in the temp directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub kind: StepKind,
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl Artifact {
    pub fn human_size(&self) -> String {
        human_size(self.size_bytes)
    }
}

/// Formats a byte count with binary units and up to two decimals.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        return format!("{bytes} B");
    }
    let formatted = format!("{value:.2}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", UNITS[unit])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

/// What the destination reported about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSiteIdentity {
    pub site_name: String,
    pub site_url: String,
    pub version: String,
}

/// Source-side record of a trusted destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub destination_url: String,
    /// Where the destination's bridge API is called when not at `destination_url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    pub migration_key: String,
    pub status: ConnectionStatus,
    pub remote_site: RemoteSiteIdentity,
}

impl Connection {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn endpoint(&self) -> &str {
        self.api_url.as_deref().unwrap_or(&self.destination_url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Idle,
    Processing,
    Completed,
    Error,
}

/// Destination-side progress record, overwritten by every migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub status: MigrationState,
    pub current_step: Option<StepKind>,
    #[serde(default)]
    pub completed_steps: Vec<StepKind>,
    pub last_update: Option<i64>,
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for MigrationStatus {
    fn default() -> Self {
        Self {
            status: MigrationState::Idle,
            current_step: None,
            completed_steps: Vec::new(),
            last_update: None,
            source_url: None,
            error: None,
        }
    }
}

impl MigrationStatus {
    /// Records completion of `step`, keeping `completed_steps` an ordered set.
    pub fn mark_completed(&mut self, step: StepKind) {
        if !self.completed_steps.contains(&step) {
            self.completed_steps.push(step);
        }
        self.status = MigrationState::Completed;
        self.error = None;
    }
}
