// ABOUTME: TOML configuration for a bridge host: site layout, bridge behaviour, timeouts
// ABOUTME: Every field has a default so a missing file still yields a usable host

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub site: SiteConfig,
    pub bridge: BridgeSettings,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Canonical origin of this site; the old URL during finalize on a source,
    /// the new URL on a destination.
    pub url: String,
    pub name: String,
    /// Base URL where this host's bridge API is reachable, when it differs from `url`.
    pub advertise_url: Option<String>,
    pub database: PathBuf,
    pub plugins_dir: PathBuf,
    pub themes_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub options_table: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            name: String::new(),
            advertise_url: None,
            database: PathBuf::from("site.db"),
            plugins_dir: PathBuf::from("content/plugins"),
            themes_dir: PathBuf::from("content/themes"),
            uploads_dir: PathBuf::from("content/uploads"),
            options_table: "options".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTokenPolicy {
    /// Continue with an empty token and warn.
    Soft,
    /// Abort before the remote phase.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizeMode {
    Batched,
    Monolithic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub listen: SocketAddr,
    pub state_path: PathBuf,
    pub temp_dir: PathBuf,
    pub source_token_policy: SourceTokenPolicy,
    pub finalize_mode: FinalizeMode,
    pub batch_rows: usize,
    pub batch_time_budget_secs: u64,
    pub step_delay_ms: u64,
    pub repackage_missing: bool,
    pub stale_migration_secs: i64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            state_path: PathBuf::from("bridge-state.db"),
            temp_dir: PathBuf::from("bridge-temp"),
            source_token_policy: SourceTokenPolicy::Soft,
            finalize_mode: FinalizeMode::Batched,
            batch_rows: 500,
            batch_time_budget_secs: 30,
            step_delay_ms: 1000,
            repackage_missing: true,
            stale_migration_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub handshake_secs: u64,
    pub step_secs: u64,
    pub finalize_secs: u64,
    pub batch_secs: u64,
    pub cleanup_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake_secs: 30,
            step_secs: 600,
            finalize_secs: 600,
            batch_secs: 60,
            cleanup_secs: 60,
        }
    }
}

impl Timeouts {
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn step(&self) -> Duration {
        Duration::from_secs(self.step_secs)
    }

    pub fn finalize(&self) -> Duration {
        Duration::from_secs(self.finalize_secs)
    }

    pub fn batch(&self) -> Duration {
        Duration::from_secs(self.batch_secs)
    }

    pub fn cleanup(&self) -> Duration {
        Duration::from_secs(self.cleanup_secs)
    }
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Like [`BridgeConfig::load`], but a missing file yields defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: BridgeConfig =
            toml::from_str(text).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.site.url.starts_with("http://") && !self.site.url.starts_with("https://") {
            return Err(BridgeError::Config(format!(
                "site.url must be an http(s) URL, got '{}'",
                self.site.url
            )));
        }
        if self.bridge.batch_rows == 0 {
            return Err(BridgeError::Config("bridge.batch_rows must be > 0".into()));
        }
        let table = &self.site.options_table;
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(BridgeError::Config(format!(
                "site.options_table must be a plain identifier, got '{table}'"
            )));
        }
        Ok(())
    }

    /// Canonical origin without a trailing slash.
    pub fn site_url(&self) -> String {
        self.site.url.trim_end_matches('/').to_string()
    }

    /// Base URL peers should call this host's bridge API on.
    pub fn public_url(&self) -> String {
        self.site
            .advertise_url
            .as_deref()
            .unwrap_or(&self.site.url)
            .trim_end_matches('/')
            .to_string()
    }

    pub fn site_name(&self) -> String {
        if self.site.name.is_empty() {
            self.site_url()
        } else {
            self.site.name.clone()
        }
    }

    pub fn batch_time_budget(&self) -> Duration {
        Duration::from_secs(self.bridge.batch_time_budget_secs)
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.bridge.step_delay_ms)
    }
}
