// ABOUTME: Destination-side restoration of one step: pull the artifact from the source and apply it
// ABOUTME: Keeps the public MigrationStatus record current; never rolls back a partial step

use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::config::Timeouts;
use crate::credentials::CredentialStore;
use crate::error::{BridgeError, Result};
use crate::remote::RemoteClient;
use crate::rewrite::normalize_origin;
use crate::site::{dump, Site};
use crate::types::{MigrationState, MigrationStatus, StepKind};
use crate::archive;

#[derive(Clone)]
pub struct Restorer {
    site: Site,
    temp_dir: PathBuf,
    credentials: CredentialStore,
    timeouts: Timeouts,
    stale_after_secs: i64,
}

impl Restorer {
    pub fn new(
        site: Site,
        temp_dir: impl Into<PathBuf>,
        credentials: CredentialStore,
        timeouts: Timeouts,
        stale_after_secs: i64,
    ) -> Self {
        Self {
            site,
            temp_dir: temp_dir.into(),
            credentials,
            timeouts,
            stale_after_secs,
        }
    }

    /// Rejects a step from a different source while another migration is still fresh.
    fn check_ownership(&self, status: &MigrationStatus, source_url: &str, now: i64) -> Result<()> {
        if status.status != MigrationState::Processing {
            return Ok(());
        }
        let Some(current) = status.source_url.as_deref() else {
            return Ok(());
        };
        let fresh = status
            .last_update
            .is_some_and(|t| now - t < self.stale_after_secs);
        if fresh && current != source_url {
            return Err(BridgeError::MigrationInProgress(format!(
                "a migration from {current} is still processing"
            )));
        }
        Ok(())
    }

    /// Downloads and applies `step`, returning the operator-facing message.
    pub async fn process_step(
        &self,
        step: StepKind,
        source_url: &str,
        source_token: &str,
    ) -> Result<String> {
        let source_url = normalize_origin(source_url)?;
        if source_token.is_empty() {
            return Err(BridgeError::MalformedInput(
                "source_token is required".to_string(),
            ));
        }

        let now = chrono::Utc::now().timestamp();
        let mut status = self.credentials.migration_status()?;
        self.check_ownership(&status, &source_url, now)?;
        if status.source_url.as_deref() != Some(source_url.as_str()) {
            status.completed_steps.clear();
        }
        status.status = MigrationState::Processing;
        status.current_step = Some(step);
        status.last_update = Some(now);
        status.source_url = Some(source_url.clone());
        status.error = None;
        self.credentials.save_migration_status(&status)?;
        info!("Restoring {} from {}", step, source_url);

        let outcome = self.fetch_and_apply(step, &source_url, source_token).await;

        status.last_update = Some(chrono::Utc::now().timestamp());
        match outcome {
            Ok(message) => {
                status.mark_completed(step);
                self.credentials.save_migration_status(&status)?;
                info!("{}", message);
                Ok(message)
            }
            Err(e) => {
                let err = match e {
                    BridgeError::StepExecution { .. } => e,
                    other => BridgeError::step(step, other.to_string()),
                };
                status.status = MigrationState::Error;
                status.error = Some(err.to_string());
                self.credentials.save_migration_status(&status)?;
                error!("{}", err);
                Err(err)
            }
        }
    }

    async fn fetch_and_apply(
        &self,
        step: StepKind,
        source_url: &str,
        source_token: &str,
    ) -> Result<String> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let incoming = self.temp_dir.join(format!("incoming-{}", step.file_name()));

        let client = RemoteClient::new(source_url, self.timeouts.clone())?;
        let bytes = client.download(step, source_token, &incoming).await?;

        let site = self.site.clone();
        let path = incoming.clone();
        let applied = tokio::task::spawn_blocking(move || apply(&site, step, &path))
            .await
            .map_err(|e| BridgeError::step(step, format!("restore task failed: {e}")))?;

        if let Err(e) = tokio::fs::remove_file(&incoming).await {
            warn!("Could not remove {}: {}", incoming.display(), e);
        }
        let detail = applied?;
        Ok(format!(
            "{} restored successfully ({}, {}).",
            step.title(),
            crate::types::human_size(bytes),
            detail
        ))
    }
}

/// Applies a downloaded artifact to the local site.
fn apply(site: &Site, step: StepKind, artifact: &Path) -> Result<String> {
    match step {
        StepKind::Database => {
            let sql = std::fs::read_to_string(artifact)?;
            let conn = site.open_db()?;
            dump::import(&conn, &sql)?;
            Ok("database imported".to_string())
        }
        _ => {
            let dir = site
                .directory(step)
                .ok_or_else(|| BridgeError::step(step, "no directory for this step"))?;
            let files = archive::extract(artifact, dir)?;
            Ok(format!("{files} files extracted"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryOptionStore;
    use std::sync::Arc;

    fn restorer() -> Restorer {
        Restorer::new(
            Site::from_config(&crate::config::SiteConfig::default()),
            "unused",
            CredentialStore::new(Arc::new(MemoryOptionStore::new())),
            Timeouts::default(),
            900,
        )
    }

    fn processing(source: &str, last_update: i64) -> MigrationStatus {
        MigrationStatus {
            status: MigrationState::Processing,
            current_step: Some(StepKind::Plugins),
            completed_steps: vec![StepKind::Database],
            last_update: Some(last_update),
            source_url: Some(source.to_string()),
            error: None,
        }
    }

    #[test]
    fn test_other_source_rejected_while_fresh() {
        let r = restorer();
        let status = processing("https://a.test", 1_000);
        assert!(r.check_ownership(&status, "https://a.test", 1_100).is_ok());
        assert!(matches!(
            r.check_ownership(&status, "https://b.test", 1_100),
            Err(BridgeError::MigrationInProgress(_))
        ));
        assert!(r.check_ownership(&status, "https://b.test", 1_000 + 901).is_ok());
    }

    #[test]
    fn test_idle_status_never_blocks() {
        let r = restorer();
        assert!(r
            .check_ownership(&MigrationStatus::default(), "https://b.test", 5)
            .is_ok());
    }

    #[tokio::test]
    async fn test_rejects_bad_inputs_before_touching_status() {
        let r = restorer();
        assert!(matches!(
            r.process_step(StepKind::Database, "not a url", "tok").await,
            Err(BridgeError::MalformedInput(_))
        ));
        assert!(matches!(
            r.process_step(StepKind::Database, "https://src.test", "").await,
            Err(BridgeError::MalformedInput(_))
        ));
        assert_eq!(
            r.credentials.migration_status().unwrap(),
            MigrationStatus::default()
        );
    }
}
