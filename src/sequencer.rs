// ABOUTME: Source-side pipeline: package locally, restore remotely, finalize, then clean both hosts
// ABOUTME: Strictly sequential; the first failing step halts the run and nothing is retried

use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use crate::cleanup::cleanup_dir;
use crate::config::{BridgeConfig, FinalizeMode, SourceTokenPolicy};
use crate::credentials::CredentialStore;
use crate::error::{BridgeError, Result};
use crate::guard::SourceLock;
use crate::key;
use crate::packager::Packager;
use crate::remote::RemoteClient;
use crate::site::Site;
use crate::types::{Artifact, Role, StepKind};

/// Progress notifications for whoever drives the pipeline.
#[derive(Debug, Clone)]
pub enum MigrationEvent {
    PackagingStarted(StepKind),
    Packaged(Artifact),
    RestoreStarted(StepKind),
    Restored { step: StepKind, message: String },
    FinalizeStarted { old_url: String },
    FinalizeBatch { rows_updated: u64, next_table: Option<String> },
    Finalized { new_url: String, rows_updated: u64 },
    CleanupFinished,
    Warning(String),
}

/// Outcome of a full migration. A non-empty `warnings` means the migration
/// succeeded but something non-essential (usually cleanup) did not.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub artifacts: Vec<Artifact>,
    pub restored_steps: Vec<StepKind>,
    pub old_url: String,
    pub new_url: String,
    pub rewritten_rows: u64,
    pub warnings: Vec<String>,
}

impl MigrationReport {
    fn warn(&mut self, message: String, events: &mut impl FnMut(MigrationEvent)) {
        warn!("{}", message);
        events(MigrationEvent::Warning(message.clone()));
        self.warnings.push(message);
    }
}

pub struct Sequencer {
    config: BridgeConfig,
    credentials: CredentialStore,
    packager: Packager,
}

impl Sequencer {
    pub fn new(config: BridgeConfig, credentials: CredentialStore) -> Self {
        let site = Site::from_config(&config.site);
        let packager = Packager::new(site, &config.bridge.temp_dir);
        Self {
            config,
            credentials,
            packager,
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.config.bridge.state_path.with_extension("lock")
    }

    /// Packages one step, off the async runtime.
    pub async fn package_step(&self, kind: StepKind) -> Result<Artifact> {
        let packager = self.packager.clone();
        tokio::task::spawn_blocking(move || packager.package(kind))
            .await
            .map_err(|e| BridgeError::step(kind, format!("packaging task failed: {e}")))?
    }

    /// Local phase: every step in order, stopping at the first failure.
    pub async fn package_all(
        &self,
        events: &mut impl FnMut(MigrationEvent),
    ) -> Result<Vec<Artifact>> {
        let mut artifacts = Vec::with_capacity(StepKind::ALL.len());
        for kind in StepKind::ALL {
            events(MigrationEvent::PackagingStarted(kind));
            let artifact = self.package_step(kind).await?;
            events(MigrationEvent::Packaged(artifact.clone()));
            artifacts.push(artifact);
        }
        info!("Local packaging complete ({} artifacts)", artifacts.len());
        Ok(artifacts)
    }

    fn source_token(
        &self,
        report: &mut MigrationReport,
        events: &mut impl FnMut(MigrationEvent),
    ) -> Result<String> {
        match self.credentials.source_token() {
            Ok(token) => Ok(token),
            Err(e) => match self.config.bridge.source_token_policy {
                SourceTokenPolicy::Strict => Err(e),
                SourceTokenPolicy::Soft => {
                    report.warn(
                        format!(
                            "Could not read the source token ({e}); continuing without it, \
                             remote restoration will likely fail"
                        ),
                        events,
                    );
                    Ok(String::new())
                }
            },
        }
    }

    /// Runs the whole migration against the connected destination.
    pub async fn run(&self, mut events: impl FnMut(MigrationEvent)) -> Result<MigrationReport> {
        self.credentials.require_role(Role::Source)?;
        let connection = self.credentials.require_connection()?;
        let key = key::decode(&connection.migration_key)?;
        let _lock = SourceLock::acquire(&self.lock_path())?;

        let client = RemoteClient::new(connection.endpoint(), self.config.timeouts.clone())?;
        let mut report = MigrationReport {
            old_url: self.config.site_url(),
            ..MigrationReport::default()
        };
        info!(
            "Migrating {} to {} ({})",
            report.old_url,
            connection.remote_site.site_name,
            client.base_url()
        );

        report.artifacts = self.package_all(&mut events).await?;

        let source_url = self.config.public_url();
        let source_token = self.source_token(&mut report, &mut events)?;
        for (i, step) in StepKind::ALL.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.step_delay()).await;
            }
            events(MigrationEvent::RestoreStarted(step));
            let response = client
                .process_step(step, &source_url, &source_token, &key.token)
                .await?;
            if !response.success {
                return Err(BridgeError::step(step, response.message));
            }
            info!("{}", response.message);
            report.restored_steps.push(step);
            events(MigrationEvent::Restored {
                step,
                message: response.message,
            });
        }

        events(MigrationEvent::FinalizeStarted {
            old_url: report.old_url.clone(),
        });
        let (new_url, rows, skipped) = match self.config.bridge.finalize_mode {
            FinalizeMode::Monolithic => {
                let response = client.finalize(&report.old_url, &key.token).await?;
                (
                    response.new_url,
                    response.rows_updated,
                    response.values_skipped,
                )
            }
            FinalizeMode::Batched => {
                self.finalize_batched(&client, &report.old_url, &key.token, &mut events)
                    .await?
            }
        };
        report.new_url = new_url;
        report.rewritten_rows = rows;
        if skipped > 0 {
            report.warn(
                format!("{skipped} serialized values could not be rewritten and were left as-is"),
                &mut events,
            );
        }
        events(MigrationEvent::Finalized {
            new_url: report.new_url.clone(),
            rows_updated: rows,
        });

        if let Err(e) = client.cleanup(&key.token).await {
            report.warn(format!("Remote cleanup failed: {e}"), &mut events);
        }
        let temp_dir = self.config.bridge.temp_dir.clone();
        match tokio::task::spawn_blocking(move || cleanup_dir(&temp_dir)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => report.warn(format!("Local cleanup failed: {e}"), &mut events),
            Err(e) => report.warn(format!("Local cleanup task failed: {e}"), &mut events),
        }
        events(MigrationEvent::CleanupFinished);

        info!(
            "Migration complete: {} -> {} ({} rows rewritten, {} warnings)",
            report.old_url,
            report.new_url,
            report.rewritten_rows,
            report.warnings.len()
        );
        Ok(report)
    }

    /// Loops finalize batches until the destination reports completion.
    async fn finalize_batched(
        &self,
        client: &RemoteClient,
        old_url: &str,
        token: &str,
        events: &mut impl FnMut(MigrationEvent),
    ) -> Result<(String, u64, u64)> {
        let mut table: Option<String> = None;
        let mut offset = 0;
        let mut rows = 0;
        let mut skipped = 0;
        loop {
            let response = client
                .finalize_batch(old_url, table.as_deref(), offset, token)
                .await?;
            if !response.success {
                return Err(BridgeError::step(
                    StepKind::Database,
                    "finalize batch reported failure",
                ));
            }
            rows += response.rows_updated;
            skipped += response.values_skipped;
            events(MigrationEvent::FinalizeBatch {
                rows_updated: response.rows_updated,
                next_table: response.next_table_name.clone(),
            });
            if response.completed {
                let new_url = response.new_url.unwrap_or_default();
                return Ok((new_url, rows, skipped));
            }

            let (Some(next_table), Some(next_offset)) =
                (response.next_table_name, response.next_offset)
            else {
                return Err(BridgeError::MalformedInput(
                    "incomplete finalize batch response carried no cursor".to_string(),
                ));
            };
            if table.as_deref() == Some(next_table.as_str()) && next_offset == offset {
                return Err(BridgeError::step(
                    StepKind::Database,
                    format!("finalize made no progress at {next_table}:{next_offset}"),
                ));
            }
            table = Some(next_table);
            offset = next_offset;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;
    use crate::store::MemoryOptionStore;
    use std::sync::Arc;

    fn sequencer(dir: &std::path::Path) -> Sequencer {
        let mut config = BridgeConfig {
            site: SiteConfig {
                url: "https://src.test".to_string(),
                database: dir.join("site.db"),
                plugins_dir: dir.join("plugins"),
                themes_dir: dir.join("themes"),
                uploads_dir: dir.join("uploads"),
                ..SiteConfig::default()
            },
            ..BridgeConfig::default()
        };
        config.bridge.temp_dir = dir.join("temp");
        config.bridge.state_path = dir.join("state.db");
        Sequencer::new(
            config,
            CredentialStore::new(Arc::new(MemoryOptionStore::new())),
        )
    }

    #[tokio::test]
    async fn test_packaging_twice_overwrites_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("plugins/hello")).unwrap();
        std::fs::write(dir.path().join("plugins/hello/hello.php"), "<?php").unwrap();
        let seq = sequencer(dir.path());

        let mut started = Vec::new();
        let first = seq
            .package_all(&mut |e| {
                if let MigrationEvent::PackagingStarted(kind) = e {
                    started.push(kind)
                }
            })
            .await
            .unwrap();
        assert_eq!(started, StepKind::ALL.to_vec());

        let second = seq.package_all(&mut |_| {}).await.unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(
            first.iter().map(|a| &a.path).collect::<Vec<_>>(),
            second.iter().map(|a| &a.path).collect::<Vec<_>>()
        );
        let files = std::fs::read_dir(dir.path().join("temp")).unwrap().count();
        assert_eq!(files, 4);
    }

    #[tokio::test]
    async fn test_run_requires_connection() {
        let dir = tempfile::tempdir().unwrap();
        let seq = sequencer(dir.path());
        assert!(matches!(
            seq.run(|_| {}).await,
            Err(BridgeError::NotConnected)
        ));
        assert!(!seq.lock_path().exists());
    }

    /// Serves reads from an empty map and fails every write.
    struct ReadOnlyStore;

    impl crate::store::OptionStore for ReadOnlyStore {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(BridgeError::Store("read-only".to_string()))
        }
        fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_source_token_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = sequencer(dir.path());
        seq.credentials = CredentialStore::new(Arc::new(ReadOnlyStore));

        let mut report = MigrationReport::default();
        let mut warned = 0;
        let token = seq
            .source_token(&mut report, &mut |e| {
                if matches!(e, MigrationEvent::Warning(_)) {
                    warned += 1
                }
            })
            .unwrap();
        assert_eq!(token, "");
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(warned, 1);

        seq.config.bridge.source_token_policy = SourceTokenPolicy::Strict;
        assert!(seq
            .source_token(&mut MigrationReport::default(), &mut |_| {})
            .is_err());
    }
}
