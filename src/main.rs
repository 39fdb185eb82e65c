// ABOUTME: CLI entry point for site-bridge
// ABOUTME: Serves the bridge API and drives roles, keys, packaging and full migrations

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use site_bridge::config::BridgeConfig;
use site_bridge::credentials::CredentialStore;
use site_bridge::sequencer::{MigrationEvent, Sequencer};
use site_bridge::server::{self, AppState};
use site_bridge::store::{OptionStore, SqliteOptionStore};
use site_bridge::types::{Role, StepKind};
use site_bridge::{cleanup, handshake, remote::RemoteClient};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "site-bridge")]
#[command(about = "Move a site between two hosts over the bridge HTTP API", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = "site-bridge.toml")]
    config: PathBuf,
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Source,
    Destination,
}

impl From<RoleArg> for Role {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::Source => Role::Source,
            RoleArg::Destination => Role::Destination,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge API server for this host
    Serve,
    /// Show or change whether this host sends or receives a site
    Role {
        #[arg(value_enum)]
        role: Option<RoleArg>,
    },
    /// Generate a new migration key (destination only)
    GenerateKey,
    /// Connect this source to a destination using its migration key
    Connect {
        /// Migration key copied from the destination
        key: String,
        /// Call the destination's bridge API here instead of the URL in the key
        #[arg(long)]
        url: Option<String>,
    },
    /// Forget the current destination
    Disconnect,
    /// Print this source's download token
    SourceToken {
        /// Replace the token with a new one
        #[arg(long)]
        rotate: bool,
    },
    /// Package artifacts locally without contacting the destination
    Package {
        /// Only package this step (database, plugins, themes, uploads)
        #[arg(long)]
        step: Option<StepKind>,
    },
    /// Run the full migration to the connected destination
    Migrate {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
        /// Do not start an embedded server; another `serve` process handles downloads
        #[arg(long)]
        no_serve: bool,
    },
    /// Remove this host's temporary migration files
    Cleanup,
    /// Show the migration status reported by a destination
    Status {
        /// Base URL of the destination's bridge API
        url: String,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "site_bridge=debug"
    } else {
        "site_bridge=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

fn open_store(config: &BridgeConfig) -> anyhow::Result<Arc<dyn OptionStore>> {
    let store = SqliteOptionStore::open(&config.bridge.state_path).with_context(|| {
        format!(
            "Failed to open bridge state at {}",
            config.bridge.state_path.display()
        )
    })?;
    Ok(Arc::new(store))
}

fn spinner(message: String) -> anyhow::Result<ProgressBar> {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar.set_message(message);
    Ok(bar)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = BridgeConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Role { role } => {
            let credentials = CredentialStore::new(open_store(&config)?);
            match role {
                Some(role) => {
                    credentials.set_role(role.into())?;
                    println!("✓ Site role set to {}", Role::from(role));
                }
                None => println!("{}", credentials.role()?),
            }
            Ok(())
        }
        Commands::GenerateKey => {
            let credentials = CredentialStore::new(open_store(&config)?);
            let key = credentials
                .generate_migration_key(&config.site_url())
                .context("Could not generate a migration key")?;
            println!("{key}");
            println!();
            println!("Paste this key into the source site. Any earlier key is no longer valid.");
            Ok(())
        }
        Commands::Connect { key, url } => {
            let credentials = CredentialStore::new(open_store(&config)?);
            let bar = spinner("Connecting to destination...".to_string())?;
            let result =
                handshake::connect(&credentials, &key, url.as_deref(), &config.timeouts).await;
            bar.finish_and_clear();
            let connection = result.context("Connection failed")?;
            println!(
                "✓ Connected to {} ({}, bridge {})",
                connection.remote_site.site_name,
                connection.destination_url,
                connection.remote_site.version
            );
            Ok(())
        }
        Commands::Disconnect => {
            let credentials = CredentialStore::new(open_store(&config)?);
            handshake::disconnect(&credentials)?;
            println!("✓ Disconnected");
            Ok(())
        }
        Commands::SourceToken { rotate } => {
            let credentials = CredentialStore::new(open_store(&config)?);
            let token = if rotate {
                credentials.rotate_source_token()?
            } else {
                credentials.source_token()?
            };
            println!("{token}");
            Ok(())
        }
        Commands::Package { step } => {
            let credentials = CredentialStore::new(open_store(&config)?);
            let sequencer = Sequencer::new(config, credentials);
            let steps = match step {
                Some(step) => vec![step],
                None => StepKind::ALL.to_vec(),
            };
            for step in steps {
                let bar = spinner(format!("Packaging {}...", step.title()))?;
                let result = sequencer.package_step(step).await;
                bar.finish_and_clear();
                let artifact =
                    result.with_context(|| format!("Packaging {} failed", step.title()))?;
                println!(
                    "✓ {} → {} ({})",
                    step.title(),
                    artifact.path.display(),
                    artifact.human_size()
                );
            }
            Ok(())
        }
        Commands::Migrate { yes, no_serve } => migrate(config, yes, no_serve).await,
        Commands::Cleanup => {
            let removed = cleanup::cleanup_dir(&config.bridge.temp_dir)?;
            println!("✓ Removed {removed} temporary entries");
            Ok(())
        }
        Commands::Status { url } => {
            let client = RemoteClient::new(&url, config.timeouts.clone())?;
            let status = client.migration_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

async fn serve(config: BridgeConfig) -> anyhow::Result<()> {
    let listen = config.bridge.listen;
    let state = Arc::new(AppState::new(config.clone(), open_store(&config)?));
    let role = state.credentials.role()?;
    if role == Role::Source {
        // Downloads are refused until a source token exists.
        state.credentials.source_token()?;
    }
    let (addr, server) = server::bind(state, listen, async move {
        let _ = tokio::signal::ctrl_c().await;
    })?;
    println!("Serving bridge API as {role} on http://{addr}");
    server.await;
    Ok(())
}

async fn migrate(config: BridgeConfig, yes: bool, no_serve: bool) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let credentials = CredentialStore::new(store.clone());
    let connection = credentials
        .require_connection()
        .context("Connect to a destination first with `site-bridge connect <KEY>`")?;

    if !yes {
        let proceed = dialoguer::Confirm::new()
            .with_prompt(format!(
                "Overwrite {} ({}) with this site? Its database and content will be replaced",
                connection.remote_site.site_name, connection.destination_url
            ))
            .default(false)
            .interact()?;
        if !proceed {
            bail!("Migration cancelled");
        }
    }

    let embedded = if no_serve {
        None
    } else {
        let state = Arc::new(AppState::new(config.clone(), store));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let (_, server) = server::bind(state, config.bridge.listen, async move {
            let _ = stopped.await;
        })?;
        Some((stop, tokio::spawn(server)))
    };

    let sequencer = Sequencer::new(config, credentials);
    let bar = ProgressBar::new((StepKind::ALL.len() * 2 + 2) as u64);
    bar.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
    )?);
    bar.enable_steady_tick(Duration::from_millis(120));
    let result = sequencer
        .run(|event| match event {
            MigrationEvent::PackagingStarted(step) => {
                bar.set_message(format!("Packaging {}", step.title()))
            }
            MigrationEvent::Packaged(artifact) => {
                bar.println(format!(
                    "✓ Packaged {} ({})",
                    artifact.kind.title(),
                    artifact.human_size()
                ));
                bar.inc(1);
            }
            MigrationEvent::RestoreStarted(step) => {
                bar.set_message(format!("Restoring {} on destination", step.title()))
            }
            MigrationEvent::Restored { message, .. } => {
                bar.println(format!("✓ {message}"));
                bar.inc(1);
            }
            MigrationEvent::FinalizeStarted { old_url } => {
                bar.set_message(format!("Rewriting {old_url}"))
            }
            MigrationEvent::FinalizeBatch { next_table, .. } => {
                if let Some(table) = next_table {
                    bar.set_message(format!("Rewriting URLs ({table})"));
                }
            }
            MigrationEvent::Finalized {
                new_url,
                rows_updated,
            } => {
                bar.println(format!("✓ Site URL is now {new_url} ({rows_updated} rows)"));
                bar.inc(1);
            }
            MigrationEvent::CleanupFinished => bar.inc(1),
            MigrationEvent::Warning(message) => bar.println(format!("⚠ {message}")),
        })
        .await;
    bar.finish_and_clear();

    if let Some((stop, handle)) = embedded {
        let _ = stop.send(());
        let _ = handle.await;
    }

    let report = result.context("Migration failed")?;
    if report.warnings.is_empty() {
        println!("✓ Migration complete: {} → {}", report.old_url, report.new_url);
    } else {
        println!(
            "✓ Migration complete with {} warning(s): {} → {}",
            report.warnings.len(),
            report.old_url,
            report.new_url
        );
    }
    Ok(())
}
