// ABOUTME: The migrated web site: its SQLite store, content directories and options table
// ABOUTME: Owns canonical-URL persistence and the derived routing cache

pub mod dump;

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::config::SiteConfig;
use crate::error::Result;
use crate::types::StepKind;

pub const SITE_URL_OPTION: &str = "siteurl";
pub const HOME_OPTION: &str = "home";
pub const ROUTING_CACHE_OPTION: &str = "rewrite_rules";

#[derive(Debug, Clone)]
pub struct Site {
    database: PathBuf,
    plugins_dir: PathBuf,
    themes_dir: PathBuf,
    uploads_dir: PathBuf,
    options_table: String,
}

impl Site {
    pub fn from_config(config: &SiteConfig) -> Self {
        Self {
            database: config.database.clone(),
            plugins_dir: config.plugins_dir.clone(),
            themes_dir: config.themes_dir.clone(),
            uploads_dir: config.uploads_dir.clone(),
            options_table: config.options_table.clone(),
        }
    }

    pub fn open_db(&self) -> Result<Connection> {
        if let Some(parent) = self.database.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.database)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Directory a file-bundle step packs from and restores into.
    pub fn directory(&self, kind: StepKind) -> Option<&Path> {
        match kind {
            StepKind::Database => None,
            StepKind::Plugins => Some(&self.plugins_dir),
            StepKind::Themes => Some(&self.themes_dir),
            StepKind::Uploads => Some(&self.uploads_dir),
        }
    }

    fn ensure_options_table(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (
                 option_name TEXT PRIMARY KEY,
                 option_value TEXT
             );",
            self.options_table
        ))?;
        Ok(())
    }

    fn has_options_table(&self, conn: &Connection) -> Result<bool> {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                rusqlite::params![self.options_table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn option(&self, conn: &Connection, name: &str) -> Result<Option<String>> {
        if !self.has_options_table(conn)? {
            return Ok(None);
        }
        let value = conn
            .query_row(
                &format!(
                    "SELECT option_value FROM \"{}\" WHERE option_name = ?1",
                    self.options_table
                ),
                rusqlite::params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    pub fn set_option(&self, conn: &Connection, name: &str, value: &str) -> Result<()> {
        self.ensure_options_table(conn)?;
        let updated = conn.execute(
            &format!(
                "UPDATE \"{}\" SET option_value = ?2 WHERE option_name = ?1",
                self.options_table
            ),
            rusqlite::params![name, value],
        )?;
        if updated == 0 {
            conn.execute(
                &format!(
                    "INSERT INTO \"{}\" (option_name, option_value) VALUES (?1, ?2)",
                    self.options_table
                ),
                rusqlite::params![name, value],
            )?;
        }
        Ok(())
    }

    /// Drops derived permalink data so it is rebuilt against the new origin.
    pub fn flush_routing_cache(&self, conn: &Connection) -> Result<()> {
        if !self.has_options_table(conn)? {
            return Ok(());
        }
        conn.execute(
            &format!(
                "DELETE FROM \"{}\" WHERE option_name = ?1",
                self.options_table
            ),
            rusqlite::params![ROUTING_CACHE_OPTION],
        )?;
        debug!("Routing cache flushed");
        Ok(())
    }

    pub fn persist_canonical_url(&self, conn: &Connection, url: &str) -> Result<()> {
        self.set_option(conn, SITE_URL_OPTION, url)?;
        self.set_option(conn, HOME_OPTION, url)?;
        Ok(())
    }

    pub fn canonical_url(&self, conn: &Connection) -> Result<Option<String>> {
        self.option(conn, SITE_URL_OPTION)
    }
}
