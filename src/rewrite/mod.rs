// ABOUTME: Finalization pass replacing the old origin URL across every table of the site database
// ABOUTME: Runs in resumable (table, offset) batches or to completion in one call

pub mod serialized;

use std::time::{Duration, Instant};

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::site::dump::quote_ident;
use crate::site::Site;
use serialized::{rewrite_value, Rewritten};

/// How much work one batch call may do.
#[derive(Debug, Clone, Copy)]
pub struct BatchBudget {
    pub rows: usize,
    pub time: Duration,
}

impl BatchBudget {
    pub fn unlimited_time(rows: usize) -> Self {
        Self {
            rows,
            time: Duration::MAX,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub completed: bool,
    pub next_table: Option<String>,
    pub next_offset: Option<u64>,
    pub rows_updated: u64,
    pub values_skipped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    pub rows_updated: u64,
    pub values_skipped: u64,
    pub batches: u64,
}

/// Trailing slashes are dropped so `https://a/` and `https://a` rewrite alike.
pub fn normalize_origin(url: &str) -> Result<String> {
    let trimmed = url.trim();
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://"))
        || reqwest::Url::parse(trimmed).is_err()
    {
        return Err(BridgeError::MalformedInput(format!("invalid URL: '{url}'")));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

#[derive(Debug, Clone)]
pub struct Rewriter {
    site: Site,
}

impl Rewriter {
    pub fn new(site: Site) -> Self {
        Self { site }
    }

    fn tables(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT name, sql FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut tables = Vec::with_capacity(rows.len());
        for (name, sql) in rows {
            let sql = sql.unwrap_or_default().to_ascii_uppercase();
            if sql.starts_with("CREATE VIRTUAL TABLE") || sql.contains("WITHOUT ROWID") {
                warn!("Skipping table {} during URL rewrite (no rowid)", name);
                continue;
            }
            tables.push(name);
        }
        Ok(tables)
    }

    fn columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    /// Rewrites up to `limit` rows of `table` starting at `offset`.
    /// Returns (rows scanned, rows updated, values skipped).
    fn rewrite_rows(
        conn: &Connection,
        table: &str,
        offset: u64,
        limit: usize,
        from: &str,
        to: &str,
    ) -> Result<(usize, u64, u64)> {
        let columns = Self::columns(conn, table)?;
        if columns.is_empty() {
            return Ok((0, 0, 0));
        }
        let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let select = format!(
            "SELECT rowid, {} FROM {} ORDER BY rowid LIMIT ?1 OFFSET ?2",
            quoted.join(", "),
            quote_ident(table)
        );

        let rows: Vec<(i64, Vec<SqlValue>)> = {
            let mut stmt = conn.prepare(&select)?;
            let mapped = stmt.query_map(
                rusqlite::params![limit as i64, offset as i64],
                |row| {
                    let rowid: i64 = row.get(0)?;
                    let mut values = Vec::with_capacity(columns.len());
                    for idx in 0..columns.len() {
                        values.push(row.get::<_, SqlValue>(idx + 1)?);
                    }
                    Ok((rowid, values))
                },
            )?;
            mapped.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut updated = 0u64;
        let mut skipped = 0u64;
        let tx = conn.unchecked_transaction()?;
        for (rowid, values) in &rows {
            let mut changes: Vec<(usize, String)> = Vec::new();
            for (idx, value) in values.iter().enumerate() {
                let SqlValue::Text(text) = value else { continue };
                match rewrite_value(text, from, to) {
                    Rewritten::Changed(next) => changes.push((idx, next)),
                    Rewritten::Corrupt => {
                        skipped += 1;
                        warn!(
                            "Skipping corrupted serialized value in {}.{} (rowid {})",
                            table, columns[idx], rowid
                        );
                    }
                    Rewritten::Unchanged => {}
                }
            }
            if changes.is_empty() {
                continue;
            }
            let assignments: Vec<String> = changes
                .iter()
                .enumerate()
                .map(|(n, (idx, _))| format!("{} = ?{}", quoted[*idx], n + 1))
                .collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE rowid = ?{}",
                quote_ident(table),
                assignments.join(", "),
                changes.len() + 1
            );
            let mut params: Vec<SqlValue> = changes
                .into_iter()
                .map(|(_, text)| SqlValue::Text(text))
                .collect();
            params.push(SqlValue::Integer(*rowid));
            tx.execute(&sql, rusqlite::params_from_iter(params))?;
            updated += 1;
        }
        tx.commit()?;
        Ok((rows.len(), updated, skipped))
    }

    /// Processes one bounded slice, starting at `table` (first table when `None`) and `offset`.
    pub fn run_batch(
        &self,
        conn: &Connection,
        from: &str,
        to: &str,
        table: Option<&str>,
        offset: u64,
        budget: BatchBudget,
    ) -> Result<BatchOutcome> {
        let tables = Self::tables(conn)?;
        let mut index = match table.filter(|t| !t.is_empty()) {
            None => 0,
            Some(name) => tables.iter().position(|t| t == name).ok_or_else(|| {
                BridgeError::MalformedInput(format!("unknown table: {name}"))
            })?,
        };
        let mut offset = offset;
        let mut outcome = BatchOutcome::default();
        let started = Instant::now();
        let mut remaining = budget.rows.max(1);

        if from == to {
            outcome.completed = true;
            return Ok(outcome);
        }

        while index < tables.len() {
            if remaining == 0 || started.elapsed() >= budget.time {
                outcome.next_table = Some(tables[index].clone());
                outcome.next_offset = Some(offset);
                return Ok(outcome);
            }
            let name = &tables[index];
            let (scanned, updated, skipped) =
                Self::rewrite_rows(conn, name, offset, remaining, from, to)?;
            outcome.rows_updated += updated;
            outcome.values_skipped += skipped;
            debug!(
                "Rewrote {} of {} rows in {} from offset {}",
                updated, scanned, name, offset
            );

            if scanned < remaining {
                index += 1;
                offset = 0;
            } else {
                offset += scanned as u64;
            }
            remaining -= scanned.min(remaining);
        }

        outcome.completed = true;
        Ok(outcome)
    }

    /// Runs batches back to back until every table is done.
    pub fn run_all(
        &self,
        conn: &Connection,
        from: &str,
        to: &str,
        batch_rows: usize,
    ) -> Result<RewriteSummary> {
        let mut summary = RewriteSummary::default();
        let mut table: Option<String> = None;
        let mut offset = 0;
        loop {
            let outcome = self.run_batch(
                conn,
                from,
                to,
                table.as_deref(),
                offset,
                BatchBudget::unlimited_time(batch_rows),
            )?;
            summary.batches += 1;
            summary.rows_updated += outcome.rows_updated;
            summary.values_skipped += outcome.values_skipped;
            if outcome.completed {
                return Ok(summary);
            }
            table = outcome.next_table;
            offset = outcome.next_offset.unwrap_or(0);
        }
    }

    /// Side effects of a completed pass: drop derived routes, persist the new origin.
    pub fn complete(&self, conn: &Connection, new_url: &str) -> Result<()> {
        self.site.flush_routing_cache(conn)?;
        self.site.persist_canonical_url(conn, new_url)?;
        info!("Canonical site URL set to {}", new_url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;

    const FROM: &str = "https://src.test";
    const TO: &str = "https://dest.test";

    fn fixture() -> (tempfile::TempDir, Rewriter, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let site = Site::from_config(&SiteConfig {
            database: dir.path().join("site.db"),
            ..SiteConfig::default()
        });
        let conn = site.open_db().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE options (option_name TEXT PRIMARY KEY, option_value TEXT);
            INSERT INTO options VALUES ('siteurl', 'https://src.test');
            INSERT INTO options VALUES ('widget', 'a:1:{s:3:"url";s:21:"https://src.test/shop";}');
            INSERT INTO options VALUES ('rewrite_rules', 'a:0:{}');
            CREATE TABLE posts (id INTEGER PRIMARY KEY, content TEXT, meta TEXT, views INTEGER);
            "#,
        )
        .unwrap();
        for i in 0..25 {
            conn.execute(
                "INSERT INTO posts (content, meta, views) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    format!("<a href=\"https://src.test/p/{i}\">post</a>"),
                    if i % 5 == 0 { "s:16:\"https://src.test\";" } else { "plain" },
                    i
                ],
            )
            .unwrap();
        }
        (dir, Rewriter::new(site), conn)
    }

    fn snapshot(conn: &Connection) -> Vec<String> {
        let mut out = Vec::new();
        for sql in [
            "SELECT option_name || '=' || option_value FROM options ORDER BY option_name",
            "SELECT id || '|' || content || '|' || meta FROM posts ORDER BY id",
        ] {
            let mut stmt = conn.prepare(sql).unwrap();
            let rows = stmt.query_map([], |r| r.get::<_, String>(0)).unwrap();
            out.extend(rows.map(|r| r.unwrap()));
        }
        out
    }

    #[test]
    fn test_batched_matches_monolithic() {
        let (_a, rewriter, mono) = fixture();
        let summary = rewriter.run_all(&mono, FROM, TO, 10_000).unwrap();
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.rows_updated, 2 + 25);

        let (_b, rewriter_b, batched) = fixture();
        let mut table: Option<String> = None;
        let mut offset = 0;
        let mut calls = 0;
        loop {
            let outcome = rewriter_b
                .run_batch(
                    &batched,
                    FROM,
                    TO,
                    table.as_deref(),
                    offset,
                    BatchBudget::unlimited_time(4),
                )
                .unwrap();
            calls += 1;
            if outcome.completed {
                break;
            }
            table = outcome.next_table;
            offset = outcome.next_offset.unwrap();
        }
        assert!(calls > 5);
        assert_eq!(snapshot(&mono), snapshot(&batched));
        assert!(snapshot(&batched).iter().all(|row| !row.contains(FROM)));
        assert!(snapshot(&batched)
            .contains(&r#"widget=a:1:{s:3:"url";s:22:"https://dest.test/shop";}"#.to_string()));
    }

    #[test]
    fn test_rerun_is_noop() {
        let (_d, rewriter, conn) = fixture();
        rewriter.run_all(&conn, FROM, TO, 7).unwrap();
        let again = rewriter.run_all(&conn, FROM, TO, 7).unwrap();
        assert_eq!(again.rows_updated, 0);
    }

    #[test]
    fn test_zero_time_budget_makes_no_progress_but_returns_cursor() {
        let (_d, rewriter, conn) = fixture();
        let budget = BatchBudget {
            rows: 100,
            time: Duration::ZERO,
        };
        let outcome = rewriter
            .run_batch(&conn, FROM, TO, Some("posts"), 3, budget)
            .unwrap();
        assert!(!outcome.completed);
        assert_eq!(outcome.next_table.as_deref(), Some("posts"));
        assert_eq!(outcome.next_offset, Some(3));
    }

    #[test]
    fn test_unknown_table_is_malformed_input() {
        let (_d, rewriter, conn) = fixture();
        let err = rewriter
            .run_batch(&conn, FROM, TO, Some("nope"), 0, BatchBudget::unlimited_time(5))
            .unwrap_err();
        assert!(matches!(err, BridgeError::MalformedInput(_)));
    }

    #[test]
    fn test_corrupted_value_is_counted_and_left_alone() {
        let (_d, rewriter, conn) = fixture();
        let broken = r#"a:1:{s:3:"url";s:99:"https://src.test";}"#;
        conn.execute(
            "INSERT INTO options VALUES ('broken', ?1)",
            rusqlite::params![broken],
        )
        .unwrap();
        let summary = rewriter.run_all(&conn, FROM, TO, 50).unwrap();
        assert_eq!(summary.values_skipped, 1);
        let stored: String = conn
            .query_row(
                "SELECT option_value FROM options WHERE option_name = 'broken'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(stored, broken);
    }

    #[test]
    fn test_complete_persists_url_and_flushes_cache() {
        let (_d, rewriter, conn) = fixture();
        rewriter.complete(&conn, TO).unwrap();
        let names: Vec<String> = conn
            .prepare("SELECT option_name FROM options ORDER BY option_name")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert!(!names.contains(&"rewrite_rules".to_string()));
        let home: String = conn
            .query_row(
                "SELECT option_value FROM options WHERE option_name = 'home'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(home, TO);
    }

    #[test]
    fn test_normalize_origin() {
        assert_eq!(normalize_origin("https://src.test/").unwrap(), "https://src.test");
        assert!(normalize_origin("src.test").is_err());
        assert!(normalize_origin("").is_err());
    }
}
