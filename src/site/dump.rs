// ABOUTME: Plain-text SQL dump and restore of a whole SQLite site database
// ABOUTME: Tables first (drop, create, rows), then indexes, triggers and views, in one transaction

use std::io::Write;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

struct SchemaObject {
    kind: String,
    name: String,
    sql: String,
}

fn schema_objects(conn: &Connection) -> Result<Vec<SchemaObject>> {
    let mut stmt = conn.prepare(
        "SELECT type, name, sql FROM sqlite_master
         WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%'
         ORDER BY CASE type
             WHEN 'table' THEN 0
             WHEN 'index' THEN 1
             WHEN 'trigger' THEN 2
             ELSE 3
         END, name",
    )?;
    let objects = stmt
        .query_map([], |row| {
            Ok(SchemaObject {
                kind: row.get(0)?,
                name: row.get(1)?,
                sql: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(objects)
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(r) if r.is_infinite() => {
            if r > 0.0 {
                "9e999".to_string()
            } else {
                "-9e999".to_string()
            }
        }
        ValueRef::Real(r) => format!("{r:?}"),
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => format!("'{}'", text.replace('\'', "''")),
            Err(_) => format!("CAST(X'{}' AS TEXT)", hex::encode(bytes)),
        },
        ValueRef::Blob(bytes) => format!("X'{}'", hex::encode(bytes)),
    }
}

/// Writes every table, row, index, trigger and view of `conn` as SQL text.
pub fn export(conn: &Connection, out: &mut impl Write) -> Result<u64> {
    let objects = schema_objects(conn)?;
    let mut rows_written = 0u64;

    writeln!(out, "-- site-bridge database dump")?;
    writeln!(out, "-- generated {}", chrono::Utc::now().to_rfc3339())?;
    writeln!(out, "PRAGMA foreign_keys=OFF;")?;
    writeln!(out, "BEGIN TRANSACTION;")?;

    for object in objects.iter().filter(|o| o.kind == "table") {
        if object.sql.to_ascii_uppercase().starts_with("CREATE VIRTUAL TABLE") {
            warn!("Skipping virtual table {} in dump", object.name);
            continue;
        }
        let table = quote_ident(&object.name);
        writeln!(out, "DROP TABLE IF EXISTS {table};")?;
        writeln!(out, "{};", object.sql)?;

        let mut stmt = conn.prepare(&format!("SELECT * FROM {table}"))?;
        let columns = stmt.column_count();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns);
            for idx in 0..columns {
                values.push(sql_literal(row.get_ref(idx)?));
            }
            writeln!(out, "INSERT INTO {table} VALUES({});", values.join(","))?;
            rows_written += 1;
        }
        debug!("Dumped table {}", object.name);
    }

    for object in objects.iter().filter(|o| o.kind != "table") {
        if object.kind == "view" {
            writeln!(out, "DROP VIEW IF EXISTS {};", quote_ident(&object.name))?;
        }
        writeln!(out, "{};", object.sql)?;
    }

    writeln!(out, "COMMIT;")?;
    out.flush()?;
    Ok(rows_written)
}

/// Executes a dump produced by [`export`] against `conn`.
pub fn import(conn: &Connection, sql: &str) -> Result<()> {
    if !sql.contains("BEGIN TRANSACTION;") {
        return Err(BridgeError::MalformedInput(
            "database dump is missing its transaction header".to_string(),
        ));
    }
    if let Err(e) = conn.execute_batch(sql) {
        if !conn.is_autocommit() {
            if let Err(rollback) = conn.execute_batch("ROLLBACK;") {
                warn!("Rollback after failed import also failed: {}", rollback);
            }
        }
        return Err(e.into());
    }
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT, body TEXT, score REAL, raw BLOB);
             CREATE INDEX idx_posts_title ON posts(title);
             CREATE VIEW titles AS SELECT title FROM posts;
             INSERT INTO posts VALUES (1, 'It''s here', 'line1
line2', 1.5, X'00ff');
             INSERT INTO posts VALUES (2, NULL, 'x', -2.0, NULL);",
        )
        .unwrap();
        conn
    }

    fn dump(conn: &Connection) -> String {
        let mut buf = Vec::new();
        export(conn, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_dump_restores_into_empty_database() {
        let source = seeded();
        let sql = dump(&source);

        let target = Connection::open_in_memory().unwrap();
        import(&target, &sql).unwrap();

        let (title, body, score, raw): (String, String, f64, Vec<u8>) = target
            .query_row(
                "SELECT title, body, score, raw FROM posts WHERE id = 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!(title, "It's here");
        assert_eq!(body, "line1\nline2");
        assert_eq!(score, 1.5);
        assert_eq!(raw, vec![0x00, 0xff]);

        let count: i64 = target
            .query_row("SELECT COUNT(*) FROM titles", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_import_replaces_existing_tables() {
        let sql = dump(&seeded());
        let target = Connection::open_in_memory().unwrap();
        target
            .execute_batch("CREATE TABLE posts (id INTEGER PRIMARY KEY, stale TEXT); INSERT INTO posts VALUES (9, 'old');")
            .unwrap();
        import(&target, &sql).unwrap();
        import(&target, &sql).unwrap();
        let ids: Vec<i64> = target
            .prepare("SELECT id FROM posts ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_import_rejects_garbage_and_rolls_back() {
        let target = Connection::open_in_memory().unwrap();
        assert!(import(&target, "hello").is_err());
        assert!(import(&target, "BEGIN TRANSACTION;\nCREATE TABLE t(a);\nNOT SQL;").is_err());
        assert!(target.is_autocommit());
        let tables: i64 = target
            .query_row("SELECT COUNT(*) FROM sqlite_master", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tables, 0);
    }
}
