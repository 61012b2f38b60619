//! Schema history of the event log
//!
//! Migrations are one-way and each runs inside a single transaction. The
//! payload rewrite additionally runs `PRAGMA foreign_key_check` before its
//! commit, so a violation rolls the whole migration back.

use crate::protocol::EventPayload;
use rusqlite::Transaction;
use rusqlite_migration::{HookError, HookResult, Migrations, M};

/// Schema written by the first releases, with events stored as JSON text.
const LEGACY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS repos (
    name TEXT NOT NULL,
    hash TEXT NOT NULL,
    file TEXT NOT NULL,
    type TEXT NOT NULL,
    date TEXT NOT NULL,
    PRIMARY KEY (name)
);

CREATE TABLE IF NOT EXISTS branches (
    repo TEXT NOT NULL,
    name TEXT NOT NULL,
    date TEXT NOT NULL,
    FOREIGN KEY (repo) REFERENCES repos(name),
    PRIMARY KEY (repo, name)
);

CREATE TABLE IF NOT EXISTS events (
    repo TEXT NOT NULL,
    branch TEXT NOT NULL,
    tick INTEGER NOT NULL,
    dict TEXT NOT NULL,
    FOREIGN KEY (repo) REFERENCES repos(name),
    FOREIGN KEY (repo, branch) REFERENCES branches(repo, name),
    PRIMARY KEY (repo, branch, tick)
);
"#;

const BINARY_EVENTS: &str = r#"
CREATE TABLE events_new (
    repo TEXT NOT NULL,
    branch TEXT NOT NULL,
    tick INTEGER NOT NULL,
    payload BLOB NOT NULL,
    FOREIGN KEY (repo) REFERENCES repos(name),
    FOREIGN KEY (repo, branch) REFERENCES branches(repo, name),
    PRIMARY KEY (repo, branch, tick)
);
"#;

const SNAPSHOTS: &str = r#"
CREATE TABLE snapshots (
    repo TEXT NOT NULL,
    branch TEXT NOT NULL,
    content BLOB NOT NULL,
    FOREIGN KEY (repo, branch) REFERENCES branches(repo, name),
    PRIMARY KEY (repo, branch)
);
"#;

/// Every schema version, oldest first.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(LEGACY_SCHEMA),
        M::up_with_hook(BINARY_EVENTS, reencode_payloads).foreign_key_check(),
        M::up(SNAPSHOTS),
    ])
}

/// Rewrites every JSON event into its binary form, then swaps the tables.
fn reencode_payloads(tx: &Transaction) -> HookResult {
    let rows = {
        let mut statement = tx.prepare("SELECT repo, branch, tick, dict FROM events")?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    tracing::info!(events = rows.len(), "Re-encoding event payloads");

    let mut insert = tx.prepare(
        "INSERT INTO events_new (repo, branch, tick, payload) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (repo, branch, tick, dict) in rows {
        let payload: EventPayload = serde_json::from_str(&dict).map_err(|error| {
            HookError::Hook(format!(
                "event {}/{} at tick {} is not a JSON object: {}",
                repo, branch, tick, error
            ))
        })?;
        let bytes = payload.to_bytes().map_err(|error| {
            HookError::Hook(format!(
                "event {}/{} at tick {} cannot be encoded: {}",
                repo, branch, tick, error
            ))
        })?;
        insert.execute(rusqlite::params![repo, branch, tick, bytes])?;
    }
    drop(insert);

    tx.execute_batch("DROP TABLE events; ALTER TABLE events_new RENAME TO events;")?;
    Ok(())
}
