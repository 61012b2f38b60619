//! Durable event log backing the relay
//!
//! Repositories, branches and the tick-ordered events of every branch live
//! in one SQLite database. The schema is an on-disk contract shared with
//! older deployments and is brought up to date by [`super::migrations`].

use crate::protocol::{Blob, Event, EventPayload};
use crate::server::migrations::migrations;
use crate::types::{Branch, Error, Repository, Result, Tick};
use rusqlite::{params, Connection, ErrorCode as SqliteErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Server-side store of repositories, branches, events and snapshots.
#[derive(Debug)]
pub struct EventLog {
    connection: Mutex<Connection>,
}

impl EventLog {
    /// Open or create an event log, applying pending migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        tracing::info!("Opening event log at {:?}", path.as_ref());

        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut connection: Connection) -> Result<Self> {
        // The pragma is a no-op inside a transaction, so it is toggled
        // around the migrations rather than within them.
        connection.pragma_update(None, "foreign_keys", "OFF")?;
        migrations().to_latest(&mut connection)?;
        connection.pragma_update(None, "foreign_keys", "ON")?;

        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Current schema version, for diagnostics.
    pub fn schema_version(&self) -> Result<String> {
        let connection = self.lock();
        let version = migrations().current_version(&connection)?;
        Ok(format!("{:?}", version))
    }

    pub fn insert_repository(&self, repo: &Repository) -> Result<()> {
        tracing::debug!(repo = %repo.name, "Inserting repository");

        self.lock()
            .execute(
                "INSERT INTO repos (name, hash, file, type, date) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![repo.name, repo.hash, repo.file, repo.kind, repo.date],
            )
            .map_err(|error| {
                conflict_or(error, || format!("Repository {}", repo.name))
            })?;
        Ok(())
    }

    pub fn select_repositories(&self) -> Result<Vec<Repository>> {
        let connection = self.lock();
        let mut statement =
            connection.prepare("SELECT name, hash, file, type, date FROM repos ORDER BY name")?;
        let repos = statement
            .query_map([], repository_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(repos)
    }

    pub fn select_repository(&self, name: &str) -> Result<Option<Repository>> {
        let repo = self
            .lock()
            .query_row(
                "SELECT name, hash, file, type, date FROM repos WHERE name = ?1",
                params![name],
                repository_from_row,
            )
            .optional()?;
        Ok(repo)
    }

    /// Inserts a branch; its repository must exist.
    pub fn insert_branch(&self, branch: &Branch) -> Result<()> {
        tracing::debug!(repo = %branch.repo, branch = %branch.name, "Inserting branch");

        if self.select_repository(&branch.repo)?.is_none() {
            return Err(Error::UnknownRepository {
                repo: branch.repo.clone(),
            });
        }

        self.lock()
            .execute(
                "INSERT INTO branches (repo, name, date) VALUES (?1, ?2, ?3)",
                params![branch.repo, branch.name, branch.date],
            )
            .map_err(|error| {
                conflict_or(error, || format!("Branch {}/{}", branch.repo, branch.name))
            })?;
        Ok(())
    }

    /// Lists the branches of a repository.
    ///
    /// A branch with an uploaded snapshot reports its last tick, the point
    /// from which a client downloading the snapshot should subscribe.
    /// Lists the branches of a repository, which must exist.
    pub fn select_branches(&self, repo: &str) -> Result<Vec<Branch>> {
        let connection = self.lock();
        let known: bool = connection.query_row(
            "SELECT EXISTS(SELECT 1 FROM repos WHERE name = ?1)",
            params![repo],
            |row| row.get(0),
        )?;
        if !known {
            return Err(Error::UnknownRepository {
                repo: repo.to_string(),
            });
        }

        let mut statement = connection.prepare(
            "SELECT b.repo, b.name, b.date,
                    CASE WHEN s.repo IS NULL THEN NULL
                         ELSE (SELECT COALESCE(MAX(e.tick), 0) FROM events e
                               WHERE e.repo = b.repo AND e.branch = b.name)
                    END
             FROM branches b
             LEFT JOIN snapshots s ON s.repo = b.repo AND s.branch = b.name
             WHERE b.repo = ?1
             ORDER BY b.name",
        )?;
        let branches = statement
            .query_map(params![repo], |row| {
                Ok(Branch {
                    repo: row.get(0)?,
                    name: row.get(1)?,
                    date: row.get(2)?,
                    tick: row.get::<_, Option<i64>>(3)?.map(to_tick),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(branches)
    }

    pub fn select_branch(&self, repo: &str, name: &str) -> Result<Option<Branch>> {
        let branch = self
            .lock()
            .query_row(
                "SELECT repo, name, date FROM branches WHERE repo = ?1 AND name = ?2",
                params![repo, name],
                |row| {
                    Ok(Branch {
                        repo: row.get(0)?,
                        name: row.get(1)?,
                        date: row.get(2)?,
                        tick: None,
                    })
                },
            )
            .optional()?;
        Ok(branch)
    }

    pub fn branch_exists(&self, repo: &str, name: &str) -> Result<bool> {
        Ok(self.select_branch(repo, name)?.is_some())
    }

    /// Persists an event at the next tick of its branch and returns that tick.
    ///
    /// The first event of a branch gets tick 1.
    pub fn append_event(&self, repo: &str, branch: &str, payload: &EventPayload) -> Result<Tick> {
        let bytes = payload.to_bytes()?;
        let mut connection = self.lock();
        let tx = connection.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM branches WHERE repo = ?1 AND name = ?2)",
            params![repo, branch],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(Error::UnknownBranch {
                repo: repo.to_string(),
                branch: branch.to_string(),
            });
        }

        let tick: i64 = tx.query_row(
            "SELECT COALESCE(MAX(tick), 0) + 1 FROM events WHERE repo = ?1 AND branch = ?2",
            params![repo, branch],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO events (repo, branch, tick, payload) VALUES (?1, ?2, ?3, ?4)",
            params![repo, branch, tick, bytes],
        )?;
        tx.commit()?;

        tracing::debug!(%repo, %branch, tick, "Appended event");
        Ok(to_tick(tick))
    }

    /// All events of a branch after `since`, in tick order.
    pub fn read_events(&self, repo: &str, branch: &str, since: Tick) -> Result<Vec<Event>> {
        let since = i64::try_from(since).unwrap_or(i64::MAX);
        let connection = self.lock();
        let mut statement = connection.prepare(
            "SELECT tick, payload FROM events
             WHERE repo = ?1 AND branch = ?2 AND tick > ?3
             ORDER BY tick ASC",
        )?;
        let rows = statement
            .query_map(params![repo, branch, since], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(tick, bytes)| Ok(Event::new(to_tick(tick), EventPayload::from_bytes(&bytes)?)))
            .collect()
    }

    /// Tick of the newest event of a branch, 0 if it has none.
    pub fn last_tick(&self, repo: &str, branch: &str) -> Result<Tick> {
        let tick: i64 = self.lock().query_row(
            "SELECT COALESCE(MAX(tick), 0) FROM events WHERE repo = ?1 AND branch = ?2",
            params![repo, branch],
            |row| row.get(0),
        )?;
        Ok(to_tick(tick))
    }

    /// Stores the full document of a branch, replacing any previous one.
    pub fn store_snapshot(&self, repo: &str, branch: &str, content: &Blob) -> Result<()> {
        if !self.branch_exists(repo, branch)? {
            return Err(Error::UnknownBranch {
                repo: repo.to_string(),
                branch: branch.to_string(),
            });
        }

        self.lock().execute(
            "INSERT INTO snapshots (repo, branch, content) VALUES (?1, ?2, ?3)
             ON CONFLICT (repo, branch) DO UPDATE SET content = excluded.content",
            params![repo, branch, content.0],
        )?;
        tracing::debug!(%repo, %branch, size = content.len(), "Stored snapshot");
        Ok(())
    }

    pub fn load_snapshot(&self, repo: &str, branch: &str) -> Result<Blob> {
        let content: Option<Vec<u8>> = self
            .lock()
            .query_row(
                "SELECT content FROM snapshots WHERE repo = ?1 AND branch = ?2",
                params![repo, branch],
                |row| row.get(0),
            )
            .optional()?;

        content.map(Blob).ok_or_else(|| Error::SnapshotNotFound {
            repo: repo.to_string(),
            branch: branch.to_string(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied
        // statement behind: SQLite rolls back the open transaction.
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn repository_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        name: row.get(0)?,
        hash: row.get(1)?,
        file: row.get(2)?,
        kind: row.get(3)?,
        date: row.get(4)?,
    })
}

fn to_tick(tick: i64) -> Tick {
    Tick::try_from(tick).unwrap_or_default()
}

fn conflict_or(error: rusqlite::Error, what: impl FnOnce() -> String) -> Error {
    match error.sqlite_error_code() {
        Some(SqliteErrorCode::ConstraintViolation) => Error::Conflict { what: what() },
        _ => Error::Database(error),
    }
}
