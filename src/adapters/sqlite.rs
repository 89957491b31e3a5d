//! SQLite-backed relational store.
//!
//! One connection in WAL mode, shared by every session through an
//! `Arc<Mutex<_>>`. Statements run on the blocking pool so the async runtime
//! never waits on disk.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::{Artifact, ArtifactKind, CallEvent, Role, StorageLocation};

use super::{ArtifactStore, ArtifactWrite, CallStore};

const CORE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS calls (
    id          TEXT PRIMARY KEY,
    room        TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    ended_at    TEXT
);

CREATE TABLE IF NOT EXISTS call_messages (
    call_id     TEXT NOT NULL,
    sequence    INTEGER NOT NULL,
    sender      TEXT NOT NULL,
    content     TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    offset_ms   INTEGER NOT NULL,
    PRIMARY KEY (call_id, sequence)
);
";

const ARTIFACT_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS call_artifacts (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    call_id       TEXT NOT NULL,
    type          TEXT NOT NULL,
    provider      TEXT NOT NULL DEFAULT 's3',
    bucket        TEXT NOT NULL,
    object_key    TEXT NOT NULL,
    region        TEXT,
    endpoint      TEXT,
    content_type  TEXT,
    etag          TEXT,
    size_bytes    INTEGER,
    sha256        TEXT,
    egress_id     TEXT,
    created_at    TEXT NOT NULL,
    UNIQUE (call_id, type, bucket, object_key)
);
CREATE INDEX IF NOT EXISTS ix_call_artifacts_call ON call_artifacts (call_id);
";

/// A persisted call message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub call_id: String,
    pub sequence: u64,
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted call row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCall {
    pub id: String,
    pub room: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// SQLite store for calls, messages and (optionally) artifacts
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database file and ensure the core schema
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Self::from_connection(conn)
    }

    /// In-memory database (tests, dry runs)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(CORE_SCHEMA)
            .context("Failed to initialize schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create the optional artifact table
    pub async fn init_artifact_schema(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch(ARTIFACT_SCHEMA)).await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| anyhow!("SQLite connection lock poisoned"))?;
            f(&mut guard).map_err(anyhow::Error::from)
        })
        .await
        .context("SQLite task failed")?
    }

    /// Messages of a call in sequence order
    pub async fn messages_for_call(&self, call_id: &str) -> Result<Vec<StoredMessage>> {
        let call_id = call_id.to_string();
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT call_id, sequence, sender, content, created_at
                     FROM call_messages WHERE call_id = ?1 ORDER BY sequence ASC",
                )?;
                let rows = stmt
                    .query_map(params![call_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(call_id, sequence, sender, text, created_at)| -> Result<StoredMessage> {
                Ok(StoredMessage {
                    call_id,
                    sequence: sequence as u64,
                    role: Role::parse(&sender)
                        .ok_or_else(|| anyhow!("Unknown sender in database: {}", sender))?,
                    text,
                    created_at: parse_time(&created_at)?,
                })
            })
            .collect()
    }

    /// Look up a call row
    pub async fn get_call(&self, call_id: &str) -> Result<Option<StoredCall>> {
        let call_id = call_id.to_string();
        let row = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, room, started_at, ended_at FROM calls WHERE id = ?1",
                    params![call_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    },
                )
                .optional()
            })
            .await?;

        row.map(|(id, room, started_at, ended_at)| -> Result<StoredCall> {
            Ok(StoredCall {
                id,
                room,
                started_at: parse_time(&started_at)?,
                ended_at: ended_at.as_deref().map(parse_time).transpose()?,
            })
        })
        .transpose()
    }

    /// Artifact rows of a call, oldest first. Empty when the table is absent.
    pub async fn artifacts_for_call(&self, call_id: &str) -> Result<Vec<Artifact>> {
        let call_id = call_id.to_string();
        let rows = self
            .with_conn(move |conn| {
                if !artifact_table_exists(conn)? {
                    return Ok(Vec::new());
                }
                let mut stmt = conn.prepare(
                    "SELECT call_id, type, bucket, object_key, region, endpoint, content_type,
                            etag, size_bytes, sha256, egress_id, created_at
                     FROM call_artifacts WHERE call_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map(params![call_id], |row| {
                        Ok(ArtifactRow {
                            call_id: row.get(0)?,
                            kind: row.get(1)?,
                            bucket: row.get(2)?,
                            key: row.get(3)?,
                            region: row.get(4)?,
                            endpoint: row.get(5)?,
                            content_type: row.get(6)?,
                            etag: row.get(7)?,
                            size_bytes: row.get(8)?,
                            sha256: row.get(9)?,
                            egress_id: row.get(10)?,
                            created_at: row.get(11)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(ArtifactRow::into_artifact).collect()
    }
}

struct ArtifactRow {
    call_id: String,
    kind: String,
    bucket: String,
    key: String,
    region: Option<String>,
    endpoint: Option<String>,
    content_type: Option<String>,
    etag: Option<String>,
    size_bytes: Option<i64>,
    sha256: Option<String>,
    egress_id: Option<String>,
    created_at: String,
}

impl ArtifactRow {
    fn into_artifact(self) -> Result<Artifact> {
        let kind = ArtifactKind::parse(&self.kind)
            .ok_or_else(|| anyhow!("Unknown artifact type in database: {}", self.kind))?;
        Ok(Artifact {
            call_id: self.call_id,
            kind,
            location: StorageLocation {
                bucket: self.bucket,
                key: self.key,
                region: self.region,
                endpoint: self.endpoint,
            },
            size_bytes: self.size_bytes.map(|s| s as u64),
            checksum_sha256: self.sha256,
            content_type: self.content_type,
            etag: self.etag,
            egress_id: self.egress_id,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

fn artifact_table_exists(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'call_artifacts'",
        [],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count > 0)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {}", value))
}

#[async_trait]
impl CallStore for SqliteStore {
    async fn open_call(&self, call_id: &str, room: &str, started_at: DateTime<Utc>) -> Result<()> {
        let (call_id, room) = (call_id.to_string(), room.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO calls (id, room, started_at) VALUES (?1, ?2, ?3)",
                params![call_id, room, started_at.to_rfc3339()],
            )
            .map(|_| ())
        })
        .await
    }

    async fn write_events(&self, events: &[CallEvent]) -> Result<usize> {
        let events = events.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO call_messages
                        (call_id, sequence, sender, content, created_at, offset_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for event in &events {
                    inserted += stmt.execute(params![
                        event.call_id,
                        event.sequence as i64,
                        event.role.as_str(),
                        event.text,
                        event.timestamp.wall.to_rfc3339(),
                        event.timestamp.offset_ms as i64,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn close_call(&self, call_id: &str, ended_at: DateTime<Utc>) -> Result<()> {
        let call_id = call_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE calls SET ended_at = ?2 WHERE id = ?1 AND ended_at IS NULL",
                params![call_id, ended_at.to_rfc3339()],
            )
            .map(|_| ())
        })
        .await
    }
}

#[async_trait]
impl ArtifactStore for SqliteStore {
    async fn record_artifact(&self, artifact: &Artifact) -> Result<ArtifactWrite> {
        let a = artifact.clone();
        self.with_conn(move |conn| {
            if !artifact_table_exists(conn)? {
                return Ok(ArtifactWrite::SchemaMissing);
            }
            let changed = conn.execute(
                "INSERT OR IGNORE INTO call_artifacts
                    (call_id, type, provider, bucket, object_key, region, endpoint,
                     content_type, etag, size_bytes, sha256, egress_id, created_at)
                 VALUES (?1, ?2, 's3', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    a.call_id,
                    a.kind.as_str(),
                    a.location.bucket,
                    a.location.key,
                    a.location.region,
                    a.location.endpoint,
                    a.content_type,
                    a.etag,
                    a.size_bytes.map(|s| s as i64),
                    a.checksum_sha256,
                    a.egress_id,
                    a.created_at.to_rfc3339(),
                ],
            )?;
            Ok(if changed == 0 {
                ArtifactWrite::AlreadyPresent
            } else {
                ArtifactWrite::Inserted
            })
        })
        .await
    }
}
