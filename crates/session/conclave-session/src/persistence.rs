//! Durable session snapshots and startup restore
//!
//! Snapshots are append-only per session: the latest record fully describes
//! the session (participants without live transport handles, active tasks,
//! open vetoes and handshakes by id, status, timestamps, configuration).
//! The store is treated as a single logical writer; versions increase
//! monotonically per session.

use crate::types::{Session, SessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conclave_core::events::{ConclaveEvent, EventBus};
use conclave_core::types::SessionId;
use conclave_core::{ConclaveError, ConclaveResult};
use dashmap::DashMap;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_rusqlite::Connection as AsyncConnection;
use tracing::{debug, info, warn};

/// Current snapshot schema version
pub const SCHEMA_VERSION: i32 = 1;

/// A durable record of one session at one version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// The session, transport-free
    pub session: Session,
    /// Monotonically increasing per-session version
    pub version: u64,
    /// Authoritative save time
    pub saved_at: DateTime<Utc>,
}

/// Listing entry for saved sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id
    pub session_id: SessionId,
    /// Status at the latest snapshot
    pub status: SessionStatus,
    /// Latest version
    pub version: u64,
    /// When the latest snapshot was taken
    pub saved_at: DateTime<Utc>,
    /// Member count at the latest snapshot
    pub participant_count: usize,
}

/// Storage health information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageHealth {
    pub is_healthy: bool,
    pub error_message: Option<String>,
    pub total_sessions: usize,
    pub total_snapshots: usize,
    pub storage_size_bytes: Option<u64>,
}

/// Abstract snapshot store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Prepare the storage (schemas, directories)
    async fn initialize(&self) -> ConclaveResult<()>;

    /// Append a snapshot of `session`, assigning the next version
    async fn save_snapshot(&self, session: &Session) -> ConclaveResult<SessionSnapshot>;

    /// Latest snapshot for a session
    async fn load_latest(&self, session_id: &str) -> ConclaveResult<Option<SessionSnapshot>>;

    /// Summaries of every saved session
    async fn list_sessions(&self) -> ConclaveResult<Vec<SessionSummary>>;

    /// Drop every snapshot of a session
    async fn remove_session(&self, session_id: &str) -> ConclaveResult<()>;

    /// Health check
    async fn health_check(&self) -> ConclaveResult<StorageHealth>;

    /// Prune superseded records, keeping the newest `keep_latest` per
    /// session. Returns how many records were removed.
    async fn cleanup_superseded(&self, keep_latest: u64) -> ConclaveResult<usize>;
}

fn summarize(snapshot: &SessionSnapshot) -> SessionSummary {
    SessionSummary {
        session_id: snapshot.session.id.clone(),
        status: snapshot.session.status,
        version: snapshot.version,
        saved_at: snapshot.saved_at,
        participant_count: snapshot.session.participants.len(),
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Append-only store held entirely in memory. Test and development use.
pub struct InMemorySessionStore {
    records: DashMap<SessionId, Vec<SessionSnapshot>>,
}

impl InMemorySessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn initialize(&self) -> ConclaveResult<()> {
        Ok(())
    }

    async fn save_snapshot(&self, session: &Session) -> ConclaveResult<SessionSnapshot> {
        let mut records = self.records.entry(session.id.clone()).or_default();
        let snapshot = SessionSnapshot {
            session: session.clone(),
            version: records.last().map(|s| s.version).unwrap_or(0) + 1,
            saved_at: Utc::now(),
        };
        records.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn load_latest(&self, session_id: &str) -> ConclaveResult<Option<SessionSnapshot>> {
        Ok(self
            .records
            .get(session_id)
            .and_then(|records| records.last().cloned()))
    }

    async fn list_sessions(&self) -> ConclaveResult<Vec<SessionSummary>> {
        let mut summaries: Vec<SessionSummary> = self
            .records
            .iter()
            .filter_map(|entry| entry.value().last().map(|s| summarize(s)))
            .collect();
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(summaries)
    }

    async fn remove_session(&self, session_id: &str) -> ConclaveResult<()> {
        self.records.remove(session_id);
        Ok(())
    }

    async fn health_check(&self) -> ConclaveResult<StorageHealth> {
        let total_snapshots = self.records.iter().map(|e| e.value().len()).sum();
        Ok(StorageHealth {
            is_healthy: true,
            error_message: None,
            total_sessions: self.records.len(),
            total_snapshots,
            storage_size_bytes: None,
        })
    }

    async fn cleanup_superseded(&self, keep_latest: u64) -> ConclaveResult<usize> {
        let keep = keep_latest.max(1) as usize;
        let mut removed = 0;
        for mut entry in self.records.iter_mut() {
            let records = entry.value_mut();
            if records.len() > keep {
                removed += records.len() - keep;
                let tail = records.split_off(records.len() - keep);
                *records = tail;
            }
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// JSON-lines store, one append-only file per session.
pub struct FileSessionStore {
    dir: PathBuf,
    // Single-writer discipline for the whole directory
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    /// Create a store rooted at `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    fn read_latest(path: &Path) -> ConclaveResult<Option<SessionSnapshot>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = fs::File::open(path)
            .map_err(|e| ConclaveError::internal(format!("open {path:?}: {e}")))?;
        let mut latest = None;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| ConclaveError::internal(format!("read {path:?}: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionSnapshot>(&line) {
                Ok(snapshot) => latest = Some(snapshot),
                Err(e) => warn!("skipping corrupt snapshot line in {path:?}: {e}"),
            }
        }
        Ok(latest)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn initialize(&self) -> ConclaveResult<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| ConclaveError::internal(format!("create {:?}: {e}", self.dir)))?;
        info!(dir = ?self.dir, "file session store ready");
        Ok(())
    }

    async fn save_snapshot(&self, session: &Session) -> ConclaveResult<SessionSnapshot> {
        let _guard = self.write_lock.lock().await;
        let path = self.session_path(&session.id);

        let version = Self::read_latest(&path)?.map(|s| s.version).unwrap_or(0) + 1;
        let snapshot = SessionSnapshot {
            session: session.clone(),
            version,
            saved_at: Utc::now(),
        };

        let line = serde_json::to_string(&snapshot)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ConclaveError::internal(format!("open {path:?}: {e}")))?;
        writeln!(file, "{line}")
            .map_err(|e| ConclaveError::internal(format!("append {path:?}: {e}")))?;

        debug!(session_id = %session.id, version, "snapshot appended");
        Ok(snapshot)
    }

    async fn load_latest(&self, session_id: &str) -> ConclaveResult<Option<SessionSnapshot>> {
        Self::read_latest(&self.session_path(session_id))
    }

    async fn list_sessions(&self) -> ConclaveResult<Vec<SessionSummary>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| ConclaveError::internal(format!("read {:?}: {e}", self.dir)))?;

        let mut summaries = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ConclaveError::internal(format!("read dir: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(snapshot) = Self::read_latest(&path)? {
                summaries.push(summarize(&snapshot));
            }
        }
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(summaries)
    }

    async fn remove_session(&self, session_id: &str) -> ConclaveResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.session_path(session_id);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| ConclaveError::internal(format!("remove {path:?}: {e}")))?;
        }
        Ok(())
    }

    async fn health_check(&self) -> ConclaveResult<StorageHealth> {
        let summaries = self.list_sessions().await?;
        let mut size = 0u64;
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                if let Ok(metadata) = entry.metadata() {
                    size += metadata.len();
                }
            }
        }
        Ok(StorageHealth {
            is_healthy: true,
            error_message: None,
            total_sessions: summaries.len(),
            total_snapshots: summaries.iter().map(|s| s.version as usize).sum(),
            storage_size_bytes: Some(size),
        })
    }

    async fn cleanup_superseded(&self, keep_latest: u64) -> ConclaveResult<usize> {
        let _guard = self.write_lock.lock().await;
        let keep = keep_latest.max(1) as usize;
        let mut removed = 0;

        let entries = fs::read_dir(&self.dir)
            .map_err(|e| ConclaveError::internal(format!("read {:?}: {e}", self.dir)))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let file = fs::File::open(&path)
                .map_err(|e| ConclaveError::internal(format!("open {path:?}: {e}")))?;
            let lines: Vec<String> = BufReader::new(file)
                .lines()
                .collect::<Result<_, _>>()
                .map_err(|e| ConclaveError::internal(format!("read {path:?}: {e}")))?;
            let non_empty: Vec<&String> = lines.iter().filter(|l| !l.trim().is_empty()).collect();
            if non_empty.len() <= keep {
                continue;
            }
            removed += non_empty.len() - keep;
            let kept = non_empty[non_empty.len() - keep..]
                .iter()
                .map(|l| l.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            fs::write(&path, format!("{kept}\n"))
                .map_err(|e| ConclaveError::internal(format!("rewrite {path:?}: {e}")))?;
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

/// SQLite-backed store for production deployments.
pub struct SqliteSessionStore {
    connection: Arc<AsyncConnection>,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `db_path`
    pub async fn new(db_path: impl AsRef<Path>) -> ConclaveResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ConclaveError::internal(format!("create {parent:?}: {e}")))?;
        }
        let connection = AsyncConnection::open(db_path)
            .await
            .map_err(|e| ConclaveError::unavailable(format!("open sqlite: {e}")))?;
        Ok(Self {
            connection: Arc::new(connection),
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn initialize(&self) -> ConclaveResult<()> {
        self.connection
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS schema_info (
                        version INTEGER PRIMARY KEY,
                        created_at TEXT NOT NULL
                    )",
                    [],
                )?;
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS session_snapshots (
                        session_id TEXT NOT NULL,
                        version INTEGER NOT NULL,
                        status TEXT NOT NULL,
                        participant_count INTEGER NOT NULL,
                        saved_at TEXT NOT NULL,
                        payload TEXT NOT NULL,
                        PRIMARY KEY (session_id, version)
                    )",
                    [],
                )?;
                conn.execute(
                    "CREATE INDEX IF NOT EXISTS idx_snapshots_session
                     ON session_snapshots(session_id)",
                    [],
                )?;
                conn.execute(
                    "INSERT OR IGNORE INTO schema_info (version, created_at) VALUES (?1, ?2)",
                    params![SCHEMA_VERSION, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| ConclaveError::internal(format!("init schema: {e}")))?;
        info!("sqlite session store ready");
        Ok(())
    }

    async fn save_snapshot(&self, session: &Session) -> ConclaveResult<SessionSnapshot> {
        let session = session.clone();
        self.connection
            .call(move |conn| {
                let tx = conn.transaction()?;
                let version: u64 = tx.query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM session_snapshots WHERE session_id = ?1",
                    params![session.id],
                    |row| row.get::<_, i64>(0),
                )? as u64
                    + 1;

                let snapshot = SessionSnapshot {
                    session,
                    version,
                    saved_at: Utc::now(),
                };
                let payload = serde_json::to_string(&snapshot)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                let status = serde_json::to_string(&snapshot.session.status)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

                tx.execute(
                    "INSERT INTO session_snapshots
                     (session_id, version, status, participant_count, saved_at, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        snapshot.session.id,
                        version as i64,
                        status,
                        snapshot.session.participants.len() as i64,
                        snapshot.saved_at.to_rfc3339(),
                        payload,
                    ],
                )?;
                tx.commit()?;
                Ok(snapshot)
            })
            .await
            .map_err(|e| ConclaveError::internal(format!("save snapshot: {e}")))
    }

    async fn load_latest(&self, session_id: &str) -> ConclaveResult<Option<SessionSnapshot>> {
        let session_id = session_id.to_string();
        let payload: Option<String> = self
            .connection
            .call(move |conn| {
                let payload = conn
                    .query_row(
                        "SELECT payload FROM session_snapshots
                         WHERE session_id = ?1 ORDER BY version DESC LIMIT 1",
                        params![session_id],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(payload)
            })
            .await
            .map_err(|e| ConclaveError::internal(format!("load snapshot: {e}")))?;

        payload
            .map(|p| serde_json::from_str(&p).map_err(ConclaveError::from))
            .transpose()
    }

    async fn list_sessions(&self) -> ConclaveResult<Vec<SessionSummary>> {
        let payloads: Vec<String> = self
            .connection
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT s.payload FROM session_snapshots s
                     JOIN (SELECT session_id, MAX(version) AS v
                           FROM session_snapshots GROUP BY session_id) latest
                     ON s.session_id = latest.session_id AND s.version = latest.v
                     ORDER BY s.session_id",
                )?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut payloads = Vec::new();
                for row in rows {
                    payloads.push(row?);
                }
                Ok(payloads)
            })
            .await
            .map_err(|e| ConclaveError::internal(format!("list sessions: {e}")))?;

        payloads
            .iter()
            .map(|p| {
                serde_json::from_str::<SessionSnapshot>(p)
                    .map(|s| summarize(&s))
                    .map_err(ConclaveError::from)
            })
            .collect()
    }

    async fn remove_session(&self, session_id: &str) -> ConclaveResult<()> {
        let session_id = session_id.to_string();
        self.connection
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM session_snapshots WHERE session_id = ?1",
                    params![session_id],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| ConclaveError::internal(format!("remove session: {e}")))
    }

    async fn health_check(&self) -> ConclaveResult<StorageHealth> {
        self.connection
            .call(|conn| {
                let total_snapshots: i64 =
                    conn.query_row("SELECT COUNT(*) FROM session_snapshots", [], |row| {
                        row.get(0)
                    })?;
                let total_sessions: i64 = conn.query_row(
                    "SELECT COUNT(DISTINCT session_id) FROM session_snapshots",
                    [],
                    |row| row.get(0),
                )?;
                Ok(StorageHealth {
                    is_healthy: true,
                    error_message: None,
                    total_sessions: total_sessions as usize,
                    total_snapshots: total_snapshots as usize,
                    storage_size_bytes: None,
                })
            })
            .await
            .map_err(|e| ConclaveError::internal(format!("health check: {e}")))
    }

    async fn cleanup_superseded(&self, keep_latest: u64) -> ConclaveResult<usize> {
        let keep = keep_latest.max(1) as i64;
        self.connection
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM session_snapshots
                     WHERE version <= (SELECT MAX(version) FROM session_snapshots s2
                                       WHERE s2.session_id = session_snapshots.session_id) - ?1",
                    params![keep],
                )?;
                Ok(removed)
            })
            .await
            .map_err(|e| ConclaveError::internal(format!("cleanup: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

/// Rehydrates sessions at startup.
///
/// The restore manager only reads the store and publishes recreate events;
/// the session manager reacts as a plain bus subscriber, so neither side
/// imports the other.
pub struct RestoreManager {
    store: Arc<dyn SessionStore>,
    bus: EventBus,
}

impl RestoreManager {
    /// Create a restore manager over `store`
    pub fn new(store: Arc<dyn SessionStore>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Summaries of every saved session
    pub async fn list_saved_sessions(&self) -> ConclaveResult<Vec<SessionSummary>> {
        self.store.list_sessions().await
    }

    /// Latest snapshot of one session
    pub async fn restore_session(&self, session_id: &str) -> ConclaveResult<Option<SessionSnapshot>> {
        self.store.load_latest(session_id).await
    }

    /// Emit a recreate event for every Active or Paused saved session.
    ///
    /// Returns the ids that were published. Restoring a session that is
    /// already live is a no-op on the subscriber side, so running this
    /// twice is harmless.
    pub async fn restore_all(&self) -> ConclaveResult<Vec<SessionId>> {
        let summaries = self.store.list_sessions().await?;
        let mut restored = Vec::new();

        for summary in summaries {
            if !matches!(summary.status, SessionStatus::Active | SessionStatus::Paused) {
                continue;
            }
            let Some(snapshot) = self.store.load_latest(&summary.session_id).await? else {
                continue;
            };
            info!(session_id = %summary.session_id, version = snapshot.version, "recreating session");
            self.bus.publish(ConclaveEvent::SessionRecreate {
                session_id: summary.session_id.clone(),
                snapshot: serde_json::to_value(&snapshot)?,
                timestamp: Utc::now(),
            });
            restored.push(summary.session_id);
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionConfig;

    fn session(id: &str) -> Session {
        let mut session = Session::new(SessionConfig::new(id, "u1"));
        session.status = SessionStatus::Active;
        session
    }

    #[tokio::test]
    async fn versions_increase_per_session() {
        let store = InMemorySessionStore::new();
        let s = session("s1");

        let first = store.save_snapshot(&s).await.unwrap();
        let second = store.save_snapshot(&s).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);

        let other = store.save_snapshot(&session("s2")).await.unwrap();
        assert_eq!(other.version, 1);
    }

    #[tokio::test]
    async fn latest_snapshot_wins() {
        let store = InMemorySessionStore::new();
        let mut s = session("s1");
        store.save_snapshot(&s).await.unwrap();
        s.status = SessionStatus::Paused;
        store.save_snapshot(&s).await.unwrap();

        let latest = store.load_latest("s1").await.unwrap().unwrap();
        assert_eq!(latest.session.status, SessionStatus::Paused);
        assert_eq!(latest.version, 2);
    }

    #[tokio::test]
    async fn cleanup_keeps_newest_records() {
        let store = InMemorySessionStore::new();
        let s = session("s1");
        for _ in 0..5 {
            store.save_snapshot(&s).await.unwrap();
        }
        let removed = store.cleanup_superseded(2).await.unwrap();
        assert_eq!(removed, 3);
        let latest = store.load_latest("s1").await.unwrap().unwrap();
        assert_eq!(latest.version, 5);
    }

    #[tokio::test]
    async fn restore_all_skips_closed_sessions() {
        let store = Arc::new(InMemorySessionStore::new());
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        store.save_snapshot(&session("s1")).await.unwrap();
        let mut closed = session("s2");
        closed.status = SessionStatus::Closed;
        store.save_snapshot(&closed).await.unwrap();

        let manager = RestoreManager::new(store, bus);
        let restored = manager.restore_all().await.unwrap();
        assert_eq!(restored, vec!["s1".to_string()]);

        match rx.recv().await.unwrap() {
            ConclaveEvent::SessionRecreate { session_id, .. } => assert_eq!(session_id, "s1"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
