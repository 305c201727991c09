use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::budget::BudgetLedger;
use crate::history::{ExecutionRecord, Outcome};
use crate::registry::NodeOverlay;
use crate::state::GlobalState;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage capability. Ordered-append durability for the record log,
/// atomic replace for snapshots and ledgers.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_snapshot(&self, state: &GlobalState) -> Result<(), PersistError>;
    async fn load_snapshot(&self) -> Result<Option<GlobalState>, PersistError>;

    async fn append_record(&self, record: &ExecutionRecord) -> Result<(), PersistError>;
    async fn finish_record(&self, record: &ExecutionRecord) -> Result<(), PersistError>;
    async fn load_open_records(&self) -> Result<Vec<ExecutionRecord>, PersistError>;
    async fn load_records(
        &self,
        since: Option<DateTime<Utc>>,
        node_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, PersistError>;
    async fn prune_records(&self, older_than: DateTime<Utc>) -> Result<u64, PersistError>;

    async fn save_ledger(&self, ledger: &BudgetLedger) -> Result<(), PersistError>;
    async fn load_ledger(&self, day_epoch: i64) -> Result<Option<BudgetLedger>, PersistError>;

    async fn save_overlay(&self, node_id: &str, overlay: &NodeOverlay) -> Result<(), PersistError>;
    async fn load_overlays(&self) -> Result<HashMap<String, NodeOverlay>, PersistError>;
}

/// Single-file SQLite store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self, PersistError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), PersistError> {
        // ============================================================
        // State singleton
        // ============================================================
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                revision INTEGER NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // ============================================================
        // Budget ledgers, one row per local day
        // ============================================================
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledgers (
                day_epoch INTEGER PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // ============================================================
        // Execution records, append log
        // ============================================================
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                outcome TEXT NOT NULL,
                dollars_used REAL NOT NULL DEFAULT 0,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                triggering_event TEXT,
                error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_node ON records(node_id, started_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_started ON records(started_at)")
            .execute(&self.pool)
            .await?;

        // ============================================================
        // Node admin overlay (enabled / priority / suspension)
        // ============================================================
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS node_overlays (
                node_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("database schema initialized");
        Ok(())
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ExecutionRecord, PersistError> {
    let id: String = row.get("id");
    let outcome: String = row.get("outcome");
    let started_at: String = row.get("started_at");
    let ended_at: Option<String> = row.get("ended_at");
    Ok(ExecutionRecord {
        id: Uuid::parse_str(&id).map_err(|e| PersistError::Corrupt(format!("record id: {e}")))?,
        node_id: row.get("node_id"),
        started_at: parse_time(&started_at)?,
        ended_at: ended_at.as_deref().map(parse_time).transpose()?,
        outcome: Outcome::parse(&outcome)
            .ok_or_else(|| PersistError::Corrupt(format!("outcome '{outcome}'")))?,
        dollars_used: row.get("dollars_used"),
        tokens_used: row.get::<i64, _>("tokens_used") as u64,
        triggering_event: row.get("triggering_event"),
        error: row.get("error"),
    })
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, PersistError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| PersistError::Corrupt(format!("timestamp '{s}': {e}")))
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn save_snapshot(&self, state: &GlobalState) -> Result<(), PersistError> {
        let payload = serde_json::to_string(state)?;
        sqlx::query(
            r#"
            INSERT INTO state (id, revision, payload, updated_at) VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                revision = excluded.revision,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(state.revision as i64)
        .bind(payload)
        .bind(state.last_updated.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<GlobalState>, PersistError> {
        let row = sqlx::query("SELECT payload FROM state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => {
                let payload: String = r.get("payload");
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn append_record(&self, record: &ExecutionRecord) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            INSERT INTO records (id, node_id, started_at, ended_at, outcome, dollars_used, tokens_used, triggering_event, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.node_id)
        .bind(record.started_at.to_rfc3339())
        .bind(record.ended_at.map(|t| t.to_rfc3339()))
        .bind(record.outcome.as_str())
        .bind(record.dollars_used)
        .bind(record.tokens_used as i64)
        .bind(&record.triggering_event)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_record(&self, record: &ExecutionRecord) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            UPDATE records
            SET ended_at = ?2, outcome = ?3, dollars_used = ?4, tokens_used = ?5, error = ?6
            WHERE id = ?1
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.ended_at.map(|t| t.to_rfc3339()))
        .bind(record.outcome.as_str())
        .bind(record.dollars_used)
        .bind(record.tokens_used as i64)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_open_records(&self) -> Result<Vec<ExecutionRecord>, PersistError> {
        let rows = sqlx::query("SELECT * FROM records WHERE ended_at IS NULL ORDER BY started_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn load_records(
        &self,
        since: Option<DateTime<Utc>>,
        node_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, PersistError> {
        let since = since.unwrap_or(DateTime::<Utc>::UNIX_EPOCH).to_rfc3339();
        let rows = match node_id {
            Some(node) => {
                sqlx::query(
                    r#"
                    SELECT * FROM records WHERE started_at >= ?1 AND node_id = ?2
                    ORDER BY started_at DESC LIMIT ?3
                    "#,
                )
                .bind(&since)
                .bind(node)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM records WHERE started_at >= ?1
                    ORDER BY started_at DESC LIMIT ?2
                    "#,
                )
                .bind(&since)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(record_from_row).collect()
    }

    async fn prune_records(&self, older_than: DateTime<Utc>) -> Result<u64, PersistError> {
        let result = sqlx::query("DELETE FROM records WHERE started_at < ?1 AND ended_at IS NOT NULL")
            .bind(older_than.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn save_ledger(&self, ledger: &BudgetLedger) -> Result<(), PersistError> {
        let payload = serde_json::to_string(ledger)?;
        sqlx::query(
            r#"
            INSERT INTO ledgers (day_epoch, payload, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(day_epoch) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(ledger.day_epoch)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_ledger(&self, day_epoch: i64) -> Result<Option<BudgetLedger>, PersistError> {
        let row = sqlx::query("SELECT payload FROM ledgers WHERE day_epoch = ?1")
            .bind(day_epoch)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => {
                let payload: String = r.get("payload");
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn save_overlay(&self, node_id: &str, overlay: &NodeOverlay) -> Result<(), PersistError> {
        let payload = serde_json::to_string(overlay)?;
        sqlx::query(
            r#"
            INSERT INTO node_overlays (node_id, payload, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(node_id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(node_id)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_overlays(&self) -> Result<HashMap<String, NodeOverlay>, PersistError> {
        let rows = sqlx::query("SELECT node_id, payload FROM node_overlays")
            .fetch_all(&self.pool)
            .await?;
        let mut overlays = HashMap::new();
        for row in rows {
            let node_id: String = row.get("node_id");
            let payload: String = row.get("payload");
            overlays.insert(node_id, serde_json::from_str(&payload)?);
        }
        Ok(overlays)
    }
}

/// In-process store for tests and ephemeral runs. Supports injected write
/// failures to exercise the retry path.
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<GlobalState>>,
    ledgers: Mutex<HashMap<i64, BudgetLedger>>,
    records: Mutex<Vec<ExecutionRecord>>,
    overlays: Mutex<HashMap<String, NodeOverlay>>,
    fail_writes: std::sync::atomic::AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write operations fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), PersistError> {
        let remaining = self.fail_writes.load(std::sync::atomic::Ordering::SeqCst);
        if remaining > 0 {
            self.fail_writes.store(remaining - 1, std::sync::atomic::Ordering::SeqCst);
            return Err(PersistError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn save_snapshot(&self, state: &GlobalState) -> Result<(), PersistError> {
        self.check_write()?;
        *self.snapshot.lock().expect("store lock") = Some(state.clone());
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<GlobalState>, PersistError> {
        Ok(self.snapshot.lock().expect("store lock").clone())
    }

    async fn append_record(&self, record: &ExecutionRecord) -> Result<(), PersistError> {
        self.check_write()?;
        self.records.lock().expect("store lock").push(record.clone());
        Ok(())
    }

    async fn finish_record(&self, record: &ExecutionRecord) -> Result<(), PersistError> {
        self.check_write()?;
        let mut records = self.records.lock().expect("store lock");
        if let Some(slot) = records.iter_mut().find(|r| r.id == record.id) {
            *slot = record.clone();
        }
        Ok(())
    }

    async fn load_open_records(&self) -> Result<Vec<ExecutionRecord>, PersistError> {
        Ok(self
            .records
            .lock()
            .expect("store lock")
            .iter()
            .filter(|r| r.ended_at.is_none())
            .cloned()
            .collect())
    }

    async fn load_records(
        &self,
        since: Option<DateTime<Utc>>,
        node_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, PersistError> {
        let records = self.records.lock().expect("store lock");
        let mut hits: Vec<_> = records
            .iter()
            .filter(|r| since.map_or(true, |s| r.started_at >= s))
            .filter(|r| node_id.map_or(true, |n| r.node_id == n))
            .cloned()
            .collect();
        hits.sort_by_key(|r| std::cmp::Reverse(r.started_at));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn prune_records(&self, older_than: DateTime<Utc>) -> Result<u64, PersistError> {
        let mut records = self.records.lock().expect("store lock");
        let before = records.len();
        records.retain(|r| r.started_at >= older_than || r.ended_at.is_none());
        Ok((before - records.len()) as u64)
    }

    async fn save_ledger(&self, ledger: &BudgetLedger) -> Result<(), PersistError> {
        self.check_write()?;
        self.ledgers.lock().expect("store lock").insert(ledger.day_epoch, ledger.clone());
        Ok(())
    }

    async fn load_ledger(&self, day_epoch: i64) -> Result<Option<BudgetLedger>, PersistError> {
        Ok(self.ledgers.lock().expect("store lock").get(&day_epoch).cloned())
    }

    async fn save_overlay(&self, node_id: &str, overlay: &NodeOverlay) -> Result<(), PersistError> {
        self.check_write()?;
        self.overlays.lock().expect("store lock").insert(node_id.to_string(), overlay.clone());
        Ok(())
    }

    async fn load_overlays(&self) -> Result<HashMap<String, NodeOverlay>, PersistError> {
        Ok(self.overlays.lock().expect("store lock").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetLedger, Category};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    async fn sqlite_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("kernel.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn snapshot_round_trip_is_lossless() {
        let (store, _dir) = sqlite_store().await;
        let mut state = GlobalState::initial(Utc::now(), 20_000);
        state.revision = 42;
        state.curiosity = 0.83;
        state.active_threads = vec!["t-1".into(), "t-2".into()];

        store.save_snapshot(&state).await.unwrap();
        let restored = store.load_snapshot().await.unwrap().unwrap();
        assert_eq!(state, restored);

        // restoring and re-saving yields the same payload again
        store.save_snapshot(&restored).await.unwrap();
        let again = store.load_snapshot().await.unwrap().unwrap();
        assert_eq!(restored, again);
    }

    #[tokio::test]
    async fn empty_store_loads_none() {
        let (store, _dir) = sqlite_store().await;
        assert!(store.load_snapshot().await.unwrap().is_none());
        assert!(store.load_ledger(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_append_finish_and_query() {
        let (store, _dir) = sqlite_store().await;
        let mut record = ExecutionRecord::begin("research.wiki_page", Utc::now(), None);
        store.append_record(&record).await.unwrap();

        let open = store.load_open_records().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].outcome, Outcome::Running);

        record.ended_at = Some(Utc::now());
        record.outcome = Outcome::Ok;
        record.dollars_used = 0.31;
        record.tokens_used = 1500;
        store.finish_record(&record).await.unwrap();

        assert!(store.load_open_records().await.unwrap().is_empty());
        let all = store.load_records(None, Some("research.wiki_page"), 10).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].outcome, Outcome::Ok);
        assert_eq!(all[0].tokens_used, 1500);
    }

    #[tokio::test]
    async fn ledger_round_trip() {
        let (store, _dir) = sqlite_store().await;
        let mut allocations = BTreeMap::new();
        allocations.insert(Category::Research, 0.5);
        let ledger = BudgetLedger::new(123, 1.0, &allocations, 0.1);
        store.save_ledger(&ledger).await.unwrap();
        let restored = store.load_ledger(123).await.unwrap().unwrap();
        assert_eq!(restored.day_epoch, 123);
        assert_eq!(restored.categories.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_failure_injection() {
        let store = MemoryStore::new();
        store.fail_next_writes(2);
        let state = GlobalState::initial(Utc::now(), 1);
        assert!(store.save_snapshot(&state).await.is_err());
        assert!(store.save_snapshot(&state).await.is_err());
        assert!(store.save_snapshot(&state).await.is_ok());
    }
}
