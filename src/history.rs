use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::persist::Persistence;

/// Terminal (or in-flight) state of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Running,
    Ok,
    Error,
    SkippedBudget,
    SkippedTrigger,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::SkippedBudget => "skipped_budget",
            Self::SkippedTrigger => "skipped_trigger",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::Running,
            Self::Ok,
            Self::Error,
            Self::SkippedBudget,
            Self::SkippedTrigger,
            Self::Cancelled,
        ]
        .into_iter()
        .find(|o| o.as_str() == s)
    }
}

/// Append-only record of one dispatch. Created at dispatch, finished once,
/// never touched again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Outcome,
    pub dollars_used: f64,
    pub tokens_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggering_event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn begin(node_id: &str, started_at: DateTime<Utc>, triggering_event: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id: node_id.to_string(),
            started_at,
            ended_at: None,
            outcome: Outcome::Running,
            dollars_used: 0.0,
            tokens_used: 0,
            triggering_event,
            error: None,
        }
    }
}

/// In-memory ring over the persisted record log. Writes go to both; queries
/// beyond the ring fall through to the store.
pub struct HistoryLog {
    store: Arc<dyn Persistence>,
    ring: Mutex<VecDeque<ExecutionRecord>>,
    ring_cap: usize,
    max_age: Duration,
}

impl HistoryLog {
    pub fn new(store: Arc<dyn Persistence>, ring_cap: usize, max_age: Duration) -> Self {
        Self { store, ring: Mutex::new(VecDeque::new()), ring_cap, max_age }
    }

    pub async fn begin(
        &self,
        node_id: &str,
        started_at: DateTime<Utc>,
        triggering_event: Option<String>,
    ) -> anyhow::Result<ExecutionRecord> {
        let record = ExecutionRecord::begin(node_id, started_at, triggering_event);
        self.store.append_record(&record).await?;
        self.push_ring(record.clone());
        Ok(record)
    }

    pub async fn finish(
        &self,
        mut record: ExecutionRecord,
        ended_at: DateTime<Utc>,
        outcome: Outcome,
        dollars_used: f64,
        tokens_used: u64,
        error: Option<String>,
    ) -> anyhow::Result<ExecutionRecord> {
        record.ended_at = Some(ended_at);
        record.outcome = outcome;
        record.dollars_used = dollars_used;
        record.tokens_used = tokens_used;
        record.error = error;
        self.store.finish_record(&record).await?;
        self.update_ring(&record);
        Ok(record)
    }

    /// Record a dispatch that never ran (budget or trigger skip) as a
    /// complete record in one step.
    pub async fn record_skip(
        &self,
        node_id: &str,
        at: DateTime<Utc>,
        outcome: Outcome,
        triggering_event: Option<String>,
        error: Option<String>,
    ) -> anyhow::Result<ExecutionRecord> {
        let mut record = ExecutionRecord::begin(node_id, at, triggering_event);
        record.ended_at = Some(at);
        record.outcome = outcome;
        record.error = error;
        self.store.append_record(&record).await?;
        self.push_ring(record.clone());
        Ok(record)
    }

    fn push_ring(&self, record: ExecutionRecord) {
        let mut ring = self.ring.lock().expect("history lock");
        ring.push_back(record);
        while ring.len() > self.ring_cap {
            ring.pop_front();
        }
    }

    fn update_ring(&self, record: &ExecutionRecord) {
        let mut ring = self.ring.lock().expect("history lock");
        if let Some(slot) = ring.iter_mut().find(|r| r.id == record.id) {
            *slot = record.clone();
        }
    }

    /// Most recent in-memory records, newest last.
    pub fn recent(&self, node_id: Option<&str>, limit: usize) -> Vec<ExecutionRecord> {
        let ring = self.ring.lock().expect("history lock");
        let mut hits: Vec<ExecutionRecord> = ring
            .iter()
            .rev()
            .filter(|r| node_id.map_or(true, |id| r.node_id == id))
            .take(limit)
            .cloned()
            .collect();
        hits.reverse();
        hits
    }

    /// Query the persisted log.
    pub async fn query(
        &self,
        since: Option<DateTime<Utc>>,
        node_id: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<ExecutionRecord>> {
        Ok(self.store.load_records(since, node_id, limit).await?)
    }

    /// Drop persisted records older than the retention window.
    pub async fn prune(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        Ok(self.store.prune_records(now - self.max_age).await?)
    }
}
