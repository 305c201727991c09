use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::persist::{PersistError, Persistence};
use crate::state::{Activity, DeltaError, GlobalState, ScalarField, StateDelta};

/// Canonical event names.
pub mod events {
    pub const STATE_CHANGED: &str = "state.changed";
    pub const ACTIVITY_CHANGED: &str = "activity.changed";
    pub const PHASE_CHANGED: &str = "phase.changed";
    pub const SESSION_STARTED: &str = "session.started";
    pub const SESSION_ENDED: &str = "session.ended";
    pub const NODE_READY: &str = "node.ready";
    pub const NODE_STARTED: &str = "node.started";
    pub const NODE_COMPLETED: &str = "node.completed";
    pub const NODE_ERRORED: &str = "node.errored";
    pub const NODE_TIMEOUT: &str = "node.timeout";
    pub const BUDGET_RESERVED: &str = "budget.reserved";
    pub const BUDGET_DENIED: &str = "budget.denied";
    pub const BUDGET_SETTLED: &str = "budget.settled";
    pub const DAY_ROLLED: &str = "day.rolled";
}

/// One event on the bus. `seq` is a process-wide monotonic counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub seq: u64,
    pub name: String,
    pub source: String,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid delta: {0}")]
    InvalidDelta(#[from] DeltaError),
    #[error("persistence failed after retries: {0}")]
    Persistence(#[from] PersistError),
}

/// Thread-safe owner of [`GlobalState`].
///
/// Reads clone an `Arc` snapshot and never block writers. Writes serialize
/// through one async gate: merge, persist, swap the pointer, then publish.
/// Event fan-out rides a broadcast channel, so a slow subscriber lags and
/// drops the oldest events (counted per subscription) without ever touching
/// the writer.
pub struct StateBus {
    snapshot: RwLock<Arc<GlobalState>>,
    write_gate: tokio::sync::Mutex<()>,
    tx: broadcast::Sender<BusEvent>,
    seq: AtomicU64,
    store: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    narrative_cap: usize,
    persist_attempts: u32,
    persist_backoff: Duration,
    persist_failed: std::sync::atomic::AtomicBool,
}

impl StateBus {
    pub fn new(
        initial: GlobalState,
        store: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        narrative_cap: usize,
        event_buffer: usize,
    ) -> Self {
        let (tx, _) = broadcast::channel(event_buffer.max(8));
        Self {
            snapshot: RwLock::new(Arc::new(initial)),
            write_gate: tokio::sync::Mutex::new(()),
            tx,
            seq: AtomicU64::new(0),
            store,
            clock,
            narrative_cap,
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(50),
            persist_failed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// True once a snapshot write has failed past all retries. The process
    /// treats this as fatal (exit code 2).
    pub fn persistence_failed(&self) -> bool {
        self.persist_failed.load(Ordering::SeqCst)
    }

    /// Consistent snapshot of the current state.
    pub fn read(&self) -> Arc<GlobalState> {
        self.snapshot.read().expect("bus snapshot lock").clone()
    }

    /// Atomically merge a delta, persist the result, and fan out events.
    ///
    /// A no-op delta leaves the revision untouched (its requested event, if
    /// any, is still published). Returns the state the write produced.
    pub async fn write_delta(&self, delta: StateDelta) -> Result<Arc<GlobalState>, BusError> {
        let _gate = self.write_gate.lock().await;
        let current = self.read();

        if delta.is_noop() {
            if let Some(spec) = &delta.emit {
                self.publish(&spec.name, &delta.source, spec.payload.clone());
            }
            return Ok(current);
        }

        let now = self.clock.now();
        let (next, clamp_notes) = current.merged(&delta, now, self.narrative_cap)?;
        for note in &clamp_notes {
            tracing::warn!(source = %delta.source, "delta clamped: {note}");
        }

        self.persist_with_retry(&next).await?;

        let next = Arc::new(next);
        *self.snapshot.write().expect("bus snapshot lock") = next.clone();

        // Publication strictly after the write is visible. The changed field
        // names let threshold watchers skip irrelevant writes.
        let changed: Vec<&str> = delta.scalars.iter().map(|p| p.field.name()).collect();
        self.publish(
            events::STATE_CHANGED,
            &delta.source,
            serde_json::json!({
                "revision": next.revision,
                "reason": delta.reason.as_deref(),
                "fields": changed,
            }),
        );
        if let Some(patch) = &delta.activity {
            self.publish(
                events::ACTIVITY_CHANGED,
                &delta.source,
                serde_json::json!({
                    "activity": patch.activity.as_str(),
                    "session_id": patch.session_id.as_deref(),
                }),
            );
            let session_event = match (current.current_activity, patch.activity) {
                (Activity::Idle, to) if to != Activity::Idle => Some(events::SESSION_STARTED),
                (from, Activity::Idle) if from != Activity::Idle => Some(events::SESSION_ENDED),
                _ => None,
            };
            if let Some(name) = session_event {
                self.publish(
                    name,
                    &delta.source,
                    serde_json::json!({
                        "session_id": patch.session_id.as_deref().or(current.active_session_id.as_deref()),
                        "activity": patch.activity.as_str(),
                    }),
                );
            }
        }
        if let Some(spec) = &delta.emit {
            self.publish(&spec.name, &delta.source, spec.payload.clone());
        }

        Ok(next)
    }

    async fn persist_with_retry(&self, state: &GlobalState) -> Result<(), PersistError> {
        let mut backoff = self.persist_backoff;
        let mut last_err = None;
        for attempt in 1..=self.persist_attempts {
            match self.store.save_snapshot(state).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, "snapshot persist failed: {e}");
                    last_err = Some(e);
                    if attempt < self.persist_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        self.persist_failed.store(true, Ordering::SeqCst);
        Err(last_err.unwrap_or_else(|| PersistError::Unavailable("no attempts made".to_string())))
    }

    /// Publish an out-of-band event (scheduler and budget lifecycle events).
    pub fn publish(&self, name: &str, source: &str, payload: serde_json::Value) {
        let event = BusEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            name: name.to_string(),
            source: source.to_string(),
            payload,
            at: self.clock.now(),
        };
        // Zero receivers is fine; the send result only reports that
        let _ = self.tx.send(event);
    }

    /// Subscribe with an event-name filter. Empty filter means everything;
    /// a trailing `.*` matches a prefix (`"node.*"`).
    pub fn subscribe(&self, filter: Vec<String>) -> Subscription {
        Subscription { rx: self.tx.subscribe(), filter, dropped: 0 }
    }

    /// Unfiltered receiver for internal consumers.
    pub fn raw_subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

/// A filtered event stream with a drop counter for lag.
pub struct Subscription {
    rx: broadcast::Receiver<BusEvent>,
    filter: Vec<String>,
    dropped: u64,
}

impl Subscription {
    /// Next matching event, or `None` once the bus has shut down.
    pub async fn next(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event.name) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    tracing::debug!(dropped = n, "subscriber lagged, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, name: &str) -> bool {
        self.filter.is_empty()
            || self.filter.iter().any(|f| {
                f == name
                    || f.strip_suffix(".*")
                        .map_or(false, |prefix| name.starts_with(prefix) && name[prefix.len()..].starts_with('.'))
            })
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Baselines and per-field pull rates for the periodic decay tick.
#[derive(Debug, Clone)]
pub struct DecayConfig {
    pub interval: Duration,
    pub baseline: HashMap<ScalarField, f32>,
    pub rate: HashMap<ScalarField, f32>,
    /// Max cumulative drift applied per field per local day.
    pub daily_band: f32,
}

impl Default for DecayConfig {
    fn default() -> Self {
        let baseline = [
            (ScalarField::Engagement, 0.4),
            (ScalarField::CognitiveLoad, 0.2),
            (ScalarField::RelationalWarmth, 0.5),
            (ScalarField::UncertaintyTolerance, 0.6),
            (ScalarField::Curiosity, 0.5),
            (ScalarField::Contentment, 0.5),
            (ScalarField::Anticipation, 0.4),
            (ScalarField::Concern, 0.2),
        ]
        .into_iter()
        .collect();
        Self {
            interval: Duration::from_secs(60),
            baseline,
            rate: HashMap::new(),
            daily_band: 0.3,
        }
    }
}

impl DecayConfig {
    const DEFAULT_RATE: f32 = 0.02;

    fn rate_for(&self, field: ScalarField) -> f32 {
        self.rate.get(&field).copied().unwrap_or(Self::DEFAULT_RATE)
    }

    fn baseline_for(&self, field: ScalarField) -> f32 {
        self.baseline.get(&field).copied().unwrap_or(0.5)
    }
}

/// Periodic pull of the emotional fields toward baseline. Each tick is a
/// regular delta from source `"clock"`, so the drift is auditable like any
/// other write.
pub struct DecayTask {
    bus: Arc<StateBus>,
    clock: Arc<dyn Clock>,
    config: DecayConfig,
    applied_today: HashMap<ScalarField, f32>,
    day_epoch: i64,
}

impl DecayTask {
    pub fn new(bus: Arc<StateBus>, clock: Arc<dyn Clock>, config: DecayConfig) -> Self {
        let day_epoch = clock.day_epoch();
        Self { bus, clock, config, applied_today: HashMap::new(), day_epoch }
    }

    /// Compute this tick's delta against the given snapshot, honoring the
    /// daily drift band. Returns `None` when every field is settled.
    pub fn tick_delta(&mut self, state: &GlobalState) -> Option<StateDelta> {
        let today = self.clock.day_epoch();
        if today != self.day_epoch {
            self.day_epoch = today;
            self.applied_today.clear();
        }

        let mut delta = StateDelta::new("clock", self.clock.now()).reason("baseline decay");
        for field in ScalarField::EMOTIONAL {
            let current = state.scalar(field);
            let pull = (self.config.baseline_for(field) - current) * self.config.rate_for(field);
            let used = self.applied_today.entry(field).or_insert(0.0);
            let allowance = (self.config.daily_band - *used).max(0.0);
            let pull = pull.clamp(-allowance, allowance);
            if pull.abs() < 1e-4 {
                continue;
            }
            *used += pull.abs();
            delta = delta.nudge(field, pull);
        }

        if delta.scalars.is_empty() {
            None
        } else {
            Some(delta)
        }
    }

    /// Run until shutdown. A persistence failure that survives the bus's own
    /// retries is fatal for the process; this task reports it by cancelling
    /// the shutdown token.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = self.bus.read();
                    if let Some(delta) = self.tick_delta(&snapshot) {
                        match self.bus.write_delta(delta).await {
                            Ok(_) => {}
                            Err(BusError::Persistence(e)) => {
                                tracing::error!("decay tick hit unrecoverable persistence failure: {e}");
                                shutdown.cancel();
                                break;
                            }
                            Err(e) => tracing::warn!("decay tick rejected: {e}"),
                        }
                    }
                }
            }
        }
        tracing::debug!("decay task stopped");
    }
}
