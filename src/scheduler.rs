use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::budget::{BudgetManager, CostClass, ReservationToken};
use crate::bus::{events, BusError, StateBus};
use crate::clock::Clock;
use crate::history::{ExecutionRecord, HistoryLog, Outcome};
use crate::persist::Persistence;
use crate::registry::{ExecutionContext, ExecutorError, NodeExecutor, NodeRegistry, NodeResult};
use crate::state::{Activity, GlobalState, StateDelta};
use crate::triggers::{FireCause, ReadyCandidate, TriggerError, TriggerEvaluator};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub tick_interval: Duration,
    pub timeouts: HashMap<CostClass, Duration>,
}

impl SchedulerConfig {
    pub fn timeout_for(&self, cost_class: CostClass) -> Duration {
        self.timeouts
            .get(&cost_class)
            .copied()
            .unwrap_or_else(|| Duration::from_secs(cost_class.default_timeout_secs()))
    }

    fn grace_for(timeout: Duration) -> Duration {
        (timeout / 10).max(Duration::from_secs(1))
    }
}

struct RunningEntry {
    cancel: CancellationToken,
}

enum DispatchOutcome {
    Finished(Result<NodeResult, ExecutorError>),
    TimedOut,
}

struct DispatchDone {
    node_id: String,
    record: ExecutionRecord,
    reservation: ReservationToken,
    attempt: u32,
    started_session: bool,
    outcome: DispatchOutcome,
}

/// Handle given to the admin API: manual dispatch, graceful stop, and a view
/// of what is in flight.
#[derive(Clone)]
pub struct SchedulerHandle {
    evaluator: Arc<TriggerEvaluator>,
    running: Arc<StdMutex<HashMap<String, RunningEntry>>>,
    kick_tx: mpsc::Sender<()>,
    shutdown: CancellationToken,
}

impl SchedulerHandle {
    pub fn dispatch(&self, node_id: &str) -> Result<(), TriggerError> {
        self.evaluator.manual(node_id)?;
        let _ = self.kick_tx.try_send(());
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn running_nodes(&self) -> Vec<String> {
        self.running.lock().expect("running lock").keys().cloned().collect()
    }
}

/// The main loop: drains ready nodes in priority order, holds the worker
/// pool, settles budget, applies deltas, and keeps the record log.
pub struct Scheduler {
    registry: Arc<NodeRegistry>,
    bus: Arc<StateBus>,
    budget: Arc<BudgetManager>,
    evaluator: Arc<TriggerEvaluator>,
    history: Arc<HistoryLog>,
    store: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    running: Arc<StdMutex<HashMap<String, RunningEntry>>>,
    workers: Arc<Semaphore>,
    done_tx: mpsc::Sender<DispatchDone>,
    done_rx: tokio::sync::Mutex<mpsc::Receiver<DispatchDone>>,
    kick_tx: mpsc::Sender<()>,
    kick_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<NodeRegistry>,
        bus: Arc<StateBus>,
        budget: Arc<BudgetManager>,
        evaluator: Arc<TriggerEvaluator>,
        history: Arc<HistoryLog>,
        store: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::channel(256);
        let (kick_tx, kick_rx) = mpsc::channel(16);
        let workers = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            registry,
            bus,
            budget,
            evaluator,
            history,
            store,
            clock,
            config,
            running: Arc::new(StdMutex::new(HashMap::new())),
            workers,
            done_tx,
            done_rx: tokio::sync::Mutex::new(done_rx),
            kick_tx,
            kick_rx: tokio::sync::Mutex::new(kick_rx),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            evaluator: self.evaluator.clone(),
            running: self.running.clone(),
            kick_tx: self.kick_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Startup pass: close out records and sessions a prior run left behind.
    /// Reservations restored into the ledger are released, so the charge is
    /// dropped rather than double-counted.
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let now = self.clock.now();
        let open = self.store.load_open_records().await?;
        let count = open.len();
        for mut record in open {
            record.ended_at = Some(now);
            record.outcome = Outcome::Cancelled;
            record.error = Some("unfinished at restart".to_string());
            self.store.finish_record(&record).await?;
        }

        for token in self.budget.snapshot().reservations {
            self.budget.release(&token, 0.0);
        }
        self.persist_ledger().await;

        let state = self.bus.read();
        if state.current_activity != Activity::Idle {
            self.bus
                .write_delta(
                    StateDelta::new("scheduler", now)
                        .end_session()
                        .reason("session reconciled after restart"),
                )
                .await
                .map_err(|e| anyhow::anyhow!("reconciliation delta rejected: {e}"))?;
        }
        if count > 0 {
            tracing::info!(count, "reconciled unfinished executions from prior run");
        }
        Ok(())
    }

    /// Drive the loop until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut done_rx = self.done_rx.lock().await;
        let mut kick_rx = self.kick_rx.lock().await;
        let mut bus_events = self.bus.raw_subscribe();
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!("scheduler loop starting");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.rollover_check().await;
                    self.pump().await;
                }
                Some(done) = done_rx.recv() => {
                    self.on_done(done).await;
                    self.pump().await;
                }
                Some(()) = kick_rx.recv() => self.pump().await,
                event = bus_events.recv() => match event {
                    Ok(ev) => {
                        self.evaluator.note_event(&ev);
                        if ev.name == events::STATE_CHANGED && self.threshold_relevant(&ev.payload) {
                            self.pump().await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(dropped = n, "scheduler lagged on bus events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {}
                },
            }
        }

        tracing::info!("scheduler stopping, draining in-flight executions");
        for entry in self.running.lock().expect("running lock").values() {
            entry.cancel.cancel();
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !self.running.lock().expect("running lock").is_empty() {
            match tokio::time::timeout_at(deadline, done_rx.recv()).await {
                Ok(Some(done)) => self.on_done(done).await,
                _ => break,
            }
        }
        self.persist_ledger().await;
        tracing::info!("scheduler stopped");
    }

    fn threshold_relevant(&self, payload: &serde_json::Value) -> bool {
        let fields: Vec<&str> = payload["fields"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        !fields.is_empty() && self.evaluator.affects_thresholds(&fields)
    }

    async fn rollover_check(&self) {
        let today = self.clock.day_epoch();
        if today == self.budget.day_epoch() {
            return;
        }
        let archived = self.budget.roll_day(today);
        if let Err(e) = self.store.save_ledger(&archived).await {
            tracing::error!("failed to archive ledger for day {}: {e}", archived.day_epoch);
        }
        self.persist_ledger().await;
        self.bus.publish(
            events::DAY_ROLLED,
            "scheduler",
            serde_json::json!({ "day_epoch": today }),
        );
        if let Err(e) = self.history.prune(self.clock.now()).await {
            tracing::warn!("history prune failed: {e}");
        }
        tracing::info!(day_epoch = today, "budget ledger rolled");
    }

    /// Collect, sort, and dispatch the ready set.
    pub async fn pump(&self) {
        let snapshot = self.bus.read();
        let running_ids: HashSet<String> = self
            .running
            .lock()
            .expect("running lock")
            .keys()
            .cloned()
            .collect();

        let mut ready = self.evaluator.collect_ready(&snapshot, &running_ids);
        ready.sort_by(|a, b| {
            a.node
                .effective_priority()
                .rank()
                .cmp(&b.node.effective_priority().rank())
                .then_with(|| a.prev_fire.cmp(&b.prev_fire))
                .then_with(|| a.node.decl.id.cmp(&b.node.decl.id))
        });

        for candidate in ready {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.try_dispatch(candidate, snapshot.clone()).await;
        }
    }

    async fn try_dispatch(&self, candidate: ReadyCandidate, snapshot: Arc<GlobalState>) {
        let node = candidate.node.decl.clone();
        let cause_label = candidate.cause.label();
        let now = self.clock.now();

        self.bus.publish(
            events::NODE_READY,
            "scheduler",
            serde_json::json!({ "node": node.id.as_str(), "cause": cause_label.as_str() }),
        );

        let Ok(permit) = self.workers.clone().try_acquire_owned() else {
            // Pool full: put the cause back so the next pump retries it
            self.evaluator.requeue_front(&node.id, candidate.cause);
            return;
        };

        let reservation = match self.budget.reserve(
            &node.id,
            node.category,
            node.cost_class,
            candidate.node.effective_priority(),
            node.est_cost,
        ) {
            Ok(token) => token,
            Err(denied) => {
                self.bus.publish(
                    events::BUDGET_DENIED,
                    "budget",
                    serde_json::json!({
                        "node": node.id.as_str(),
                        "reason": denied.reason(),
                        "detail": denied.to_string(),
                    }),
                );
                if let Err(e) = self
                    .history
                    .record_skip(
                        &node.id,
                        now,
                        Outcome::SkippedBudget,
                        Some(cause_label),
                        Some(denied.to_string()),
                    )
                    .await
                {
                    tracing::error!("failed to record budget skip: {e}");
                }
                return;
            }
        };
        self.bus.publish(
            events::BUDGET_RESERVED,
            "budget",
            serde_json::json!({
                "node": node.id.as_str(),
                "reservation": reservation.id,
                "amount": reservation.amount,
            }),
        );
        self.persist_ledger().await;

        let record = match self.history.begin(&node.id, now, Some(cause_label)).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(node = %node.id, "cannot append execution record, dispatch dropped: {e}");
                self.budget.release(&reservation, 0.0);
                self.persist_ledger().await;
                return;
            }
        };

        // Long-lived sessions flip the activity state for their duration
        let mut started_session = false;
        if node.is_session {
            let delta = StateDelta::new("scheduler", now)
                .start_session(activity_for(&node), record.id.to_string())
                .reason(format!("{} started", node.id));
            match self.bus.write_delta(delta).await {
                Ok(_) => started_session = true,
                Err(e) => {
                    // Another session owns the activity slot; step aside
                    tracing::info!(node = %node.id, "session start rejected: {e}");
                    self.budget.release(&reservation, 0.0);
                    self.persist_ledger().await;
                    let _ = self
                        .history
                        .finish(record, self.clock.now(), Outcome::SkippedTrigger, 0.0, 0, Some(e.to_string()))
                        .await;
                    return;
                }
            }
        }

        let cancel = self.shutdown.child_token();
        self.running
            .lock()
            .expect("running lock")
            .insert(node.id.clone(), RunningEntry { cancel: cancel.clone() });
        self.bus.publish(
            events::NODE_STARTED,
            "scheduler",
            serde_json::json!({ "node": node.id.as_str(), "execution": record.id }),
        );

        let attempt = match candidate.cause {
            FireCause::Retry(n) => n,
            _ => 1,
        };
        let timeout = self.config.timeout_for(node.cost_class);
        let grace = SchedulerConfig::grace_for(timeout);
        let executor: Arc<dyn NodeExecutor> = node.executor.clone();
        let ctx = ExecutionContext {
            node_id: node.id.clone(),
            execution_id: record.id,
            snapshot,
            cancel: cancel.clone(),
            reservation: reservation.clone(),
        };
        let done_tx = self.done_tx.clone();
        let node_id = node.id.clone();

        tokio::spawn(async move {
            let fut = executor.execute(ctx);
            tokio::pin!(fut);
            let outcome = tokio::select! {
                result = &mut fut => DispatchOutcome::Finished(result),
                _ = tokio::time::sleep(timeout) => {
                    cancel.cancel();
                    // Grace for cooperative cleanup; the result no longer counts
                    let _ = tokio::time::timeout(grace, &mut fut).await;
                    DispatchOutcome::TimedOut
                }
            };
            let _ = done_tx
                .send(DispatchDone {
                    node_id,
                    record,
                    reservation,
                    attempt,
                    started_session,
                    outcome,
                })
                .await;
            drop(permit);
        });
    }

    /// Process every completion currently sitting in the channel. The run
    /// loop does this implicitly; tests call it directly.
    pub async fn drain_completions(&self) {
        loop {
            let done = { self.done_rx.lock().await.try_recv() };
            match done {
                Ok(done) => self.on_done(done).await,
                Err(_) => break,
            }
        }
    }

    async fn on_done(&self, done: DispatchDone) {
        let DispatchDone { node_id, record, reservation, attempt, started_session, outcome } = done;
        self.running.lock().expect("running lock").remove(&node_id);
        let now = self.clock.now();

        match outcome {
            DispatchOutcome::Finished(Ok(result)) => {
                // Reservation-token check: a hold released elsewhere means
                // this result arrived from a dead dispatch
                if !self.budget.is_live(&reservation) {
                    tracing::warn!(node = %node_id, "result from released reservation ignored");
                    return;
                }
                self.complete(node_id, record, reservation, started_session, result, now).await;
            }
            DispatchOutcome::Finished(Err(error)) if self.shutdown.is_cancelled() => {
                self.budget.release(&reservation, error.dollars_used);
                self.persist_ledger().await;
                self.close_session(&node_id, started_session, now).await;
                let _ = self
                    .history
                    .finish(record, now, Outcome::Cancelled, error.dollars_used, 0, Some("shutdown".to_string()))
                    .await;
            }
            DispatchOutcome::Finished(Err(error)) => {
                self.budget.release(&reservation, error.dollars_used);
                self.persist_ledger().await;
                self.close_session(&node_id, started_session, now).await;
                self.bus.publish(
                    events::NODE_ERRORED,
                    "scheduler",
                    serde_json::json!({
                        "node": node_id.as_str(),
                        "error": error.message.as_str(),
                        "transient": error.transient,
                    }),
                );
                let _ = self
                    .history
                    .finish(record, now, Outcome::Error, error.dollars_used, 0, Some(error.message.clone()))
                    .await;
                self.maybe_retry(&node_id, attempt, &error);
            }
            DispatchOutcome::TimedOut => {
                self.budget.release(&reservation, 0.0);
                self.persist_ledger().await;
                self.close_session(&node_id, started_session, now).await;
                self.bus.publish(
                    events::NODE_TIMEOUT,
                    "scheduler",
                    serde_json::json!({ "node": node_id.as_str() }),
                );
                let _ = self
                    .history
                    .finish(record, now, Outcome::Cancelled, 0.0, 0, Some("timeout".to_string()))
                    .await;
            }
        }
    }

    async fn complete(
        &self,
        node_id: String,
        record: ExecutionRecord,
        reservation: ReservationToken,
        started_session: bool,
        result: NodeResult,
        now: chrono::DateTime<Utc>,
    ) {
        self.budget.settle(&reservation, result.dollars_used, result.tokens_used);
        self.persist_ledger().await;
        self.bus.publish(
            events::BUDGET_SETTLED,
            "budget",
            serde_json::json!({
                "node": node_id.as_str(),
                "reservation": reservation.id,
                "dollars": result.dollars_used,
                "tokens": result.tokens_used,
            }),
        );

        let mut outcome = Outcome::Ok;
        let mut error = None;
        if let Some(delta) = result.state_delta {
            match self.bus.write_delta(delta).await {
                Ok(_) => {}
                Err(BusError::InvalidDelta(e)) => {
                    outcome = Outcome::Error;
                    error = Some(format!("invalid delta: {e}"));
                }
                Err(BusError::Persistence(e)) => {
                    tracing::error!("state persistence failed, shutting down: {e}");
                    self.shutdown.cancel();
                    outcome = Outcome::Error;
                    error = Some(format!("persistence: {e}"));
                }
            }
        }

        self.close_session(&node_id, started_session, now).await;

        let record = match self
            .history
            .finish(record, now, outcome, result.dollars_used, result.tokens_used, error.clone())
            .await
        {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("failed to finish execution record: {e}");
                return;
            }
        };

        if outcome == Outcome::Ok {
            self.evaluator.note_completion(&node_id, record.ended_at.unwrap_or(now));
            self.bus.publish(
                events::NODE_COMPLETED,
                "scheduler",
                serde_json::json!({
                    "node": node_id.as_str(),
                    "execution": record.id,
                    "tokens": result.tokens_used,
                }),
            );
            for target in &result.chain_to {
                if let Err(e) = self.evaluator.chain_enqueue(target) {
                    tracing::warn!(from = %node_id, "chain target skipped: {e}");
                }
            }
            for target in &result.request_nodes {
                self.evaluator.request(&node_id, target);
            }
        } else {
            self.bus.publish(
                events::NODE_ERRORED,
                "scheduler",
                serde_json::json!({ "node": node_id.as_str(), "error": error }),
            );
        }
    }

    async fn close_session(&self, node_id: &str, started_session: bool, now: chrono::DateTime<Utc>) {
        if !started_session {
            return;
        }
        let delta = StateDelta::new("scheduler", now)
            .end_session()
            .reason(format!("{node_id} finished"));
        if let Err(e) = self.bus.write_delta(delta).await {
            tracing::error!(node = node_id, "failed to clear session activity: {e}");
        }
    }

    fn maybe_retry(&self, node_id: &str, attempt: u32, error: &ExecutorError) {
        if !error.transient {
            return;
        }
        let Some(registered) = self.registry.get(node_id) else { return };
        let Some(policy) = registered.decl.retry.clone() else { return };
        let next_attempt = attempt + 1;
        if next_attempt > policy.max_attempts {
            tracing::info!(node = node_id, "retry attempts exhausted");
            return;
        }
        let delay = policy.backoff_delay(next_attempt);
        let evaluator = self.evaluator.clone();
        let kick = self.kick_tx.clone();
        let shutdown = self.shutdown.clone();
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    evaluator.retry_enqueue(&node_id, next_attempt);
                    let _ = kick.try_send(());
                }
            }
        });
    }

    async fn persist_ledger(&self) {
        if let Err(e) = self.store.save_ledger(&self.budget.snapshot()).await {
            tracing::error!("ledger persist failed: {e}");
        }
    }
}

fn activity_for(node: &crate::registry::CognitiveNode) -> Activity {
    use crate::budget::Category;
    match node.category {
        Category::Research => Activity::Research,
        Category::Reflection => Activity::Reflection,
        Category::Dream => Activity::Dreaming,
        Category::Journal => Activity::Journal,
        Category::Chat => Activity::Chat,
        _ => Activity::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetConfig, Category, Priority};
    use crate::clock::{ManualClock, PhaseSchedule};
    use crate::executors::FnExecutor;
    use crate::persist::MemoryStore;
    use crate::registry::{CognitiveNode, RetryPolicy, Trigger};
    use crate::state::ScalarField;
    use chrono::DateTime;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    struct Harness {
        registry: Arc<NodeRegistry>,
        bus: Arc<StateBus>,
        budget: Arc<BudgetManager>,
        evaluator: Arc<TriggerEvaluator>,
        history: Arc<HistoryLog>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        scheduler: Arc<Scheduler>,
    }

    fn build(daily_budget: f64, max_concurrent: usize, timeouts: &[(CostClass, Duration)]) -> Harness {
        let clock = Arc::new(ManualClock::utc(at("2026-03-01T12:00:00Z")));
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(NodeRegistry::new());
        let state = GlobalState::initial(clock.now(), clock.day_epoch());
        let bus = Arc::new(StateBus::new(state, store.clone(), clock.clone(), 16, 256));

        let mut allocations = BTreeMap::new();
        allocations.insert(Category::Research, 0.5);
        allocations.insert(Category::System, 0.2);
        allocations.insert(Category::Memory, 0.1);
        allocations.insert(Category::Dream, 0.1);
        let budget = Arc::new(BudgetManager::new(
            BudgetConfig {
                daily_budget_usd: daily_budget,
                category_allocations: allocations,
                reserve_fraction: 0.1,
            },
            clock.day_epoch(),
            None,
        ));

        let evaluator = Arc::new(TriggerEvaluator::new(
            registry.clone(),
            clock.clone(),
            PhaseSchedule::default(),
            chrono::Duration::minutes(10),
            16,
        ));
        let history = Arc::new(HistoryLog::new(store.clone(), 64, chrono::Duration::days(14)));
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            bus.clone(),
            budget.clone(),
            evaluator.clone(),
            history.clone(),
            store.clone(),
            clock.clone(),
            SchedulerConfig {
                max_concurrent,
                tick_interval: Duration::from_millis(50),
                timeouts: timeouts.iter().cloned().collect(),
            },
        ));

        Harness { registry, bus, budget, evaluator, history, store, clock, scheduler }
    }

    /// Let spawned dispatch tasks run to completion under the paused clock.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn instant_node(id: &str, category: Category, cost_class: CostClass, dollars: f64) -> CognitiveNode {
        let node_id = id.to_string();
        CognitiveNode::new(
            id,
            category,
            cost_class,
            FnExecutor::new(move |_ctx| {
                let node_id = node_id.clone();
                async move {
                    Ok(NodeResult {
                        output: serde_json::json!({ "from": node_id.as_str() }),
                        state_delta: Some(
                            StateDelta::new(node_id.clone(), Utc::now())
                                .nudge(ScalarField::Curiosity, 0.01),
                        ),
                        tokens_used: 100,
                        dollars_used: dollars,
                        ..Default::default()
                    })
                }
            }),
        )
        .trigger(Trigger::Manual)
    }

    #[tokio::test(start_paused = true)]
    async fn manual_dispatch_runs_settles_and_applies_delta() {
        let h = build(5.0, 2, &[]);
        h.registry
            .register(instant_node("research.wiki_page", Category::Research, CostClass::Research, 0.30))
            .unwrap();
        h.evaluator.prime().unwrap();
        let before = h.bus.read();

        h.evaluator.manual("research.wiki_page").unwrap();
        h.scheduler.pump().await;
        settle().await;
        h.scheduler.drain_completions().await;

        let records = h.history.recent(Some("research.wiki_page"), 10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Ok);
        assert!((records[0].dollars_used - 0.30).abs() < 1e-9);

        let after = h.bus.read();
        assert!(after.revision > before.revision);
        assert!(after.curiosity > before.curiosity);

        let ledger = h.budget.snapshot();
        assert!(ledger.reservations.is_empty());
        assert!((ledger.spent_total() - 0.30).abs() < 1e-9);
        // ledger was persisted along the way
        assert!(h.store.load_ledger(h.clock.day_epoch()).await.unwrap().is_some());
    }

    /// Scenario: $1.00 day, research at 50%. Two $0.30 dispatches fit, the
    /// third is denied on the category, a free node still runs.
    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_denies_third_dispatch() {
        let h = build(1.0, 2, &[]);
        h.registry
            .register(instant_node("research.wiki_page", Category::Research, CostClass::Research, 0.30))
            .unwrap();
        h.registry
            .register(instant_node("system.github_metrics", Category::System, CostClass::Free, 0.0))
            .unwrap();
        h.evaluator.prime().unwrap();
        let mut denied_events = h.bus.subscribe(vec![events::BUDGET_DENIED.to_string()]);

        for _ in 0..3 {
            h.evaluator.manual("research.wiki_page").unwrap();
            h.scheduler.pump().await;
            settle().await;
            h.scheduler.drain_completions().await;
        }
        h.evaluator.manual("system.github_metrics").unwrap();
        h.scheduler.pump().await;
        settle().await;
        h.scheduler.drain_completions().await;

        let research = h.history.recent(Some("research.wiki_page"), 10);
        let outcomes: Vec<Outcome> = research.iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![Outcome::Ok, Outcome::Ok, Outcome::SkippedBudget]);

        let free = h.history.recent(Some("system.github_metrics"), 10);
        assert_eq!(free[0].outcome, Outcome::Ok);

        let denied = denied_events.next().await.unwrap();
        assert_eq!(denied.payload["reason"], "category");

        // P5: settled + live <= cap + reserve drawn
        let ledger = h.budget.snapshot();
        assert!(
            ledger.spent_total() + ledger.reserved_total()
                <= ledger.daily_budget + ledger.reserve_drawn + 1e-9
        );
    }

    /// Scenario: chain successor starts only after the predecessor's delta
    /// and record are committed.
    #[tokio::test(start_paused = true)]
    async fn chain_successor_runs_after_predecessor() {
        let h = build(5.0, 2, &[]);
        let mut research = instant_node("research.wiki_page", Category::Research, CostClass::Research, 0.30);
        // rebuild with a chain_to in the result
        research.executor = FnExecutor::new(|_ctx| async {
            Ok(NodeResult {
                output: serde_json::json!({"page": "done"}),
                state_delta: Some(
                    StateDelta::new("research.wiki_page", Utc::now()).nudge(ScalarField::Curiosity, 0.02),
                ),
                chain_to: vec!["memory.summarize_conversation".to_string()],
                tokens_used: 900,
                dollars_used: 0.28,
                ..Default::default()
            })
        });
        h.registry.register(research).unwrap();
        h.registry
            .register(
                instant_node("memory.summarize_conversation", Category::Memory, CostClass::Light, 0.02)
                    .trigger(Trigger::Chain { after: vec!["research.wiki_page".to_string()] }),
            )
            .unwrap();
        h.evaluator.prime().unwrap();
        let base_revision = h.bus.read().revision;

        h.evaluator.manual("research.wiki_page").unwrap();
        h.scheduler.pump().await;
        settle().await;
        h.scheduler.drain_completions().await;
        // chain target was enqueued on completion; next pump picks it up
        h.clock.advance(chrono::Duration::seconds(1));
        h.scheduler.pump().await;
        settle().await;
        h.scheduler.drain_completions().await;

        let research_rec = &h.history.recent(Some("research.wiki_page"), 1)[0];
        let summary_rec = &h.history.recent(Some("memory.summarize_conversation"), 1)[0];
        assert_eq!(research_rec.outcome, Outcome::Ok);
        assert_eq!(summary_rec.outcome, Outcome::Ok);
        assert!(summary_rec.started_at >= research_rec.ended_at.unwrap());
        // one delta each
        assert!(h.bus.read().revision >= base_revision + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_and_releases_budget() {
        let h = build(5.0, 2, &[(CostClass::Light, Duration::from_millis(50))]);
        h.registry
            .register(
                CognitiveNode::new(
                    "memory.slow",
                    Category::Memory,
                    CostClass::Light,
                    FnExecutor::new(|ctx| async move {
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => Err(ExecutorError::transient("cancelled")),
                            _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok(NodeResult::default()),
                        }
                    }),
                )
                .trigger(Trigger::Manual),
            )
            .unwrap();
        h.evaluator.prime().unwrap();
        let mut timeout_events = h.bus.subscribe(vec![events::NODE_TIMEOUT.to_string()]);

        h.evaluator.manual("memory.slow").unwrap();
        h.scheduler.pump().await;
        // past timeout plus grace
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.scheduler.drain_completions().await;

        let record = &h.history.recent(Some("memory.slow"), 1)[0];
        assert_eq!(record.outcome, Outcome::Cancelled);
        assert_eq!(timeout_events.next().await.unwrap().payload["node"], "memory.slow");

        let ledger = h.budget.snapshot();
        assert!(ledger.reservations.is_empty());
        assert_eq!(ledger.spent_total(), 0.0);
        // worker slot reclaimed
        assert!(h.scheduler.handle().running_nodes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn session_sets_activity_and_reconciliation_clears_it() {
        let h = build(5.0, 2, &[]);
        h.registry
            .register(
                CognitiveNode::new(
                    "dream.nightly",
                    Category::Dream,
                    CostClass::Dream,
                    FnExecutor::new(|ctx| async move {
                        ctx.cancel.cancelled().await;
                        Err(ExecutorError::transient("cancelled"))
                    }),
                )
                .session()
                .trigger(Trigger::Manual),
            )
            .unwrap();
        h.evaluator.prime().unwrap();

        h.evaluator.manual("dream.nightly").unwrap();
        h.scheduler.pump().await;
        settle().await;

        let mid = h.bus.read();
        assert_eq!(mid.current_activity, Activity::Dreaming);
        assert!(mid.active_session_id.is_some());
        assert_eq!(h.store.load_open_records().await.unwrap().len(), 1);

        // the process dies here; a fresh stack reloads from the same store
        let clock2 = Arc::new(ManualClock::utc(at("2026-03-01T12:05:00Z")));
        let restored = h.store.load_snapshot().await.unwrap().unwrap();
        let bus2 = Arc::new(StateBus::new(restored, h.store.clone(), clock2.clone(), 16, 64));
        let registry2 = Arc::new(NodeRegistry::new());
        let evaluator2 = Arc::new(TriggerEvaluator::new(
            registry2.clone(),
            clock2.clone(),
            PhaseSchedule::default(),
            chrono::Duration::minutes(10),
            16,
        ));
        let restored_ledger = h.store.load_ledger(clock2.day_epoch()).await.unwrap();
        assert!(restored_ledger.as_ref().is_some_and(|l| !l.reservations.is_empty()));
        let budget2 = Arc::new(BudgetManager::new(
            BudgetConfig {
                daily_budget_usd: 5.0,
                category_allocations: [(Category::Dream, 0.1)].into_iter().collect(),
                reserve_fraction: 0.1,
            },
            clock2.day_epoch(),
            restored_ledger,
        ));
        let history2 = Arc::new(HistoryLog::new(h.store.clone(), 64, chrono::Duration::days(14)));
        let scheduler2 = Arc::new(Scheduler::new(
            registry2,
            bus2.clone(),
            budget2.clone(),
            evaluator2,
            history2,
            h.store.clone(),
            clock2,
            SchedulerConfig {
                max_concurrent: 2,
                tick_interval: Duration::from_millis(50),
                timeouts: HashMap::new(),
            },
        ));

        scheduler2.reconcile().await.unwrap();

        // P8: nothing is left running, the session is closed, the hold is gone
        assert!(h.store.load_open_records().await.unwrap().is_empty());
        let records = h.store.load_records(None, Some("dream.nightly"), 10).await.unwrap();
        assert_eq!(records[0].outcome, Outcome::Cancelled);
        let state = bus2.read();
        assert_eq!(state.current_activity, Activity::Idle);
        assert_eq!(state.active_session_id, None);
        assert!(budget2.snapshot().reservations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_retries_with_fresh_reservation() {
        let h = build(5.0, 2, &[]);
        let failures = Arc::new(AtomicU32::new(1));
        let counter = failures.clone();
        h.registry
            .register(
                CognitiveNode::new(
                    "research.flaky",
                    Category::Research,
                    CostClass::Light,
                    FnExecutor::new(move |_ctx| {
                        let counter = counter.clone();
                        async move {
                            if counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                                Err(ExecutorError::transient("flaky backend"))
                            } else {
                                Ok(NodeResult { dollars_used: 0.03, tokens_used: 50, ..Default::default() })
                            }
                        }
                    }),
                )
                .trigger(Trigger::Manual)
                .retry_policy(RetryPolicy {
                    max_attempts: 3,
                    initial_backoff_ms: 10,
                    max_backoff_ms: 100,
                    backoff_multiplier: 2.0,
                    jitter: false,
                }),
            )
            .unwrap();
        h.evaluator.prime().unwrap();

        h.evaluator.manual("research.flaky").unwrap();
        h.scheduler.pump().await;
        settle().await;
        h.scheduler.drain_completions().await;

        // backoff elapses, retry is enqueued
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.scheduler.pump().await;
        settle().await;
        h.scheduler.drain_completions().await;

        let records = h.history.recent(Some("research.flaky"), 10);
        let outcomes: Vec<Outcome> = records.iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![Outcome::Error, Outcome::Ok]);

        let ledger = h.budget.snapshot();
        assert!(ledger.reservations.is_empty());
        assert!((ledger.spent_total() - 0.03).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_wins_the_last_worker_slot() {
        let h = build(5.0, 1, &[]);
        h.registry
            .register(
                instant_node("research.low", Category::Research, CostClass::Free, 0.0)
                    .priority(Priority::Low),
            )
            .unwrap();
        h.registry
            .register(
                instant_node("system.critical", Category::System, CostClass::Free, 0.0)
                    .priority(Priority::Critical),
            )
            .unwrap();
        h.evaluator.prime().unwrap();

        h.evaluator.manual("research.low").unwrap();
        h.evaluator.manual("system.critical").unwrap();
        h.scheduler.pump().await;
        settle().await;
        h.scheduler.drain_completions().await;
        h.scheduler.pump().await;
        settle().await;
        h.scheduler.drain_completions().await;

        let all = h.history.recent(None, 10);
        let order: Vec<&str> = all.iter().map(|r| r.node_id.as_str()).collect();
        assert_eq!(order, vec!["system.critical", "research.low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_sessions_skip_the_second() {
        let h = build(5.0, 2, &[]);
        let slow_session = |id: &str, category| {
            CognitiveNode::new(
                id,
                category,
                CostClass::Dream,
                FnExecutor::new(|ctx| async move {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => Err(ExecutorError::transient("cancelled")),
                        _ = tokio::time::sleep(Duration::from_millis(200)) => Ok(NodeResult::default()),
                    }
                }),
            )
            .session()
            .trigger(Trigger::Manual)
        };
        h.registry.register(slow_session("dream.nightly", Category::Dream)).unwrap();
        h.registry.register(slow_session("research.deep", Category::Research)).unwrap();
        h.evaluator.prime().unwrap();

        h.evaluator.manual("dream.nightly").unwrap();
        h.evaluator.manual("research.deep").unwrap();
        h.scheduler.pump().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        h.scheduler.drain_completions().await;

        let skipped: Vec<_> = h
            .history
            .recent(None, 10)
            .into_iter()
            .filter(|r| r.outcome == Outcome::SkippedTrigger)
            .collect();
        assert_eq!(skipped.len(), 1);
        // and the budget hold for the skipped one is gone
        assert!(h.budget.snapshot().reservations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn day_rollover_archives_ledger_and_emits_event() {
        let h = build(1.0, 2, &[]);
        h.registry
            .register(instant_node("research.wiki_page", Category::Research, CostClass::Research, 0.30))
            .unwrap();
        h.evaluator.prime().unwrap();

        h.evaluator.manual("research.wiki_page").unwrap();
        h.scheduler.pump().await;
        settle().await;
        h.scheduler.drain_completions().await;
        let yesterday = h.clock.day_epoch();

        let mut rolled = h.bus.subscribe(vec![events::DAY_ROLLED.to_string()]);
        h.clock.advance(chrono::Duration::days(1));
        h.scheduler.rollover_check().await;

        assert_eq!(rolled.next().await.unwrap().payload["day_epoch"], h.clock.day_epoch());
        let archived = h.store.load_ledger(yesterday).await.unwrap().unwrap();
        assert!((archived.spent_total() - 0.30).abs() < 1e-9);
        assert_eq!(h.budget.snapshot().spent_total(), 0.0);
        assert_eq!(h.budget.day_epoch(), h.clock.day_epoch());
    }
}
