use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::bus::BusEvent;
use crate::clock::{Clock, PhaseSchedule, ScheduleError, ScheduleSpec, ScheduleTz};
use crate::registry::{NodeRegistry, RegisteredNode, Trigger};
use crate::state::{GlobalState, ScalarField};

/// Why a node was marked ready. Stringified into the execution record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireCause {
    Schedule,
    Threshold,
    Event(String),
    Chain,
    Request(String),
    Manual,
    Retry(u32),
}

impl FireCause {
    pub fn label(&self) -> String {
        match self {
            Self::Schedule => "schedule".to_string(),
            Self::Threshold => "threshold".to_string(),
            Self::Event(name) => format!("event:{name}"),
            Self::Chain => "chain".to_string(),
            Self::Request(from) => format!("request:{from}"),
            Self::Manual => "manual".to_string(),
            Self::Retry(attempt) => format!("retry:{attempt}"),
        }
    }

    /// Hard fires reset the quiet window that gates soft requests.
    fn is_hard(&self) -> bool {
        matches!(self, Self::Schedule | Self::Event(_) | Self::Manual)
    }
}

/// A node the scheduler should consider dispatching this tick.
pub struct ReadyCandidate {
    pub node: Arc<RegisteredNode>,
    pub cause: FireCause,
    /// Fire instant of the previous dispatch, for age tie-breaking.
    pub prev_fire: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("node '{node}': bad schedule spec: {source}")]
    BadSchedule { node: String, source: ScheduleError },
    #[error("node '{node}': bad threshold expression: {detail}")]
    BadExpression { node: String, detail: String },
}

// ============================================================
// Threshold expressions
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
struct Comparison {
    field: ScalarField,
    op: CmpOp,
    value: f32,
}

impl Comparison {
    fn eval(&self, state: &GlobalState) -> bool {
        let v = state.scalar(self.field);
        match self.op {
            CmpOp::Lt => v < self.value,
            CmpOp::Le => v <= self.value,
            CmpOp::Gt => v > self.value,
            CmpOp::Ge => v >= self.value,
        }
    }
}

/// Small boolean grammar over scalar fields:
/// `cmp ('&&' cmp)*` groups joined by `'||'`, where each cmp is
/// `field (<|<=|>|>=) literal`. No parentheses.
#[derive(Debug, Clone)]
pub struct ThresholdExpr {
    or_groups: Vec<Vec<Comparison>>,
}

impl ThresholdExpr {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let cmp_re = regex::Regex::new(r"^([a-z_]+)\s*(<=|>=|<|>)\s*([0-9]*\.?[0-9]+)$")
            .expect("valid regex");
        let mut or_groups = Vec::new();
        for group in expr.split("||") {
            let mut comparisons = Vec::new();
            for raw in group.split("&&") {
                let raw = raw.trim();
                let caps = cmp_re
                    .captures(raw)
                    .ok_or_else(|| format!("cannot parse comparison '{raw}'"))?;
                let field = ScalarField::parse(&caps[1])
                    .ok_or_else(|| format!("unknown field '{}'", &caps[1]))?;
                let op = match &caps[2] {
                    "<" => CmpOp::Lt,
                    "<=" => CmpOp::Le,
                    ">" => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                let value: f32 = caps[3]
                    .parse()
                    .map_err(|_| format!("bad literal '{}'", &caps[3]))?;
                comparisons.push(Comparison { field, op, value });
            }
            if comparisons.is_empty() {
                return Err("empty comparison group".to_string());
            }
            or_groups.push(comparisons);
        }
        Ok(Self { or_groups })
    }

    pub fn eval(&self, state: &GlobalState) -> bool {
        self.or_groups.iter().any(|group| group.iter().all(|c| c.eval(state)))
    }

    pub fn watched_fields(&self) -> Vec<ScalarField> {
        let mut fields: Vec<ScalarField> = self
            .or_groups
            .iter()
            .flatten()
            .map(|c| c.field)
            .collect();
        fields.dedup();
        fields
    }
}

// ============================================================
// Evaluator
// ============================================================

struct ParsedTriggers {
    schedules: Vec<(ScheduleSpec, ScheduleTz)>,
    thresholds: Vec<(ThresholdExpr, Duration)>,
    events: Vec<(String, Option<String>)>,
    chains: Vec<Vec<String>>,
    request_from: Vec<String>,
}

#[derive(Default)]
struct NodeRuntime {
    last_fire: Option<DateTime<Utc>>,
    last_hard_fire: Option<DateTime<Utc>>,
    schedule_next: Vec<Option<DateTime<Utc>>>,
    threshold_last: Vec<Option<DateTime<Utc>>>,
    queued: VecDeque<FireCause>,
}

struct EvalState {
    parsed: HashMap<String, ParsedTriggers>,
    runtime: HashMap<String, NodeRuntime>,
    completions: HashMap<String, DateTime<Utc>>,
    watched: HashMap<ScalarField, HashSet<String>>,
    request_log: HashMap<(String, String), DateTime<Utc>>,
}

/// Evaluates every node's triggers against clock and state and produces the
/// ready queue. One instance lives inside the scheduler.
pub struct TriggerEvaluator {
    registry: Arc<NodeRegistry>,
    clock: Arc<dyn Clock>,
    phases: PhaseSchedule,
    quiet_window: Duration,
    queue_cap: usize,
    inner: Mutex<EvalState>,
}

impl TriggerEvaluator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        clock: Arc<dyn Clock>,
        phases: PhaseSchedule,
        quiet_window: Duration,
        queue_cap: usize,
    ) -> Self {
        Self {
            registry,
            clock,
            phases,
            quiet_window,
            queue_cap,
            inner: Mutex::new(EvalState {
                parsed: HashMap::new(),
                runtime: HashMap::new(),
                completions: HashMap::new(),
                watched: HashMap::new(),
                request_log: HashMap::new(),
            }),
        }
    }

    /// Parse every registered node's triggers. Must run after registration
    /// and before the first tick; a malformed spec is a startup error.
    pub fn prime(&self) -> Result<(), TriggerError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("evaluator lock");
        for registered in self.registry.list() {
            let node_id = registered.decl.id.clone();
            if inner.parsed.contains_key(&node_id) {
                continue;
            }
            let mut parsed = ParsedTriggers {
                schedules: Vec::new(),
                thresholds: Vec::new(),
                events: Vec::new(),
                chains: Vec::new(),
                request_from: Vec::new(),
            };
            for trigger in &registered.decl.triggers {
                match trigger {
                    Trigger::Schedule { spec, tz } => {
                        let spec = ScheduleSpec::parse(spec).map_err(|source| {
                            TriggerError::BadSchedule { node: node_id.clone(), source }
                        })?;
                        parsed.schedules.push((spec, *tz));
                    }
                    Trigger::StateThreshold { expr, debounce } => {
                        let expr = ThresholdExpr::parse(expr).map_err(|detail| {
                            TriggerError::BadExpression { node: node_id.clone(), detail }
                        })?;
                        for field in expr.watched_fields() {
                            inner.watched.entry(field).or_default().insert(node_id.clone());
                        }
                        let debounce = Duration::from_std(*debounce)
                            .unwrap_or_else(|_| Duration::hours(24));
                        parsed.thresholds.push((expr, debounce));
                    }
                    Trigger::Event { name, source } => {
                        parsed.events.push((name.clone(), source.clone()));
                    }
                    Trigger::Chain { after } => parsed.chains.push(after.clone()),
                    Trigger::NodeRequest { from } => {
                        parsed.request_from.extend(from.iter().cloned());
                    }
                    Trigger::Manual => {}
                }
            }

            let runtime = NodeRuntime {
                schedule_next: parsed
                    .schedules
                    .iter()
                    .map(|(spec, tz)| spec.next_after(now, tz.offset(&*self.clock), &self.phases))
                    .collect(),
                threshold_last: vec![None; parsed.thresholds.len()],
                ..Default::default()
            };
            inner.runtime.insert(node_id.clone(), runtime);
            inner.parsed.insert(node_id, parsed);
        }
        Ok(())
    }

    /// Whether a write touching these fields can move any threshold trigger.
    pub fn affects_thresholds(&self, changed_fields: &[&str]) -> bool {
        let inner = self.inner.lock().expect("evaluator lock");
        changed_fields
            .iter()
            .filter_map(|name| ScalarField::parse(name))
            .any(|field| inner.watched.contains_key(&field))
    }

    /// Feed a bus event to every matching Event trigger.
    pub fn note_event(&self, event: &BusEvent) {
        let mut inner = self.inner.lock().expect("evaluator lock");
        let mut hits = Vec::new();
        for (node_id, parsed) in &inner.parsed {
            let matched = parsed.events.iter().any(|(name, source)| {
                *name == event.name && source.as_deref().map_or(true, |s| s == event.source)
            });
            if matched {
                hits.push((node_id.clone(), event.name.clone()));
            }
        }
        for (node_id, name) in hits {
            Self::enqueue(&mut inner, &node_id, FireCause::Event(name), self.queue_cap);
        }
    }

    /// Record a successful completion, for Chain triggers.
    pub fn note_completion(&self, node_id: &str, ended_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("evaluator lock");
        inner.completions.insert(node_id.to_string(), ended_at);
    }

    /// Enqueue a `chain_to` successor named by a finished node's result.
    pub fn chain_enqueue(&self, target: &str) -> Result<(), TriggerError> {
        if self.registry.get(target).is_none() {
            return Err(TriggerError::UnknownNode(target.to_string()));
        }
        let mut inner = self.inner.lock().expect("evaluator lock");
        Self::enqueue(&mut inner, target, FireCause::Chain, self.queue_cap);
        Ok(())
    }

    /// Explicit dispatch request (admin API).
    pub fn manual(&self, node_id: &str) -> Result<(), TriggerError> {
        if self.registry.get(node_id).is_none() {
            return Err(TriggerError::UnknownNode(node_id.to_string()));
        }
        let mut inner = self.inner.lock().expect("evaluator lock");
        Self::enqueue(&mut inner, node_id, FireCause::Manual, self.queue_cap);
        Ok(())
    }

    /// Re-dispatch request from the retry machinery; bypasses the quiet
    /// window but respects the bounded queue.
    pub fn retry_enqueue(&self, node_id: &str, attempt: u32) {
        let mut inner = self.inner.lock().expect("evaluator lock");
        Self::enqueue(&mut inner, node_id, FireCause::Retry(attempt), self.queue_cap);
    }

    /// Put a consumed cause back at the head of the queue (worker pool was
    /// full). Not subject to the cap: the cause was already admitted once.
    pub fn requeue_front(&self, node_id: &str, cause: FireCause) {
        let mut inner = self.inner.lock().expect("evaluator lock");
        inner.runtime.entry(node_id.to_string()).or_default().queued.push_front(cause);
    }

    /// Soft request from one node for another. Honored only when the target
    /// lists the requester, has been quiet for the whole window, and the
    /// requester has not asked recently.
    pub fn request(&self, from: &str, target: &str) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("evaluator lock");
        let Some(parsed) = inner.parsed.get(target) else {
            tracing::debug!(from, target, "request for unknown node ignored");
            return;
        };
        if !parsed.request_from.iter().any(|allowed| allowed == from) {
            tracing::debug!(from, target, "requester not in allowlist, ignored");
            return;
        }
        let quiet_ok = inner
            .runtime
            .get(target)
            .and_then(|rt| rt.last_hard_fire)
            .map_or(true, |t| now - t >= self.quiet_window);
        if !quiet_ok {
            tracing::debug!(from, target, "request suppressed inside quiet window");
            return;
        }
        let key = (from.to_string(), target.to_string());
        if let Some(last) = inner.request_log.get(&key) {
            if now - *last < self.quiet_window {
                tracing::debug!(from, target, "request rate-limited");
                return;
            }
        }
        inner.request_log.insert(key, now);
        Self::enqueue(&mut inner, target, FireCause::Request(from.to_string()), self.queue_cap);
    }

    fn enqueue(inner: &mut EvalState, node_id: &str, cause: FireCause, cap: usize) {
        let runtime = inner.runtime.entry(node_id.to_string()).or_default();
        if runtime.queued.len() >= cap {
            tracing::warn!(node = node_id, "trigger queue full, dropping {:?}", cause);
            return;
        }
        runtime.queued.push_back(cause);
    }

    /// Evaluate everything against the current instant and snapshot.
    ///
    /// At most one cause per node is surfaced; schedule and threshold fires
    /// are consumed here (so a budget skip does not hot-loop), while queued
    /// causes for a running node stay queued until it finishes.
    pub fn collect_ready(
        &self,
        state: &GlobalState,
        running: &HashSet<String>,
    ) -> Vec<ReadyCandidate> {
        let now = self.clock.now();
        let mut guard = self.inner.lock().expect("evaluator lock");
        let inner = &mut *guard;
        let mut ready = Vec::new();

        for registered in self.registry.list() {
            let node_id = registered.decl.id.clone();
            let Some(parsed) = inner.parsed.get(&node_id) else { continue };

            let mut schedule_due = false;
            let mut due_thresholds = Vec::new();
            let mut chain_due = false;
            {
                let runtime = inner.runtime.entry(node_id.clone()).or_default();
                runtime.schedule_next.resize(parsed.schedules.len(), None);
                runtime.threshold_last.resize(parsed.thresholds.len(), None);
                for (idx, (spec, tz)) in parsed.schedules.iter().enumerate() {
                    match runtime.schedule_next[idx] {
                        Some(due) if due <= now => {
                            schedule_due = true;
                            runtime.schedule_next[idx] =
                                spec.next_after(now, tz.offset(&*self.clock), &self.phases);
                        }
                        None => {
                            runtime.schedule_next[idx] =
                                spec.next_after(now, tz.offset(&*self.clock), &self.phases);
                        }
                        _ => {}
                    }
                }
                for (idx, (expr, debounce)) in parsed.thresholds.iter().enumerate() {
                    if !expr.eval(state) {
                        continue;
                    }
                    let debounce_ok = runtime
                        .threshold_last
                        .get(idx)
                        .copied()
                        .flatten()
                        .map_or(true, |last| now - last >= *debounce);
                    if debounce_ok {
                        due_thresholds.push(idx);
                    }
                }
                if !parsed.chains.is_empty() {
                    let last_fire = runtime.last_fire;
                    chain_due = parsed.chains.iter().any(|after| {
                        !after.is_empty()
                            && after.iter().all(|pred| {
                                inner_completion(&inner.completions, pred)
                                    .map_or(false, |end| last_fire.map_or(true, |lf| end > lf))
                            })
                    });
                }
            }

            if !registered.is_active(now) {
                continue;
            }

            let runtime = inner.runtime.entry(node_id.clone()).or_default();

            if running.contains(&node_id) {
                // Coalesce schedule/threshold fires while an instance runs;
                // queued causes wait their turn
                continue;
            }

            let cause = if let Some(queued) = runtime.queued.pop_front() {
                Some(queued)
            } else if schedule_due {
                Some(FireCause::Schedule)
            } else if let Some(idx) = due_thresholds.first().copied() {
                runtime.threshold_last[idx] = Some(now);
                Some(FireCause::Threshold)
            } else if chain_due {
                Some(FireCause::Chain)
            } else {
                None
            };

            if let Some(cause) = cause {
                let prev_fire = runtime.last_fire;
                runtime.last_fire = Some(now);
                if cause.is_hard() {
                    runtime.last_hard_fire = Some(now);
                }
                ready.push(ReadyCandidate { node: registered.clone(), cause, prev_fire });
            }
        }

        ready
    }
}

fn inner_completion(
    completions: &HashMap<String, DateTime<Utc>>,
    node_id: &str,
) -> Option<DateTime<Utc>> {
    completions.get(node_id).copied()
}
