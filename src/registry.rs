use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::budget::{Category, CostClass, Priority, ReservationToken};
use crate::clock::ScheduleTz;
use crate::state::{GlobalState, StateDelta};

/// How a node becomes ready. A node may declare several.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Cron-like spec or `@phase` name, resolved in the given zone.
    Schedule { spec: String, tz: ScheduleTz },
    /// Boolean expression over scalar state fields, e.g. `"concern > 0.7"`.
    /// Fires at most once per debounce window.
    StateThreshold { expr: String, debounce: Duration },
    /// Fires when a matching bus event is seen.
    Event { name: String, source: Option<String> },
    /// Fires once every listed node has completed successfully since this
    /// node's own last fire.
    Chain { after: Vec<String> },
    /// Soft request from another node; honored only while quiet.
    NodeRequest { from: Vec<String> },
    /// Only via explicit dispatch.
    Manual,
}

/// Retry declaration for nodes that opt in. Each attempt reserves budget
/// afresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given attempt (1-based retry count).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let raw = (self.initial_backoff_ms as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32)) as u64;
        let mut delay_ms = raw.min(self.max_backoff_ms);
        if self.jitter {
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms += jitter;
        }
        Duration::from_millis(delay_ms)
    }
}

/// What an executor hands back to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct NodeResult {
    pub output: serde_json::Value,
    pub state_delta: Option<StateDelta>,
    pub chain_to: Vec<String>,
    pub request_nodes: Vec<String>,
    pub tokens_used: u64,
    pub dollars_used: f64,
}

impl NodeResult {
    pub fn with_output(output: serde_json::Value) -> Self {
        Self { output, ..Default::default() }
    }
}

/// Domain error from an executor. `transient` drives the retry decision;
/// `dollars_used` carries the minimum charge when an LLM call already went
/// out before the failure.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExecutorError {
    pub message: String,
    pub transient: bool,
    pub dollars_used: f64,
}

impl ExecutorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { message: message.into(), transient: true, dollars_used: 0.0 }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), transient: false, dollars_used: 0.0 }
    }

    pub fn with_charge(mut self, dollars: f64) -> Self {
        self.dollars_used = dollars;
        self
    }
}

/// Everything an executor gets for one dispatch.
pub struct ExecutionContext {
    pub node_id: String,
    pub execution_id: Uuid,
    pub snapshot: Arc<GlobalState>,
    pub cancel: CancellationToken,
    pub reservation: ReservationToken,
}

/// The one capability the scheduler dispatches through. Implementations wrap
/// LLM clients, memory stores, and tool handlers; the scheduler never looks
/// inside.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeResult, ExecutorError>;
}

/// Static declaration of a schedulable unit of work.
#[derive(Clone)]
pub struct CognitiveNode {
    pub id: String,
    pub category: Category,
    pub cost_class: CostClass,
    pub priority: Priority,
    pub enabled: bool,
    pub is_session: bool,
    pub triggers: Vec<Trigger>,
    pub retry: Option<RetryPolicy>,
    pub est_cost: Option<f64>,
    pub executor: Arc<dyn NodeExecutor>,
}

impl CognitiveNode {
    pub fn new(
        id: impl Into<String>,
        category: Category,
        cost_class: CostClass,
        executor: Arc<dyn NodeExecutor>,
    ) -> Self {
        Self {
            id: id.into(),
            category,
            cost_class,
            priority: Priority::Normal,
            enabled: true,
            is_session: false,
            triggers: Vec::new(),
            retry: None,
            est_cost: None,
            executor,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn session(mut self) -> Self {
        self.is_session = true;
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn estimated_cost(mut self, usd: f64) -> Self {
        self.est_cost = Some(usd);
        self
    }
}

/// Admin-set overrides layered on a declaration; persisted across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeOverlay {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended_until: Option<DateTime<Utc>>,
}

impl NodeOverlay {
    pub fn is_empty(&self) -> bool {
        self.enabled.is_none() && self.priority.is_none() && self.suspended_until.is_none()
    }
}

/// Declaration plus overlay, as handed to the evaluator and scheduler.
pub struct RegisteredNode {
    pub decl: CognitiveNode,
    pub overlay: NodeOverlay,
}

impl RegisteredNode {
    pub fn effective_priority(&self) -> Priority {
        self.overlay.priority.unwrap_or(self.decl.priority)
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let enabled = self.overlay.enabled.unwrap_or(self.decl.enabled);
        let suspended = self.overlay.suspended_until.map_or(false, |until| until > now);
        enabled && !suspended
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("node '{0}' already registered")]
    Duplicate(String),
    #[error("unknown node '{0}'")]
    Unknown(String),
}

/// Holds declared cognitive nodes. Registration happens at startup; admin
/// ops only touch the overlay. Reads swap an immutable map pointer so the
/// evaluator never takes the write lock.
pub struct NodeRegistry {
    inner: RwLock<Arc<HashMap<String, Arc<RegisteredNode>>>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Arc::new(HashMap::new())) }
    }

    pub fn register(&self, node: CognitiveNode) -> Result<(), RegistryError> {
        let mut guard = self.inner.write().expect("registry lock");
        if guard.contains_key(&node.id) {
            return Err(RegistryError::Duplicate(node.id));
        }
        let mut next = (**guard).clone();
        next.insert(
            node.id.clone(),
            Arc::new(RegisteredNode { decl: node, overlay: NodeOverlay::default() }),
        );
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<RegisteredNode>> {
        self.map().get(id).cloned()
    }

    fn map(&self) -> Arc<HashMap<String, Arc<RegisteredNode>>> {
        self.inner.read().expect("registry lock").clone()
    }

    /// Stable listing: category, then id.
    pub fn list(&self) -> Vec<Arc<RegisteredNode>> {
        let mut nodes: Vec<_> = self.map().values().cloned().collect();
        nodes.sort_by(|a, b| {
            a.decl
                .category
                .cmp(&b.decl.category)
                .then_with(|| a.decl.id.cmp(&b.decl.id))
        });
        nodes
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<NodeOverlay, RegistryError> {
        self.update_overlay(id, |overlay| overlay.enabled = Some(enabled))
    }

    pub fn override_priority(
        &self,
        id: &str,
        priority: Option<Priority>,
    ) -> Result<NodeOverlay, RegistryError> {
        self.update_overlay(id, |overlay| overlay.priority = priority)
    }

    pub fn suspend_until(
        &self,
        id: &str,
        until: Option<DateTime<Utc>>,
    ) -> Result<NodeOverlay, RegistryError> {
        self.update_overlay(id, |overlay| overlay.suspended_until = until)
    }

    pub fn apply_overlays(&self, overlays: HashMap<String, NodeOverlay>) {
        for (id, overlay) in overlays {
            let _ = self.update_overlay(&id, |slot| *slot = overlay.clone());
        }
    }

    fn update_overlay(
        &self,
        id: &str,
        apply: impl FnOnce(&mut NodeOverlay),
    ) -> Result<NodeOverlay, RegistryError> {
        let mut guard = self.inner.write().expect("registry lock");
        let current = guard.get(id).ok_or_else(|| RegistryError::Unknown(id.to_string()))?;
        let mut overlay = current.overlay.clone();
        apply(&mut overlay);
        let mut next = (**guard).clone();
        next.insert(
            id.to_string(),
            Arc::new(RegisteredNode { decl: current.decl.clone(), overlay: overlay.clone() }),
        );
        *guard = Arc::new(next);
        Ok(overlay)
    }
}
