use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::budget::{BudgetLedger, BudgetManager, Category, Priority};
use crate::bus::StateBus;
use crate::history::{ExecutionRecord, HistoryLog};
use crate::persist::Persistence;
use crate::registry::{NodeRegistry, RegistryError, Trigger};
use crate::scheduler::SchedulerHandle;
use crate::state::GlobalState;
use crate::triggers::TriggerError;

/// Everything the admin surface needs a handle on.
#[derive(Clone)]
pub struct ApiState {
    pub bus: Arc<StateBus>,
    pub registry: Arc<NodeRegistry>,
    pub budget: Arc<BudgetManager>,
    pub history: Arc<HistoryLog>,
    pub scheduler: SchedulerHandle,
    pub store: Arc<dyn Persistence>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/state/events", get(get_state_events))
        .route("/nodes", get(list_nodes))
        .route("/nodes/:id/enabled", put(set_node_enabled))
        .route("/nodes/:id/priority", put(set_node_priority))
        .route("/nodes/:id/suspend", put(suspend_node))
        .route("/nodes/:id/dispatch", post(dispatch_node))
        .route("/budget", get(get_budget))
        .route("/budget/config", put(put_budget_config))
        .route("/history", get(get_history))
        .route("/status", get(get_status))
        .route("/shutdown", post(post_shutdown))
        .route("/health", get(health_check))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

// ============================================================
// Errors
// ============================================================

/// Structured error body: `{kind, message, node_id?, reservation_id?}` with
/// stable kind strings.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<Uuid>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiErrorBody { kind, message: message.into(), node_id: None, reservation_id: None },
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(kind: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, kind, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.body.node_id = Some(node_id.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<TriggerError> for ApiError {
    fn from(err: TriggerError) -> Self {
        match &err {
            TriggerError::UnknownNode(id) => Self::not_found(err.to_string()).with_node(id.clone()),
            _ => Self::bad_request("invalid_trigger", err.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match &err {
            RegistryError::Unknown(id) => Self::not_found(err.to_string()).with_node(id.clone()),
            RegistryError::Duplicate(id) => {
                Self::bad_request("duplicate_node", err.to_string()).with_node(id.clone())
            }
        }
    }
}

// ============================================================
// State
// ============================================================

async fn get_state(State(api): State<ApiState>) -> Json<GlobalState> {
    Json((*api.bus.read()).clone())
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    /// Comma-separated event names; `node.*` prefixes allowed.
    #[serde(default)]
    filter: Option<String>,
}

async fn get_state_events(
    State(api): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let filter: Vec<String> = query
        .filter
        .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let mut subscription = api.bus.subscribe(filter);
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(64);
    tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            let sse_event = match Event::default().event(event.name.clone()).json_data(&event) {
                Ok(ev) => ev,
                Err(e) => {
                    tracing::warn!("unserializable bus event dropped from stream: {e}");
                    continue;
                }
            };
            if tx.send(Ok(sse_event)).await.is_err() {
                break;
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

// ============================================================
// Nodes
// ============================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub category: Category,
    pub cost_class: crate::budget::CostClass,
    pub priority: Priority,
    pub enabled: bool,
    pub is_session: bool,
    pub triggers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended_until: Option<DateTime<Utc>>,
    pub running: bool,
}

fn trigger_label(trigger: &Trigger) -> String {
    match trigger {
        Trigger::Schedule { spec, .. } => format!("schedule({spec})"),
        Trigger::StateThreshold { expr, .. } => format!("threshold({expr})"),
        Trigger::Event { name, .. } => format!("event({name})"),
        Trigger::Chain { after } => format!("chain({})", after.join(",")),
        Trigger::NodeRequest { from } => format!("request({})", from.join(",")),
        Trigger::Manual => "manual".to_string(),
    }
}

async fn list_nodes(State(api): State<ApiState>) -> Json<Vec<NodeInfo>> {
    let running = api.scheduler.running_nodes();
    let now = Utc::now();
    let nodes = api
        .registry
        .list()
        .into_iter()
        .map(|registered| NodeInfo {
            id: registered.decl.id.clone(),
            category: registered.decl.category,
            cost_class: registered.decl.cost_class,
            priority: registered.effective_priority(),
            enabled: registered.is_active(now),
            is_session: registered.decl.is_session,
            triggers: registered.decl.triggers.iter().map(trigger_label).collect(),
            suspended_until: registered.overlay.suspended_until,
            running: running.contains(&registered.decl.id),
        })
        .collect();
    Json(nodes)
}

#[derive(Debug, Deserialize)]
struct EnabledBody {
    enabled: bool,
}

async fn set_node_enabled(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<EnabledBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let overlay = api.registry.set_enabled(&id, body.enabled)?;
    if let Err(e) = api.store.save_overlay(&id, &overlay).await {
        return Err(ApiError::internal(format!("overlay persist failed: {e}")).with_node(id));
    }
    Ok(Json(serde_json::json!({ "id": id, "enabled": body.enabled })))
}

#[derive(Debug, Deserialize)]
struct PriorityBody {
    /// Omit to clear the override.
    priority: Option<Priority>,
}

async fn set_node_priority(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<PriorityBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let overlay = api.registry.override_priority(&id, body.priority)?;
    if let Err(e) = api.store.save_overlay(&id, &overlay).await {
        return Err(ApiError::internal(format!("overlay persist failed: {e}")).with_node(id));
    }
    Ok(Json(serde_json::json!({ "id": id, "priority": body.priority })))
}

#[derive(Debug, Deserialize)]
struct SuspendBody {
    /// Omit to lift the suspension.
    until: Option<DateTime<Utc>>,
}

async fn suspend_node(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<SuspendBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let overlay = api.registry.suspend_until(&id, body.until)?;
    if let Err(e) = api.store.save_overlay(&id, &overlay).await {
        return Err(ApiError::internal(format!("overlay persist failed: {e}")).with_node(id));
    }
    Ok(Json(serde_json::json!({ "id": id, "suspended_until": body.until })))
}

async fn dispatch_node(
    State(api): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    api.scheduler.dispatch(&id)?;
    Ok(Json(serde_json::json!({ "id": id, "dispatched": true })))
}

// ============================================================
// Budget
// ============================================================

async fn get_budget(State(api): State<ApiState>) -> Json<BudgetLedger> {
    Json(api.budget.snapshot())
}

#[derive(Debug, Deserialize)]
struct BudgetConfigBody {
    daily_budget_usd: f64,
    category_allocations: BTreeMap<String, f64>,
    #[serde(default)]
    reserve_fraction: Option<f64>,
}

async fn put_budget_config(
    State(api): State<ApiState>,
    Json(body): Json<BudgetConfigBody>,
) -> Result<Json<BudgetLedger>, ApiError> {
    if body.daily_budget_usd < 0.0 {
        return Err(ApiError::bad_request("config", "daily budget must be non-negative"));
    }
    let mut allocations = BTreeMap::new();
    for (name, frac) in &body.category_allocations {
        let category = Category::parse(name)
            .ok_or_else(|| ApiError::bad_request("config", format!("unknown category '{name}'")))?;
        if *frac < 0.0 {
            return Err(ApiError::bad_request("config", "allocations must be non-negative"));
        }
        allocations.insert(category, *frac);
    }
    let reserve = body.reserve_fraction.unwrap_or(0.0);
    let sum: f64 = allocations.values().sum();
    if sum + reserve > 1.0 + 1e-9 {
        return Err(ApiError::bad_request(
            "config",
            format!("allocations ({sum:.3}) plus reserve ({reserve:.3}) exceed 1.0"),
        ));
    }

    api.budget.reconfigure(crate::budget::BudgetConfig {
        daily_budget_usd: body.daily_budget_usd,
        category_allocations: allocations,
        reserve_fraction: reserve,
    });
    let snapshot = api.budget.snapshot();
    if let Err(e) = api.store.save_ledger(&snapshot).await {
        return Err(ApiError::internal(format!("ledger persist failed: {e}")));
    }
    Ok(Json(snapshot))
}

// ============================================================
// History
// ============================================================

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    since: Option<DateTime<Utc>>,
    #[serde(default)]
    node: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn get_history(
    State(api): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ExecutionRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(100).min(1000);
    let records = api
        .history
        .query(query.since, query.node.as_deref(), limit)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(records))
}

// ============================================================
// Status & lifecycle
// ============================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub activity: String,
    pub rhythm_phase: String,
    pub day_epoch: i64,
    pub revision: u64,
    pub budget_remaining_usd: f64,
    pub running_nodes: Vec<String>,
    pub shutting_down: bool,
}

async fn get_status(State(api): State<ApiState>) -> Json<StatusResponse> {
    let state = api.bus.read();
    Json(StatusResponse {
        activity: state.current_activity.as_str().to_string(),
        rhythm_phase: state.rhythm_phase.clone(),
        day_epoch: state.day_epoch,
        revision: state.revision,
        budget_remaining_usd: api.budget.remaining(None),
        running_nodes: api.scheduler.running_nodes(),
        shutting_down: api.scheduler.is_shutting_down(),
    })
}

async fn post_shutdown(State(api): State<ApiState>) -> Json<serde_json::Value> {
    tracing::info!("shutdown requested over admin API");
    api.scheduler.shutdown();
    Json(serde_json::json!({ "shutting_down": true }))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "cortex-core",
    }))
}
