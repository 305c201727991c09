mod api;
mod budget;
mod bus;
mod clock;
mod config;
mod executors;
mod history;
mod persist;
mod registry;
mod scheduler;
mod state;
mod triggers;

use std::process::ExitCode;
use std::sync::Arc;

use crate::budget::BudgetManager;
use crate::bus::{DecayTask, StateBus};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, KernelConfig};
use crate::executors::{builtin_nodes, LlmClient};
use crate::history::HistoryLog;
use crate::persist::{PersistError, Persistence, SqliteStore};
use crate::registry::NodeRegistry;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::state::{Activity, GlobalState, ScalarField};
use crate::triggers::TriggerEvaluator;

/// Startup failures, sorted by exit code: persistence 2, config and
/// invariant violations 3, everything else 1.
enum Fatal {
    Config(ConfigError),
    Persistence(PersistError),
    Invariant(String),
    Other(anyhow::Error),
}

impl Fatal {
    fn exit_code(&self) -> ExitCode {
        match self {
            Self::Persistence(_) => ExitCode::from(2),
            Self::Config(_) | Self::Invariant(_) => ExitCode::from(3),
            Self::Other(_) => ExitCode::from(1),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Persistence(_) => "persistence",
            Self::Invariant(_) => "invariant",
            Self::Other(_) => "startup",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Config(e) => e.to_string(),
            Self::Persistence(e) => e.to_string(),
            Self::Invariant(m) => m.clone(),
            Self::Other(e) => e.to_string(),
        }
    }
}

impl From<ConfigError> for Fatal {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<PersistError> for Fatal {
    fn from(e: PersistError) -> Self {
        Self::Persistence(e)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            tracing::error!(kind = fatal.kind(), "fatal: {}", fatal.message());
            fatal.exit_code()
        }
    }
}

async fn run() -> Result<(), Fatal> {
    let config = KernelConfig::from_env()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // ============================================================
    // Persistence and restored state
    // ============================================================

    tracing::info!(path = %config.database_path.display(), "opening datastore");
    let store: Arc<dyn Persistence> = Arc::new(SqliteStore::open(&config.database_path).await?);

    let state = match store.load_snapshot().await? {
        Some(snapshot) => {
            tracing::info!(revision = snapshot.revision, "restored state snapshot");
            snapshot
        }
        None => {
            tracing::info!("no prior state, starting fresh");
            GlobalState::initial(clock.now(), clock.day_epoch())
        }
    };
    check_startup_invariants(&state)?;

    let bus = Arc::new(StateBus::new(
        state,
        store.clone(),
        clock.clone(),
        config.narrative_cap,
        config.event_buffer,
    ));

    let restored_ledger = store.load_ledger(clock.day_epoch()).await?;
    if restored_ledger.is_some() {
        tracing::info!(day_epoch = clock.day_epoch(), "restored budget ledger");
    }
    let budget = Arc::new(BudgetManager::new(config.budget(), clock.day_epoch(), restored_ledger));

    // ============================================================
    // Nodes
    // ============================================================

    let registry = Arc::new(NodeRegistry::new());
    let llm = Arc::new(LlmClient::new(
        config.ollama_host.clone(),
        config.llm_model.clone(),
        config.llm_usd_per_1k_tokens,
    ));
    for node in builtin_nodes(
        llm,
        clock.clone(),
        config.phase_schedule.clone(),
        config.reflection_hour,
    ) {
        registry
            .register(node)
            .map_err(|e| Fatal::Other(anyhow::anyhow!("builtin registration: {e}")))?;
    }
    registry.apply_overlays(store.load_overlays().await?);

    let evaluator = Arc::new(TriggerEvaluator::new(
        registry.clone(),
        clock.clone(),
        config.phase_schedule.clone(),
        chrono::Duration::from_std(config.quiet_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(10)),
        config.trigger_queue_cap,
    ));
    evaluator
        .prime()
        .map_err(|e| Fatal::Invariant(format!("trigger declaration: {e}")))?;

    let history = Arc::new(HistoryLog::new(
        store.clone(),
        config.history_ring,
        chrono::Duration::days(config.history_max_age_days),
    ));

    // ============================================================
    // Scheduler + reconciliation
    // ============================================================

    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        bus.clone(),
        budget.clone(),
        evaluator.clone(),
        history.clone(),
        store.clone(),
        clock.clone(),
        SchedulerConfig {
            max_concurrent: config.max_concurrent,
            tick_interval: config.tick_interval,
            timeouts: config.timeouts.clone(),
        },
    ));
    scheduler.reconcile().await.map_err(Fatal::Other)?;

    let shutdown = scheduler.shutdown_token();

    let decay = DecayTask::new(bus.clone(), clock.clone(), config.decay());
    let decay_handle = tokio::spawn(decay.run(shutdown.clone()));

    let scheduler_handle = tokio::spawn(scheduler.clone().run());

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    // ============================================================
    // Admin API
    // ============================================================

    let app = api::router(api::ApiState {
        bus: bus.clone(),
        registry,
        budget,
        history,
        scheduler: scheduler.handle(),
        store,
    });

    tracing::info!("cortex kernel awake, admin on {}", config.admin_addr);
    let listener = tokio::net::TcpListener::bind(config.admin_addr)
        .await
        .map_err(|e| Fatal::Other(anyhow::anyhow!("bind {}: {e}", config.admin_addr)))?;

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await
        .map_err(|e| Fatal::Other(anyhow::anyhow!("server error: {e}")))?;

    // Loop tasks wind down after the token flips
    shutdown.cancel();
    let _ = scheduler_handle.await;
    let _ = decay_handle.await;

    if bus.persistence_failed() {
        return Err(Fatal::Persistence(PersistError::Unavailable(
            "state snapshot could not be persisted".to_string(),
        )));
    }
    tracing::info!("clean shutdown");
    Ok(())
}

fn check_startup_invariants(state: &GlobalState) -> Result<(), Fatal> {
    for field in ScalarField::ALL {
        let value = state.scalar(field);
        if !(0.0..=1.0).contains(&value) || value.is_nan() {
            return Err(Fatal::Invariant(format!(
                "restored state field {} = {} out of bounds",
                field.name(),
                value
            )));
        }
    }
    let idle = state.current_activity == Activity::Idle;
    if idle && state.active_session_id.is_some() {
        return Err(Fatal::Invariant("idle state carries a session id".to_string()));
    }
    if !idle && state.active_session_id.is_none() {
        return Err(Fatal::Invariant(format!(
            "activity {} restored without a session id",
            state.current_activity
        )));
    }
    Ok(())
}
