use chrono::NaiveTime;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::budget::{BudgetConfig, Category, CostClass};
use crate::bus::DecayConfig;
use crate::clock::{DayPhase, PhaseSchedule};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}: {detail}")]
    Invalid { key: &'static str, detail: String },
    #[error("category allocations sum to {sum:.3}, allocations plus reserve must stay within 1.0")]
    AllocationSum { sum: f64 },
    #[error("unknown category '{0}' in CATEGORY_ALLOCATIONS")]
    UnknownCategory(String),
    #[error("unknown phase '{0}' in PHASE_SCHEDULE")]
    UnknownPhase(String),
    #[error("PHASE_SCHEDULE missing phase '{0}'")]
    MissingPhase(&'static str),
}

/// Kernel configuration, read from the environment with defaults for every
/// key. Validation failures are fatal at startup.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub database_path: PathBuf,
    pub admin_addr: SocketAddr,
    pub daily_budget_usd: f64,
    pub category_allocations: BTreeMap<Category, f64>,
    pub reserve_fraction: f64,
    pub max_concurrent: usize,
    pub tick_interval: Duration,
    pub decay_tick_interval: Duration,
    pub phase_schedule: PhaseSchedule,
    pub timeouts: HashMap<CostClass, Duration>,
    pub quiet_window: Duration,
    pub trigger_queue_cap: usize,
    pub event_buffer: usize,
    pub narrative_cap: usize,
    pub history_ring: usize,
    pub history_max_age_days: i64,
    pub reflection_hour: u32,
    pub ollama_host: String,
    pub llm_model: String,
    pub llm_usd_per_1k_tokens: f64,
}

fn default_allocations() -> BTreeMap<Category, f64> {
    [
        (Category::System, 0.05),
        (Category::Journal, 0.10),
        (Category::Memory, 0.10),
        (Category::Research, 0.25),
        (Category::Reflection, 0.10),
        (Category::Growth, 0.05),
        (Category::Curiosity, 0.05),
        (Category::Creative, 0.05),
        (Category::Dream, 0.10),
        (Category::Chat, 0.05),
    ]
    .into_iter()
    .collect()
}

impl KernelConfig {
    /// Environment wins over the optional `CORTEX_CONFIG` JSON file, which
    /// wins over the built-in defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file_values = match std::env::var("CORTEX_CONFIG") {
            Ok(path) => load_config_file(&path)?,
            Err(_) => HashMap::new(),
        };
        Self::from_lookup(move |key| {
            std::env::var(key).ok().or_else(|| file_values.get(key).cloned())
        })
    }

    /// Build from any key lookup. Tests feed a map instead of the process
    /// environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Self {
            database_path: PathBuf::from(
                get("DATABASE_PATH").unwrap_or_else(|| "./cortex.db".to_string()),
            ),
            admin_addr: parse_key(&get, "ADMIN_ADDR", "0.0.0.0:3900")?,
            daily_budget_usd: parse_key(&get, "DAILY_BUDGET_USD", "5.00")?,
            category_allocations: match get("CATEGORY_ALLOCATIONS") {
                Some(raw) => parse_allocations(&raw)?,
                None => default_allocations(),
            },
            reserve_fraction: parse_key(&get, "RESERVE_FRACTION", "0.10")?,
            max_concurrent: parse_key(&get, "MAX_CONCURRENT", "4")?,
            tick_interval: Duration::from_millis(parse_key(&get, "TICK_INTERVAL_MS", "5000")?),
            decay_tick_interval: Duration::from_secs(parse_key(&get, "DECAY_TICK_INTERVAL_S", "60")?),
            phase_schedule: match get("PHASE_SCHEDULE") {
                Some(raw) => parse_phase_schedule(&raw)?,
                None => PhaseSchedule::default(),
            },
            timeouts: parse_timeouts(&get)?,
            quiet_window: Duration::from_secs(
                parse_key::<u64>(&get, "QUIET_WINDOW_MINS", "10")? * 60,
            ),
            trigger_queue_cap: parse_key(&get, "TRIGGER_QUEUE_CAP", "16")?,
            event_buffer: parse_key(&get, "EVENT_BUFFER", "256")?,
            narrative_cap: parse_key(&get, "NARRATIVE_CAP", "16")?,
            history_ring: parse_key(&get, "HISTORY_RING", "512")?,
            history_max_age_days: parse_key(&get, "HISTORY_MAX_AGE_DAYS", "30")?,
            reflection_hour: parse_key(&get, "REFLECTION_HOUR", "23")?,
            ollama_host: get("OLLAMA_HOST").unwrap_or_else(|| "http://localhost:11434".to_string()),
            llm_model: get("LLM_MODEL").unwrap_or_else(|| "llama3.2".to_string()),
            llm_usd_per_1k_tokens: parse_key(&get, "LLM_USD_PER_1K_TOKENS", "0.002")?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.daily_budget_usd < 0.0 {
            return Err(ConfigError::Invalid {
                key: "DAILY_BUDGET_USD",
                detail: "must be non-negative".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.reserve_fraction) {
            return Err(ConfigError::Invalid {
                key: "RESERVE_FRACTION",
                detail: "must be within [0, 1]".to_string(),
            });
        }
        let sum: f64 = self.category_allocations.values().sum();
        if self.category_allocations.values().any(|f| *f < 0.0) || sum + self.reserve_fraction > 1.0 + 1e-9 {
            return Err(ConfigError::AllocationSum { sum });
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_CONCURRENT",
                detail: "worker pool must hold at least one slot".to_string(),
            });
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "TICK_INTERVAL_MS",
                detail: "must be positive".to_string(),
            });
        }
        if self.reflection_hour >= 24 {
            return Err(ConfigError::Invalid {
                key: "REFLECTION_HOUR",
                detail: "must be an hour of day (0-23)".to_string(),
            });
        }
        for phase in [DayPhase::Morning, DayPhase::Midday, DayPhase::Afternoon, DayPhase::Evening, DayPhase::Night] {
            if self.phase_schedule.boundary(phase).is_none() {
                return Err(ConfigError::MissingPhase(phase.as_str()));
            }
        }
        Ok(())
    }

    pub fn timeout_for(&self, cost_class: CostClass) -> Duration {
        self.timeouts
            .get(&cost_class)
            .copied()
            .unwrap_or_else(|| Duration::from_secs(cost_class.default_timeout_secs()))
    }

    pub fn budget(&self) -> BudgetConfig {
        BudgetConfig {
            daily_budget_usd: self.daily_budget_usd,
            category_allocations: self.category_allocations.clone(),
            reserve_fraction: self.reserve_fraction,
        }
    }

    pub fn decay(&self) -> DecayConfig {
        DecayConfig { interval: self.decay_tick_interval, ..DecayConfig::default() }
    }
}

/// Flat JSON object of config keys; non-string values are stringified so
/// they parse the same way env values do.
fn load_config_file(path: &str) -> Result<HashMap<String, String>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
        key: "CORTEX_CONFIG",
        detail: format!("{path}: {e}"),
    })?;
    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| ConfigError::Invalid {
        key: "CORTEX_CONFIG",
        detail: format!("{path}: {e}"),
    })?;
    let object = value.as_object().ok_or(ConfigError::Invalid {
        key: "CORTEX_CONFIG",
        detail: "expected a flat JSON object".to_string(),
    })?;
    Ok(object
        .iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect())
}

fn parse_key<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let raw = get(key).unwrap_or_else(|| default.to_string());
    raw.parse()
        .map_err(|e: T::Err| ConfigError::Invalid { key, detail: format!("'{raw}': {e}") })
}

/// `category:fraction` pairs, comma separated, e.g.
/// `research:0.3,dream:0.1,chat:0.2`.
fn parse_allocations(raw: &str) -> Result<BTreeMap<Category, f64>, ConfigError> {
    let mut allocations = BTreeMap::new();
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (name, frac) = pair.split_once(':').ok_or(ConfigError::Invalid {
            key: "CATEGORY_ALLOCATIONS",
            detail: format!("expected 'category:fraction', got '{pair}'"),
        })?;
        let category = Category::parse(name.trim())
            .ok_or_else(|| ConfigError::UnknownCategory(name.trim().to_string()))?;
        let frac: f64 = frac.trim().parse().map_err(|e| ConfigError::Invalid {
            key: "CATEGORY_ALLOCATIONS",
            detail: format!("'{frac}': {e}"),
        })?;
        allocations.insert(category, frac);
    }
    if allocations.is_empty() {
        return Err(ConfigError::Invalid {
            key: "CATEGORY_ALLOCATIONS",
            detail: "no allocations given".to_string(),
        });
    }
    Ok(allocations)
}

/// `phase:HH:MM` pairs, comma separated, e.g. `morning:06:00,midday:12:00`.
fn parse_phase_schedule(raw: &str) -> Result<PhaseSchedule, ConfigError> {
    let mut boundaries = Vec::new();
    for entry in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (name, time) = entry.trim().split_once(':').ok_or(ConfigError::Invalid {
            key: "PHASE_SCHEDULE",
            detail: format!("expected 'phase:HH:MM', got '{entry}'"),
        })?;
        let phase = DayPhase::parse(name.trim())
            .ok_or_else(|| ConfigError::UnknownPhase(name.trim().to_string()))?;
        let time = NaiveTime::parse_from_str(time.trim(), "%H:%M").map_err(|e| {
            ConfigError::Invalid { key: "PHASE_SCHEDULE", detail: format!("'{time}': {e}") }
        })?;
        boundaries.push((phase, time));
    }
    Ok(PhaseSchedule::new(boundaries))
}

fn parse_timeouts(
    get: &impl Fn(&str) -> Option<String>,
) -> Result<HashMap<CostClass, Duration>, ConfigError> {
    let mut timeouts = HashMap::new();
    for (key, class) in [
        ("TIMEOUT_FREE_S", CostClass::Free),
        ("TIMEOUT_LIGHT_S", CostClass::Light),
        ("TIMEOUT_SESSION_S", CostClass::Session),
        ("TIMEOUT_RESEARCH_S", CostClass::Research),
        ("TIMEOUT_DREAM_S", CostClass::Dream),
    ] {
        if let Some(raw) = get(key) {
            let secs: u64 = raw.parse().map_err(|e| ConfigError::Invalid {
                key: "TIMEOUT_*_S",
                detail: format!("'{raw}': {e}"),
            })?;
            timeouts.insert(class, Duration::from_secs(secs));
        }
    }
    Ok(timeouts)
}
