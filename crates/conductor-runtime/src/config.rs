//! Engine configuration from `CONDUCTOR_*` environment variables.
//!
//! Unset variables take their defaults, values below a minimum are clamped, and
//! unparseable values are rejected with [ConfigError].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use conductor_kernel::SlimConfig;

const KEYS: &[&str] = &[
    "CONDUCTOR_MAX_CONCURRENT_RUNS",
    "CONDUCTOR_MAX_CALLS_PER_RUN",
    "CONDUCTOR_MAX_RUNS_PER_SUBMITTER",
    "CONDUCTOR_QUEUE_HIGH_WATERMARK",
    "CONDUCTOR_ACTIVE_HIGH_WATERMARK",
    "CONDUCTOR_HARD_WATERMARK",
    "CONDUCTOR_RESERVATION_TTL_SECS",
    "CONDUCTOR_EVENT_BUFFER_CAPACITY",
    "CONDUCTOR_RETAINED_FINISHED_RUNS",
    "CONDUCTOR_CHECKPOINT_MAX_INLINE_CHARS",
    "CONDUCTOR_CHECKPOINT_MAX_BYTES",
    "CONDUCTOR_CHECKPOINT_HEAVY_FIELDS",
    "CONDUCTOR_CACHE_LOCAL_TTL_SECS",
    "CONDUCTOR_CACHE_SHARED_TTL_SECS",
    "CONDUCTOR_CACHE_LOCAL_MAX_ENTRIES",
    "CONDUCTOR_RUN_COST_BUDGET_USD",
    "CONDUCTOR_RUN_TIME_BUDGET_SECS",
    "CONDUCTOR_STORAGE_BACKEND",
    "CONDUCTOR_SQLITE_DB",
];

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key}='{value}': {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

/// Limits for the concurrency controller.
#[derive(Clone, Debug)]
pub struct ConcurrencyConfig {
    pub max_concurrent_runs: usize,
    pub max_calls_per_run: usize,
    pub max_runs_per_submitter: usize,
    pub queue_high_watermark: usize,
    pub active_high_watermark: usize,
    /// Reject admissions beyond `queue_high_watermark` instead of queueing them.
    pub hard_watermark: bool,
    pub reservation_ttl: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 8,
            max_calls_per_run: 4,
            max_runs_per_submitter: 2,
            queue_high_watermark: 256,
            active_high_watermark: 8,
            hard_watermark: false,
            reservation_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub local_ttl: Duration,
    pub shared_ttl: Duration,
    pub local_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_ttl: Duration::from_secs(60),
            shared_ttl: Duration::from_secs(3600),
            local_max_entries: 1024,
        }
    }
}

/// Soft per-run budgets; exceeding them is reported, never enforced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BudgetConfig {
    pub cost_usd: Option<f64>,
    pub wall_clock: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub concurrency: ConcurrencyConfig,
    pub event_buffer_capacity: usize,
    /// Finished runs whose traces stay in memory; older ones are served from the durable log.
    pub retained_finished_runs: usize,
    pub checkpoint: SlimConfig,
    pub cache: CacheConfig,
    pub budget: BudgetConfig,
    pub storage_backend: StorageBackend,
    pub sqlite_db_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyConfig::default(),
            event_buffer_capacity: 1000,
            retained_finished_runs: 256,
            checkpoint: SlimConfig::default(),
            cache: CacheConfig::default(),
            budget: BudgetConfig::default(),
            storage_backend: StorageBackend::Memory,
            sqlite_db_path: "conductor.db".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut envs = HashMap::new();
        for key in KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert((*key).to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let max_concurrent_runs = read_usize(envs, "CONDUCTOR_MAX_CONCURRENT_RUNS", 8, 1)?;
        let concurrency = ConcurrencyConfig {
            max_concurrent_runs,
            max_calls_per_run: read_usize(envs, "CONDUCTOR_MAX_CALLS_PER_RUN", 4, 1)?,
            max_runs_per_submitter: read_usize(envs, "CONDUCTOR_MAX_RUNS_PER_SUBMITTER", 2, 1)?,
            queue_high_watermark: read_usize(envs, "CONDUCTOR_QUEUE_HIGH_WATERMARK", 256, 1)?,
            active_high_watermark: read_usize(
                envs,
                "CONDUCTOR_ACTIVE_HIGH_WATERMARK",
                max_concurrent_runs,
                1,
            )?,
            hard_watermark: read_bool(envs, "CONDUCTOR_HARD_WATERMARK", false)?,
            reservation_ttl: Duration::from_secs(read_u64(
                envs,
                "CONDUCTOR_RESERVATION_TTL_SECS",
                300,
                5,
            )?),
        };

        let defaults = SlimConfig::default();
        let heavy_fields = match non_empty(envs, "CONDUCTOR_CHECKPOINT_HEAVY_FIELDS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect::<HashSet<_>>(),
            None => defaults.heavy_fields.clone(),
        };
        let checkpoint = SlimConfig {
            max_inline_chars: read_usize(envs, "CONDUCTOR_CHECKPOINT_MAX_INLINE_CHARS", 2048, 64)?,
            heavy_fields,
            all_lists_heavy: false,
            max_checkpoint_bytes: read_usize(envs, "CONDUCTOR_CHECKPOINT_MAX_BYTES", 1_048_576, 4096)?,
        };

        let cache = CacheConfig {
            local_ttl: Duration::from_secs(read_u64(envs, "CONDUCTOR_CACHE_LOCAL_TTL_SECS", 60, 1)?),
            shared_ttl: Duration::from_secs(read_u64(
                envs,
                "CONDUCTOR_CACHE_SHARED_TTL_SECS",
                3600,
                1,
            )?),
            local_max_entries: read_usize(envs, "CONDUCTOR_CACHE_LOCAL_MAX_ENTRIES", 1024, 16)?,
        };

        let budget = BudgetConfig {
            cost_usd: read_optional_f64(envs, "CONDUCTOR_RUN_COST_BUDGET_USD")?,
            wall_clock: read_optional_u64(envs, "CONDUCTOR_RUN_TIME_BUDGET_SECS")?
                .map(Duration::from_secs),
        };

        let storage_backend = match non_empty(envs, "CONDUCTOR_STORAGE_BACKEND")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("memory") => StorageBackend::Memory,
            Some("sqlite") => StorageBackend::Sqlite,
            Some(other) => {
                return Err(invalid(
                    "CONDUCTOR_STORAGE_BACKEND",
                    other,
                    "expected one of: memory, sqlite",
                ))
            }
        };
        let sqlite_db_path = non_empty(envs, "CONDUCTOR_SQLITE_DB")
            .map(String::from)
            .unwrap_or_else(|| "conductor.db".to_string());

        Ok(Self {
            concurrency,
            event_buffer_capacity: read_usize(envs, "CONDUCTOR_EVENT_BUFFER_CAPACITY", 1000, 16)?,
            retained_finished_runs: read_usize(envs, "CONDUCTOR_RETAINED_FINISHED_RUNS", 256, 1)?,
            checkpoint,
            cache,
            budget,
            storage_backend,
            sqlite_db_path,
        })
    }
}

fn non_empty<'a>(envs: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    envs.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn read_u64(
    envs: &HashMap<String, String>,
    key: &str,
    default: u64,
    minimum: u64,
) -> Result<u64, ConfigError> {
    match non_empty(envs, key) {
        None => Ok(default),
        Some(raw) => {
            let value: u64 = raw
                .parse()
                .map_err(|e: std::num::ParseIntError| invalid(key, raw, e.to_string()))?;
            if value < minimum {
                tracing::warn!(key, value, minimum, "configuration value below minimum, clamping");
            }
            Ok(value.max(minimum))
        }
    }
}

fn read_usize(
    envs: &HashMap<String, String>,
    key: &str,
    default: usize,
    minimum: usize,
) -> Result<usize, ConfigError> {
    read_u64(envs, key, default as u64, minimum as u64).map(|v| v as usize)
}

fn read_optional_u64(envs: &HashMap<String, String>, key: &str) -> Result<Option<u64>, ConfigError> {
    non_empty(envs, key)
        .map(|raw| {
            raw.parse()
                .map_err(|e: std::num::ParseIntError| invalid(key, raw, e.to_string()))
        })
        .transpose()
}

fn read_optional_f64(envs: &HashMap<String, String>, key: &str) -> Result<Option<f64>, ConfigError> {
    match non_empty(envs, key) {
        None => Ok(None),
        Some(raw) => {
            let value: f64 = raw
                .parse()
                .map_err(|e: std::num::ParseFloatError| invalid(key, raw, e.to_string()))?;
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(key, raw, "expected a non-negative number"));
            }
            Ok(Some(value))
        }
    }
}

fn read_bool(envs: &HashMap<String, String>, key: &str, default: bool) -> Result<bool, ConfigError> {
    match non_empty(envs, key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, &v, "expected a boolean")),
        },
    }
}
