//! # Tally Configuration
//!
//! Configuration for the reservation engine, event channel and processor.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_REDIS_URL=redis://127.0.0.1:6379                             │
//! │     TALLY_WORKERS=8                                                    │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally/tally.toml (Linux)                                 │
//! │     ~/Library/Application Support/com.tally.tally/tally.toml (macOS)   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "/var/lib/tally/ledger.db"
//!
//! [redis]
//! url = "redis://127.0.0.1:6379"
//!
//! [reservation]
//! default_ttl_secs = 300
//! max_attempts = 5
//!
//! [channel]
//! partitions = 16
//! max_delivery_attempts = 5
//!
//! [processor]
//! workers = 4
//! ```

use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{StockError, StockResult};

// =============================================================================
// Database Settings
// =============================================================================

/// Ledger database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("tally-ledger.db")
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Redis Settings
// =============================================================================

/// Fast-path store and channel connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisSettings {
    /// `redis://` or `rediss://` URL. Library users may leave this unset
    /// and run on the in-memory backends.
    #[serde(default)]
    pub url: Option<String>,
}

// =============================================================================
// Reservation Settings
// =============================================================================

/// Reservation engine tuning.
///
/// ```text
///   reserve ──► contended? ──► backoff 1ms, 2ms, 4ms ... 20ms (max_attempts)
///          └──► store down? ─► backoff until store_retry_window, then fail closed
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationSettings {
    /// Hold time for a reservation that is never committed.
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,

    /// Attempts at a contended reserve before `ContentionExceeded`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// How long an unreachable store is retried before `StoreUnavailable`.
    #[serde(default = "default_store_retry_window")]
    pub store_retry_window_ms: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Reservations expired per sweep pass.
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: usize,

    /// How long finished reservations stay readable.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

fn default_ttl() -> u64 {
    tally_core::DEFAULT_RESERVATION_TTL_SECS
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_initial() -> u64 {
    1
}
fn default_backoff_max() -> u64 {
    20
}
fn default_store_retry_window() -> u64 {
    2_000
}
fn default_sweep_interval() -> u64 {
    1_000
}
fn default_sweep_batch() -> usize {
    500
}
fn default_retention() -> u64 {
    86_400
}

impl Default for ReservationSettings {
    fn default() -> Self {
        ReservationSettings {
            default_ttl_secs: default_ttl(),
            max_attempts: default_max_attempts(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
            store_retry_window_ms: default_store_retry_window(),
            sweep_interval_ms: default_sweep_interval(),
            sweep_batch: default_sweep_batch(),
            retention_secs: default_retention(),
        }
    }
}

impl ReservationSettings {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_ttl_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs as i64)
    }

    /// Backoff between contended reserve attempts. The attempt count, not
    /// elapsed time, bounds the loop.
    pub fn contention_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: Duration::from_millis(self.backoff_initial_ms),
            initial_interval: Duration::from_millis(self.backoff_initial_ms),
            max_interval: Duration::from_millis(self.backoff_max_ms),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Backoff while the store is unreachable, bounded by the retry window.
    pub fn store_backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.backoff_initial_ms.max(10));
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: Duration::from_millis(self.store_retry_window_ms / 4).max(Duration::from_millis(10)),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_millis(self.store_retry_window_ms)),
            ..Default::default()
        }
    }
}

// =============================================================================
// Channel Settings
// =============================================================================

/// Event channel tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Number of ordered partitions. Keys hash onto partitions.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// An unacknowledged delivery becomes visible again after this long.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_ms: u64,

    /// Deliveries before a message is dead-lettered.
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_partitions() -> u32 {
    16
}
fn default_visibility_timeout() -> u64 {
    30_000
}
fn default_max_delivery_attempts() -> u32 {
    5
}
fn default_poll_interval() -> u64 {
    50
}
fn default_batch_size() -> usize {
    16
}

impl Default for ChannelSettings {
    fn default() -> Self {
        ChannelSettings {
            partitions: default_partitions(),
            visibility_timeout_ms: default_visibility_timeout(),
            max_delivery_attempts: default_max_delivery_attempts(),
            poll_interval_ms: default_poll_interval(),
            batch_size: default_batch_size(),
        }
    }
}

impl ChannelSettings {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// =============================================================================
// Processor Settings
// =============================================================================

/// Sales processor and reconciler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// In-process retry budget for a transient ledger write.
    #[serde(default = "default_write_retry_window")]
    pub write_retry_window_secs: u64,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
}

fn default_workers() -> usize {
    4
}
fn default_write_retry_window() -> u64 {
    30
}
fn default_reconcile_interval() -> u64 {
    300
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        ProcessorSettings {
            workers: default_workers(),
            write_retry_window_secs: default_write_retry_window(),
            reconcile_interval_secs: default_reconcile_interval(),
        }
    }
}

impl ProcessorSettings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// Backoff for the durable sale write, bounded by the write window.
    pub fn write_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: Duration::from_millis(100),
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.write_retry_window_secs)),
            ..Default::default()
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete Tally configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub redis: RedisSettings,

    #[serde(default)]
    pub reservation: ReservationSettings,

    #[serde(default)]
    pub channel: ChannelSettings,

    #[serde(default)]
    pub processor: ProcessorSettings,
}

impl TallyConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tally.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> StockResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading tally config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load tally config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn save(&self, config_path: Option<PathBuf>) -> StockResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| StockError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StockError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| StockError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Tally config saved");
        Ok(())
    }

    pub fn validate(&self) -> StockResult<()> {
        if let Some(ref url) = self.redis.url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(StockError::InvalidConfig(format!(
                    "Redis URL must start with redis:// or rediss://, got: {}",
                    url
                )));
            }
        }

        if self.reservation.default_ttl_secs == 0 {
            return Err(StockError::InvalidConfig("default_ttl_secs must be greater than 0".into()));
        }

        if self.reservation.max_attempts == 0 {
            return Err(StockError::InvalidConfig("max_attempts must be greater than 0".into()));
        }

        if self.reservation.backoff_initial_ms > self.reservation.backoff_max_ms {
            return Err(StockError::InvalidConfig(
                "backoff_initial_ms must not exceed backoff_max_ms".into(),
            ));
        }

        if self.channel.partitions == 0 {
            return Err(StockError::InvalidConfig("partitions must be greater than 0".into()));
        }

        if self.channel.max_delivery_attempts == 0 {
            return Err(StockError::InvalidConfig(
                "max_delivery_attempts must be greater than 0".into(),
            ));
        }

        if self.channel.batch_size == 0 {
            return Err(StockError::InvalidConfig("batch_size must be greater than 0".into()));
        }

        if self.processor.workers == 0 {
            return Err(StockError::InvalidConfig("workers must be greater than 0".into()));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("TALLY_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(url) = std::env::var("TALLY_REDIS_URL") {
            debug!("Overriding redis URL from environment");
            self.redis.url = Some(url);
        }

        if let Ok(ttl) = std::env::var("TALLY_RESERVATION_TTL_SECS") {
            if let Ok(v) = ttl.parse::<u64>() {
                self.reservation.default_ttl_secs = v;
            }
        }

        if let Ok(partitions) = std::env::var("TALLY_PARTITIONS") {
            if let Ok(v) = partitions.parse::<u32>() {
                debug!(partitions = v, "Overriding partition count from environment");
                self.channel.partitions = v;
            }
        }

        if let Ok(attempts) = std::env::var("TALLY_MAX_DELIVERY_ATTEMPTS") {
            if let Ok(v) = attempts.parse::<u32>() {
                self.channel.max_delivery_attempts = v;
            }
        }

        if let Ok(workers) = std::env::var("TALLY_WORKERS") {
            match workers.parse::<usize>() {
                Ok(v) => self.processor.workers = v,
                Err(_) => warn!(workers = %workers, "Ignoring non-numeric TALLY_WORKERS"),
            }
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "tally").map(|dirs| dirs.config_dir().join("tally.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TallyConfig::default();
        assert_eq!(config.reservation.default_ttl_secs, 300);
        assert_eq!(config.reservation.max_attempts, 5);
        assert_eq!(config.channel.partitions, 16);
        assert_eq!(config.channel.max_delivery_attempts, 5);
        assert_eq!(config.processor.write_retry_window_secs, 30);
        assert!(config.redis.url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TallyConfig::default();

        config.redis.url = Some("http://localhost".into());
        assert!(config.validate().is_err());

        config.redis.url = Some("redis://localhost:6379".into());
        assert!(config.validate().is_ok());

        config.channel.partitions = 0;
        assert!(config.validate().is_err());
        config.channel.partitions = 4;

        config.reservation.backoff_initial_ms = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TallyConfig = toml::from_str(
            r#"
            [reservation]
            default_ttl_secs = 60

            [channel]
            partitions = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.reservation.default_ttl_secs, 60);
        assert_eq!(config.reservation.sweep_batch, 500);
        assert_eq!(config.channel.partitions, 4);
        assert_eq!(config.processor.workers, 4);
    }

    #[test]
    fn test_toml_serialization() {
        let toml_str = toml::to_string_pretty(&TallyConfig::default()).unwrap();
        assert!(toml_str.contains("[reservation]"));
        assert!(toml_str.contains("[channel]"));
    }

    #[test]
    fn test_backoff_bounds() {
        let settings = ReservationSettings::default();
        let b = settings.contention_backoff();
        assert_eq!(b.initial_interval, Duration::from_millis(1));
        assert_eq!(b.max_interval, Duration::from_millis(20));
        assert!(b.max_elapsed_time.is_none());

        let s = settings.store_backoff();
        assert_eq!(s.max_elapsed_time, Some(Duration::from_millis(2_000)));
    }
}
