//! Gateway configuration loading.
//!
//! TOML file first, environment overrides second.  A missing config file is
//! not an error — every field has a default — so a bare container with just
//! `CLOUD_API_URL` set comes up fine.  Default config path:
//! `/etc/carnitrack/gateway.toml`.
//!
//! # Recognized environment overrides
//! `TCP_PORT`, `TCP_HOST`, `CLOUD_API_URL`, `EVENT_SEND_TIMEOUT_MS`,
//! `REST_MAX_RETRIES`, `REST_RETRY_DELAY_MS`, `REST_BACKOFF_MULTIPLIER`,
//! `REST_MAX_RETRY_DELAY_MS`, `HEARTBEAT_TIMEOUT_MS`, `ACTIVITY_IDLE_MS`,
//! `ACTIVITY_STALE_MS`, `SESSION_POLL_INTERVAL_MS`,
//! `SESSION_CACHE_EXPIRY_MS`, `OFFLINE_TRIGGER_DELAY_MS`,
//! `OFFLINE_MAX_EVENTS_PER_BATCH`, `OFFLINE_BATCH_RETENTION_DAYS`.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub tcp: TcpConfig,
    pub cloud: CloudConfig,
    pub heartbeat: HeartbeatConfig,
    pub activity: ActivityConfig,
    pub session_cache: SessionCacheConfig,
    pub offline: OfflineConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Base URL of the Cloud API; a trailing `/edge` segment is optional
    /// (the REST client normalizes either way).
    pub api_url: String,
    pub event_send_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    pub queue_when_offline: bool,
    pub max_queue_size: usize,
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub timeout_ms: u64,
    pub check_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ActivityConfig {
    pub idle_threshold_ms: u64,
    pub stale_threshold_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SessionCacheConfig {
    pub poll_interval_ms: u64,
    pub expiry_ms: u64,
    pub cleanup_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct OfflineConfig {
    pub trigger_delay_ms: u64,
    pub max_events_per_batch: u64,
    pub retention_days: u32,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub backlog_sync_delay_ms: u64,
    pub retry_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    tcp: Option<RawTcpConfig>,
    cloud: Option<RawCloudConfig>,
    heartbeat: Option<RawHeartbeatConfig>,
    activity: Option<RawActivityConfig>,
    session_cache: Option<RawSessionCacheConfig>,
    offline: Option<RawOfflineConfig>,
    sync: Option<RawSyncConfig>,
    storage: Option<RawStorageConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTcpConfig {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCloudConfig {
    api_url: Option<String>,
    event_send_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    max_retry_delay_ms: Option<u64>,
    queue_when_offline: Option<bool>,
    max_queue_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHeartbeatConfig {
    timeout_ms: Option<u64>,
    check_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawActivityConfig {
    idle_threshold_ms: Option<u64>,
    stale_threshold_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSessionCacheConfig {
    poll_interval_ms: Option<u64>,
    expiry_ms: Option<u64>,
    cleanup_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawOfflineConfig {
    trigger_delay_ms: Option<u64>,
    max_events_per_batch: Option<u64>,
    retention_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSyncConfig {
    batch_size: Option<usize>,
    backlog_sync_delay_ms: Option<u64>,
    retry_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStorageConfig {
    sqlite_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the default path, tolerating its absence, then apply
/// environment overrides.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/carnitrack/gateway.toml"))
}

/// Load config from a custom path (absent file → all defaults), then apply
/// environment overrides.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let raw = if path.exists() {
        let toml_str = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Io(format!("reading config file '{}': {}", path.display(), e))
        })?;
        toml::from_str(&toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?
    } else {
        RawConfig::default()
    };
    let mut cfg = resolve(raw)?;
    apply_env_overrides(&mut cfg, |name| std::env::var(name).ok())?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Load config from a TOML string without env overrides.  Test seam.
pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let cfg = resolve(raw)?;
    validate(&cfg)?;
    Ok(cfg)
}

// ---------------------------------------------------------------------------
// Resolution: Raw → concrete with defaults
// ---------------------------------------------------------------------------

fn resolve(raw: RawConfig) -> Result<GatewayConfig, ConfigError> {
    let tcp_raw = raw.tcp.unwrap_or_default();
    let cloud_raw = raw.cloud.unwrap_or_default();
    let hb_raw = raw.heartbeat.unwrap_or_default();
    let act_raw = raw.activity.unwrap_or_default();
    let sess_raw = raw.session_cache.unwrap_or_default();
    let off_raw = raw.offline.unwrap_or_default();
    let sync_raw = raw.sync.unwrap_or_default();
    let storage_raw = raw.storage.unwrap_or_default();

    Ok(GatewayConfig {
        tcp: TcpConfig {
            host: tcp_raw.host.unwrap_or_else(|| "0.0.0.0".to_owned()),
            port: tcp_raw.port.unwrap_or(8899),
        },
        cloud: CloudConfig {
            // Empty means "not configured"; validate() rejects it after env
            // overrides have had their chance to supply CLOUD_API_URL.
            api_url: cloud_raw.api_url.unwrap_or_default(),
            event_send_timeout_ms: cloud_raw.event_send_timeout_ms.unwrap_or(10_000),
            max_retries: cloud_raw.max_retries.unwrap_or(3),
            retry_delay_ms: cloud_raw.retry_delay_ms.unwrap_or(1_000),
            backoff_multiplier: cloud_raw.backoff_multiplier.unwrap_or(2.0),
            max_retry_delay_ms: cloud_raw.max_retry_delay_ms.unwrap_or(30_000),
            queue_when_offline: cloud_raw.queue_when_offline.unwrap_or(true),
            max_queue_size: cloud_raw.max_queue_size.unwrap_or(100),
        },
        heartbeat: HeartbeatConfig {
            timeout_ms: hb_raw.timeout_ms.unwrap_or(60_000),
            check_interval_ms: hb_raw.check_interval_ms.unwrap_or(10_000),
        },
        activity: ActivityConfig {
            idle_threshold_ms: act_raw.idle_threshold_ms.unwrap_or(5 * 60 * 1000),
            stale_threshold_ms: act_raw.stale_threshold_ms.unwrap_or(30 * 60 * 1000),
        },
        session_cache: SessionCacheConfig {
            poll_interval_ms: sess_raw.poll_interval_ms.unwrap_or(5_000),
            expiry_ms: sess_raw.expiry_ms.unwrap_or(4 * 60 * 60 * 1000),
            cleanup_interval_ms: sess_raw.cleanup_interval_ms.unwrap_or(60_000),
        },
        offline: OfflineConfig {
            trigger_delay_ms: off_raw.trigger_delay_ms.unwrap_or(5_000),
            max_events_per_batch: off_raw.max_events_per_batch.unwrap_or(1_000),
            retention_days: off_raw.retention_days.unwrap_or(30),
        },
        sync: SyncConfig {
            batch_size: sync_raw.batch_size.unwrap_or(50),
            backlog_sync_delay_ms: sync_raw.backlog_sync_delay_ms.unwrap_or(2_000),
            retry_interval_ms: sync_raw.retry_interval_ms.unwrap_or(30_000),
        },
        storage: StorageConfig {
            sqlite_path: storage_raw
                .sqlite_path
                .unwrap_or_else(|| "/var/lib/carnitrack/gateway.sqlite3".to_owned()),
        },
    })
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

/// Apply the recognized environment overrides.  `lookup` is injected so
/// tests don't mutate the process environment.
pub fn apply_env_overrides(
    cfg: &mut GatewayConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
        value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={value}")))
    }

    if let Some(v) = lookup("TCP_HOST") {
        cfg.tcp.host = v;
    }
    if let Some(v) = lookup("TCP_PORT") {
        cfg.tcp.port = parse_env("TCP_PORT", &v)?;
    }
    if let Some(v) = lookup("CLOUD_API_URL") {
        cfg.cloud.api_url = v;
    }
    if let Some(v) = lookup("EVENT_SEND_TIMEOUT_MS") {
        cfg.cloud.event_send_timeout_ms = parse_env("EVENT_SEND_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = lookup("REST_MAX_RETRIES") {
        cfg.cloud.max_retries = parse_env("REST_MAX_RETRIES", &v)?;
    }
    if let Some(v) = lookup("REST_RETRY_DELAY_MS") {
        cfg.cloud.retry_delay_ms = parse_env("REST_RETRY_DELAY_MS", &v)?;
    }
    if let Some(v) = lookup("REST_BACKOFF_MULTIPLIER") {
        cfg.cloud.backoff_multiplier = parse_env("REST_BACKOFF_MULTIPLIER", &v)?;
    }
    if let Some(v) = lookup("REST_MAX_RETRY_DELAY_MS") {
        cfg.cloud.max_retry_delay_ms = parse_env("REST_MAX_RETRY_DELAY_MS", &v)?;
    }
    if let Some(v) = lookup("HEARTBEAT_TIMEOUT_MS") {
        cfg.heartbeat.timeout_ms = parse_env("HEARTBEAT_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = lookup("ACTIVITY_IDLE_MS") {
        cfg.activity.idle_threshold_ms = parse_env("ACTIVITY_IDLE_MS", &v)?;
    }
    if let Some(v) = lookup("ACTIVITY_STALE_MS") {
        cfg.activity.stale_threshold_ms = parse_env("ACTIVITY_STALE_MS", &v)?;
    }
    if let Some(v) = lookup("SESSION_POLL_INTERVAL_MS") {
        cfg.session_cache.poll_interval_ms = parse_env("SESSION_POLL_INTERVAL_MS", &v)?;
    }
    if let Some(v) = lookup("SESSION_CACHE_EXPIRY_MS") {
        cfg.session_cache.expiry_ms = parse_env("SESSION_CACHE_EXPIRY_MS", &v)?;
    }
    if let Some(v) = lookup("OFFLINE_TRIGGER_DELAY_MS") {
        cfg.offline.trigger_delay_ms = parse_env("OFFLINE_TRIGGER_DELAY_MS", &v)?;
    }
    if let Some(v) = lookup("OFFLINE_MAX_EVENTS_PER_BATCH") {
        cfg.offline.max_events_per_batch = parse_env("OFFLINE_MAX_EVENTS_PER_BATCH", &v)?;
    }
    if let Some(v) = lookup("OFFLINE_BATCH_RETENTION_DAYS") {
        cfg.offline.retention_days = parse_env("OFFLINE_BATCH_RETENTION_DAYS", &v)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(cfg: &GatewayConfig) -> Result<(), ConfigError> {
    if cfg.cloud.api_url.trim().is_empty() {
        return Err(ConfigError::MissingField(
            "cloud.api_url (or CLOUD_API_URL)".to_owned(),
        ));
    }
    if cfg.cloud.backoff_multiplier < 1.0 {
        return Err(ConfigError::InvalidValue(format!(
            "cloud.backoff_multiplier must be >= 1.0, got {}",
            cfg.cloud.backoff_multiplier
        )));
    }
    if cfg.offline.max_events_per_batch == 0 {
        return Err(ConfigError::InvalidValue(
            "offline.max_events_per_batch must be > 0".to_owned(),
        ));
    }
    if cfg.sync.batch_size == 0 {
        return Err(ConfigError::InvalidValue(
            "sync.batch_size must be > 0".to_owned(),
        ));
    }
    Ok(())
}
