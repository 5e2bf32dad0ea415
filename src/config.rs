//! Layered configuration.
//!
//! Sources, lowest priority first:
//! 1. compiled-in defaults (Binance USD-M futures endpoints)
//! 2. an optional TOML file
//! 3. environment overrides with prefix `DEPTHSYNC_` and `__` nesting,
//!    e.g. `DEPTHSYNC_CONNECTION__MAX_RECONNECT_ATTEMPTS=3`

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_base_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_max_jitter_ms() -> u64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_max_missed_heartbeats() -> u32 {
    3
}

fn default_event_buffer() -> usize {
    4_096
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_snapshot_timeout_ms() -> u64 {
    10_000
}

fn default_snapshot_limit() -> u32 {
    1_000
}

fn default_snapshot_retry_delay_ms() -> u64 {
    2_000
}

fn default_max_resync_attempts() -> u32 {
    5
}

fn default_max_buffered_diffs() -> usize {
    10_000
}

fn default_visible_depth() -> usize {
    20
}

fn default_wall_share_threshold() -> f64 {
    0.05
}

fn default_render_interval_ms() -> u64 {
    500
}

fn default_ws_url() -> String {
    "wss://fstream.binance.com/ws".to_string()
}

fn default_rest_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_depth_path() -> String {
    "/fapi/v1/depth".to_string()
}

fn default_stream_suffix() -> String {
    "@depth@100ms".to_string()
}

fn default_price_decimals() -> u32 {
    8
}

fn default_size_decimals() -> u32 {
    8
}

/// Top-level configuration for a depth feed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub book: BookConfig,
    #[serde(default)]
    pub view: ViewConfig,
    #[serde(default)]
    pub venue: VenueConfig,
}

/// Reconnect, heartbeat and transport limits for a [`ConnectionManager`](crate::net::ConnectionManager).
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Reconnect attempts after a drop before the manager parks in `Error`.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_base_reconnect_delay_ms")]
    pub base_reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
    /// Upper bound of the uniform jitter added to each backoff delay.
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How long a ping may stay unanswered before it counts as missed.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
    /// Capacity of the connection event broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl ConnectionConfig {
    pub fn base_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.base_reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            base_reconnect_delay_ms: default_base_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Circuit breaker guarding the snapshot fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_circuit_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_circuit_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_circuit_failure_threshold(),
            recovery_timeout_ms: default_circuit_recovery_timeout_ms(),
        }
    }
}

/// Bootstrap and resync limits for the book synchronizer.
#[derive(Debug, Clone, Deserialize)]
pub struct BookConfig {
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
    /// Depth requested from the snapshot endpoint.
    #[serde(default = "default_snapshot_limit")]
    pub snapshot_limit: u32,
    #[serde(default = "default_snapshot_retry_delay_ms")]
    pub snapshot_retry_delay_ms: u64,
    /// Consecutive resyncs without reaching a live book before giving up.
    #[serde(default = "default_max_resync_attempts")]
    pub max_resync_attempts: u32,
    #[serde(default = "default_max_buffered_diffs")]
    pub max_buffered_diffs: usize,
}

impl BookConfig {
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn snapshot_retry_delay(&self) -> Duration {
        Duration::from_millis(self.snapshot_retry_delay_ms)
    }
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
            snapshot_limit: default_snapshot_limit(),
            snapshot_retry_delay_ms: default_snapshot_retry_delay_ms(),
            max_resync_attempts: default_max_resync_attempts(),
            max_buffered_diffs: default_max_buffered_diffs(),
        }
    }
}

/// Consumer-facing view settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewConfig {
    #[serde(default = "default_visible_depth")]
    pub visible_depth: usize,
    /// Fraction of visible side size above which a bucket is a wall.
    #[serde(default = "default_wall_share_threshold")]
    pub wall_share_threshold: f64,
    #[serde(default = "default_render_interval_ms")]
    pub render_interval_ms: u64,
}

impl ViewConfig {
    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms)
    }

    /// Wall threshold in basis points of visible side size.
    pub fn wall_threshold_bps(&self) -> u64 {
        (self.wall_share_threshold * 10_000.0).round() as u64
    }
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            visible_depth: default_visible_depth(),
            wall_share_threshold: default_wall_share_threshold(),
            render_interval_ms: default_render_interval_ms(),
        }
    }
}

/// Endpoints and number scales of the upstream venue.
#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_depth_path")]
    pub depth_path: String,
    /// Appended to the lowercase symbol to form the stream name.
    #[serde(default = "default_stream_suffix")]
    pub stream_suffix: String,
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,
    #[serde(default = "default_size_decimals")]
    pub size_decimals: u32,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            depth_path: default_depth_path(),
            stream_suffix: default_stream_suffix(),
            price_decimals: default_price_decimals(),
            size_decimals: default_size_decimals(),
        }
    }
}

impl SyncConfig {
    /// Load defaults, then `config_path` (if any), then `DEPTHSYNC_*` env overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            let path_str = path.to_str().context("config path is not valid UTF-8")?;
            builder = builder.add_source(File::with_name(path_str).required(true));
        }

        // `config` defaults the prefix separator to the nesting separator,
        // so it has to be set back to a single underscore.
        builder = builder.add_source(
            Environment::with_prefix("DEPTHSYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: SyncConfig = builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document on top of the compiled-in defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let cfg: SyncConfig = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.view.visible_depth == 0 {
            bail!("view.visible_depth must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.view.wall_share_threshold) {
            bail!(
                "view.wall_share_threshold must be within [0, 1], got {}",
                self.view.wall_share_threshold
            );
        }
        if self.connection.base_reconnect_delay_ms > self.connection.max_reconnect_delay_ms {
            bail!("connection.base_reconnect_delay_ms exceeds max_reconnect_delay_ms");
        }
        for (key, value) in [
            ("connection.connect_timeout_ms", self.connection.connect_timeout_ms),
            ("connection.heartbeat_interval_ms", self.connection.heartbeat_interval_ms),
            ("book.snapshot_timeout_ms", self.book.snapshot_timeout_ms),
            ("view.render_interval_ms", self.view.render_interval_ms),
        ] {
            if value == 0 {
                bail!("{key} must be greater than zero");
            }
        }
        if self.connection.max_missed_heartbeats == 0 {
            bail!("connection.max_missed_heartbeats must be at least 1");
        }
        if self.breaker.failure_threshold == 0 {
            bail!("breaker.failure_threshold must be at least 1");
        }
        if self.venue.price_decimals > 12 || self.venue.size_decimals > 12 {
            bail!("venue decimals above 12 overflow the fixed-point representation");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serializes tests that touch process environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn test_defaults() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.connection.max_reconnect_attempts, 10);
        assert_eq!(cfg.connection.base_reconnect_delay(), Duration::from_secs(1));
        assert_eq!(cfg.connection.max_missed_heartbeats, 3);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.view.visible_depth, 20);
        assert_eq!(cfg.view.render_interval(), Duration::from_millis(500));
        assert_eq!(cfg.view.wall_threshold_bps(), 500);
        assert_eq!(cfg.venue.depth_path, "/fapi/v1/depth");
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let _lock = lock_env();
        let cfg = SyncConfig::load(None).expect("load defaults");
        assert_eq!(cfg.connection.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.book.max_resync_attempts, 5);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let cfg = SyncConfig::from_toml_str(
            r#"
[connection]
max_reconnect_attempts = 3
heartbeat_interval_ms = 5000

[view]
visible_depth = 10
wall_share_threshold = 0.1

[venue]
ws_url = "wss://stream.binance.com:9443/ws"
price_decimals = 2
"#,
        )
        .expect("parse toml");

        assert_eq!(cfg.connection.max_reconnect_attempts, 3);
        assert_eq!(cfg.connection.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(cfg.connection.max_reconnect_delay_ms, 30_000);
        assert_eq!(cfg.view.visible_depth, 10);
        assert_eq!(cfg.view.wall_threshold_bps(), 1_000);
        assert_eq!(cfg.venue.ws_url, "wss://stream.binance.com:9443/ws");
        assert_eq!(cfg.venue.price_decimals, 2);
        assert_eq!(cfg.venue.size_decimals, 8);
    }

    #[test]
    fn test_env_override() {
        let _lock = lock_env();
        std::env::set_var("DEPTHSYNC_CONNECTION__MAX_RECONNECT_ATTEMPTS", "2");
        let cfg = SyncConfig::load(None);
        std::env::remove_var("DEPTHSYNC_CONNECTION__MAX_RECONNECT_ATTEMPTS");

        assert_eq!(cfg.expect("load with env").connection.max_reconnect_attempts, 2);
    }

    #[test]
    fn test_rejects_invalid_threshold() {
        let err = SyncConfig::from_toml_str("[view]\nwall_share_threshold = 1.5\n").unwrap_err();
        assert!(format!("{err:#}").contains("wall_share_threshold"));
    }

    #[test]
    fn test_rejects_zero_depth() {
        assert!(SyncConfig::from_toml_str("[view]\nvisible_depth = 0\n").is_err());
    }

    fn rejected(toml: &str) -> String {
        format!("{:#}", SyncConfig::from_toml_str(toml).unwrap_err())
    }

    #[test]
    fn test_rejects_zero_heartbeat_interval() {
        let err = rejected("[connection]\nheartbeat_interval_ms = 0\n");
        assert!(err.contains("connection.heartbeat_interval_ms"), "{err}");
    }

    #[test]
    fn test_rejects_zero_connect_timeout() {
        let err = rejected("[connection]\nconnect_timeout_ms = 0\n");
        assert!(err.contains("connection.connect_timeout_ms"), "{err}");
    }

    #[test]
    fn test_rejects_zero_snapshot_timeout() {
        let err = rejected("[book]\nsnapshot_timeout_ms = 0\n");
        assert!(err.contains("book.snapshot_timeout_ms"), "{err}");
    }

    #[test]
    fn test_rejects_zero_render_interval() {
        let err = rejected("[view]\nrender_interval_ms = 0\n");
        assert!(err.contains("view.render_interval_ms"), "{err}");
    }
}
