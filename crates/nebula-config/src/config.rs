//! Replication tuning structs with sensible defaults and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
pub const CONFIG_FILE_NAME: &str = "replication.ron";

/// Top-level replication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Authoritative (host) side settings.
    pub server: ServerConfig,
    /// Observing (client) side settings.
    pub client: ClientConfig,
    /// Client-side interpolation engine tuning.
    pub interpolation: InterpolationConfig,
    /// Snapshot transfer settings.
    pub snapshot: SnapshotConfig,
    /// Wire codec settings.
    pub network: NetworkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Server-side replication policy.
///
/// The distance bands and intervals were tuned for a specific map scale; they
/// only carry "near / mid / far" meaning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Pose interval for watchers inside `near_band` (seconds).
    pub base_pose_interval: f64,
    /// Pose interval for watchers between `near_band` and `mid_band` (seconds).
    pub mid_pose_interval: f64,
    /// Near band radius in meters.
    pub near_band: f32,
    /// Mid band radius in meters. Watchers beyond it get no pose updates.
    pub mid_band: f32,
    /// How often an unwatched actor records its pose locally (seconds).
    pub idle_record_interval: f64,
    /// Minimum movement before a pose update is worth sending (meters).
    pub min_position_delta: f32,
    /// Minimum rotation change before a pose update is worth sending (degrees).
    pub min_rotation_delta_deg: f32,
    /// A watched actor that has not moved still refreshes this often (seconds).
    pub pose_keepalive: f64,
    /// Minimum time between two health broadcasts for one actor (seconds).
    pub health_min_interval: f64,
    /// Model name used when the registry cannot name the actor's model.
    pub default_model: String,
    /// Scene paths in which no actor is ever registered (lobby, hub).
    pub blocked_scenes: Vec<String>,
}

/// Client-side activation and proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Within this radius the client asks to watch an actor (meters).
    pub activation_inner_radius: f32,
    /// Beyond this radius the client tears the proxy down (meters).
    pub activation_outer_radius: f32,
    /// Retry policy for activation requests.
    pub activation_retry: RetryConfig,
    /// Maximum updates cached for an actor whose proxy is not ready yet.
    pub pending_updates_per_actor: usize,
    /// Model used when the actor's own model cannot be resolved.
    pub fallback_model: String,
    /// Edge length of a coarse position cell (meters).
    pub position_cell_size: f32,
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry (seconds).
    pub initial_delay: f64,
    /// Multiplier applied after each attempt.
    pub multiplier: f64,
    /// Upper bound on the delay (seconds).
    pub max_delay: f64,
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Jitter factor (0.0 - 1.0) applied as +/- to each delay.
    pub jitter: f64,
}

/// Network interpolation engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterpolationConfig {
    /// Nominal interval between pose samples from the server (seconds).
    pub send_interval: f64,
    /// Lower bound on render delay (seconds).
    pub min_delay: f64,
    /// Upper bound on render delay (seconds).
    pub max_delay: f64,
    /// Extra delay as a fraction of `send_interval`.
    pub safety_margin: f64,
    /// Number of inter-arrival samples kept by the jitter estimator.
    pub jitter_window: usize,
    /// EMA smoothing factor for jitter mean/variance.
    pub jitter_alpha: f64,
    /// EMA smoothing factor for drift.
    pub drift_alpha: f64,
    /// Drift above this (seconds) speeds the timeline up.
    pub catch_up_threshold: f64,
    /// Drift below minus this (seconds) slows the timeline down.
    pub slow_down_threshold: f64,
    /// Timeline speed while catching up.
    pub catch_up_rate: f64,
    /// Timeline speed while slowing down.
    pub slow_down_rate: f64,
    /// Displacement between samples treated as a teleport (meters).
    pub teleport_distance: f32,
    /// A sample further ahead of the timeline than `max_delay` plus this
    /// (seconds) re-seeds it.
    pub resync_gap: f64,
    /// Longest extrapolation past the newest sample (seconds).
    pub max_extrapolation: f64,
    /// Speed above which extrapolation is disabled (m/s).
    pub running_speed: f32,
    /// Hard cap on buffered samples.
    pub buffer_capacity: usize,
    /// Buffers at or below this size are searched linearly.
    pub linear_scan_limit: usize,
}

/// Snapshot transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Entries per snapshot chunk.
    pub chunk_capacity: usize,
    /// Maximum entries queued on the client before the oldest are dropped.
    pub pending_capacity: usize,
    /// Entries applied per client frame.
    pub drain_per_frame: usize,
    /// Wall-time budget for one client drain (milliseconds).
    pub drain_time_budget_ms: u64,
    /// Client full-refresh request interval (seconds).
    pub client_refresh_interval: f64,
    /// Server periodic broadcast interval (seconds).
    pub server_broadcast_interval: f64,
    /// Shortened server interval when the last broadcast found no peers.
    pub server_retry_interval: f64,
}

/// Wire codec configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Encoded messages at or above this size are lz4-compressed (bytes).
    pub compression_threshold: usize,
    /// Whether compression is applied at all.
    pub compression_enabled: bool,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_pose_interval: 0.1,
            mid_pose_interval: 0.25,
            near_band: 55.0,
            mid_band: 65.0,
            idle_record_interval: 1.0,
            min_position_delta: 0.05,
            min_rotation_delta_deg: 1.0,
            pose_keepalive: 2.0,
            health_min_interval: 0.2,
            default_model: "default".to_string(),
            blocked_scenes: vec!["Lobby".to_string()],
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            activation_inner_radius: 80.0,
            activation_outer_radius: 100.0,
            activation_retry: RetryConfig::default(),
            pending_updates_per_actor: 8,
            fallback_model: "player".to_string(),
            position_cell_size: 16.0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: 0.5,
            multiplier: 2.0,
            max_delay: 4.0,
            max_attempts: 6,
            jitter: 0.0,
        }
    }
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            send_interval: 0.1,
            min_delay: 0.05,
            max_delay: 0.5,
            safety_margin: 0.2,
            jitter_window: 20,
            jitter_alpha: 0.1,
            drift_alpha: 0.1,
            catch_up_threshold: 0.05,
            slow_down_threshold: 0.05,
            catch_up_rate: 1.05,
            slow_down_rate: 0.95,
            teleport_distance: 10.0,
            resync_gap: 1.0,
            max_extrapolation: 0.25,
            running_speed: 4.0,
            buffer_capacity: 64,
            linear_scan_limit: 8,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: 32,
            pending_capacity: 512,
            drain_per_frame: 16,
            drain_time_budget_ms: 2,
            client_refresh_interval: 30.0,
            server_broadcast_interval: 60.0,
            server_retry_interval: 5.0,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 256,
            compression_enabled: true,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `replication.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        new_config.validate()?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Checks cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.near_band > self.server.mid_band {
            return Err(ConfigError::Invalid(format!(
                "server.near_band ({}) must not exceed server.mid_band ({})",
                self.server.near_band, self.server.mid_band
            )));
        }
        if self.client.activation_inner_radius >= self.client.activation_outer_radius {
            return Err(ConfigError::Invalid(format!(
                "client.activation_inner_radius ({}) must be below activation_outer_radius ({})",
                self.client.activation_inner_radius, self.client.activation_outer_radius
            )));
        }
        if self.interpolation.min_delay > self.interpolation.max_delay {
            return Err(ConfigError::Invalid(format!(
                "interpolation.min_delay ({}) must not exceed max_delay ({})",
                self.interpolation.min_delay, self.interpolation.max_delay
            )));
        }
        if self.snapshot.chunk_capacity == 0 || self.interpolation.buffer_capacity < 2 {
            return Err(ConfigError::Invalid(
                "snapshot.chunk_capacity must be positive and interpolation.buffer_capacity at least 2"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("near_band: 55.0"));
        assert!(ron_str.contains("activation_outer_radius: 100.0"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(server: (near_band: 30.0, mid_band: 40.0))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.server.near_band, 30.0);
        assert_eq!(config.server.base_pose_interval, 0.1);
        assert_eq!(config.interpolation, InterpolationConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_activation_radii_rejected() {
        let mut config = Config::default();
        config.client.activation_inner_radius = 120.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_inverted_bands_rejected() {
        let mut config = Config::default();
        config.server.near_band = 70.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.near_band = 40.0;
        config.snapshot.chunk_capacity = 8;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.interpolation.max_delay = 0.8;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().interpolation.max_delay, 0.8);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let result: Result<Config, _> = ron::from_str("{{not valid}}");
        assert!(result.is_err());
    }
}
