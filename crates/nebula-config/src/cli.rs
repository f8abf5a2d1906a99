//! Command-line overrides for replication tuning.

use std::path::PathBuf;

use clap::Args;

use crate::Config;

/// Directory name used under the platform config directory.
const APP_DIR_NAME: &str = "nebula-replication";

/// Replication command-line arguments.
///
/// CLI values override settings loaded from `replication.ron`. Binaries
/// embed this with `#[command(flatten)]`.
#[derive(Args, Debug, Clone, Default)]
pub struct CliArgs {
    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Near pose band in meters.
    #[arg(long)]
    pub near_band: Option<f32>,

    /// Mid pose band in meters.
    #[arg(long)]
    pub mid_band: Option<f32>,

    /// Client activation radius in meters.
    #[arg(long)]
    pub inner_radius: Option<f32>,

    /// Client proxy teardown radius in meters.
    #[arg(long)]
    pub outer_radius: Option<f32>,

    /// Nominal server pose send interval in seconds.
    #[arg(long)]
    pub send_interval: Option<f64>,
}

impl CliArgs {
    /// The config directory to use: `--config` if given, otherwise the
    /// platform config directory. `None` when neither can be determined.
    pub fn config_dir(&self) -> Option<PathBuf> {
        self.config
            .clone()
            .or_else(|| dirs::config_dir().map(|base| base.join(APP_DIR_NAME)))
    }
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        if let Some(near) = args.near_band {
            self.server.near_band = near;
        }
        if let Some(mid) = args.mid_band {
            self.server.mid_band = mid;
        }
        if let Some(inner) = args.inner_radius {
            self.client.activation_inner_radius = inner;
        }
        if let Some(outer) = args.outer_radius {
            self.client.activation_outer_radius = outer;
        }
        if let Some(interval) = args.send_interval {
            self.server.base_pose_interval = interval;
            self.interpolation.send_interval = interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            near_band: Some(30.0),
            send_interval: Some(0.05),
            log_level: Some("debug".to_string()),
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.server.near_band, 30.0);
        assert_eq!(config.server.base_pose_interval, 0.05);
        assert_eq!(config.interpolation.send_interval, 0.05);
        assert_eq!(config.debug.log_level, "debug");
        // Non-overridden fields retain defaults
        assert_eq!(config.server.mid_band, 65.0);
        assert_eq!(config.client.activation_outer_radius, 100.0);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_explicit_config_dir_wins() {
        let args = CliArgs {
            config: Some(PathBuf::from("/tmp/replication-test")),
            ..CliArgs::default()
        };
        assert_eq!(
            args.config_dir(),
            Some(PathBuf::from("/tmp/replication-test"))
        );
    }
}
