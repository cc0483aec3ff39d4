//! Configuration module for recon-rs
//!
//! A reconstruction run is described by one TOML file:
//!
//! ```toml
//! [pipeline]
//! queue_capacity = 1000
//! clamp_policy = "reject"
//!
//! [logging]
//! filter = "info,recon_rs=debug"
//!
//! [[stages]]
//! kind = "accumulator"
//! [stages.options]
//! profiles_per_frame = 16
//! frames_per_reconstruction = 1
//! matrix_size = 16
//!
//! [[stages]]
//! kind = "cg_sense"
//! [stages.options]
//! iterations = 10
//! tolerance = 1e-6
//! ```
//!
//! # Config Location
//!
//! When no path is given the file is looked up in the platform config dir:
//! - **Linux**: `~/.config/recon-rs/recon.toml`
//! - **macOS**: `~/Library/Application Support/recon-rs/recon.toml`
//! - **Windows**: `%APPDATA%\recon-rs\recon.toml`

pub mod options;

pub use options::{ConfigValue, StageOptions};

use crate::error::{ReconError, Result, ResultExt};
use crate::pipeline::StageKind;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};

/// Directory name under the platform config dir
pub const APP_DIR: &str = "recon-rs";

/// Config filename
pub const CONFIG_FILE: &str = "recon.toml";

/// Default bounded queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Default tracing filter when neither `RUST_LOG` nor the config sets one
pub const DEFAULT_LOG_FILTER: &str = "info,recon_rs=debug";

/// Get the default config file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_DIR).join(CONFIG_FILE))
}

// ==================== Clamp Policy ====================

/// How out-of-range numeric options are handled.
///
/// `Reject` turns them into configuration errors. `Clamp` silently pulls them
/// back into range (logging a warning), which is what acquisition front-ends
/// that send slightly inconsistent headers usually need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClampPolicy {
    #[default]
    Reject,
    Clamp,
}

impl ClampPolicy {
    /// Check `value >= min`.
    pub fn at_least<T>(self, name: &str, value: T, min: T) -> Result<T>
    where
        T: PartialOrd + Copy + Display,
    {
        if value >= min {
            return Ok(value);
        }
        match self {
            ClampPolicy::Reject => Err(ReconError::config(format!(
                "option '{}' = {} is below the minimum {}",
                name, value, min
            ))),
            ClampPolicy::Clamp => {
                tracing::warn!("Clamping option '{}' from {} to {}", name, value, min);
                Ok(min)
            }
        }
    }

    /// Check `min <= value <= max`.
    pub fn within<T>(self, name: &str, value: T, min: T, max: T) -> Result<T>
    where
        T: PartialOrd + Copy + Display,
    {
        if value >= min && value <= max {
            return Ok(value);
        }
        match self {
            ClampPolicy::Reject => Err(ReconError::config(format!(
                "option '{}' = {} is outside [{}, {}]",
                name, value, min, max
            ))),
            ClampPolicy::Clamp => {
                let clamped = if value < min { min } else { max };
                tracing::warn!("Clamping option '{}' from {} to {}", name, value, clamped);
                Ok(clamped)
            }
        }
    }
}

// ==================== Settings ====================

/// Pipeline runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Capacity of every inter-stage queue
    pub queue_capacity: usize,

    /// Handling of out-of-range options
    pub clamp_policy: ClampPolicy,

    /// Number of compute devices; defaults to the available parallelism
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_count: Option<usize>,

    /// Allow several stages to bind the same device
    pub shared_devices: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            clamp_policy: ClampPolicy::Reject,
            device_count: None,
            shared_devices: false,
        }
    }
}

impl PipelineSettings {
    /// Resolved device count
    pub fn devices(&self) -> usize {
        self.device_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Directory for daily-rolling log files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// One stage in the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub kind: StageKind,

    /// Display name; defaults to the kind's name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub options: StageOptions,
}

impl StageConfig {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            name: None,
            options: StageOptions::new(),
        }
    }

    pub fn with_options(mut self, options: StageOptions) -> Self {
        self.options = options;
        self
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.kind.config_key().to_string())
    }
}

// ==================== Recon Config ====================

/// Complete reconstruction configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconConfig {
    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl Default for ReconConfig {
    /// Noise prewhitening, accumulation of one 16x16 frame and CG-SENSE.
    fn default() -> Self {
        Self {
            pipeline: PipelineSettings::default(),
            logging: LoggingSettings::default(),
            stages: vec![
                StageConfig::new(StageKind::NoiseAdjust),
                StageConfig::new(StageKind::Accumulator).with_options(
                    StageOptions::new()
                        .with("profiles_per_frame", 16)
                        .with("frames_per_reconstruction", 1)
                        .with("matrix_size", 16),
                ),
                StageConfig::new(StageKind::CgSense).with_options(
                    StageOptions::new()
                        .with("iterations", 10)
                        .with("tolerance", 1e-6),
                ),
            ],
        }
    }
}

impl ReconConfig {
    /// Parse a config from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(ReconError::from)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load from `path`, or the default location, falling back to defaults on any error
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
            Some(p) => p,
            None => return Self::default(),
        };

        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Self::default();
        }

        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config, creating parent directories as needed
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check settings that do not depend on a particular stage
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.queue_capacity == 0 {
            return Err(ReconError::config("pipeline.queue_capacity must be positive"));
        }
        if self.pipeline.device_count == Some(0) {
            tracing::warn!("pipeline.device_count is 0; stages that bind a device will fail");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trip() {
        let config = ReconConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = ReconConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = ReconConfig::from_toml(
            r#"
            [[stages]]
            kind = "gp_sense"
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.pipeline.clamp_policy, ClampPolicy::Reject);
        assert_eq!(config.stages.len(), 1);
        assert_eq!(config.stages[0].kind, StageKind::GpSense);
        assert!(config.stages[0].options.is_empty());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = ReconConfig::from_toml("[pipeline]\nqueue_capacity = 0\n").unwrap_err();
        assert!(matches!(err, ReconError::Configuration(_)));
    }

    #[test]
    fn test_clamp_policy() {
        assert_eq!(ClampPolicy::Reject.at_least("iterations", 5, 1).unwrap(), 5);
        assert!(ClampPolicy::Reject.at_least("iterations", 0, 1).is_err());
        assert_eq!(ClampPolicy::Clamp.at_least("iterations", 0, 1).unwrap(), 1);

        assert!(ClampPolicy::Reject
            .within("regularization_mix", 1.5, 0.0, 1.0)
            .is_err());
        assert_eq!(
            ClampPolicy::Clamp
                .within("regularization_mix", 1.5, 0.0, 1.0)
                .unwrap(),
            1.0
        );
        assert_eq!(
            ClampPolicy::Clamp
                .within("regularization_mix", -0.5, 0.0, 1.0)
                .unwrap(),
            0.0
        );
    }

    #[test]
    fn test_stage_display_name() {
        let stage = StageConfig::new(StageKind::Accumulator);
        assert_eq!(stage.display_name(), "accumulator");
        let named = StageConfig {
            name: Some("acc0".into()),
            ..stage
        };
        assert_eq!(named.display_name(), "acc0");
    }
}
