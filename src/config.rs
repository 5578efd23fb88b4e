//! Application configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/basler-daq.toml` by default)
//! 2. environment variables prefixed with `BASLER_DAQ_`, nested keys
//!    separated by a double underscore
//!
//! # Example
//! ```no_run
//! use basler_daq::config::AppConfig;
//!
//! // BASLER_DAQ_CAMERA__IP=192.168.0.42 overrides [camera] ip
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Camera: {}", config.camera.ip);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use daq_driver_basler::AcquisitionSettings;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/basler-daq.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "BASLER_DAQ_";

/// Top-level application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Camera to open
    pub camera: CameraConfig,
    /// Acquisition controller settings
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
    /// Frame ring receiving completed frames
    #[serde(default)]
    pub frame_ring: FrameRingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
}

/// Camera connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// IPv4 address or DNS name of the GigE camera
    pub ip: String,
}

/// Frame ring sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRingConfig {
    /// Number of frame slots
    #[serde(default = "default_nb_buffers")]
    pub nb_buffers: usize,
    /// Capacity of one slot in bytes; must hold a full frame
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_nb_buffers() -> usize {
    8
}

fn default_max_frame_bytes() -> usize {
    // Full 1392x1040 Mono16 frame, rounded up to 4 MiB
    4 * 1024 * 1024
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl Default for FrameRingConfig {
    fn default() -> Self {
        Self {
            nb_buffers: default_nb_buffers(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; every key then has to come from the
    /// environment or its default.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_ascii_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.camera.ip.trim().is_empty() {
            return Err("camera.ip must not be empty".to_string());
        }

        self.acquisition
            .validate()
            .map_err(|e| format!("Invalid acquisition settings: {}", e))?;

        if self.frame_ring.nb_buffers == 0 {
            return Err("frame_ring.nb_buffers must be at least 1".to_string());
        }
        if self.frame_ring.max_frame_bytes == 0 {
            return Err("frame_ring.max_frame_bytes must be at least 1".to_string());
        }

        Ok(())
    }
}
