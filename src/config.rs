//! Capture configuration
//!
//! Configuration is loaded from TOML, JSON or YAML depending on the file
//! extension and validated before it is applied.

use crate::filter::FrameFilter;
use crate::{PktCaptureError, Result};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Capture pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Number of preallocated wrappers
    pub pool_capacity: usize,
    /// Maximum frames waiting for the worker
    pub queue_capacity: usize,
    /// Wrapper buffer size; bounds radiotap header plus frame
    pub buffer_size: usize,
    /// Noise floor used when the firmware reports none (dBm)
    pub noise_floor_dbm: i8,
    /// Re-encapsulate Ethernet data frames as 802.11 when a BSSID is known
    pub convert_ethernet: bool,
    /// Suspend and unregister acknowledgement timeout
    pub suspend_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Worker thread name prefix
    pub worker_name: String,
    /// Filter installed when an interface is attached
    pub default_filter: FrameFilter,
    pub logging: LoggingConfig,
}

/// Smallest wrapper buffer: radiotap header and a full Ethernet frame
const MIN_BUFFER_SIZE: usize = 2048;

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

/// Configuration validation result
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            pool_capacity: crate::DEFAULT_POOL_CAPACITY,
            queue_capacity: crate::DEFAULT_QUEUE_CAPACITY,
            buffer_size: crate::DEFAULT_BUFFER_SIZE,
            noise_floor_dbm: crate::DEFAULT_NOISE_FLOOR_DBM,
            convert_ethernet: true,
            suspend_timeout_ms: crate::DEFAULT_SUSPEND_TIMEOUT_MS,
            shutdown_timeout_ms: crate::DEFAULT_SHUTDOWN_TIMEOUT_MS,
            worker_name: crate::DEFAULT_WORKER_NAME.to_string(),
            default_filter: FrameFilter::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Configuration change watcher
pub trait ConfigWatcher: Send + Sync {
    fn on_config_changed(&self, old_config: &CaptureConfig, new_config: &CaptureConfig);

    fn name(&self) -> &str;
}

impl<T: ConfigWatcher + ?Sized> ConfigWatcher for std::sync::Arc<T> {
    fn on_config_changed(&self, old_config: &CaptureConfig, new_config: &CaptureConfig) {
        (**self).on_config_changed(old_config, new_config)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Configuration manager
pub struct ConfigManager {
    config: CaptureConfig,
    config_path: Option<PathBuf>,
    watchers: Vec<Box<dyn ConfigWatcher>>,
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("config", &self.config)
            .field("config_path", &self.config_path)
            .field("watchers", &format!("[{} watchers]", self.watchers.len()))
            .finish()
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum Format {
    Json,
    Toml,
    Yaml,
}

impl Format {
    fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|s| s.to_str()) {
            Some("json") => Ok(Format::Json),
            Some("toml") => Ok(Format::Toml),
            Some("yaml") | Some("yml") => Ok(Format::Yaml),
            _ => Err(PktCaptureError::Config(format!(
                "Unsupported config file format: {}",
                path.display()
            ))),
        }
    }

    fn parse(self, content: &str) -> Result<CaptureConfig> {
        match self {
            Format::Json => serde_json::from_str(content)
                .map_err(|e| PktCaptureError::Config(format!("Failed to parse JSON config: {}", e))),
            Format::Toml => toml::from_str(content)
                .map_err(|e| PktCaptureError::Config(format!("Failed to parse TOML config: {}", e))),
            Format::Yaml => serde_yaml::from_str(content)
                .map_err(|e| PktCaptureError::Config(format!("Failed to parse YAML config: {}", e))),
        }
    }

    fn render(self, config: &CaptureConfig) -> Result<String> {
        match self {
            Format::Json => serde_json::to_string_pretty(config)
                .map_err(|e| PktCaptureError::Config(format!("Failed to serialize JSON config: {}", e))),
            Format::Toml => toml::to_string_pretty(config)
                .map_err(|e| PktCaptureError::Config(format!("Failed to serialize TOML config: {}", e))),
            Format::Yaml => serde_yaml::to_string(config)
                .map_err(|e| PktCaptureError::Config(format!("Failed to serialize YAML config: {}", e))),
        }
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::with_config(CaptureConfig::default())
    }

    pub fn with_config(config: CaptureConfig) -> Self {
        Self {
            config,
            config_path: None,
            watchers: Vec::new(),
        }
    }

    /// Load and validate configuration from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = Format::from_path(path)?;
        let content = fs::read_to_string(path)
            .map_err(|e| PktCaptureError::Config(format!("Failed to read config file: {}", e)))?;
        let config = format.parse(&content)?;

        let manager = Self {
            config,
            config_path: Some(path.to_path_buf()),
            watchers: Vec::new(),
        };
        manager.ensure_valid(&manager.config)?;
        log::debug!("loaded capture config from {}", path.display());
        Ok(manager)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = Format::from_path(path)?.render(&self.config)?;
        fs::write(path, content)
            .map_err(|e| PktCaptureError::Config(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    pub fn get_config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Replace the configuration after validating it
    pub fn update_config(&mut self, new_config: CaptureConfig) -> Result<()> {
        self.ensure_valid(&new_config)?;

        let old_config = std::mem::replace(&mut self.config, new_config);
        for watcher in &self.watchers {
            watcher.on_config_changed(&old_config, &self.config);
        }
        Ok(())
    }

    pub fn validate_config(&self, config: &CaptureConfig) -> ValidationResult {
        let mut result = ValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        if config.pool_capacity == 0 {
            result.errors.push("Pool capacity cannot be 0".to_string());
        }
        if config.queue_capacity == 0 {
            result.errors.push("Queue capacity cannot be 0".to_string());
        }
        if config.queue_capacity > config.pool_capacity {
            result.warnings.push(format!(
                "Queue capacity {} exceeds pool capacity {}; the pool is the effective bound",
                config.queue_capacity, config.pool_capacity
            ));
        }
        if config.buffer_size < MIN_BUFFER_SIZE {
            result.errors.push(format!(
                "Buffer size {} is below the minimum of {} bytes",
                config.buffer_size, MIN_BUFFER_SIZE
            ));
        } else if config.buffer_size < radio802::MAX_MPDU_SIZE {
            result.warnings.push(format!(
                "Buffer size {} cannot hold a {}-byte MPDU; larger frames are dropped",
                config.buffer_size,
                radio802::MAX_MPDU_SIZE
            ));
        }
        if config.suspend_timeout_ms == 0 {
            result.errors.push("Suspend timeout cannot be 0".to_string());
        }
        if config.shutdown_timeout_ms == 0 {
            result.errors.push("Shutdown timeout cannot be 0".to_string());
        }
        if config.noise_floor_dbm > 0 {
            result.errors.push(format!(
                "Noise floor {} dBm must not be positive",
                config.noise_floor_dbm
            ));
        }
        if config.worker_name.is_empty() {
            result.errors.push("Worker name cannot be empty".to_string());
        }
        if config.default_filter.connected_beacon_interval != 0 {
            result.warnings.push(
                "Default connected beacon interval needs a beacon interval before it takes effect"
                    .to_string(),
            );
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            result.errors.push(format!(
                "Invalid log level '{}', must be one of: {}",
                config.logging.level,
                valid_levels.join(", ")
            ));
        }

        result.valid = result.errors.is_empty();
        result
    }

    pub fn add_watcher(&mut self, watcher: Box<dyn ConfigWatcher>) {
        self.watchers.push(watcher);
    }

    pub fn remove_watcher(&mut self, name: &str) {
        self.watchers.retain(|w| w.name() != name);
    }

    /// Reload configuration from the file it was loaded from
    pub fn reload(&mut self) -> Result<()> {
        let path = self
            .config_path
            .clone()
            .ok_or_else(|| PktCaptureError::Config("No config file path set".to_string()))?;
        let reloaded = Self::load_from_file(&path)?;
        self.update_config(reloaded.config)
    }

    pub fn to_json(&self) -> Result<String> {
        Format::Json.render(&self.config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Format::Toml.render(&self.config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Format::Yaml.render(&self.config)
    }

    fn ensure_valid(&self, config: &CaptureConfig) -> Result<()> {
        let validation = self.validate_config(config);
        for warning in &validation.warnings {
            log::warn!("capture config: {}", warning);
        }
        if !validation.valid {
            return Err(PktCaptureError::Config(format!(
                "Configuration validation failed: {}",
                validation.errors.join(", ")
            )));
        }
        Ok(())
    }
}
