//! Engine configuration
//!
//! [`EngineConfig`] gathers the knobs of the compute layer, scheduler,
//! acquisition controller, scratch pool and logging. Every field has a
//! default, so partial files load cleanly.
//!
//! # Data Location
//!
//! The default config file lives in the platform data directory:
//! - **Linux**: `~/.local/share/dev.scopeflow/`
//! - **macOS**: `~/Library/Application Support/dev.scopeflow/`
//! - **Windows**: `%APPDATA%\dev.scopeflow\`
//!
//! Files ending in `.toml` are read as TOML, anything else as JSON.

use crate::error::{Result, ScopeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "dev.scopeflow";

/// Default config filename
pub const CONFIG_FILE: &str = "engine.toml";

/// Default refresh rate of the background scheduler in Hz
pub const DEFAULT_REFRESH_RATE_HZ: u32 = 60;

/// Default number of pending waveform sets before acquisition stalls
pub const DEFAULT_PENDING_HIGH_WATER: usize = 8;

/// Trigger polling interval used by `wait_for_trigger` (100 Hz)
pub const DEFAULT_TRIGGER_POLL_MS: u64 = 10;

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        ScopeError::Config("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            ScopeError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Path of the default config file
pub fn default_config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

/// Which implementation backs the compute device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeBackend {
    /// Kernels run on the host against an emulated device heap
    #[default]
    Software,
    /// Kernels run as WGSL on a GPU adapter (needs the `wgpu` feature)
    Wgpu,
}

/// Compute device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Create a compute device at all
    pub enable_device: bool,
    pub backend: ComputeBackend,
    /// Name of the software device
    pub device_name: String,
    /// 64-bit integer support in kernels
    pub int64: bool,
    /// 64-bit float support in kernels
    pub float64: bool,
    /// Host-visible device memory
    pub unified_memory: bool,
    pub memory_budget_mb: usize,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            enable_device: true,
            backend: ComputeBackend::Software,
            device_name: "software".to_string(),
            int64: true,
            float64: true,
            unified_memory: false,
            memory_budget_mb: 512,
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Refresh cycles per second for the background runner
    pub refresh_rate_hz: u32,
    /// Skip filters whose inputs and parameters did not change
    pub skip_unchanged: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_rate_hz: DEFAULT_REFRESH_RATE_HZ,
            skip_unchanged: true,
        }
    }
}

/// Acquisition controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Pending sets at which `acquire_data` stalls
    pub pending_high_water: usize,
    pub trigger_poll_ms: u64,
    /// Re-arm after each capture in normal mode
    pub auto_rearm: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            pending_high_water: DEFAULT_PENDING_HIGH_WATER,
            trigger_poll_ms: DEFAULT_TRIGGER_POLL_MS,
            auto_rearm: true,
        }
    }
}

/// Extra scratch pools registered at startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool ids beyond the built-in ones, created with host-only hints
    pub extra_pools: Vec<u16>,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Directory for daily-rolling log files; none disables file logging
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,scopeflow=debug".to_string(),
            log_dir: None,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub compute: ComputeConfig,
    pub scheduler: SchedulerConfig,
    pub acquisition: AcquisitionConfig,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "toml")
}

impl EngineConfig {
    /// Load from a TOML or JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScopeError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        if is_toml(path) {
            toml::from_str(&content).map_err(|e| {
                ScopeError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })
        } else {
            serde_json::from_str(&content).map_err(|e| {
                ScopeError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })
        }
    }

    /// Load a config file, returning defaults if any error occurs
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Using default engine config: {}", e);
                Self::default()
            }
        }
    }

    /// Save as TOML or JSON depending on the extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ScopeError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = if is_toml(path) {
            toml::to_string_pretty(self)
                .map_err(|e| ScopeError::Config(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| ScopeError::Config(format!("Failed to serialize config: {}", e)))?
        };

        std::fs::write(path, content).map_err(|e| {
            ScopeError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Register the configured extra scratch pools on the global pool
    pub fn apply_pools(&self) {
        use crate::buffer::{AccessHint, PoolId, ScratchPool};
        for &id in &self.pool.extra_pools {
            ScratchPool::global().register_pool(PoolId(id), AccessHint::Likely, AccessHint::Unlikely);
        }
    }
}
