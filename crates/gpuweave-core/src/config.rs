use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Top-level gpuweave configuration, loaded from gpuweave.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuweaveConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub presentation: PresentationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Name reported to the driver in the application info
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Enable the Khronos validation layer and debug messenger
    #[serde(default)]
    pub validation: bool,
    /// Require descriptor indexing (update-after-bind, partially bound sets)
    #[serde(default)]
    pub descriptor_indexing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Physical device index in enumeration order
    #[serde(default)]
    pub index: u32,
    /// Upper bound for every CPU-side fence wait
    #[serde(default = "default_fence_timeout_ms")]
    pub fence_timeout_ms: u64,
    /// Queues created per family (capped by what the family offers)
    #[serde(default = "default_queues_per_family")]
    pub queues_per_family: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentationConfig {
    #[serde(default)]
    pub present_mode: PresentMode,
    /// Frames in flight on top of minImageCount + 1
    #[serde(default)]
    pub extra_frames: u32,
}

/// Swapchain presentation mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PresentMode {
    #[default]
    #[serde(rename = "fifo")]
    Fifo,
    #[serde(rename = "mailbox")]
    Mailbox,
    #[serde(rename = "immediate")]
    Immediate,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            validation: false,
            descriptor_indexing: false,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            index: 0,
            fence_timeout_ms: default_fence_timeout_ms(),
            queues_per_family: default_queues_per_family(),
        }
    }
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            present_mode: PresentMode::default(),
            extra_frames: 0,
        }
    }
}

impl DeviceConfig {
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    /// Fence timeout in the nanosecond unit the driver expects.
    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout_ms.saturating_mul(1_000_000)
    }
}

impl GpuweaveConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text.
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let config: GpuweaveConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(CoreError::Io(_)) => Self::default(),
            Err(e) => {
                tracing::warn!(path, error = %e, "ignoring invalid configuration");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.device.queues_per_family == 0 {
            return Err(CoreError::ConfigError(
                "device.queues_per_family must be at least 1".to_string(),
            ));
        }
        if self.device.fence_timeout_ms == 0 {
            return Err(CoreError::ConfigError(
                "device.fence_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.application.name.contains('\0') {
            return Err(CoreError::ConfigError(
                "application.name must not contain NUL".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, CoreError> {
        toml::to_string_pretty(self).map_err(|e| CoreError::ConfigError(e.to_string()))
    }
}

/// Returns the default config file path based on platform conventions.
/// Search order:
/// 1. System-wide config: `%PROGRAMDATA%\gpuweave\gpuweave.toml` (Windows) or `/etc/gpuweave/gpuweave.toml`
/// 2. Local fallback: `./gpuweave.toml`
pub fn default_config_path() -> String {
    #[cfg(windows)]
    {
        let programdata = std::env::var("PROGRAMDATA")
            .unwrap_or_else(|_| r"C:\ProgramData".to_string());
        let system_path = format!(r"{}\gpuweave\gpuweave.toml", programdata);
        if std::path::Path::new(&system_path).exists() {
            return system_path;
        }
    }
    #[cfg(not(windows))]
    {
        let system_path = "/etc/gpuweave/gpuweave.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "gpuweave.toml".to_string()
}

fn default_app_name() -> String {
    "gpuweave".to_string()
}

fn default_fence_timeout_ms() -> u64 {
    2000
}

fn default_queues_per_family() -> u32 {
    3
}
