//! Configuration loading using Figment
//!
//! Configuration is layered:
//! 1. `config/lab_daq.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `LAB_DAQ_`; `__` separates nesting
//!    levels, e.g. `LAB_DAQ_APPLICATION__LOG_LEVEL=debug`
//!
//! # Example
//! ```no_run
//! use lab_daq::config::LabConfig;
//!
//! let config = LabConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), lab_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::registry::DeviceDescriptor;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/lab_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LabConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Where and how batch output is written
    #[serde(default)]
    pub storage: StorageConfig,
    /// Hardware timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Device catalog
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name shown in logs
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Batch output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for step files and summary logs
    pub output_dir: PathBuf,
    /// Second header line written into every step file
    #[serde(default)]
    pub file_header: String,
    /// Directory for batch checkpoints; none disables them
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

/// Hardware timeouts, written as human-readable durations ("10s", "2m").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Upper bound on one verification exchange
    #[serde(with = "humantime_serde", default = "default_verify_timeout")]
    pub verify: Duration,
    /// Upper bound on one step measurement
    #[serde(with = "humantime_serde", default = "default_measure_timeout")]
    pub measure: Duration,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_verify_timeout() -> Duration {
    crate::hardware::registry::DEFAULT_VERIFY_TIMEOUT
}

fn default_measure_timeout() -> Duration {
    crate::experiment::driver::DEFAULT_MEASURE_TIMEOUT
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Lab DAQ".to_string(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            file_header: String::new(),
            checkpoint_dir: None,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            verify: default_verify_timeout(),
            measure: default_measure_timeout(),
        }
    }
}

impl LabConfig {
    /// Load configuration from `config/lab_daq.toml` and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(LabConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LAB_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(DaqError::Config(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.timeouts.verify.is_zero() || self.timeouts.measure.is_zero() {
            return Err(DaqError::Config("Timeouts must be greater than zero".into()));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(DaqError::Config("Device name must not be empty".into()));
            }
            if !names.insert(device.name.as_str()) {
                return Err(DaqError::Config(format!("Duplicate device name: {}", device.name)));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Last working configuration
// =============================================================================

/// Descriptor list as persisted between sessions.
///
/// After a successful verification the catalog (with the addresses that worked)
/// is saved so the next session starts from known-good addresses.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceCatalogFile {
    /// Descriptors in catalog order
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
}

impl DeviceCatalogFile {
    /// Catalog holding `devices`.
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self { devices }
    }

    /// `~/.lab_daq/last_working_config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".lab_daq").join("last_working_config.toml"))
    }

    /// Write the catalog as TOML, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let path = path.as_ref();
        let text = toml::to_string_pretty(self)
            .map_err(|e| DaqError::Config(format!("Cannot serialize device catalog: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DaqError::persist(path, e))?;
        }
        std::fs::write(path, text).map_err(|e| DaqError::persist(path, e))?;
        tracing::debug!(path = %path.display(), devices = self.devices.len(), "Device catalog saved");
        Ok(())
    }

    /// Read a catalog written by [`save`](Self::save).
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| DaqError::Config(format!("Invalid device catalog {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::{CapabilityKind, ConnectionKind};
    use serial_test::serial;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
[application]
name = "Test Lab"
log_level = "debug"

[storage]
output_dir = "/tmp/lab"
file_header = "Dark IV"

[timeouts]
verify = "2s"
measure = "1m 30s"

[[devices]]
name = "SMU-A"
kind = "SMU"
connection = "Dummy"

[[devices]]
name = "Lockin SR830"
kind = "Lockin"
connection = "GPIB"
address = "GPIB0::8::INSTR"
question = "*IDN?"
answer = "SR830"
"#;

    fn write_sample(dir: &Path) -> PathBuf {
        let path = dir.join("lab_daq.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        path
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let config = LabConfig::load_from(write_sample(dir.path())).unwrap();

        assert_eq!(config.application.name, "Test Lab");
        assert_eq!(config.application.log_format, "pretty");
        assert_eq!(config.timeouts.verify, Duration::from_secs(2));
        assert_eq!(config.timeouts.measure, Duration::from_secs(90));
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[1].connection, ConnectionKind::Gpib);
        assert_eq!(config.devices[0].kind, CapabilityKind::Smu);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = LabConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.application, ApplicationConfig::default());
        assert!(config.devices.is_empty());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let dir = tempdir().unwrap();
        let path = write_sample(dir.path());

        std::env::set_var("LAB_DAQ_APPLICATION__LOG_LEVEL", "warn");
        let config = LabConfig::load_from(&path);
        std::env::remove_var("LAB_DAQ_APPLICATION__LOG_LEVEL");

        assert_eq!(config.unwrap().application.log_level, "warn");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = LabConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(config.validate(), Err(DaqError::Config(_))));
    }

    #[test]
    fn test_duplicate_device_names() {
        let config = LabConfig {
            devices: vec![
                DeviceDescriptor::dummy("SMU-A", CapabilityKind::Smu),
                DeviceDescriptor::dummy("SMU-A", CapabilityKind::Lockin),
            ],
            ..LabConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate device name"));
    }

    #[test]
    fn test_catalog_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("last_working_config.toml");
        let catalog = DeviceCatalogFile::new(vec![DeviceDescriptor::new(
            "SMU-B",
            CapabilityKind::Smu,
            ConnectionKind::Serial,
            "/dev/ttyUSB0",
        )
        .with_verification("*IDN?", "2400")]);

        catalog.save(&path).unwrap();
        assert_eq!(DeviceCatalogFile::load(&path).unwrap(), catalog);
    }
}
