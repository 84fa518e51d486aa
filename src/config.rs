//! Configuration for module discovery and firmware flashing, loaded with Figment.
//!
//! Sources are merged in order, later ones winning:
//! 1. Built-in defaults (`ModulesConfig::default()`)
//! 2. A TOML file (`config/deck_modules.toml` unless a path is given)
//! 3. Environment variables prefixed with `DECK_MODULES_`, nested with `__`
//!    (e.g. `DECK_MODULES_HARDWARE__LIVE=true`)
//!
//! The legacy `RUNNING_ON_PI` variable, when present, also turns live hardware on.
//!
//! # Example
//! ```no_run
//! use deck_modules::config::ModulesConfig;
//!
//! let config = ModulesConfig::load()?;
//! println!("Device directory: {}", config.hardware.device_dir.display());
//! # Ok::<(), deck_modules::error::ModuleError>(())
//! ```

use crate::error::{ModuleError, ModuleResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/deck_modules.toml";

/// Environment variable set on the robot itself.
pub const RUNNING_ON_PI_ENV: &str = "RUNNING_ON_PI";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Device namespace settings
    pub hardware: HardwareConfig,
    /// Bootloader port search settings
    pub bootloader: BootloaderConfig,
    /// External flashing tool settings
    pub flash_tool: FlashToolConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Where modules show up and whether to look at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Read the real device namespace. When false everything is simulated.
    pub live: bool,
    /// Directory holding one entry per attached module
    pub device_dir: PathBuf,
    /// Delay before the single retry when the directory is missing
    #[serde(with = "humantime_serde")]
    pub enumerate_retry_delay: Duration,
}

/// Bootloader port search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootloaderConfig {
    /// Upper bound on the search for the bootloader port
    #[serde(with = "humantime_serde")]
    pub port_search_timeout: Duration,
    /// Delay between two namespace checks while searching
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Name suffix carried by new-style bootloader ports
    pub port_suffix: String,
}

/// Flashing tool (avrdude) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashToolConfig {
    /// Executable to run
    pub program: String,
    /// avrdude configuration file passed with `-C`
    pub config_file: PathBuf,
    /// Target microcontroller part number
    pub part_no: String,
    /// Programmer protocol id
    pub programmer_id: String,
    /// Bootloader baud rate
    pub baud_rate: u32,
    /// Literal text printed by the tool after a verified write
    pub verification_marker: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "deck-modules".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            live: false,
            device_dir: PathBuf::from("/dev/modules"),
            enumerate_retry_delay: Duration::from_secs(2),
        }
    }
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        Self {
            port_search_timeout: Duration::from_millis(5500),
            poll_interval: Duration::from_millis(250),
            port_suffix: "bootloader".to_string(),
        }
    }
}

impl Default for FlashToolConfig {
    fn default() -> Self {
        Self {
            program: "avrdude".to_string(),
            config_file: PathBuf::from("config/avrdude.conf"),
            part_no: "atmega32u4".to_string(),
            programmer_id: "avr109".to_string(),
            baud_rate: 57600,
            verification_marker: "flash verified".to_string(),
        }
    }
}

impl ModulesConfig {
    /// Load configuration from `config/deck_modules.toml` and the environment
    pub fn load() -> ModuleResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ModuleResult<Self> {
        let mut config: ModulesConfig = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DECK_MODULES_").split("__"))
            .extract()?;

        if std::env::var_os(RUNNING_ON_PI_ENV).is_some() {
            config.hardware.live = true;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> ModuleResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ModuleError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.hardware.device_dir.as_os_str().is_empty() {
            return Err(ModuleError::Configuration(
                "hardware.device_dir must not be empty".to_string(),
            ));
        }

        if self.bootloader.port_search_timeout.is_zero() {
            return Err(ModuleError::Configuration(
                "bootloader.port_search_timeout must be greater than zero".to_string(),
            ));
        }

        if self.bootloader.poll_interval > self.bootloader.port_search_timeout {
            return Err(ModuleError::Configuration(format!(
                "bootloader.poll_interval ({:?}) exceeds port_search_timeout ({:?})",
                self.bootloader.poll_interval, self.bootloader.port_search_timeout
            )));
        }

        if self.bootloader.port_suffix.is_empty() {
            return Err(ModuleError::Configuration(
                "bootloader.port_suffix must not be empty".to_string(),
            ));
        }

        if self.flash_tool.verification_marker.is_empty() {
            return Err(ModuleError::Configuration(
                "flash_tool.verification_marker must not be empty".to_string(),
            ));
        }

        if self.flash_tool.baud_rate == 0 {
            return Err(ModuleError::Configuration(
                "flash_tool.baud_rate must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        std::env::remove_var(RUNNING_ON_PI_ENV);
        std::env::remove_var("DECK_MODULES_HARDWARE__LIVE");
        std::env::remove_var("DECK_MODULES_BOOTLOADER__PORT_SEARCH_TIMEOUT");
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ModulesConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.hardware.live);
        assert_eq!(config.hardware.device_dir, PathBuf::from("/dev/modules"));
        assert_eq!(
            config.bootloader.port_search_timeout,
            Duration::from_millis(5500)
        );
        assert_eq!(config.flash_tool.part_no, "atmega32u4");
        assert_eq!(config.flash_tool.programmer_id, "avr109");
        assert_eq!(config.flash_tool.baud_rate, 57600);
    }

    #[test]
    #[serial]
    fn test_load_from_toml_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modules.toml");
        std::fs::write(
            &path,
            r#"
[application]
log_level = "debug"

[hardware]
live = true
device_dir = "/tmp/modules"

[bootloader]
port_search_timeout = "4s"
poll_interval = "100ms"
"#,
        )
        .unwrap();

        let config = ModulesConfig::load_from(&path).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert!(config.hardware.live);
        assert_eq!(config.hardware.device_dir, PathBuf::from("/tmp/modules"));
        assert_eq!(config.bootloader.port_search_timeout, Duration::from_secs(4));
        assert_eq!(config.bootloader.poll_interval, Duration::from_millis(100));
        // Untouched sections keep their defaults
        assert_eq!(config.flash_tool.verification_marker, "flash verified");
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        clear_env();
        let config = ModulesConfig::load_from("/nonexistent/deck_modules.toml").unwrap();
        assert!(!config.hardware.live);
        assert_eq!(config.bootloader.port_suffix, "bootloader");
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        std::env::set_var("DECK_MODULES_BOOTLOADER__PORT_SEARCH_TIMEOUT", "2s");
        let config = ModulesConfig::load_from("/nonexistent/deck_modules.toml").unwrap();
        assert_eq!(config.bootloader.port_search_timeout, Duration::from_secs(2));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_running_on_pi_enables_live_hardware() {
        clear_env();
        std::env::set_var(RUNNING_ON_PI_ENV, "true");
        let config = ModulesConfig::load_from("/nonexistent/deck_modules.toml").unwrap();
        assert!(config.hardware.live);
        clear_env();
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = ModulesConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(
            config.validate(),
            Err(ModuleError::Configuration(_))
        ));
    }

    #[test]
    fn test_poll_interval_longer_than_timeout() {
        let mut config = ModulesConfig::default();
        config.bootloader.poll_interval = Duration::from_secs(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_marker_rejected() {
        let mut config = ModulesConfig::default();
        config.flash_tool.verification_marker.clear();
        assert!(config.validate().is_err());
    }
}
