use crate::domain::packet::DeviceType;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "atorch_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// How long a scan may run before discovery gives up
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,

    /// Meter family addressed by outgoing commands
    #[serde(default)]
    pub device_type: DeviceType,

    /// Print packets as JSON lines instead of text
    #[serde(default = "default_false")]
    pub json_output: bool,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: default_discovery_timeout_ms(),
            device_type: DeviceType::default(),
            json_output: false,
            log_settings: LogSettings::default(),
        }
    }
}

fn default_discovery_timeout_ms() -> u64 {
    crate::infrastructure::bluetooth::protocol::DISCOVERY_TIMEOUT_MS
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        Self::load(Self::get_settings_path()?)
    }

    /// Load `settings_path`, writing the defaults there on first run
    ///
    /// A file that exists but does not parse is an error, not a reset.
    pub fn load(settings_path: PathBuf) -> anyhow::Result<Self> {
        if !settings_path.exists() {
            let service = Self {
                settings: Settings::default(),
                settings_path,
            };
            service.save()?;
            return Ok(service);
        }

        let settings = Self::load_from_file(&settings_path)
            .with_context(|| format!("Invalid settings file {}", settings_path.display()))?;
        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("AtorchLink");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)
            .with_context(|| format!("Failed to write {}", self.settings_path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let settings: Settings = serde_json::from_str(r#"{ "device_type": "usb" }"#).unwrap();
        assert_eq!(settings.device_type, DeviceType::Usb);
        assert_eq!(settings.discovery_timeout_ms, 20_000);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_first_run_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AtorchLink").join("settings.json");

        let service = SettingsService::load(path.clone()).unwrap();
        assert_eq!(service.get().discovery_timeout_ms, 20_000);

        let written: Settings = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.device_type, DeviceType::Dc);
        assert!(!written.json_output);
    }

    #[test]
    fn test_existing_file_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "discovery_timeout_ms": 5000, "json_output": true }"#).unwrap();

        let service = SettingsService::load(path.clone()).unwrap();
        assert_eq!(service.get().discovery_timeout_ms, 5_000);
        assert!(service.get().json_output);
        assert!(fs::read_to_string(&path).unwrap().contains("5000"));
    }

    #[test]
    fn test_malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();

        let err = SettingsService::load(path.clone()).err().expect("parse error");
        assert!(err.to_string().contains("Invalid settings file"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "not json");
    }
}
