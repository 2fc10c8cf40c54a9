//! Configuration
//!
//! `HostConfig` lists the devices the host should run, one tagged section
//! per driver. Every field has a default so a section can be as short as
//! `{ "driver": "microtouch", "serial": { "port": "/dev/ttyUSB1" } }`.
//!
//! Drivers also persist a few runtime choices (video format, cooler state,
//! control values) through a [`ConfigStore`], keyed by property name.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::property::PropertyValue;
use crate::protocol::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Where and how to reach a serial device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Serial port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub port: String,
    pub baud_rate: u32,
    /// Response timeout in milliseconds
    pub timeout_ms: u64,
    /// `host:port` of a serial-over-TCP bridge; used instead of `port` when set
    pub tcp_address: Option<String>,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            tcp_address: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StarGoFocuserConfig {
    pub enabled: bool,
    pub name: String,
    pub max_position: i64,
    /// Initial speed, 1..=10
    pub speed: u32,
    pub reversed: bool,
}

impl Default for StarGoFocuserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "StarGo Focuser".to_string(),
            max_position: 100_000,
            speed: 5,
            reversed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StarGoConfig {
    pub name: String,
    pub serial: SerialSettings,
    pub poll_interval_ms: u64,
    /// Guide with `:Mg` pulse commands instead of move-and-stop
    pub use_pulse_commands: bool,
    pub guide_threshold_ms: u64,
    /// Guide speeds in percent of sidereal rate
    pub guide_speed_ra: u32,
    pub guide_speed_dec: u32,
    /// Send UTC time and site location after connecting
    pub sync_time_on_connect: bool,
    pub latitude: f64,
    /// East positive, degrees
    pub longitude: f64,
    pub focuser: StarGoFocuserConfig,
}

impl Default for StarGoConfig {
    fn default() -> Self {
        Self {
            name: "Avalon StarGo".to_string(),
            serial: SerialSettings::default(),
            poll_interval_ms: 1000,
            use_pulse_commands: true,
            guide_threshold_ms: 50,
            guide_speed_ra: 50,
            guide_speed_dec: 50,
            sync_time_on_connect: true,
            latitude: 0.0,
            longitude: 0.0,
            focuser: StarGoFocuserConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicrotouchConfig {
    pub name: String,
    pub serial: SerialSettings,
    pub poll_interval_ms: u64,
    pub max_position: i64,
    /// Minimum change before a new temperature is published
    pub temperature_delta: f64,
    /// Talk to an in-process firmware model instead of a port
    pub simulate: bool,
}

impl Default for MicrotouchConfig {
    fn default() -> Self {
        Self {
            name: "Microtouch".to_string(),
            serial: SerialSettings {
                baud_rate: 19200,
                ..SerialSettings::default()
            },
            poll_interval_ms: 500,
            max_position: 60000,
            temperature_delta: 0.01,
            simulate: false,
        }
    }
}

/// ToupTek cameras; one section covers every camera the SDK enumerates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToupcamConfig {
    pub name: String,
    pub poll_interval_ms: u64,
    /// Use the in-process camera model instead of the vendor SDK
    pub simulate: bool,
    /// Where video format, cooler and control choices are kept
    pub state_file: Option<PathBuf>,
}

impl Default for ToupcamConfig {
    fn default() -> Self {
        Self {
            name: "ToupCam".to_string(),
            poll_interval_ms: 1000,
            simulate: false,
            state_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum DeviceConfig {
    #[serde(rename = "stargo")]
    StarGo(StarGoConfig),
    Microtouch(MicrotouchConfig),
    Toupcam(ToupcamConfig),
}

impl DeviceConfig {
    pub fn name(&self) -> &str {
        match self {
            DeviceConfig::StarGo(c) => &c.name,
            DeviceConfig::Microtouch(c) => &c.name,
            DeviceConfig::Toupcam(c) => &c.name,
        }
    }

    pub fn poll_interval_ms(&self) -> u64 {
        match self {
            DeviceConfig::StarGo(c) => c.poll_interval_ms,
            DeviceConfig::Microtouch(c) => c.poll_interval_ms,
            DeviceConfig::Toupcam(c) => c.poll_interval_ms,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub devices: Vec<DeviceConfig>,
}

impl HostConfig {
    /// `<config dir>/astrolink/host.json`
    pub fn default_path() -> io::Result<PathBuf> {
        let base = dirs::config_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "Could not find config directory")
            })?;
        Ok(base.join("astrolink").join("host.json"))
    }

    pub fn load(path: &Path) -> Result<Self, DriverError> {
        let content = fs::read_to_string(path).map_err(|e| {
            DriverError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: HostConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no driver can run with
    pub fn validate(&self) -> Result<(), DriverError> {
        for device in &self.devices {
            if device.poll_interval_ms() == 0 {
                return Err(DriverError::Config(format!(
                    "{}: poll_interval_ms must be at least 1",
                    device.name()
                )));
            }
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), DriverError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Persisted driver state, keyed by device and property name
pub trait ConfigStore: Send {
    fn save_item(
        &mut self,
        device: &str,
        property: &str,
        value: &PropertyValue,
    ) -> Result<(), DriverError>;

    /// Write out anything buffered
    fn flush(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

type Items = BTreeMap<String, BTreeMap<String, PropertyValue>>;

/// JSON file store; writes happen on `flush`
#[derive(Debug)]
pub struct JsonConfigStore {
    path: PathBuf,
    items: Items,
}

impl JsonConfigStore {
    /// Open `path`, keeping whatever it already holds
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DriverError> {
        let path = path.into();
        let items = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Items::new()
        };
        Ok(Self { path, items })
    }

    pub fn get(&self, device: &str, property: &str) -> Option<&PropertyValue> {
        self.items.get(device)?.get(property)
    }
}

impl ConfigStore for JsonConfigStore {
    fn save_item(
        &mut self,
        device: &str,
        property: &str,
        value: &PropertyValue,
    ) -> Result<(), DriverError> {
        self.items
            .entry(device.to_string())
            .or_default()
            .insert(property.to_string(), value.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DriverError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.items)?;
        fs::write(&self.path, content)?;
        tracing::debug!("saved driver config to {}", self.path.display());
        Ok(())
    }
}

/// In-memory store; clones share contents
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    items: Arc<Mutex<Items>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device: &str, property: &str) -> Option<PropertyValue> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.get(device)?.get(property).cloned()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn save_item(
        &mut self,
        device: &str,
        property: &str,
        value: &PropertyValue,
    ) -> Result<(), DriverError> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(device.to_string())
            .or_default()
            .insert(property.to_string(), value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_minimal_sections_fill_defaults() {
        let json = r#"{
            "devices": [
                { "driver": "microtouch", "serial": { "port": "/dev/ttyUSB1" } },
                { "driver": "stargo", "serial": { "port": "/dev/ttyUSB0" }, "focuser": { "speed": 3 } }
            ]
        }"#;
        let config: HostConfig = serde_json::from_str(json).unwrap();

        match &config.devices[0] {
            DeviceConfig::Microtouch(c) => {
                assert_eq!(c.serial.port, "/dev/ttyUSB1");
                assert_eq!(c.serial.baud_rate, DEFAULT_BAUD_RATE);
                assert_eq!(c.max_position, 60000);
            }
            other => panic!("unexpected section {:?}", other),
        }
        match &config.devices[1] {
            DeviceConfig::StarGo(c) => {
                assert_eq!(c.focuser.speed, 3);
                assert!(c.focuser.enabled);
                assert_eq!(c.guide_threshold_ms, 50);
            }
            other => panic!("unexpected section {:?}", other),
        }
    }

    #[test]
    fn test_camera_section() {
        let json = r#"{ "devices": [ { "driver": "toupcam", "simulate": true } ] }"#;
        let config: HostConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.devices[0].name(), "ToupCam");
        match &config.devices[0] {
            DeviceConfig::Toupcam(c) => {
                assert!(c.simulate);
                assert_eq!(c.poll_interval_ms, 1000);
                assert_eq!(c.state_file, None);
            }
            other => panic!("unexpected section {:?}", other),
        }
    }

    #[test]
    fn test_unknown_driver_is_an_error() {
        let json = r#"{ "devices": [ { "driver": "lx200classic" } ] }"#;
        assert!(serde_json::from_str::<HostConfig>(json).is_err());
    }

    #[test]
    fn test_memory_store_shares_contents() {
        let store = MemoryConfigStore::new();
        let mut writer = store.clone();
        writer
            .save_item("Camera", "CCD_COOLER", &PropertyValue::Switch(vec![true, false]))
            .unwrap();
        assert_eq!(
            store.get("Camera", "CCD_COOLER"),
            Some(PropertyValue::Switch(vec![true, false]))
        );
        assert_eq!(store.get("Camera", "CCD_CONTROLS"), None);
    }
}
