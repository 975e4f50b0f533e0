//! Configuration loading and validation.
//!
//! The on-disk shape mirrors what the configuration manager generates: a
//! per-device map of `address -> [name, scale, unit, data_type]` rows plus
//! poll timing and optional transport/sink blocks. All normalization lives
//! here; by the time a `DeviceSpec` exists the register map is valid.
//!
//! The data type column is mandatory. Older register maps omitted it and
//! the reader assumed uint16, which silently mis-sized every 32-bit read;
//! a row without all four columns now fails the load.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::point::{DeviceSpec, ParameterSpec};
use crate::scheduler::PollTiming;

/// Environment variable prefix for overrides, e.g.
/// `POLLSRV_POLL__INTERVAL_MS=5000`.
const ENV_PREFIX: &str = "POLLSRV_";

fn default_interval_ms() -> u64 {
    10_000
}
fn default_read_timeout_ms() -> u64 {
    3_000
}
fn default_read_delay_ms() -> u64 {
    50
}
fn default_device_delay_ms() -> u64 {
    500
}
fn default_port() -> u16 {
    502
}
fn default_measurement() -> String {
    "energy_measurements".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_read_delay_ms")]
    pub read_delay_ms: u64,
    #[serde(default = "default_device_delay_ms")]
    pub device_delay_ms: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            read_delay_ms: default_read_delay_ms(),
            device_delay_ms: default_device_delay_ms(),
        }
    }
}

/// Modbus/TCP endpoint (or serial gateway) shared by the whole fleet.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxSettings {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
}

/// One register row: `[name, scale, unit, data_type]`. All four columns are
/// required.
#[derive(Debug, Clone, Deserialize)]
struct RawParameter(String, f64, String, String);

#[derive(Debug, Clone, Deserialize)]
struct RawDevice {
    unit_id: u8,
    parameters: BTreeMap<String, RawParameter>,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub poll: PollSettings,
    #[serde(default)]
    pub transport: Option<TransportSettings>,
    #[serde(default)]
    pub influx: Option<InfluxSettings>,
    devices: BTreeMap<String, RawDevice>,
}

impl AppConfig {
    /// Load from a YAML file with `POLLSRV_` environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))
    }

    pub fn timing(&self) -> PollTiming {
        PollTiming {
            interval: Duration::from_millis(self.poll.interval_ms),
            read_timeout: Duration::from_millis(self.poll.read_timeout_ms),
            read_delay: Duration::from_millis(self.poll.read_delay_ms),
            device_delay: Duration::from_millis(self.poll.device_delay_ms),
        }
    }

    /// Build the validated device fleet. Devices come out ordered by id and
    /// parameters by register address, so poll order is deterministic.
    pub fn build_fleet(&self) -> Result<Vec<DeviceSpec>, ConfigError> {
        let mut fleet = Vec::with_capacity(self.devices.len());
        for (device_id, raw) in &self.devices {
            let mut parameters = Vec::with_capacity(raw.parameters.len());
            for (key, row) in &raw.parameters {
                let address = parse_address(device_id, key)?;
                let data_type = row.3.parse()?;
                parameters.push(ParameterSpec::new(
                    address,
                    row.0.clone(),
                    row.1,
                    row.2.clone(),
                    data_type,
                )?);
            }
            parameters.sort_by_key(|p| p.address);
            fleet.push(DeviceSpec::new(device_id.clone(), raw.unit_id, parameters)?);
        }
        crate::point::validate_fleet(&fleet)?;
        Ok(fleet)
    }
}

/// Convert a Modbus-notation holding-register address (40001-49999) to its
/// 0-based protocol address; addresses outside that range pass through.
pub fn convert_modbus_address(address: u64) -> u64 {
    if (40001..=49999).contains(&address) {
        address - 40001
    } else {
        address
    }
}

fn parse_address(device_id: &str, key: &str) -> Result<u16, ConfigError> {
    let raw: u64 = key
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidAddress {
            device: device_id.to_string(),
            address: key.to_string(),
        })?;
    let converted = convert_modbus_address(raw);
    u16::try_from(converted).map_err(|_| ConfigError::InvalidAddress {
        device: device_id.to_string(),
        address: key.to_string(),
    })
}
