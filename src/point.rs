//! Data model for the register map: data types, parameters and devices.
//!
//! Everything here is immutable once validated. Validation happens at
//! construction so that a fleet that polls at all is a fleet whose register
//! map is internally consistent.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Register data types supported by the decoder.
///
/// The enumeration is closed: adding a variant forces both
/// [`DataType::register_count`] and the decoder to be updated, so a new
/// type can never silently fall back to a guessed register width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
}

impl DataType {
    /// Number of 16-bit holding registers occupied by one value of this type.
    pub fn register_count(self) -> u16 {
        match self {
            DataType::Uint16 | DataType::Int16 => 1,
            DataType::Uint32 | DataType::Int32 | DataType::Float32 => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Uint16 => "uint16",
            DataType::Int16 => "int16",
            DataType::Uint32 => "uint32",
            DataType::Int32 => "int32",
            DataType::Float32 => "float32",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uint16" => Ok(DataType::Uint16),
            "int16" => Ok(DataType::Int16),
            "uint32" => Ok(DataType::Uint32),
            "int32" => Ok(DataType::Int32),
            "float32" => Ok(DataType::Float32),
            other => Err(ConfigError::UnknownDataType(other.to_string())),
        }
    }
}

/// One configured register read: address, output field name, scale, unit
/// and data type.
///
/// `scale` is a divisor: `physical = decoded_raw / scale`. A register
/// holding tenths of a volt is configured with `scale = 10.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub address: u16,
    pub name: String,
    pub scale: f64,
    pub unit: String,
    pub data_type: DataType,
}

impl ParameterSpec {
    pub fn new(
        address: u16,
        name: impl Into<String>,
        scale: f64,
        unit: impl Into<String>,
        data_type: DataType,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::EmptyName { address });
        }
        if scale == 0.0 || !scale.is_finite() {
            return Err(ConfigError::InvalidScale {
                name,
                address,
                scale,
            });
        }
        let end = u32::from(address) + u32::from(data_type.register_count()) - 1;
        if end > u32::from(u16::MAX) {
            return Err(ConfigError::AddressOutOfRange {
                name,
                address: u64::from(address),
            });
        }
        Ok(Self {
            address,
            name,
            scale,
            unit: unit.into(),
            data_type,
        })
    }

    /// Last register address occupied by this parameter.
    pub fn end_address(&self) -> u16 {
        self.address + self.data_type.register_count() - 1
    }

    fn overlaps(&self, other: &ParameterSpec) -> bool {
        self.address <= other.end_address() && other.address <= self.end_address()
    }
}

/// One logical slave device on the shared bus.
///
/// `unit_id` is the slave id on RTU or the unit identifier on Modbus/TCP.
/// Parameter order is preserved as declared; poll results report outcomes
/// in the same order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub device_id: String,
    pub unit_id: u8,
    pub parameters: Vec<ParameterSpec>,
}

impl DeviceSpec {
    /// Build a device, rejecting empty parameter sets and overlapping
    /// register ranges (a 2-word parameter at A occupies A and A+1).
    pub fn new(
        device_id: impl Into<String>,
        unit_id: u8,
        parameters: Vec<ParameterSpec>,
    ) -> Result<Self, ConfigError> {
        let device_id = device_id.into();
        if parameters.is_empty() {
            return Err(ConfigError::EmptyDevice(device_id));
        }
        for (i, a) in parameters.iter().enumerate() {
            for b in parameters.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return Err(ConfigError::AddressOverlap {
                        device: device_id,
                        first: a.name.clone(),
                        second: b.name.clone(),
                        address: a.address.max(b.address),
                    });
                }
            }
        }
        Ok(Self {
            device_id,
            unit_id,
            parameters,
        })
    }
}

/// Validate fleet-level invariants: at least one device, and no two devices
/// sharing a unit id on the same transport (they would be indistinguishable
/// on the wire).
pub fn validate_fleet(devices: &[DeviceSpec]) -> Result<(), ConfigError> {
    if devices.is_empty() {
        return Err(ConfigError::EmptyFleet);
    }
    for (i, a) in devices.iter().enumerate() {
        for b in devices.iter().skip(i + 1) {
            if a.unit_id == b.unit_id {
                return Err(ConfigError::DuplicateUnitId {
                    first: a.device_id.clone(),
                    second: b.device_id.clone(),
                    unit_id: a.unit_id,
                });
            }
        }
    }
    Ok(())
}
