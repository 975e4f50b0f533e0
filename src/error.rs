//! Error types for the polling service.
//!
//! Three families, matching how failures propagate: `ConfigError` is fatal
//! and halts startup, `TransportError` and `DecodeError` are captured as
//! per-parameter outcomes and never abort a cycle.

use std::time::Duration;

use thiserror::Error;

/// Fatal configuration problems, detected before polling starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown data type '{0}' (expected uint16, int16, uint32, int32 or float32)")]
    UnknownDataType(String),

    #[error("parameter '{name}' at address {address} has invalid scale factor {scale} (must be non-zero and finite)")]
    InvalidScale {
        name: String,
        address: u16,
        scale: f64,
    },

    #[error("parameter at address {address} has an empty name")]
    EmptyName { address: u16 },

    #[error("device '{device}': parameters '{first}' and '{second}' overlap at register {address}")]
    AddressOverlap {
        device: String,
        first: String,
        second: String,
        address: u16,
    },

    #[error("devices '{first}' and '{second}' share bus unit id {unit_id} on one transport")]
    DuplicateUnitId {
        first: String,
        second: String,
        unit_id: u8,
    },

    #[error("parameter '{name}': register range starting at {address} runs past address 65535")]
    AddressOutOfRange { name: String, address: u64 },

    #[error("device '{device}': invalid register address key '{address}'")]
    InvalidAddress { device: String, address: String },

    #[error("device '{0}' has no parameters configured")]
    EmptyDevice(String),

    #[error("no devices configured")]
    EmptyFleet,

    #[error("transport is not configured (set [transport] or run with --simulate)")]
    MissingTransport,

    #[error("failed to load configuration: {0}")]
    Load(String),
}

/// Per-read transport failures. Isolated to the read that raised them.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("short response: requested {requested} registers, received {received}")]
    ShortResponse { requested: u16, received: usize },

    #[error("modbus exception {code:#04x} from unit {unit_id}")]
    Exception { unit_id: u8, code: u8 },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unit {0} is not reachable on this bus")]
    UnknownUnit(u8),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Per-parameter decode failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("insufficient registers for {data_type}: expected {expected}, got {got}")]
    InsufficientRegisters {
        data_type: &'static str,
        expected: u16,
        got: usize,
    },

    #[error("non-finite float32 value (bits {bits:#010x})")]
    NonFinite { bits: u32 },
}
