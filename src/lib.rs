//! pollsrv — Modbus register polling and decoding engine.
//!
//! Polls a fleet of Modbus slave devices sharing one transport, reads
//! holding registers per configured parameter, decodes raw words into
//! scaled engineering values and hands per-cycle batches to a time-series
//! sink. Transport access is a single injected capability
//! ([`bus::BusClient`]); the decode path is pure and testable without any
//! hardware.

pub mod bus;
pub mod config;
pub mod decode;
pub mod error;
pub mod point;
pub mod poller;
pub mod scheduler;
pub mod sink;
pub mod tcp;

pub use bus::{BusClient, SimulatedBus};
pub use config::AppConfig;
pub use error::{ConfigError, DecodeError, TransportError};
pub use point::{DataType, DeviceSpec, ParameterSpec};
pub use poller::{DecodedValue, DevicePoller, Outcome, PollResult};
pub use scheduler::{CycleStats, FleetScheduler, PollTiming};
pub use sink::{InfluxSink, LogSink, Sink};
pub use tcp::ModbusTcpClient;
