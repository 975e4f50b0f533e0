//! Per-device polling: one pass over a device's parameter set.
//!
//! The poller is stateless between polls. It borrows the device spec and
//! the bus for one invocation, records a value-or-reason outcome for every
//! parameter and never retries — retry policy belongs to the layer above.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::bus::BusClient;
use crate::decode;
use crate::error::{DecodeError, TransportError};
use crate::point::{DeviceSpec, ParameterSpec};

/// A successfully decoded parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedValue {
    pub name: String,
    pub unit: String,
    pub raw_words_consumed: u16,
    pub value: f64,
}

/// Outcome of one parameter read. Every parameter gets exactly one of these
/// per cycle; silence is a defect.
#[derive(Debug, Clone)]
pub enum Outcome {
    Ok(DecodedValue),
    TransportError(TransportError),
    DecodeError(DecodeError),
    InsufficientRegisters { expected: u16, got: usize },
}

impl Outcome {
    /// Stable tag for logs and metrics.
    pub fn tag(&self) -> &'static str {
        match self {
            Outcome::Ok(_) => "ok",
            Outcome::TransportError(_) => "transport_error",
            Outcome::DecodeError(_) => "decode_error",
            Outcome::InsufficientRegisters { .. } => "insufficient_registers",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }
}

/// Per-device result of one poll cycle. Created fresh each cycle, immutable
/// once populated, consumed by the sink and discarded.
#[derive(Debug, Clone)]
pub struct PollResult {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    /// Outcomes in declared parameter order.
    pub outcomes: Vec<(ParameterSpec, Outcome)>,
}

impl PollResult {
    pub fn ok_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_ok()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.ok_count()
    }

    /// Iterator over successfully decoded values, in declared order.
    pub fn values(&self) -> impl Iterator<Item = &DecodedValue> {
        self.outcomes.iter().filter_map(|(_, o)| match o {
            Outcome::Ok(v) => Some(v),
            _ => None,
        })
    }
}

/// Polls one device's parameters sequentially over the shared bus.
#[derive(Debug, Clone, Copy)]
pub struct DevicePoller {
    /// Upper bound on a single register read.
    pub read_timeout: Duration,
    /// Spacing between parameter reads, to respect bus turnaround timing.
    pub read_delay: Duration,
}

impl DevicePoller {
    pub fn new(read_timeout: Duration, read_delay: Duration) -> Self {
        Self {
            read_timeout,
            read_delay,
        }
    }

    /// Read and decode every parameter of `device`. A failing parameter is
    /// recorded and skipped; it never aborts the rest of the device.
    pub async fn poll(&self, device: &DeviceSpec, bus: &dyn BusClient) -> PollResult {
        let mut outcomes = Vec::with_capacity(device.parameters.len());

        for (i, param) in device.parameters.iter().enumerate() {
            if i > 0 && !self.read_delay.is_zero() {
                tokio::time::sleep(self.read_delay).await;
            }
            let outcome = self.read_parameter(device, param, bus).await;
            match &outcome {
                Outcome::Ok(v) => {
                    debug!(
                        device = %device.device_id,
                        name = %v.name,
                        value = v.value,
                        unit = %v.unit,
                        "parameter read"
                    );
                }
                other => {
                    warn!(
                        device = %device.device_id,
                        name = %param.name,
                        address = param.address,
                        outcome = other.tag(),
                        "parameter read failed"
                    );
                }
            }
            outcomes.push((param.clone(), outcome));
        }

        PollResult {
            device_id: device.device_id.clone(),
            timestamp: Utc::now(),
            outcomes,
        }
    }

    async fn read_parameter(
        &self,
        device: &DeviceSpec,
        param: &ParameterSpec,
        bus: &dyn BusClient,
    ) -> Outcome {
        let count = param.data_type.register_count();

        let read = bus.read_registers(device.unit_id, param.address, count);
        let words = match tokio::time::timeout(self.read_timeout, read).await {
            Ok(Ok(words)) => words,
            Ok(Err(e)) => return Outcome::TransportError(e),
            Err(_) => {
                return Outcome::TransportError(TransportError::Timeout(self.read_timeout))
            }
        };

        // RawWords carry exactly the requested count; any mismatch is
        // reported, never trimmed or padded into a best-effort decode.
        if words.len() != count as usize {
            return Outcome::InsufficientRegisters {
                expected: count,
                got: words.len(),
            };
        }

        match decode::decode(&words, param.data_type, param.scale) {
            Ok(value) => Outcome::Ok(DecodedValue {
                name: param.name.clone(),
                unit: param.unit.clone(),
                raw_words_consumed: count,
                value,
            }),
            Err(e) => Outcome::DecodeError(e),
        }
    }
}
