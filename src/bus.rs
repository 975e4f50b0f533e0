//! Bus client abstraction and the in-memory simulated bus.
//!
//! The engine is transport-agnostic: everything it needs from the physical
//! bus is one primitive, "read N consecutive holding registers starting at
//! address A from unit S".

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::TransportError;

/// Capability consumed by the poller: a single register-read primitive.
///
/// Implementations are serial-RTU, Modbus/TCP or simulated; the engine does
/// not care which. Reads are serialized by construction — the scheduler is
/// the only caller and never issues a second read before the first resolves.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Read `count` consecutive holding registers starting at `address`
    /// from unit `unit_id`. Returns exactly `count` words on success.
    async fn read_registers(
        &self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;
}

/// In-memory bus holding per-unit register maps, with fault injection.
///
/// Used by the test suite and by `--simulate` runs against a synthetic
/// fleet. Missing registers read as zero, matching a typical slave that
/// exposes a contiguous block.
#[derive(Default)]
pub struct SimulatedBus {
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    units: HashMap<u8, HashMap<u16, u16>>,
    offline: Vec<u8>,
    // unit ids whose responses are truncated to one word
    short_response: Vec<u8>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one register on a unit, creating the unit if needed.
    pub fn set_register(&self, unit_id: u8, address: u16, value: u16) {
        let mut state = self.state.lock().expect("simulated bus poisoned");
        state.units.entry(unit_id).or_default().insert(address, value);
    }

    /// Store a 32-bit value across two registers, high word first.
    pub fn set_u32(&self, unit_id: u8, address: u16, value: u32) {
        self.set_register(unit_id, address, (value >> 16) as u16);
        self.set_register(unit_id, address + 1, (value & 0xFFFF) as u16);
    }

    /// Store an IEEE-754 float32 across two registers, high word first.
    pub fn set_f32(&self, unit_id: u8, address: u16, value: f32) {
        self.set_u32(unit_id, address, value.to_bits());
    }

    /// Make a unit stop answering (simulates a powered-off device).
    pub fn set_offline(&self, unit_id: u8, offline: bool) {
        let mut state = self.state.lock().expect("simulated bus poisoned");
        state.offline.retain(|&u| u != unit_id);
        if offline {
            state.offline.push(unit_id);
        }
    }

    /// Make a unit return truncated (single-word) responses.
    pub fn set_short_response(&self, unit_id: u8, short: bool) {
        let mut state = self.state.lock().expect("simulated bus poisoned");
        state.short_response.retain(|&u| u != unit_id);
        if short {
            state.short_response.push(unit_id);
        }
    }
}

#[async_trait]
impl BusClient for SimulatedBus {
    async fn read_registers(
        &self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let state = self.state.lock().expect("simulated bus poisoned");
        if state.offline.contains(&unit_id) {
            return Err(TransportError::Connection(format!(
                "unit {unit_id} did not respond"
            )));
        }
        let registers = state
            .units
            .get(&unit_id)
            .ok_or(TransportError::UnknownUnit(unit_id))?;

        let mut words: Vec<u16> = (0..count)
            .map(|i| registers.get(&(address + i)).copied().unwrap_or(0))
            .collect();
        if state.short_response.contains(&unit_id) {
            words.truncate(1);
        }
        Ok(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_back_stored_registers() {
        let bus = SimulatedBus::new();
        bus.set_register(1, 10, 123);
        bus.set_u32(1, 20, 0x0001_0002);

        assert_eq!(bus.read_registers(1, 10, 1).await.unwrap(), vec![123]);
        assert_eq!(bus.read_registers(1, 20, 2).await.unwrap(), vec![1, 2]);
        // unset registers read as zero
        assert_eq!(bus.read_registers(1, 500, 1).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn offline_unit_fails_with_connection_error() {
        let bus = SimulatedBus::new();
        bus.set_register(2, 0, 7);
        bus.set_offline(2, true);
        let err = bus.read_registers(2, 0, 1).await.unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)));

        bus.set_offline(2, false);
        assert_eq!(bus.read_registers(2, 0, 1).await.unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn unknown_unit_fails() {
        let bus = SimulatedBus::new();
        let err = bus.read_registers(9, 0, 1).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownUnit(9)));
    }

    #[tokio::test]
    async fn short_response_truncates() {
        let bus = SimulatedBus::new();
        bus.set_f32(3, 0, 1.5);
        bus.set_short_response(3, true);
        let words = bus.read_registers(3, 0, 2).await.unwrap();
        assert_eq!(words.len(), 1);
    }
}
