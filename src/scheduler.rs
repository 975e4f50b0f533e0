//! Fleet scheduling: the fixed-interval poll loop over all devices.
//!
//! The scheduler exclusively owns the bus handle for the process lifetime
//! and is the single caller issuing reads, so bus access is serialized by
//! construction. Devices are polled in configured order; one device's
//! failure never delays the rest beyond its own bounded reads.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bus::BusClient;
use crate::error::ConfigError;
use crate::point::{self, DeviceSpec};
use crate::poller::{DevicePoller, PollResult};
use crate::sink::Sink;

/// Timing knobs for the poll loop.
#[derive(Debug, Clone, Copy)]
pub struct PollTiming {
    /// Cycle cadence. If a cycle overruns, the next one starts immediately
    /// after completion; cycles never overlap.
    pub interval: Duration,
    /// Upper bound on a single register read.
    pub read_timeout: Duration,
    /// Spacing between parameter reads within a device.
    pub read_delay: Duration,
    /// Spacing between devices.
    pub device_delay: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            read_timeout: Duration::from_secs(3),
            read_delay: Duration::from_millis(50),
            device_delay: Duration::from_millis(500),
        }
    }
}

/// Per-device success counts for one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStats {
    pub device_id: String,
    pub ok: usize,
    pub failed: usize,
}

/// Aggregated statistics for one completed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleStats {
    pub cycle: u64,
    pub ok_parameters: usize,
    pub failed_parameters: usize,
    pub elapsed_ms: u64,
    pub devices: Vec<DeviceStats>,
}

/// Drives the poll loop over an immutable device snapshot.
///
/// Reconfiguration means building a new scheduler from a new snapshot; the
/// device list never mutates mid-cycle.
pub struct FleetScheduler {
    devices: Vec<DeviceSpec>,
    poller: DevicePoller,
    timing: PollTiming,
    bus: Arc<dyn BusClient>,
    sink: Arc<dyn Sink>,
    cycle: u64,
}

impl FleetScheduler {
    /// Build a scheduler, validating fleet-level invariants (duplicate unit
    /// ids are a fatal configuration error, not a runtime surprise).
    pub fn new(
        devices: Vec<DeviceSpec>,
        timing: PollTiming,
        bus: Arc<dyn BusClient>,
        sink: Arc<dyn Sink>,
    ) -> Result<Self, ConfigError> {
        point::validate_fleet(&devices)?;
        Ok(Self {
            devices,
            poller: DevicePoller::new(timing.read_timeout, timing.read_delay),
            timing,
            bus,
            sink,
            cycle: 0,
        })
    }

    pub fn devices(&self) -> &[DeviceSpec] {
        &self.devices
    }

    /// Poll every device once, in configured order, and aggregate stats.
    pub async fn run_cycle(&mut self) -> (Vec<PollResult>, CycleStats) {
        self.cycle_inner(&CancellationToken::new()).await
    }

    async fn cycle_inner(&mut self, shutdown: &CancellationToken) -> (Vec<PollResult>, CycleStats) {
        self.cycle += 1;
        let started = Instant::now();
        let mut batch = Vec::with_capacity(self.devices.len());
        let mut devices = Vec::with_capacity(self.devices.len());

        for (i, device) in self.devices.iter().enumerate() {
            if i > 0 {
                if !self.timing.device_delay.is_zero() {
                    tokio::time::sleep(self.timing.device_delay).await;
                }
                // Shutdown lands between devices; the in-flight read always
                // resolves first, bounded by the read timeout.
                if shutdown.is_cancelled() {
                    break;
                }
            }

            let result = self.poller.poll(device, self.bus.as_ref()).await;
            info!(
                device = %device.device_id,
                ok = result.ok_count(),
                total = result.outcomes.len(),
                "device polled"
            );
            devices.push(DeviceStats {
                device_id: result.device_id.clone(),
                ok: result.ok_count(),
                failed: result.failed_count(),
            });
            batch.push(result);
        }

        let stats = CycleStats {
            cycle: self.cycle,
            ok_parameters: devices.iter().map(|d| d.ok).sum(),
            failed_parameters: devices.iter().map(|d| d.failed).sum(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            devices,
        };
        (batch, stats)
    }

    /// Run cycles at the configured interval until `shutdown` is cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.timing.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            devices = self.devices.len(),
            interval_ms = self.timing.interval.as_millis() as u64,
            "fleet scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let (batch, stats) = self.cycle_inner(&shutdown).await;
            if let Err(e) = self.sink.publish(&batch, &stats).await {
                error!(cycle = stats.cycle, error = %e, "sink publish failed");
            }
            info!(
                cycle = stats.cycle,
                ok = stats.ok_parameters,
                failed = stats.failed_parameters,
                elapsed_ms = stats.elapsed_ms,
                "cycle complete"
            );

            if shutdown.is_cancelled() {
                break;
            }
        }

        info!("fleet scheduler stopped");
    }
}
