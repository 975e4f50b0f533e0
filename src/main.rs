//! pollsrv binary: load configuration, wire the bus and sink, run the
//! fleet scheduler until shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pollsrv::bus::{BusClient, SimulatedBus};
use pollsrv::config::AppConfig;
use pollsrv::error::ConfigError;
use pollsrv::point::{DataType, DeviceSpec};
use pollsrv::scheduler::FleetScheduler;
use pollsrv::sink::{InfluxSink, LogSink, Sink};
use pollsrv::tcp::ModbusTcpClient;

#[derive(Parser, Debug)]
#[command(name = "pollsrv", about = "Modbus register polling service")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "POLLSRV_CONFIG", default_value = "pollsrv.yaml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,

    /// Poll an in-memory simulated bus instead of a real transport
    #[arg(long)]
    simulate: bool,

    /// Run a single cycle and exit
    #[arg(long)]
    oneshot: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let fleet = config.build_fleet()?;
    info!(
        devices = fleet.len(),
        parameters = fleet.iter().map(|d| d.parameters.len()).sum::<usize>(),
        "configuration loaded"
    );

    if args.validate {
        println!("configuration OK: {} device(s)", fleet.len());
        return Ok(());
    }

    let bus: Arc<dyn BusClient> = if args.simulate {
        info!("running against simulated bus");
        Arc::new(seed_simulated_bus(&fleet))
    } else {
        let transport = config
            .transport
            .as_ref()
            .ok_or(ConfigError::MissingTransport)?;
        Arc::new(ModbusTcpClient::connect(&transport.host, transport.port).await?)
    };

    let sink: Arc<dyn Sink> = match &config.influx {
        Some(influx) => {
            info!(url = %influx.url, bucket = %influx.bucket, "writing to influx");
            Arc::new(InfluxSink::new(
                &influx.url,
                &influx.org,
                &influx.bucket,
                influx.token.clone(),
                influx.measurement.clone(),
            ))
        }
        None => Arc::new(LogSink),
    };

    let mut scheduler = FleetScheduler::new(fleet, config.timing(), bus, sink.clone())?;

    if args.oneshot {
        let (batch, stats) = scheduler.run_cycle().await;
        sink.publish(&batch, &stats).await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    scheduler.run(shutdown).await;
    Ok(())
}

/// Populate a simulated bus with plausible values for every configured
/// parameter, so `--simulate` exercises the full decode path.
fn seed_simulated_bus(fleet: &[DeviceSpec]) -> SimulatedBus {
    let bus = SimulatedBus::new();
    for device in fleet {
        for param in &device.parameters {
            match param.data_type {
                DataType::Uint16 | DataType::Int16 => {
                    bus.set_register(device.unit_id, param.address, 1234)
                }
                DataType::Uint32 | DataType::Int32 => {
                    bus.set_u32(device.unit_id, param.address, 123_456)
                }
                DataType::Float32 => bus.set_f32(device.unit_id, param.address, 56.78),
            }
        }
    }
    bus
}
