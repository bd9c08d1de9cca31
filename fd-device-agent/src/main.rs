//! fd-device agent - field device supervisor
//!
//! Startup sequence:
//! - Load configuration and initialize logging
//! - Refuse to run on a device that was never set up
//! - Resolve the broker address (override, last known, DNS, broadcast)
//! - Run the telemetry scheduler until interrupted

use anyhow::{Context, Result};
use fd_device_agent::collectors::{DeviceCollector, GrainbinCollector, OwfsReader, W1Thermometer};
use fd_device_agent::jobs::{DeviceUpdateJob, GrainbinUpdateJob};
use fd_device_agent::{
    logging, AddressResolver, AgentConfig, AmqpPublisher, Alignment, BrokerProbe, DispatchClient, JsonFileStore,
    Resolution, ScheduledJob, Scheduler, SystemClock, SystemLookup,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Interval jobs for the resolved broker
fn build_jobs(config: &AgentConfig, publisher: AmqpPublisher) -> Vec<ScheduledJob> {
    let client = Arc::new(DispatchClient::new(publisher, config.broker.dispatch_timeout()));
    let alignment = if config.schedule.align_to_minute {
        Alignment::MinuteStart
    } else {
        Alignment::None
    };

    let device = DeviceCollector::new(
        config.device.clone(),
        config.grainbin.bins.len(),
        W1Thermometer::new(&config.device.w1_devices_dir),
    );
    let grainbins = GrainbinCollector::new(config.grainbin.bins.clone(), OwfsReader::new(&config.grainbin.owfs_root));

    let mut jobs = vec![ScheduledJob::new(
        config.schedule.device_update_interval(),
        DeviceUpdateJob::new(device, client.clone()),
    )
    .aligned(alignment)
    .run_at_startup()];

    if config.grainbin.bins.is_empty() {
        info!("No grainbins configured, skipping grainbin updates");
    } else {
        jobs.push(
            ScheduledJob::new(
                config.schedule.grainbin_update_interval(),
                GrainbinUpdateJob::new(grainbins, client),
            )
            .aligned(alignment),
        );
    }

    jobs
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    let logging = logging::init().context("Failed to initialize logging")?;
    if let Err(e) = dotenv {
        if !e.not_found() {
            warn!("Ignoring unreadable .env file: {}", e);
        }
    }

    let config = AgentConfig::load().await.context("Failed to load configuration")?;
    logging.apply_config(&config).context("Failed to apply the configured log filter")?;

    info!("fd-device agent v{} starting ({:?})", env!("CARGO_PKG_VERSION"), config.environment);

    if !config.is_setup() {
        error!("Device has not been setup. Set device.id in the configuration before starting the agent");
        std::process::exit(1);
    }

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                interrupt.cancel();
            }
            Err(e) => warn!("Cannot listen for interrupts: {}", e),
        }
    });

    let store = JsonFileStore::new(&config.storage.state_path);
    let resolver = AddressResolver::new(
        config.broker.clone(),
        config.discovery.clone(),
        BrokerProbe::new(config.broker.clone()),
        SystemLookup,
        store,
        token.clone(),
    );

    let endpoint = match resolver.resolve().await.context("Broker address resolution failed")? {
        Resolution::Resolved { endpoint, stage } => {
            info!("Using broker at {} (found via {})", endpoint, stage);
            endpoint
        }
        Resolution::Unresolved => {
            error!("Could not find the FarmMonitor broker, not starting the scheduler");
            std::process::exit(1);
        }
    };

    let publisher = AmqpPublisher::new(
        endpoint,
        config.broker.exchange.clone(),
        config.broker.routing_key.clone(),
        config.broker.heartbeat(),
    );
    let jobs = build_jobs(&config, publisher);

    let scheduler = Scheduler::new(SystemClock, token.clone());
    let handle = tokio::spawn(async move { scheduler.run(jobs).await });

    handle.await.context("Scheduler task failed")?;
    info!("fd-device agent stopped");
    Ok(())
}
