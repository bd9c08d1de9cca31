//! Periodic telemetry jobs
//!
//! Each run collects fresh snapshots and dispatches them. Collection and
//! dispatch failures are logged; the job stays scheduled either way.

use crate::broker::dispatch::{DispatchClient, DispatchOutcome, TaskPublisher};
use crate::collectors::{DeviceSource, GrainbinSource};
use crate::scheduler::{Job, JobControl};
use crate::{DEVICE_UPDATE_TASK, GRAINBIN_UPDATE_TASK};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Sends one `device.update` per run and waits for the broker's ack
pub struct DeviceUpdateJob<D, P> {
    source: D,
    client: Arc<DispatchClient<P>>,
    last_outcome: Option<DispatchOutcome>,
}

impl<D: DeviceSource, P: TaskPublisher> DeviceUpdateJob<D, P> {
    pub fn new(source: D, client: Arc<DispatchClient<P>>) -> Self {
        Self {
            source,
            client,
            last_outcome: None,
        }
    }

    pub fn last_outcome(&self) -> Option<DispatchOutcome> {
        self.last_outcome
    }
}

#[async_trait]
impl<D: DeviceSource, P: TaskPublisher> Job for DeviceUpdateJob<D, P> {
    fn name(&self) -> &str {
        DEVICE_UPDATE_TASK
    }

    async fn run(&mut self) -> JobControl {
        let snapshot = match self.source.device_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Could not collect device snapshot: {}", e);
                return JobControl::Continue;
            }
        };

        let outcome = self.client.send(DEVICE_UPDATE_TASK, snapshot, true).await;
        if outcome.is_delivered() {
            info!("Sent device update");
        }
        self.last_outcome = Some(outcome);
        JobControl::Continue
    }
}

/// Sends one `grainbin.update` per connected bin, fire-and-forget
pub struct GrainbinUpdateJob<G, P> {
    source: G,
    client: Arc<DispatchClient<P>>,
    last_outcomes: Vec<DispatchOutcome>,
}

impl<G: GrainbinSource, P: TaskPublisher> GrainbinUpdateJob<G, P> {
    pub fn new(source: G, client: Arc<DispatchClient<P>>) -> Self {
        Self {
            source,
            client,
            last_outcomes: Vec::new(),
        }
    }

    /// Outcomes of the latest run, one per dispatched bin
    pub fn last_outcomes(&self) -> &[DispatchOutcome] {
        &self.last_outcomes
    }
}

#[async_trait]
impl<G: GrainbinSource, P: TaskPublisher> Job for GrainbinUpdateJob<G, P> {
    fn name(&self) -> &str {
        GRAINBIN_UPDATE_TASK
    }

    async fn run(&mut self) -> JobControl {
        self.last_outcomes.clear();

        let snapshots = match self.source.grainbin_snapshots().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!("Could not collect grainbin snapshots: {}", e);
                return JobControl::Continue;
            }
        };

        if snapshots.is_empty() {
            warn!("No grainbin connected, nothing to send");
            return JobControl::Continue;
        }

        for snapshot in snapshots {
            let outcome = self.client.send(GRAINBIN_UPDATE_TASK, snapshot, false).await;
            self.last_outcomes.push(outcome);
        }

        let delivered = self.last_outcomes.iter().filter(|o| o.is_delivered()).count();
        info!("Sent {}/{} grainbin updates", delivered, self.last_outcomes.len());
        JobControl::Continue
    }
}
