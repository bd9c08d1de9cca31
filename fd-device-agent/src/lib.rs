//! fd-device agent - broker discovery and telemetry dispatch for field devices
//!
//! The agent runs on a monitoring device and reports to the Farm Monitor server
//! through its message broker:
//! - Broker address resolution (override, last known, DNS candidates, broadcast presence)
//! - Bounded-timeout reachability probes and task dispatch
//! - Periodic device and grainbin telemetry jobs
//!
//! Sensor access and persistence are thin collaborators behind traits, so the
//! resolution and dispatch logic can be exercised with in-memory doubles.

pub mod broker;
pub mod collectors;
pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod resolver;
pub mod scheduler;
pub mod snapshot;

pub use broker::dispatch::{DispatchClient, DispatchOutcome, AmqpPublisher, TaskMessage, TaskPublisher};
pub use broker::probe::{BrokerProbe, Probe, ProbeResult};
pub use config::AgentConfig;
pub use discovery::{DiscoveryListener, ListenOutcome};
pub use endpoint::{Endpoint, EndpointRecord, EndpointStore, JsonFileStore, MemoryStore};
pub use error::{CollectError, ConfigError, DiscoveryError, PublishError, ResolveError, StoreError};
pub use resolver::{AddressResolver, HostLookup, Resolution, Stage, SystemLookup};
pub use scheduler::{Alignment, Clock, Job, JobControl, ScheduledJob, Scheduler, SystemClock};
pub use snapshot::Snapshot;

/// Task name for the device identity/temperature update
pub const DEVICE_UPDATE_TASK: &str = "device.update";

/// Task name for per-bus grainbin updates
pub const GRAINBIN_UPDATE_TASK: &str = "grainbin.update";

/// Default broker port
pub const DEFAULT_BROKER_PORT: u16 = 5672;

/// Default UDP port the server's presence notifier broadcasts on
pub const DEFAULT_PRESENCE_PORT: u16 = 5554;
