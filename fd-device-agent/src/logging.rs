//! Log subscriber setup
//!
//! The subscriber is installed before the configuration is read, with a
//! bootstrap filter, so warnings raised while loading it are not lost. Once
//! the configuration is known its filter replaces the bootstrap one, unless
//! `RUST_LOG` was set.

use crate::config::AgentConfig;
use tracing::{warn, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Filter in effect until the configuration has been loaded
pub const BOOTSTRAP_FILTER: &str = "fd_device_agent=info,lapin=warn";

/// Swaps the active filter once the configuration is known
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    from_env: bool,
}

impl LogHandle {
    /// Switch to the configured filter; a `RUST_LOG` filter is kept as is
    pub fn apply_config(&self, config: &AgentConfig) -> Result<(), reload::Error> {
        if self.from_env {
            return Ok(());
        }

        let filter = EnvFilter::try_new(config.log_filter()).unwrap_or_else(|e| {
            warn!("Invalid log filter '{}': {}", config.log_filter(), e);
            EnvFilter::new(BOOTSTRAP_FILTER)
        });
        self.filter.reload(filter)
    }
}

/// Subscriber writing to `writer`, filtered by `env_filter` or the bootstrap
/// filter until `LogHandle::apply_config` runs
pub fn build<W>(writer: W, env_filter: Option<EnvFilter>) -> (impl Subscriber + Send + Sync + 'static, LogHandle)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let from_env = env_filter.is_some();
    let filter = env_filter.unwrap_or_else(|| EnvFilter::new(BOOTSTRAP_FILTER));
    let (filter, handle) = reload::Layer::new(filter);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer));

    (
        subscriber,
        LogHandle {
            filter: handle,
            from_env,
        },
    )
}

/// Install the global subscriber on stdout
pub fn init() -> Result<LogHandle, TryInitError> {
    let (subscriber, handle) = build(std::io::stdout, EnvFilter::try_from_default_env().ok());
    subscriber.try_init()?;
    Ok(handle)
}
