//! Builder wiring configuration into a running balancer.

use std::sync::Arc;

use anyhow::Context as _;

use crate::config::{DispatcherConfig, TaskLogConfig};
use crate::core::error::AppResult;
use crate::core::handler::HandlerRegistry;
use crate::scheduler::Balancer;
use crate::store::{FileTaskLog, MemoryTaskLog, TaskLog};
use crate::worker::launcher::{InProcessLauncher, WorkerLauncher};

/// Assembles a [`Balancer`] from configuration and a handler registry.
///
/// By default the task log backend comes from `config.task_log` and the
/// launcher from `config.worker`: a configured worker command yields process
/// workers, no worker section yields in-process ones. Both can be overridden
/// for embedding and tests.
pub struct BalancerBuilder {
    config: DispatcherConfig,
    registry: Arc<HandlerRegistry>,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    log: Option<Arc<dyn TaskLog>>,
}

impl BalancerBuilder {
    /// Start from `config`, executing the handlers in `registry`.
    #[must_use]
    pub fn new(config: DispatcherConfig, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            config,
            registry,
            launcher: None,
            log: None,
        }
    }

    /// Use `launcher` instead of the configured worker backend.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Use `log` instead of the configured task log backend.
    #[must_use]
    pub fn with_task_log(mut self, log: Arc<dyn TaskLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Validate the configuration and start the engine.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> AppResult<Balancer> {
        self.config
            .validate()
            .map_err(|e| anyhow::anyhow!("config invalid: {e}"))?;
        let config = Arc::new(self.config);

        let log: Arc<dyn TaskLog> = match self.log {
            Some(log) => log,
            None => match &config.task_log {
                TaskLogConfig::Memory => Arc::new(MemoryTaskLog::new()),
                TaskLogConfig::File { dir } => Arc::new(
                    FileTaskLog::open(dir)
                        .with_context(|| format!("opening task log in {}", dir.display()))?,
                ),
            },
        };

        let launcher: Arc<dyn WorkerLauncher> = match self.launcher {
            Some(launcher) => launcher,
            None => match config.worker.clone() {
                Some(worker) => process_launcher(worker, &config)?,
                None => Arc::new(
                    InProcessLauncher::new(Arc::clone(&self.registry)).with_timeouts(
                        config.checkin_timeout(),
                        config.control_call_timeout(),
                    ),
                ),
            },
        };

        let balancer = Balancer::start(config, self.registry, launcher, log)?;
        Ok(balancer)
    }
}

#[cfg(unix)]
fn process_launcher(
    worker: crate::config::WorkerSpawnConfig,
    config: &DispatcherConfig,
) -> AppResult<Arc<dyn WorkerLauncher>> {
    let launcher = crate::worker::launcher::ProcessLauncher::bind(
        worker,
        config.checkin_timeout(),
        config.control_call_timeout(),
    )?;
    Ok(Arc::new(launcher))
}

#[cfg(not(unix))]
fn process_launcher(
    _worker: crate::config::WorkerSpawnConfig,
    _config: &DispatcherConfig,
) -> AppResult<Arc<dyn WorkerLauncher>> {
    anyhow::bail!("process workers require unix domain sockets on this platform")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_is_rejected() {
        let config = DispatcherConfig {
            checkin_timeout_ms: 0,
            ..DispatcherConfig::default()
        };
        let registry = Arc::new(HandlerRegistry::new());
        let err = BalancerBuilder::new(config, registry).build().unwrap_err();
        assert!(err.to_string().contains("config invalid"));
    }
}
