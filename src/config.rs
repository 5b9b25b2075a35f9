//! Engine configuration.
//!
//! All knobs have conservative defaults sized for a small provisioning
//! deployment; builders override individual fields.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Tunable parameters for [`crate::Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Provisioning operations a single backend box handles comfortably.
    /// The global pool is derived from this.
    pub box_parallelism: usize,
    /// Concurrent operations allowed per tenant.
    pub tenant_pool_size: usize,
    /// How long an operation may stay active before it is forced to
    /// `TimedOut`.
    pub operation_ttl: Duration,
    /// How long a stopped process gets to exit on SIGTERM before it is
    /// killed.
    pub stop_grace_period: Duration,
    /// Interval of the background deadline sweep.
    pub sweep_interval: Duration,
    /// How often watchers scan their response directory.
    pub directory_poll_interval: Duration,
    /// Delay between the consecutive length polls of the write stability
    /// check.
    pub stability_poll_delay: Duration,
    /// Watcher timeout used when no per-kind override exists.
    pub default_watcher_timeout: Duration,
    /// Per-handler-kind watcher timeout overrides.
    pub watcher_timeouts: HashMap<String, Duration>,
    /// Directory holding durable records of armed watchers.
    pub handler_state_dir: PathBuf,
    /// Directory external scripts write result files into.
    pub response_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            box_parallelism: 2,
            tenant_pool_size: 5,
            operation_ttl: Duration::from_secs(3 * 60 * 60),
            stop_grace_period: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(30),
            directory_poll_interval: Duration::from_secs(2),
            stability_poll_delay: Duration::from_millis(500),
            default_watcher_timeout: Duration::from_secs(30 * 60),
            watcher_timeouts: HashMap::new(),
            handler_state_dir: PathBuf::from("/var/lib/operon/handlers"),
            response_dir: PathBuf::from("/var/lib/operon/responses"),
        }
    }
}

impl EngineConfig {
    /// Size of the global pool: three operations per backend box keeps the
    /// boxes busy without letting bursts swamp them.
    pub fn global_pool_size(&self) -> usize {
        self.box_parallelism.saturating_mul(3).max(1)
    }

    /// Watcher timeout for a handler kind, falling back to the default.
    pub fn watcher_timeout(&self, kind: &str) -> Duration {
        self.watcher_timeouts
            .get(kind)
            .copied()
            .unwrap_or(self.default_watcher_timeout)
    }

    pub fn with_box_parallelism(mut self, boxes: usize) -> Self {
        self.box_parallelism = boxes;
        self
    }

    pub fn with_tenant_pool_size(mut self, size: usize) -> Self {
        self.tenant_pool_size = size;
        self
    }

    pub fn with_operation_ttl(mut self, ttl: Duration) -> Self {
        self.operation_ttl = ttl;
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_directory_poll_interval(mut self, interval: Duration) -> Self {
        self.directory_poll_interval = interval;
        self
    }

    pub fn with_stability_poll_delay(mut self, delay: Duration) -> Self {
        self.stability_poll_delay = delay;
        self
    }

    pub fn with_default_watcher_timeout(mut self, timeout: Duration) -> Self {
        self.default_watcher_timeout = timeout;
        self
    }

    /// Overrides the watcher timeout for one handler kind.
    pub fn with_watcher_timeout(mut self, kind: impl Into<String>, timeout: Duration) -> Self {
        self.watcher_timeouts.insert(kind.into(), timeout);
        self
    }

    pub fn with_handler_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.handler_state_dir = dir.into();
        self
    }

    pub fn with_response_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.response_dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_pool_scales_with_box_parallelism() {
        assert_eq!(EngineConfig::default().global_pool_size(), 6);
        assert_eq!(
            EngineConfig::default()
                .with_box_parallelism(4)
                .global_pool_size(),
            12
        );
        // A zero-box configuration still admits one operation.
        assert_eq!(
            EngineConfig::default()
                .with_box_parallelism(0)
                .global_pool_size(),
            1
        );
    }

    #[test]
    fn watcher_timeout_prefers_the_per_kind_override() {
        let config = EngineConfig::default()
            .with_default_watcher_timeout(Duration::from_secs(600))
            .with_watcher_timeout("terminate", Duration::from_secs(60));

        assert_eq!(config.watcher_timeout("terminate"), Duration::from_secs(60));
        assert_eq!(config.watcher_timeout("deploy"), Duration::from_secs(600));
    }
}
