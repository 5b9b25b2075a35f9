//! The engine: one service object wiring the limiter, the process table,
//! the command runner, and the callback machinery together.
//!
//! # Example
//! ```no_run
//! use operon::{Engine, EngineConfig};
//!
//! # async fn demo() {
//! let engine = Engine::new(EngineConfig::default());
//! let trigger = engine
//!     .trigger("alice", vec!["occi".into(), "create".into()], None)
//!     .await
//!     .unwrap();
//! let record = trigger.handle.await.unwrap();
//! println!("finished: {}", record.status());
//! engine.shutdown().await;
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::callback::{
    CallbackHandler, CallbackRecord, CallbackRegistry, CallbackWatcher, HandlerFactory,
    RegistryError, RestoreCoordinator, WatcherHandle,
};
use crate::config::EngineConfig;
use crate::core::{BoxError, CompletionHandle, CorrelationId, LifecycleEvent, ProcessRecord, RequestId};
use crate::limiter::{ConcurrencyLimiter, PoolScope};
use crate::process::{CommandRunner, DeadlineSweeper, DeadlineSweeperHandle, ProcessTable, RunnerError};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// An operation with the same `{tenant, command}` identity is already
    /// active.
    #[error("operation already active: {0}")]
    Duplicate(RequestId),

    /// No active operation exists for the id.
    #[error("no active operation: {0}")]
    NotFound(RequestId),

    /// The command runner refused the submission.
    #[error("runner error")]
    Runner(#[from] RunnerError),

    /// Persisting the armed watcher failed.
    #[error("callback registry error")]
    Registry(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Describes the asynchronous business result an operation expects.
pub struct CallbackSpec {
    /// Receives the result file once it lands.
    pub handler: Arc<dyn CallbackHandler>,
    /// Overrides the configured watcher timeout for this operation.
    pub timeout: Option<Duration>,
    /// Opaque payload persisted alongside the watcher so the handler can be
    /// rebuilt after a restart.
    pub payload: serde_json::Value,
}

/// What a successful trigger hands back to the caller.
pub struct Trigger {
    /// Identity of the accepted operation.
    pub request_id: RequestId,
    /// Correlation token for the expected result file, if a callback was
    /// armed. External scripts name their result file after it.
    pub correlation_id: Option<CorrelationId>,
    /// Resolves with the terminal [`ProcessRecord`].
    pub handle: CompletionHandle,
}

/// Asynchronous infrastructure-operation engine.
///
/// # Lifecycle
/// 1. Create: `Engine::new(config)` (starts the deadline sweeper)
/// 2. Register factories: `.register_factory(...)` for every handler kind
/// 3. Recover: `.restore().await` re-arms watchers from durable records
/// 4. Serve: `.trigger(...)`, `.snapshot(...)`, `.stop(...)`, `.kill(...)`
/// 5. Shutdown: `.shutdown().await`
pub struct Engine {
    config: EngineConfig,
    limiter: Arc<ConcurrencyLimiter>,
    table: Arc<ProcessTable>,
    runner: CommandRunner,
    registry: Arc<CallbackRegistry>,
    restore: RestoreCoordinator,
    sweeper: DeadlineSweeperHandle,
    token: CancellationToken,
    watchers: tokio::sync::Mutex<Vec<WatcherHandle>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let limiter = Arc::new(ConcurrencyLimiter::new(
            config.global_pool_size(),
            config.tenant_pool_size,
        ));
        let table = Arc::new(ProcessTable::new(config.operation_ttl));
        let runner = CommandRunner::new(Arc::clone(&limiter), Arc::clone(&table))
            .with_grace_period(config.stop_grace_period);
        let registry = Arc::new(CallbackRegistry::new(config.handler_state_dir.clone()));
        let restore = RestoreCoordinator::new(Arc::clone(&registry))
            .with_poll_interval(config.directory_poll_interval)
            .with_stability_delay(config.stability_poll_delay);
        let sweeper = DeadlineSweeper::new(Arc::clone(&table))
            .with_poll_interval(config.sweep_interval)
            .start();

        info!(
            global_pool = config.global_pool_size(),
            tenant_pool = config.tenant_pool_size,
            "engine started"
        );

        Self {
            config,
            limiter,
            table,
            runner,
            registry,
            restore,
            sweeper,
            token: CancellationToken::new(),
            watchers: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Registers a handler factory for startup recovery. Must be called for
    /// every handler kind before [`Engine::restore`].
    pub fn register_factory(&mut self, factory: Arc<dyn HandlerFactory>) {
        self.restore.register(factory);
    }

    /// Re-arms watchers from durable records left by a previous run.
    /// Returns the number of watchers restored.
    pub async fn restore(&self) -> usize {
        let handles = self.restore.restore(&self.token).await;
        let count = handles.len();
        let mut watchers = self.watchers.lock().await;
        watchers.retain(|handle| !handle.is_finished());
        watchers.extend(handles);
        count
    }

    /// Submits an operation for execution under the tenant's pool.
    ///
    /// Accepts or rejects atomically against the operation's
    /// `{tenant, command}` identity, arms and persists the callback watcher
    /// if one is requested, then hands the command to the runner. The
    /// returned handle resolves once the operation reaches a terminal state.
    pub async fn trigger(
        &self,
        tenant: &str,
        command: Vec<String>,
        callback: Option<CallbackSpec>,
    ) -> Result<Trigger> {
        if command.is_empty() {
            return Err(RunnerError::EmptyCommand.into());
        }

        let request_id = RequestId::new(tenant, &command);
        if !self.table.start(&request_id, command.clone()) {
            return Err(EngineError::Duplicate(request_id));
        }

        let (tx, rx) = oneshot::channel();
        self.table
            .apply(&request_id, LifecycleEvent::AttachHandle(tx));

        let correlation_id = match callback {
            Some(spec) => match self.arm_callback(&request_id, spec).await {
                Ok(id) => Some(id),
                Err(err) => {
                    // The operation never ran; fail it so the key frees up.
                    self.table.apply(&request_id, LifecycleEvent::Failed);
                    return Err(err);
                }
            },
            None => None,
        };

        if let Err(err) = self.runner.run(request_id.clone(), command).await {
            self.table.apply(&request_id, LifecycleEvent::Failed);
            return Err(err.into());
        }

        Ok(Trigger {
            request_id,
            correlation_id,
            handle: rx,
        })
    }

    /// Persists and starts the watcher for one operation's expected result.
    async fn arm_callback(
        &self,
        request_id: &RequestId,
        spec: CallbackSpec,
    ) -> Result<CorrelationId> {
        let correlation_id = CorrelationId::generate();
        let timeout = spec
            .timeout
            .unwrap_or_else(|| self.config.watcher_timeout(spec.handler.kind()));

        self.table.arm_callback(request_id);

        // Persist before watching, so a crash between the two re-arms the
        // watcher instead of losing it.
        let record = CallbackRecord::new(
            self.config.response_dir.clone(),
            timeout,
            spec.handler.kind(),
            correlation_id,
            spec.payload,
        );
        self.registry.upsert(&record).await?;

        let handler = Arc::new(TrackingHandler {
            inner: spec.handler,
            table: Arc::clone(&self.table),
            id: request_id.clone(),
        });
        let watcher = CallbackWatcher::new(
            self.config.response_dir.clone(),
            timeout,
            correlation_id,
            handler,
            Arc::clone(&self.registry),
        )
        .with_poll_interval(self.config.directory_poll_interval)
        .with_stability_delay(self.config.stability_poll_delay);

        self.track(watcher.start(self.token.child_token())).await;

        Ok(correlation_id)
    }

    /// Keeps the handle of a live watcher, dropping handles of watchers
    /// that already finished so the set tracks live loops, not history.
    async fn track(&self, handle: WatcherHandle) {
        let mut watchers = self.watchers.lock().await;
        watchers.retain(|handle| !handle.is_finished());
        watchers.push(handle);
    }

    /// Snapshot of an operation: partial while running, terminal afterward.
    pub fn snapshot(&self, id: &RequestId) -> Option<ProcessRecord> {
        self.table.snapshot(id)
    }

    /// Requests graceful termination of an active operation.
    pub fn stop(&self, id: &RequestId) -> Result<()> {
        if !self.table.is_active(id) {
            return Err(EngineError::NotFound(id.clone()));
        }
        self.runner.stop(id);
        Ok(())
    }

    /// Requests forceful termination of an active operation.
    pub fn kill(&self, id: &RequestId) -> Result<()> {
        if !self.table.is_active(id) {
            return Err(EngineError::NotFound(id.clone()));
        }
        self.runner.kill(id);
        Ok(())
    }

    /// Resizes one of the pools at runtime. Applies to new submissions;
    /// operations already holding a slot are unaffected.
    pub async fn resize_pool(&self, scope: PoolScope, permits: usize) {
        self.limiter.resize(scope, permits).await;
    }

    /// Number of currently active operations.
    pub fn active_count(&self) -> usize {
        self.table.active_count()
    }

    /// Drops finished records older than the given age. Returns the count.
    pub fn cleanup_finished(&self, older_than: Duration) -> u64 {
        self.table.cleanup_finished(older_than)
    }

    /// Stops the sweeper and every armed watcher.
    ///
    /// Watchers stopped here keep their durable records, so the next run
    /// restores them.
    pub async fn shutdown(self) {
        self.token.cancel();
        self.sweeper.shutdown().await;
        for handle in self.watchers.into_inner() {
            handle.wait().await;
        }
        info!("engine stopped cleanly");
    }
}

/// Wraps a caller-supplied handler so callback outcomes also advance the
/// operation's state machine.
struct TrackingHandler {
    inner: Arc<dyn CallbackHandler>,
    table: Arc<ProcessTable>,
    id: RequestId,
}

#[async_trait]
impl CallbackHandler for TrackingHandler {
    fn kind(&self) -> &str {
        self.inner.kind()
    }

    async fn on_match(&self, name: &str, bytes: &[u8]) -> std::result::Result<bool, BoxError> {
        let delivered = self.inner.on_match(name, bytes).await?;
        if delivered {
            self.table.apply(&self.id, LifecycleEvent::ResultDelivered);
        }
        Ok(delivered)
    }

    async fn on_timeout(&self) {
        self.inner.on_timeout().await;
        if self.table.force_timeout(&self.id).is_none() {
            warn!(id = %self.id, "callback timed out for an operation no longer active");
        }
    }
}
