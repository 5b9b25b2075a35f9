//! Startup recovery of armed watchers from their durable records.
//!
//! Arming a watcher and persisting its record are two steps of one logical
//! operation; after a crash only the record survives. The coordinator scans
//! the handler-state directory, rebuilds one handler per record via the
//! factory registered for its kind, and re-arms a watcher with the remaining
//! portion of the original timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::BoxError;

use super::registry::{CallbackRecord, CallbackRegistry};
use super::watcher::{CallbackHandler, CallbackWatcher, WatcherHandle};

/// Rebuilds handlers of one kind from their persisted payloads.
#[async_trait]
pub trait HandlerFactory: Send + Sync {
    /// The handler kind this factory can rebuild. Must match the
    /// `handler_kind` the original handler reported when it was armed.
    fn kind(&self) -> &str;

    /// Reconstructs a handler from the record's opaque payload.
    async fn rebuild(
        &self,
        record: &CallbackRecord,
    ) -> std::result::Result<Arc<dyn CallbackHandler>, BoxError>;
}

/// Re-arms watchers for every durable record that still has a factory.
pub struct RestoreCoordinator {
    registry: Arc<CallbackRegistry>,
    factories: HashMap<String, Arc<dyn HandlerFactory>>,
    poll_interval: Duration,
    stability_delay: Duration,
}

impl RestoreCoordinator {
    pub fn new(registry: Arc<CallbackRegistry>) -> Self {
        Self {
            registry,
            factories: HashMap::new(),
            poll_interval: Duration::from_millis(500),
            stability_delay: Duration::from_millis(500),
        }
    }

    /// Registers a factory for its handler kind. A later registration for
    /// the same kind replaces the earlier one.
    pub fn register(&mut self, factory: Arc<dyn HandlerFactory>) {
        self.factories.insert(factory.kind().to_string(), factory);
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stability_delay(mut self, delay: Duration) -> Self {
        self.stability_delay = delay;
        self
    }

    /// Scans the registry and arms one watcher per restorable record.
    ///
    /// A record whose kind has no registered factory, or whose factory
    /// fails to rebuild the handler, is skipped with a warning; its file is
    /// left in place for a later scan with better factories. Expired
    /// records are re-armed with a zero timeout so their timeout callbacks
    /// still fire.
    pub async fn restore(&self, token: &CancellationToken) -> Vec<WatcherHandle> {
        let records = match self.registry.find_all().await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "failed to scan callback records, nothing restored");
                return Vec::new();
            }
        };

        let now = Utc::now();
        let mut handles = Vec::new();

        for record in records {
            let Some(factory) = self.factories.get(&record.handler_kind) else {
                warn!(
                    kind = %record.handler_kind,
                    correlation_id = %record.correlation_id,
                    "no factory for callback record, skipping"
                );
                continue;
            };

            let handler = match factory.rebuild(&record).await {
                Ok(handler) => handler,
                Err(err) => {
                    warn!(
                        kind = %record.handler_kind,
                        correlation_id = %record.correlation_id,
                        error = %err,
                        "factory failed to rebuild handler, skipping record"
                    );
                    continue;
                }
            };

            let remaining = record.remaining_timeout(now);
            debug!(
                kind = %record.handler_kind,
                correlation_id = %record.correlation_id,
                remaining = ?remaining,
                "re-arming watcher from durable record"
            );

            let watcher = CallbackWatcher::new(
                record.directory.clone(),
                remaining,
                record.correlation_id,
                handler,
                Arc::clone(&self.registry),
            )
            .with_poll_interval(self.poll_interval)
            .with_stability_delay(self.stability_delay);

            handles.push(watcher.start(token.child_token()));
        }

        info!(count = handles.len(), "restored armed watchers");
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopHandler {
        kind: String,
    }

    #[async_trait]
    impl CallbackHandler for NoopHandler {
        fn kind(&self) -> &str {
            &self.kind
        }

        async fn on_match(&self, _name: &str, _bytes: &[u8]) -> Result<bool, BoxError> {
            Ok(true)
        }

        async fn on_timeout(&self) {}
    }

    struct CountingFactory {
        kind: String,
        rebuilds: AtomicUsize,
    }

    impl CountingFactory {
        fn new(kind: &str) -> Arc<Self> {
            Arc::new(Self {
                kind: kind.to_string(),
                rebuilds: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HandlerFactory for CountingFactory {
        fn kind(&self) -> &str {
            &self.kind
        }

        async fn rebuild(
            &self,
            record: &CallbackRecord,
        ) -> Result<Arc<dyn CallbackHandler>, BoxError> {
            self.rebuilds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopHandler {
                kind: record.handler_kind.clone(),
            }))
        }
    }

    async fn seed(
        registry: &CallbackRegistry,
        kind: &str,
        responses: PathBuf,
    ) -> crate::core::CorrelationId {
        let id = crate::core::CorrelationId::generate();
        registry
            .upsert(&CallbackRecord::new(
                responses,
                Duration::from_secs(300),
                kind,
                id,
                json!({"vm": "m1"}),
            ))
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn restores_one_watcher_per_valid_record() {
        let state = tempfile::tempdir().unwrap();
        let responses = tempfile::tempdir().unwrap();
        let registry = Arc::new(CallbackRegistry::new(state.path()));

        for _ in 0..3 {
            seed(&registry, "deploy", responses.path().to_path_buf()).await;
        }
        // A malformed file never reaches a factory.
        std::fs::write(state.path().join("broken_record.json"), b"not json").unwrap();

        let factory = CountingFactory::new("deploy");
        let mut coordinator = RestoreCoordinator::new(Arc::clone(&registry))
            .with_poll_interval(Duration::from_millis(20));
        coordinator.register(factory.clone());

        let token = CancellationToken::new();
        let handles = coordinator.restore(&token).await;

        assert_eq!(handles.len(), 3);
        assert_eq!(factory.rebuilds.load(Ordering::SeqCst), 3);

        for handle in handles {
            handle.shutdown().await;
        }
    }

    #[tokio::test]
    async fn unknown_kind_is_skipped_and_its_record_survives() {
        let state = tempfile::tempdir().unwrap();
        let responses = tempfile::tempdir().unwrap();
        let registry = Arc::new(CallbackRegistry::new(state.path()));

        seed(&registry, "deploy", responses.path().to_path_buf()).await;
        seed(&registry, "terminate", responses.path().to_path_buf()).await;

        let mut coordinator = RestoreCoordinator::new(Arc::clone(&registry))
            .with_poll_interval(Duration::from_millis(20));
        coordinator.register(CountingFactory::new("deploy"));

        let token = CancellationToken::new();
        let handles = coordinator.restore(&token).await;
        assert_eq!(handles.len(), 1);

        for handle in handles {
            handle.shutdown().await;
        }

        // The skipped record is still on disk for a later scan.
        let remaining = registry.find_all().await.unwrap();
        assert!(remaining.iter().any(|r| r.handler_kind == "terminate"));
    }

    #[tokio::test]
    async fn repeated_scan_restores_the_same_set() {
        let state = tempfile::tempdir().unwrap();
        let responses = tempfile::tempdir().unwrap();
        let registry = Arc::new(CallbackRegistry::new(state.path()));

        seed(&registry, "deploy", responses.path().to_path_buf()).await;
        seed(&registry, "deploy", responses.path().to_path_buf()).await;

        let mut coordinator = RestoreCoordinator::new(Arc::clone(&registry))
            .with_poll_interval(Duration::from_millis(20));
        coordinator.register(CountingFactory::new("deploy"));

        let token = CancellationToken::new();
        let first = coordinator.restore(&token).await;
        assert_eq!(first.len(), 2);
        for handle in first {
            handle.shutdown().await;
        }

        // Shutdown leaves records in place, so a second restore arms the
        // same watchers again.
        let second = coordinator.restore(&token).await;
        assert_eq!(second.len(), 2);
        for handle in second {
            handle.shutdown().await;
        }
    }
}
