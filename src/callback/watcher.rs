//! Background watcher that correlates an external script's result file back
//! to the operation waiting for it.
//!
//! Each armed watcher polls its response directory for the artifact named
//! after its correlation id. Before reading, it waits for **write
//! stability**: the file length must be identical across two consecutive
//! polls. A sibling `<base>.done` marker short-circuits that wait for
//! writers that signal completion explicitly; length polling remains the
//! fallback for writers that do not.
//!
//! Multiple watchers may observe the same physical directory concurrently.
//! Correctness relies on each watcher's own filename predicate and on
//! idempotent deletion, not on mutual exclusion between watchers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{BoxError, CorrelationId};

use super::registry::CallbackRegistry;

/// Receives the matched result file, or the news that none ever arrived.
///
/// `on_match` returning `Ok(true)` means the payload was delivered outward
/// and the artifact may be deleted. `Ok(false)` or an error leaves the file
/// in place for a later scan or manual remediation; the watch loop keeps
/// running either way.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    /// Stable name of the handler kind, used to key the durable record and
    /// to find the factory that can rebuild this handler after a restart.
    fn kind(&self) -> &str;

    /// Called with the full content of a matched result file.
    async fn on_match(&self, name: &str, bytes: &[u8]) -> std::result::Result<bool, BoxError>;

    /// Called exactly once if the timeout elapses with no successful match.
    async fn on_timeout(&self);
}

/// Background watcher for one armed callback.
pub struct CallbackWatcher {
    directory: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    stability_delay: Duration,
    correlation_id: CorrelationId,
    handler: Arc<dyn CallbackHandler>,
    registry: Arc<CallbackRegistry>,
}

impl CallbackWatcher {
    pub fn new(
        directory: impl Into<PathBuf>,
        timeout: Duration,
        correlation_id: CorrelationId,
        handler: Arc<dyn CallbackHandler>,
        registry: Arc<CallbackRegistry>,
    ) -> Self {
        Self {
            directory: directory.into(),
            timeout,
            poll_interval: Duration::from_millis(500),
            stability_delay: Duration::from_millis(500),
            correlation_id,
            handler,
            registry,
        }
    }

    /// Sets how often the directory is scanned for the artifact.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the delay between the consecutive length polls of the write
    /// stability check.
    pub fn with_stability_delay(mut self, delay: Duration) -> Self {
        self.stability_delay = delay;
        self
    }

    /// Starts the watch loop in a background task.
    ///
    /// Cancelling `token` stops the loop without firing the timeout
    /// callback; it is the shutdown path, not an outcome.
    pub fn start(self, token: CancellationToken) -> WatcherHandle {
        let join = tokio::spawn({
            let token = token.clone();
            async move {
                self.run(token).await;
            }
        });
        WatcherHandle { join, token }
    }

    async fn run(self, token: CancellationToken) {
        let deadline = tokio::time::Instant::now() + self.timeout;
        info!(
            correlation_id = %self.correlation_id,
            directory = %self.directory.display(),
            timeout = ?self.timeout,
            "callback watcher armed"
        );

        loop {
            // Only the search for the artifact races the deadline. Once the
            // content is in hand, delivery runs to completion: a handler
            // must never see its outward side effects cut off mid-flight
            // and then receive a timeout for the same operation.
            let bytes = tokio::select! {
                _ = token.cancelled() => {
                    debug!(correlation_id = %self.correlation_id, "callback watcher cancelled");
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.finish_timeout().await;
                    return;
                }
                bytes = self.await_artifact() => bytes,
            };

            if self.deliver(&bytes).await {
                self.remove_record().await;
                return;
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {
                    self.finish_timeout().await;
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Polls until the artifact exists, is write-stable, and was read in
    /// full. Only returns with the complete content; I/O errors are logged
    /// and retried on the next tick.
    async fn await_artifact(&self) -> Vec<u8> {
        let artifact = self.directory.join(self.correlation_id.file_name());
        loop {
            let present = match fs::try_exists(&artifact).await {
                Ok(present) => present,
                Err(err) => {
                    warn!(
                        correlation_id = %self.correlation_id,
                        error = %err,
                        "failed to check response directory"
                    );
                    false
                }
            };
            if present {
                match self.read_stable(&artifact).await {
                    Ok(bytes) => return bytes,
                    Err(err) => {
                        warn!(
                            correlation_id = %self.correlation_id,
                            error = %err,
                            "failed to read result file, will rescan"
                        );
                    }
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn read_stable(&self, artifact: &Path) -> std::io::Result<Vec<u8>> {
        self.wait_for_stability(artifact).await?;
        fs::read(artifact).await
    }

    /// Hands the content to the handler. Returns true once the result was
    /// delivered and the artifacts cleaned up.
    async fn deliver(&self, bytes: &[u8]) -> bool {
        let name = self.correlation_id.file_name();
        let artifact = self.directory.join(&name);
        match self.handler.on_match(&name, bytes).await {
            Ok(true) => {
                info!(correlation_id = %self.correlation_id, "result delivered");
                self.delete_artifacts(&artifact).await;
                true
            }
            Ok(false) => {
                warn!(
                    correlation_id = %self.correlation_id,
                    "handler declined result file, leaving it in place"
                );
                false
            }
            Err(err) => {
                warn!(
                    correlation_id = %self.correlation_id,
                    error = %err,
                    "handler failed on result file, leaving it in place"
                );
                false
            }
        }
    }

    /// Waits until the writer appears to be done with the file.
    ///
    /// A `<base>.done` marker is the definitive completion signal; without
    /// one, two consecutive length polls reporting the same size are taken
    /// as good enough. A continuously appended file is bounded only by the
    /// watcher's overall timeout.
    async fn wait_for_stability(&self, path: &Path) -> std::io::Result<()> {
        let marker = path.with_extension("done");
        let mut previous: Option<u64> = None;

        loop {
            if fs::try_exists(&marker).await? {
                debug!(path = %path.display(), "completion marker present");
                return Ok(());
            }

            let len = fs::metadata(path).await?.len();
            if previous == Some(len) {
                return Ok(());
            }
            previous = Some(len);

            tokio::time::sleep(self.stability_delay).await;
        }
    }

    /// Deletes the matched artifact and any co-located sibling sharing its
    /// base name (the `.log`, the `.done` marker). Idempotent: files already
    /// gone are fine.
    async fn delete_artifacts(&self, artifact: &Path) {
        let stem = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.split('.').next())
            .map(str::to_string);
        let Some(stem) = stem else { return };

        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.split('.').next() == Some(stem.as_str()) {
                if let Err(err) = fs::remove_file(entry.path()).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %entry.path().display(), error = %err, "failed to delete artifact");
                    }
                }
            }
        }
    }

    async fn finish_timeout(&self) {
        warn!(
            correlation_id = %self.correlation_id,
            "callback watcher timed out with no result"
        );
        self.handler.on_timeout().await;
        // Timed-out watchers also drop their durable record, so a stale
        // watch never resurrects after a restart.
        self.remove_record().await;
    }

    async fn remove_record(&self) {
        if let Err(err) = self
            .registry
            .remove(self.handler.kind(), self.correlation_id)
            .await
        {
            warn!(
                correlation_id = %self.correlation_id,
                error = %err,
                "failed to remove callback record"
            );
        }
    }
}

/// Handle to a running watcher task.
pub struct WatcherHandle {
    join: JoinHandle<()>,
    token: CancellationToken,
}

impl WatcherHandle {
    /// True once the watch loop has ended (matched, timed out, or
    /// cancelled).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancels the watch loop and waits for the task to finish. Does not
    /// fire the timeout callback.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.join.await;
    }

    /// Waits for the watcher to finish on its own (match or timeout).
    pub async fn wait(self) {
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::callback::registry::CallbackRecord;

    struct RecordingHandler {
        accept: bool,
        delivery_delay: Duration,
        matches: AtomicUsize,
        timeouts: AtomicUsize,
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingHandler {
        fn new(accept: bool) -> Arc<Self> {
            Self::with_delivery_delay(accept, Duration::ZERO)
        }

        fn with_delivery_delay(accept: bool, delivery_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                accept,
                delivery_delay,
                matches: AtomicUsize::new(0),
                timeouts: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CallbackHandler for RecordingHandler {
        fn kind(&self) -> &str {
            "recording"
        }

        async fn on_match(&self, _name: &str, bytes: &[u8]) -> Result<bool, BoxError> {
            self.matches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delivery_delay).await;
            self.seen.lock().unwrap().push(bytes.to_vec());
            Ok(self.accept)
        }

        async fn on_timeout(&self) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn watcher(
        dir: &Path,
        timeout: Duration,
        id: CorrelationId,
        handler: Arc<dyn CallbackHandler>,
        registry: Arc<CallbackRegistry>,
    ) -> CallbackWatcher {
        CallbackWatcher::new(dir, timeout, id, handler, registry)
            .with_poll_interval(Duration::from_millis(20))
            .with_stability_delay(Duration::from_millis(50))
    }

    async fn armed_registry(
        state_dir: &Path,
        response_dir: &Path,
        id: CorrelationId,
    ) -> Arc<CallbackRegistry> {
        let registry = Arc::new(CallbackRegistry::new(state_dir));
        registry
            .upsert(&CallbackRecord::new(
                response_dir.to_path_buf(),
                Duration::from_secs(60),
                "recording",
                id,
                json!({}),
            ))
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn matches_result_file_and_cleans_up() {
        let state = tempfile::tempdir().unwrap();
        let responses = tempfile::tempdir().unwrap();
        let id = CorrelationId::generate();
        let registry = armed_registry(state.path(), responses.path(), id).await;
        let handler = RecordingHandler::new(true);

        let handle = watcher(
            responses.path(),
            Duration::from_secs(5),
            id,
            handler.clone(),
            registry.clone(),
        )
        .start(CancellationToken::new());

        std::fs::write(responses.path().join(id.file_name()), b"{\"ok\":true}").unwrap();
        std::fs::write(responses.path().join(format!("{}.log", id)), b"log line").unwrap();

        handle.wait().await;

        assert_eq!(handler.matches.load(Ordering::SeqCst), 1);
        assert_eq!(handler.timeouts.load(Ordering::SeqCst), 0);
        // Artifact and its log sibling are gone.
        assert!(!responses.path().join(id.file_name()).exists());
        assert!(!responses.path().join(format!("{}.log", id)).exists());
        // Durable record removed on the success path.
        assert!(registry.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn in_flight_delivery_is_not_cut_off_by_the_deadline() {
        let state = tempfile::tempdir().unwrap();
        let responses = tempfile::tempdir().unwrap();
        let id = CorrelationId::generate();
        let registry = armed_registry(state.path(), responses.path(), id).await;
        // Delivery takes longer than the watcher's whole timeout.
        let handler =
            RecordingHandler::with_delivery_delay(true, Duration::from_millis(800));

        let handle = watcher(
            responses.path(),
            Duration::from_millis(400),
            id,
            handler.clone(),
            registry.clone(),
        )
        .start(CancellationToken::new());

        std::fs::write(responses.path().join(id.file_name()), b"{\"ok\":true}").unwrap();

        handle.wait().await;

        // The handler ran exactly once, to completion, and the deadline did
        // not fire a timeout on top of the successful delivery.
        assert_eq!(handler.matches.load(Ordering::SeqCst), 1);
        assert_eq!(handler.timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(handler.seen.lock().unwrap().len(), 1);
        assert!(!responses.path().join(id.file_name()).exists());
        assert!(registry.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn two_burst_write_is_not_read_truncated() {
        let state = tempfile::tempdir().unwrap();
        let responses = tempfile::tempdir().unwrap();
        let id = CorrelationId::generate();
        let registry = armed_registry(state.path(), responses.path(), id).await;
        let handler = RecordingHandler::new(true);

        let handle = watcher(
            responses.path(),
            Duration::from_secs(10),
            id,
            handler.clone(),
            registry,
        )
        .start(CancellationToken::new());

        // First burst, then a pause longer than the stability delay, then
        // the second burst.
        let path = responses.path().join(id.file_name());
        let writer = tokio::spawn(async move {
            tokio::fs::write(&path, b"first-burst").await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            let mut content = tokio::fs::read(&path).await.unwrap();
            content.extend_from_slice(b"+second-burst");
            tokio::fs::write(&path, &content).await.unwrap();
        });

        writer.await.unwrap();
        handle.wait().await;

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], b"first-burst+second-burst".to_vec());
    }

    #[tokio::test]
    async fn done_marker_short_circuits_stability_wait() {
        let state = tempfile::tempdir().unwrap();
        let responses = tempfile::tempdir().unwrap();
        let id = CorrelationId::generate();
        let registry = armed_registry(state.path(), responses.path(), id).await;
        let handler = RecordingHandler::new(true);

        // Long stability delay: only the marker can finish this quickly.
        let handle = CallbackWatcher::new(
            responses.path(),
            Duration::from_secs(30),
            id,
            handler.clone() as Arc<dyn CallbackHandler>,
            registry,
        )
        .with_poll_interval(Duration::from_millis(20))
        .with_stability_delay(Duration::from_secs(20))
        .start(CancellationToken::new());

        std::fs::write(responses.path().join(id.file_name()), b"payload").unwrap();
        std::fs::write(responses.path().join(format!("{}.done", id)), b"").unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("watcher should finish well before the stability delay");

        assert_eq!(handler.matches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_fires_once_and_removes_record() {
        let state = tempfile::tempdir().unwrap();
        let responses = tempfile::tempdir().unwrap();
        let id = CorrelationId::generate();
        let registry = armed_registry(state.path(), responses.path(), id).await;
        let handler = RecordingHandler::new(true);

        let handle = watcher(
            responses.path(),
            Duration::from_millis(150),
            id,
            handler.clone(),
            registry.clone(),
        )
        .start(CancellationToken::new());

        handle.wait().await;

        assert_eq!(handler.matches.load(Ordering::SeqCst), 0);
        assert_eq!(handler.timeouts.load(Ordering::SeqCst), 1);
        assert!(registry.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn declined_match_leaves_file_and_keeps_watching() {
        let state = tempfile::tempdir().unwrap();
        let responses = tempfile::tempdir().unwrap();
        let id = CorrelationId::generate();
        let registry = armed_registry(state.path(), responses.path(), id).await;
        let handler = RecordingHandler::new(false);

        let handle = watcher(
            responses.path(),
            Duration::from_millis(400),
            id,
            handler.clone(),
            registry,
        )
        .start(CancellationToken::new());

        std::fs::write(responses.path().join(id.file_name()), b"bad payload").unwrap();

        handle.wait().await;

        // The loop retried rather than dying on the first decline, the file
        // survived for remediation, and the timeout eventually fired.
        assert!(handler.matches.load(Ordering::SeqCst) >= 1);
        assert_eq!(handler.timeouts.load(Ordering::SeqCst), 1);
        assert!(responses.path().join(id.file_name()).exists());
    }

    #[tokio::test]
    async fn shutdown_does_not_fire_timeout() {
        let state = tempfile::tempdir().unwrap();
        let responses = tempfile::tempdir().unwrap();
        let id = CorrelationId::generate();
        let registry = armed_registry(state.path(), responses.path(), id).await;
        let handler = RecordingHandler::new(true);

        let token = CancellationToken::new();
        let handle = watcher(
            responses.path(),
            Duration::from_secs(30),
            id,
            handler.clone(),
            registry.clone(),
        )
        .start(token);

        handle.shutdown().await;

        assert_eq!(handler.timeouts.load(Ordering::SeqCst), 0);
        // Shutdown is not a terminal outcome: the durable record survives
        // for the restore path.
        assert_eq!(registry.find_all().await.unwrap().len(), 1);
    }
}
