//! Background sweeper that evicts overdue operations.
//!
//! Runs in a separate task and periodically asks the process table to
//! force-complete builders whose deadline has passed. Eviction does not
//! depend on further lifecycle events arriving, so retained state stays
//! bounded even when a spawned process never reports completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::machine::ProcessTable;

/// Background deadline sweeper.
///
/// # Lifecycle
/// 1. Create: `DeadlineSweeper::new(table)`
/// 2. Configure: `.with_poll_interval(duration)`
/// 3. Start: `.start()` returns a handle
/// 4. Shutdown: `handle.shutdown().await`
pub struct DeadlineSweeper {
    table: Arc<ProcessTable>,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl DeadlineSweeper {
    /// Creates a sweeper with the default 30 second poll interval.
    pub fn new(table: Arc<ProcessTable>) -> Self {
        Self {
            table,
            poll_interval: Duration::from_secs(30),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets how often overdue builders are checked for.
    ///
    /// Lazy eviction on table access still applies between sweeps, so this
    /// only bounds how long an untouched overdue builder can linger.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Starts the sweeper in a background task.
    ///
    /// The returned handle must be used to stop it; dropping the handle
    /// without calling shutdown leaks the background task.
    pub fn start(self) -> DeadlineSweeperHandle {
        let shutdown = Arc::clone(&self.shutdown);
        let handle = tokio::spawn(async move {
            self.run().await;
        });
        DeadlineSweeperHandle { handle, shutdown }
    }

    async fn run(self) {
        info!(poll_interval = ?self.poll_interval, "deadline sweeper started");

        while !self.shutdown.load(Ordering::SeqCst) {
            let evicted = self.table.expire_overdue(Utc::now());
            if !evicted.is_empty() {
                debug!(count = evicted.len(), "sweeper evicted overdue operations");
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        info!("deadline sweeper stopped cleanly");
    }
}

/// Handle for stopping the deadline sweeper.
pub struct DeadlineSweeperHandle {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl DeadlineSweeperHandle {
    /// Signals the sweeper to stop and waits for the task to finish.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.handle.await;
    }
}
