//! Durable on-disk descriptions of armed callback watchers.
//!
//! Every armed watcher is mirrored as one JSON file under the handler-state
//! directory, named `<handler_kind>_<correlation_id>.json`. The records are
//! the system's only recovery input: after a restart,
//! [`crate::callback::RestoreCoordinator`] re-arms one watcher per surviving
//! file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::core::CorrelationId;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// An I/O operation on the handler-state directory failed.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded as JSON.
    #[error("record serialization failed")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Durable description of one armed callback watcher.
///
/// The `payload` is opaque to this layer: it carries whatever the handler
/// factory for `handler_kind` needs to reconstruct the handler at restore
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackRecord {
    /// Directory the watcher observes for the result file.
    pub directory: PathBuf,
    /// When the watcher was armed.
    pub armed_at: DateTime<Utc>,
    /// Absolute expiration of the watch.
    pub timeout_at: DateTime<Utc>,
    /// Which handler factory can rebuild the handler.
    pub handler_kind: String,
    /// Token linking the result file back to this watcher.
    pub correlation_id: CorrelationId,
    /// Handler-reconstruction payload, owned by the handler factory.
    pub payload: serde_json::Value,
}

impl CallbackRecord {
    pub fn new(
        directory: PathBuf,
        timeout: Duration,
        handler_kind: impl Into<String>,
        correlation_id: CorrelationId,
        payload: serde_json::Value,
    ) -> Self {
        let armed_at = Utc::now();
        let timeout_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| armed_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            directory,
            armed_at,
            timeout_at,
            handler_kind: handler_kind.into(),
            correlation_id,
            payload,
        }
    }

    /// The watcher timeout still remaining, zero if already expired.
    pub fn remaining_timeout(&self, now: DateTime<Utc>) -> Duration {
        (self.timeout_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Durable file name for this record's `{handler_kind, correlation_id}` key.
    pub fn file_name(&self) -> String {
        record_file_name(&self.handler_kind, self.correlation_id)
    }
}

fn record_file_name(handler_kind: &str, correlation_id: CorrelationId) -> String {
    format!("{}_{}.json", handler_kind, correlation_id)
}

/// Filesystem-backed registry of armed watchers.
pub struct CallbackRegistry {
    dir: PathBuf,
}

impl CallbackRegistry {
    /// Creates a registry over the given handler-state directory.
    ///
    /// The directory is created on first write; a missing directory scans
    /// as empty.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the record, overwriting any existing file for the same
    /// `{handler_kind, correlation_id}` key (upsert).
    ///
    /// The write goes to a temporary name first and is renamed into place,
    /// so a crash mid-write never leaves a half-written record behind.
    pub async fn upsert(&self, record: &CallbackRecord) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let bytes = serde_json::to_vec_pretty(record)?;
        let final_path = self.dir.join(record.file_name());
        let tmp_path = self.dir.join(format!("{}.tmp", record.file_name()));

        fs::write(&tmp_path, &bytes).await?;
        fs::rename(&tmp_path, &final_path).await?;

        debug!(path = %final_path.display(), "armed watcher persisted");
        Ok(())
    }

    /// Scans the directory and deserializes every record.
    ///
    /// A file that fails to parse is skipped and logged; it never aborts the
    /// whole scan.
    pub async fn find_all(&self) -> Result<Vec<CallbackRecord>> {
        let mut records = Vec::new();

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<CallbackRecord>(&bytes) {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "skipping malformed callback record");
                    }
                },
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable callback record");
                }
            }
        }

        Ok(records)
    }

    /// Deletes the record file for the given key. Idempotent: removing a
    /// record that is already gone succeeds.
    pub async fn remove(&self, handler_kind: &str, correlation_id: CorrelationId) -> Result<()> {
        let path = self.dir.join(record_file_name(handler_kind, correlation_id));
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "callback record removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
