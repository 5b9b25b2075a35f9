//! Identity types for external operations.
//!
//! A [`RequestId`] identifies one logical operation (tenant plus command
//! signature) and is used for equality and duplicate detection, never for
//! ownership. A [`CorrelationId`] is a generated token embedded in the
//! filename of the result artifact an external script eventually writes,
//! linking that file back to the operation that produced it.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use super::error::Error;

/// Identity key for one logical external operation.
///
/// Two triggers with the same tenant and the same command token vector map
/// to the same `RequestId`, which is how duplicate submissions are detected
/// while the first one is still active. Equality is over the tokens
/// themselves, so `["a b"]` and `["a", "b"]` are distinct identities even
/// though they render the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId {
    tenant: String,
    command: Vec<String>,
}

impl RequestId {
    /// Builds an id from the owning tenant and the full command token vector.
    pub fn new(tenant: impl Into<String>, command: &[String]) -> Self {
        Self {
            tenant: tenant.into(),
            command: command.to_vec(),
        }
    }

    /// The tenant that owns this operation.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// The command rendered for display. Not injective; use the id itself
    /// for equality.
    pub fn signature(&self) -> String {
        self.command.join(" ")
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant, self.signature())
    }
}

/// Generated token linking an external script's result file back to the
/// operation and handler that are waiting for it.
///
/// The token is embedded in the artifact filename (`<uuid>.json`, optionally
/// with a `<uuid>.log` sibling), so it can be recovered from a bare directory
/// scan with no other context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generates a fresh unique correlation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The canonical name of the result artifact for this id.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }

    /// Attempts to recover a correlation id from a result filename.
    ///
    /// Accepts any name whose stem (the part before the first `.`) parses as
    /// a UUID, so both `<uuid>.json` and sibling artifacts like `<uuid>.log`
    /// decode to the same id.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.split('.').next()?;
        Uuid::parse_str(stem).ok().map(Self)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::InvalidCorrelationId(s.to_string()))
    }
}
