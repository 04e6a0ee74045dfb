//! Stream version assignment and optimistic concurrency checks.
//!
//! The same per-stream version numbers drive both the append-time guard and
//! the version stamped on aggregate snapshots, so a caller that read a
//! snapshot at version `n` can append with `ExpectedVersion::Exact(n)`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConcurrencyError;
use crate::event::Identity;

/// Expected stream version for an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Accept any current stream version (no concurrency check at
    /// validation time; the commit still guards against racing appends).
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream must be at exactly this version.
    Exact(u64),
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any"),
            ExpectedVersion::NoStream => f.write_str("no stream"),
            ExpectedVersion::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// Current state of a stream as reported by the event store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    /// Stream identity.
    pub stream: Identity,
    /// Owning tenant.
    pub tenant_id: String,
    /// Number of events in the stream (the version of its last event).
    pub version: u64,
    /// Aggregate type the stream is tagged with, if any.
    pub aggregate_type: Option<String>,
    /// Whether the stream has been archived.
    pub is_archived: bool,
}

/// Compare-and-swap condition attached to a commit.
///
/// The store must reject the whole commit when the stream's persisted version
/// differs from `current_version` (0 meaning "does not exist").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamGuard {
    /// Owning tenant.
    pub tenant_id: String,
    /// Stream being appended to.
    pub stream: Identity,
    /// Version the writer observed before appending.
    pub current_version: u64,
}

/// Validate an append against the stream's current state.
///
/// Returns the version the stream is currently at (0 for a new stream).
///
/// # Errors
///
/// Returns [`ConcurrencyError::Stream`] when `expected` does not hold.
pub fn check_expected_version(
    stream: &Identity,
    expected: ExpectedVersion,
    current: Option<&StreamState>,
) -> Result<u64, ConcurrencyError> {
    let actual = current.map(|s| s.version).unwrap_or(0);
    let ok = match expected {
        ExpectedVersion::Any => true,
        ExpectedVersion::NoStream => current.is_none(),
        ExpectedVersion::Exact(v) => v == actual,
    };
    if ok {
        Ok(actual)
    } else {
        Err(ConcurrencyError::Stream {
            stream: stream.clone(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Versions assigned to `count` events appended to a stream at `current`.
pub fn assign_versions(current: u64, count: usize) -> impl Iterator<Item = u64> {
    (current + 1)..=(current + count as u64)
}
