//! Type-safe identifiers for pool entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// JobId
// ============================================================================

/// Unique identifier for a submitted job.
///
/// Backed by a v4 UUID; generated at submission time and returned to the
/// caller for status polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh job ID.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// WorkerId
// ============================================================================

/// Identifier for a worker slot within the pool.
///
/// Assigned sequentially at pool start-up; stable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    /// Creates a worker ID from its pool index.
    #[inline]
    #[must_use]
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw pool index.
    #[inline]
    #[must_use]
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId::new(3).to_string(), "worker-3");
    }

    #[test]
    fn test_job_id_serde_transparent() {
        let id = JobId::new();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{id}\""));
    }
}
