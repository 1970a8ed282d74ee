//! Job records, status reporting, and the in-memory job store.
//!
//! A job is created at submission (status `queued`), mutated by progress
//! callbacks while a worker executes it, and finished exactly once by the
//! terminal resolve/reject. `done` and `error` are terminal: the store
//! silently drops any mutation that arrives after them.
//!
//! The store is shared between workers (writers) and the status-polling
//! front-end (reader); reads clone the record so polling never observes a
//! half-written update.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::capture::CapturedPayload;
use crate::error::{Error, Result};
use crate::identifiers::JobId;

// ============================================================================
// JobInput
// ============================================================================

/// Raw job input as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    /// Product page URL to extract data from.
    pub product_url: String,
}

// ============================================================================
// ParsedInput
// ============================================================================

/// Validated and normalized job input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedInput {
    /// Original product URL.
    pub product_url: String,

    /// Store segment extracted from the URL.
    pub store: String,

    /// Numeric product identifier extracted from the URL.
    pub product_id: String,
}

/// Validates `input` against the configured product-URL pattern.
///
/// The pattern's first capture group is the store segment, the second the
/// product identifier.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when the URL does not match; this happens
/// at submission time, before any session is involved.
pub fn parse_input(input: &JobInput, pattern: &Regex) -> Result<ParsedInput> {
    let trimmed = input.product_url.trim();
    let captures = pattern
        .captures(trimmed)
        .ok_or_else(|| Error::invalid_input("product_url must be a storefront product URL"))?;

    let store = captures
        .get(1)
        .ok_or_else(|| Error::invalid_input("product URL pattern captured no store segment"))?
        .as_str()
        .to_string();
    let product_id = captures
        .get(2)
        .ok_or_else(|| Error::invalid_input("product URL pattern captured no product id"))?
        .as_str()
        .to_string();

    Ok(ParsedInput {
        product_url: trimmed.to_string(),
        store,
        product_id,
    })
}

// ============================================================================
// JobStatus
// ============================================================================

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for an idle worker.
    Queued,

    /// A worker is executing the job.
    Running,

    /// Blocked on an externally-resolvable condition (verification wall).
    /// A sub-state, not terminal: the job returns to `running` if the wall
    /// clears within its deadline.
    NeedsManual,

    /// Finished with a result. Terminal.
    Done,

    /// Finished with an error. Terminal.
    Error,
}

impl JobStatus {
    /// Returns `true` for `done` and `error`.
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

// ============================================================================
// StatusUpdate
// ============================================================================

/// Incremental status emitted by a worker during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// New status.
    pub status: JobStatus,

    /// Terse human-readable message.
    pub message: String,
}

impl StatusUpdate {
    /// Creates a `running` update.
    #[inline]
    pub fn running(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Running,
            message: message.into(),
        }
    }

    /// Creates a `needs_manual` update.
    #[inline]
    pub fn needs_manual(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::NeedsManual,
            message: message.into(),
        }
    }
}

/// Callback forwarding status updates into the job record.
pub type ProgressSink = Arc<dyn Fn(StatusUpdate) + Send + Sync>;

/// Progress sink that drops every update. Useful in tests and for callers
/// that only poll the record.
#[must_use]
pub fn null_progress() -> ProgressSink {
    Arc::new(|_| {})
}

// ============================================================================
// BenefitsPayload
// ============================================================================

/// Which path produced the benefits payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BenefitsKind {
    /// Direct fetch against the by-products endpoint.
    #[serde(rename = "benefits/by-products")]
    ByProducts,

    /// Passive capture of the product-benefits exchange.
    #[serde(rename = "product-benefits")]
    ProductBenefits,
}

/// The chosen benefits payload, tagged with the path that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenefitsPayload {
    /// Which path produced this payload.
    pub kind: BenefitsKind,

    /// Source URL.
    pub url: String,

    /// HTTP status of the source exchange.
    pub status: u16,

    /// Decoded JSON body.
    pub body: Value,
}

// ============================================================================
// CaptureResult
// ============================================================================

/// Assembled result of a successful job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Normalized input.
    pub input: ParsedInput,

    /// Channel identifier resolved during capture, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_uid: Option<String>,

    /// Primary payload with its source URL and status.
    pub product_details: CapturedPayload,

    /// Chosen benefits payload.
    pub benefits: BenefitsPayload,

    /// When the result was assembled.
    pub captured_at: DateTime<Utc>,
}

// ============================================================================
// JobRecord
// ============================================================================

/// One job's record, as exposed to the status-polling collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    /// Current status.
    pub status: JobStatus,

    /// Last status message.
    pub message: String,

    /// Raw input as submitted.
    pub input: JobInput,

    /// Final result, present once `status` is `done`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CaptureResult>,

    /// Final error message, present once `status` is `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Submission time.
    pub created_at: DateTime<Utc>,

    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// JobStore
// ============================================================================

/// Concurrent in-memory store of job records.
pub struct JobStore {
    jobs: RwLock<FxHashMap<JobId, JobRecord>>,
}

impl JobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: RwLock::new(FxHashMap::default()),
        })
    }

    /// Inserts a fresh `queued` record for `id`.
    pub fn insert(&self, id: JobId, input: JobInput) {
        let now = Utc::now();
        self.jobs.write().insert(
            id,
            JobRecord {
                status: JobStatus::Queued,
                message: "Queued".to_string(),
                input,
                result: None,
                error: None,
                created_at: now,
                updated_at: now,
            },
        );
    }

    /// Returns a clone of the record, or `None` if unknown or swept.
    #[must_use]
    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.jobs.read().get(&id).cloned()
    }

    /// Applies a progress update. No-op once the record is terminal or gone.
    pub fn apply(&self, id: JobId, update: StatusUpdate) {
        let mut jobs = self.jobs.write();
        if let Some(record) = jobs.get_mut(&id) {
            if record.status.is_terminal() {
                return;
            }
            record.status = update.status;
            record.message = update.message;
            record.updated_at = Utc::now();
        }
    }

    /// Finishes the job with a result. No-op once terminal or gone.
    pub fn resolve(&self, id: JobId, result: CaptureResult) {
        let mut jobs = self.jobs.write();
        if let Some(record) = jobs.get_mut(&id) {
            if record.status.is_terminal() {
                return;
            }
            record.status = JobStatus::Done;
            record.message = "Done".to_string();
            record.result = Some(result);
            record.updated_at = Utc::now();
        }
    }

    /// Finishes the job with an error. No-op once terminal or gone.
    pub fn reject(&self, id: JobId, message: impl Into<String>) {
        let mut jobs = self.jobs.write();
        if let Some(record) = jobs.get_mut(&id) {
            if record.status.is_terminal() {
                return;
            }
            record.status = JobStatus::Error;
            record.message = "Error".to_string();
            record.error = Some(message.into());
            record.updated_at = Utc::now();
        }
    }

    /// Removes records older than `ttl`, returning how many were dropped.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, record| now - record.created_at <= ttl);
        let dropped = before - jobs.len();
        if dropped > 0 {
            debug!(dropped, remaining = jobs.len(), "Swept expired job records");
        }
        dropped
    }

    /// Spawns a background task sweeping every `interval`.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        ttl: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep(ttl);
            }
        })
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    /// Returns `true` when no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
