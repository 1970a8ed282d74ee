//! Error types for the capture pool.
//!
//! This module defines all error types used throughout the crate.
//! Transience is an explicit property of the variant, not something
//! inferred later from a message: the session layer consults
//! [`Error::is_transient`] to decide whether a failure penalizes the
//! proxy entry and forces a context rebuild.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use capture_pool::{Result, WorkerPool, JobInput};
//!
//! async fn example(pool: &WorkerPool, input: JobInput) -> Result<()> {
//!     let handle = pool.submit(input)?;
//!     let record = handle.wait(std::time::Duration::from_millis(500)).await;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants | Transient |
//! |----------|----------|-----------|
//! | Configuration | [`Error::Config`] | no |
//! | Submission | [`Error::InvalidInput`] | no |
//! | Start-up | [`Error::SessionStart`] | no |
//! | Infrastructure | [`Error::Navigation`], [`Error::Connection`], [`Error::SessionClosed`], [`Error::Timeout`] | yes |
//! | Verification | [`Error::VerificationTimeout`] | no |
//! | Capture | [`Error::CaptureTimeout`], [`Error::Assembly`] | no |
//! | Driver | [`Error::Driver`] | no |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when pool configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Submission Errors
    // ========================================================================
    /// Job input failed the structural check.
    ///
    /// Rejected at submission time, before a session is ever involved.
    #[error("Invalid job input: {message}")]
    InvalidInput {
        /// Description of the input problem.
        message: String,
    },

    // ========================================================================
    // Start-up Errors
    // ========================================================================
    /// An automation context could not be built.
    ///
    /// Fatal at pool start-up: the pool must not silently run with fewer
    /// sessions than configured.
    #[error("Session start failed: {message}")]
    SessionStart {
        /// Description of the start-up failure.
        message: String,
    },

    // ========================================================================
    // Infrastructure Errors (transient)
    // ========================================================================
    /// Navigation failed.
    #[error("Navigation to {url} failed: {message}")]
    Navigation {
        /// URL that was being loaded.
        url: String,
        /// Description of the navigation failure.
        message: String,
    },

    /// Low-level connection or proxy failure.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Automation context or page terminated unexpectedly.
    #[error("Session closed: {message}")]
    SessionClosed {
        /// Description of the termination.
        message: String,
    },

    /// Bounded wait on a network-bound step expired.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Verification Errors (no proxy penalty)
    // ========================================================================
    /// Manual-verification deadline expired.
    ///
    /// The verification wall never cleared within its outer deadline. The
    /// job fails, but the endpoint is not penalized: the wall says nothing
    /// about the network path being broken.
    #[error("Manual verification timeout after {timeout_ms}ms")]
    VerificationTimeout {
        /// Milliseconds waited before giving up.
        timeout_ms: u64,
    },

    // ========================================================================
    // Capture Errors (no proxy penalty)
    // ========================================================================
    /// Expected payload never appeared within its observation window.
    #[error("Capture timeout waiting for {what} (last status: {})", last_status.map(|s| s.to_string()).unwrap_or_else(|| "none".into()))]
    CaptureTimeout {
        /// Which payload was being waited for.
        what: String,
        /// Last HTTP status observed for the pattern, if any.
        last_status: Option<u16>,
    },

    /// Result assembly failed.
    ///
    /// Required identifiers or payloads were missing after capture completed.
    #[error("Assembly failed: {message}")]
    Assembly {
        /// Description of what was missing.
        message: String,
    },

    // ========================================================================
    // Driver Errors
    // ========================================================================
    /// Driver-reported failure that maps to no other variant.
    #[error("Driver error: {message}")]
    Driver {
        /// Description of the driver failure.
        message: String,
    },
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid input error.
    #[inline]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates a session start error.
    #[inline]
    pub fn session_start(message: impl Into<String>) -> Self {
        Self::SessionStart {
            message: message.into(),
        }
    }

    /// Creates a navigation error.
    #[inline]
    pub fn navigation(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Navigation {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a session closed error.
    #[inline]
    pub fn session_closed(message: impl Into<String>) -> Self {
        Self::SessionClosed {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Creates a verification timeout error.
    #[inline]
    pub fn verification_timeout(timeout_ms: u64) -> Self {
        Self::VerificationTimeout { timeout_ms }
    }

    /// Creates a capture timeout error.
    #[inline]
    pub fn capture_timeout(what: impl Into<String>, last_status: Option<u16>) -> Self {
        Self::CaptureTimeout {
            what: what.into(),
            last_status,
        }
    }

    /// Creates an assembly error.
    #[inline]
    pub fn assembly(message: impl Into<String>) -> Self {
        Self::Assembly {
            message: message.into(),
        }
    }

    /// Creates a driver error.
    #[inline]
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::VerificationTimeout { .. } | Self::CaptureTimeout { .. }
        )
    }

    /// Returns `true` if this failure points at the network path rather
    /// than the job itself.
    ///
    /// Transient failures penalize the proxy entry in use and trigger a
    /// context rebuild before the error propagates. Capture, assembly, and
    /// verification-deadline failures are deliberately excluded: the
    /// expected data not showing up, or a wall not clearing, is no evidence
    /// against the endpoint.
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Navigation { .. }
                | Self::Connection { .. }
                | Self::SessionClosed { .. }
                | Self::Timeout { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
