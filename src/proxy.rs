//! Rotating proxy pool with failure-driven cooldown.
//!
//! The pool issues endpoints one at a time in round-robin order, skipping
//! entries that are temporarily disabled after reported failures. It is the
//! only state shared across concurrently-running workers, so every read and
//! mutation happens under a single monitor lock.
//!
//! Entries are created once at construction and never removed; failure and
//! success reports mutate them in place. The scan in [`ProxyPool::acquire`]
//! is O(pool size), which is fine for the single-digit pools this serves.

// ============================================================================
// Imports
// ============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::driver::ProxyServer;

// ============================================================================
// ProxyEndpoint
// ============================================================================

/// One rotatable endpoint with its failure state.
#[derive(Debug, Clone)]
struct ProxyEndpoint {
    server: ProxyServer,

    /// Entry is unusable until this instant. `None` means never penalized.
    cooldown_until: Option<Instant>,

    /// Informational pressure metric. Grows on failure, shrinks on success,
    /// floored at zero.
    fails: u32,
}

impl ProxyEndpoint {
    fn new(server: ProxyServer) -> Self {
        Self {
            server,
            cooldown_until: None,
            fails: 0,
        }
    }

    fn is_cooling(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

// ============================================================================
// ProxyLease
// ============================================================================

/// Handle to an acquired endpoint.
///
/// Cheap to clone; carries a copy of the endpoint address for session
/// construction plus the index used to report the outcome back. The lease
/// does not own the entry's lifecycle — the pool does.
#[derive(Debug, Clone)]
pub struct ProxyLease {
    index: usize,
    server: ProxyServer,
}

impl ProxyLease {
    /// The endpoint this lease points at.
    #[inline]
    #[must_use]
    pub fn server(&self) -> &ProxyServer {
        &self.server
    }
}

// ============================================================================
// EndpointStatus
// ============================================================================

/// Point-in-time view of one entry, for introspection and tests.
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    /// Endpoint address without credentials.
    pub server_url: String,

    /// Current failure count.
    pub fails: u32,

    /// Remaining cooldown, if the entry is currently disabled.
    pub cooldown_remaining: Option<Duration>,
}

// ============================================================================
// ProxyPool
// ============================================================================

/// Round-robin pool of proxy endpoints with cooldown-based backoff.
///
/// # Example
///
/// ```
/// use capture_pool::driver::ProxyServer;
/// use capture_pool::proxy::ProxyPool;
/// use std::time::Duration;
///
/// let pool = ProxyPool::new(ProxyServer::parse_list("http://a:1@h1:80,http://h2:81").unwrap());
/// let lease = pool.acquire().expect("entry available");
/// pool.report_failure(&lease, Duration::from_secs(120));
/// ```
pub struct ProxyPool {
    state: Mutex<PoolState>,
}

struct PoolState {
    entries: Vec<ProxyEndpoint>,
    cursor: usize,
}

impl ProxyPool {
    /// Creates a pool over the given endpoints, in configured order.
    ///
    /// An empty list is valid: every [`ProxyPool::acquire`] returns `None`
    /// and workers run unrotated.
    #[must_use]
    pub fn new(servers: Vec<ProxyServer>) -> Self {
        Self {
            state: Mutex::new(PoolState {
                entries: servers.into_iter().map(ProxyEndpoint::new).collect(),
                cursor: 0,
            }),
        }
    }

    /// Returns the next usable endpoint in round-robin order.
    ///
    /// Starts just past the last entry returned and skips entries still
    /// within their cooldown window. Returns `None` when the pool is empty
    /// or every entry is cooling; callers proceed without a rotated proxy.
    #[must_use]
    pub fn acquire(&self) -> Option<ProxyLease> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let len = state.entries.len();

        for step in 0..len {
            let index = (state.cursor + step) % len;
            if !state.entries[index].is_cooling(now) {
                state.cursor = (index + 1) % len;
                let lease = ProxyLease {
                    index,
                    server: state.entries[index].server.clone(),
                };
                debug!(proxy = %lease.server.server_url(), "Proxy acquired");
                return Some(lease);
            }
        }

        if len > 0 {
            warn!(pool_size = len, "All proxy entries cooling down; proceeding unrotated");
        }
        None
    }

    /// Reports a failure on the leased entry.
    ///
    /// Increments the failure count and disables the entry until
    /// `now + cooldown`. The window always restarts from the current moment;
    /// it never stacks on top of a previous cooldown.
    pub fn report_failure(&self, lease: &ProxyLease, cooldown: Duration) {
        let mut state = self.state.lock();
        let entry = &mut state.entries[lease.index];
        entry.fails += 1;
        entry.cooldown_until = Some(Instant::now() + cooldown);
        warn!(
            proxy = %entry.server.server_url(),
            fails = entry.fails,
            cooldown_ms = cooldown.as_millis() as u64,
            "Proxy failure reported"
        );
    }

    /// Reports a success on the leased entry, easing its failure pressure.
    pub fn report_success(&self, lease: &ProxyLease) {
        let mut state = self.state.lock();
        let entry = &mut state.entries[lease.index];
        entry.fails = entry.fails.saturating_sub(1);
        debug!(proxy = %entry.server.server_url(), fails = entry.fails, "Proxy success reported");
    }

    /// Number of configured entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns `true` when no entries are configured.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Sum of failure counts across all entries.
    #[must_use]
    pub fn pressure(&self) -> u32 {
        self.state.lock().entries.iter().map(|e| e.fails).sum()
    }

    /// Point-in-time view of every entry.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EndpointStatus> {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .iter()
            .map(|entry| EndpointStatus {
                server_url: entry.server.server_url(),
                fails: entry.fails,
                cooldown_remaining: entry
                    .cooldown_until
                    .filter(|until| *until > now)
                    .map(|until| until - now),
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
