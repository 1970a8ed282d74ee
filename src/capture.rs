//! Capture coordination: matching observed network exchanges to expected
//! payloads by URL pattern.
//!
//! A [`CaptureCoordinator`] is armed once per job execution, before the
//! navigation that is expected to trigger the exchanges. It watches the
//! session's response stream and keeps at most one successful payload per
//! tracked pattern — a primary pattern and a fallback pattern sharing the
//! same identifier. Slots are write-once: the first successful (2xx,
//! JSON-decodable) match locks its slot; later duplicates are ignored.
//! Non-success or body-less matches record status only, so a failed attempt
//! never blocks a later success on the same pattern.
//!
//! State is queried through non-blocking accessors plus the generic bounded
//! poll [`await_condition`], which makes the whole thing testable with
//! synthetic events instead of a live network stream.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::driver::{PageSession, ResponseEvent};
use crate::error::{Error, Result};
use crate::job::{ProgressSink, StatusUpdate};

// ============================================================================
// Constants
// ============================================================================

/// Jitter range added to each direct-fetch backoff step, in milliseconds.
/// Spreads retries so concurrently failing workers don't burst in sync.
const FETCH_JITTER_MS: std::ops::RangeInclusive<u64> = 100..=400;

// ============================================================================
// CapturePattern
// ============================================================================

/// Compiled URL pattern for one tracked payload.
///
/// Built from a template carrying an `{id}` placeholder; the identifier is
/// regex-escaped before substitution and matching is case-insensitive. The
/// template's first capture group, when present, resolves the channel
/// identifier.
///
/// # Example
///
/// ```
/// use capture_pool::capture::CapturePattern;
///
/// let pattern = CapturePattern::for_identifier(
///     r"/i/v2/channels/([^/]+)/products/{id}(?:\?|$)",
///     "12345",
/// ).unwrap();
/// assert!(pattern.matches("https://host/i/v2/channels/abc/products/12345").is_some());
/// ```
#[derive(Debug, Clone)]
pub struct CapturePattern {
    regex: Regex,
}

impl CapturePattern {
    /// Compiles `template` with `{id}` replaced by the escaped identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the template lacks the placeholder or
    /// does not compile.
    pub fn for_identifier(template: &str, identifier: &str) -> Result<Self> {
        if !template.contains("{id}") {
            return Err(Error::config(format!(
                "capture template {template:?} is missing the {{id}} placeholder"
            )));
        }

        let pattern = template.replace("{id}", &regex::escape(identifier));
        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::config(format!("capture template {template:?}: {e}")))?;

        Ok(Self { regex })
    }

    /// Matches `url`, returning the resolved channel identifier (capture
    /// group 1) on a hit. `Some(None)` means the pattern matched but defines
    /// no identifier group.
    #[must_use]
    pub fn matches(&self, url: &str) -> Option<Option<String>> {
        self.regex
            .captures(url)
            .map(|captures| captures.get(1).map(|m| m.as_str().to_string()))
    }
}

// ============================================================================
// CapturedPayload
// ============================================================================

/// One recorded payload with its source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedPayload {
    /// Source URL of the exchange.
    pub url: String,

    /// HTTP status of the exchange.
    pub status: u16,

    /// Decoded JSON body.
    pub body: Value,
}

// ============================================================================
// CaptureState
// ============================================================================

#[derive(Debug, Default)]
struct Slot {
    last_status: Option<u16>,
    payload: Option<CapturedPayload>,
}

#[derive(Debug, Default)]
struct CaptureState {
    primary: Slot,
    fallback: Slot,
    channel_uid: Option<String>,
}

// ============================================================================
// CaptureCoordinator
// ============================================================================

/// Observes a session's response stream for the duration of one execution.
///
/// Created fresh per job via [`CaptureCoordinator::attach`]; discarded when
/// the execution ends. Never reused across jobs.
pub struct CaptureCoordinator {
    state: Arc<Mutex<CaptureState>>,
}

impl CaptureCoordinator {
    /// Registers an observer on `session` and returns the coordinator.
    ///
    /// For every observed exchange the primary pattern is tried first, then
    /// the fallback. `progress` fires at most once per newly-recorded
    /// payload.
    pub fn attach(
        session: &dyn PageSession,
        primary: CapturePattern,
        fallback: CapturePattern,
        progress: ProgressSink,
    ) -> Self {
        let state = Arc::new(Mutex::new(CaptureState::default()));

        let observer_state = Arc::clone(&state);
        session.observe_responses(Arc::new(move |event| {
            Self::observe(&observer_state, &primary, &fallback, &progress, event);
        }));

        Self { state }
    }

    fn observe(
        state: &Mutex<CaptureState>,
        primary: &CapturePattern,
        fallback: &CapturePattern,
        progress: &ProgressSink,
        event: &ResponseEvent,
    ) {
        trace!(url = %event.url, status = event.status, "Observed exchange");

        let mut state = state.lock();

        if state.primary.payload.is_none() {
            if let Some(channel) = primary.matches(&event.url) {
                state.primary.last_status = Some(event.status);
                if event.is_success() {
                    if let Some(body) = &event.body {
                        state.primary.payload = Some(CapturedPayload {
                            url: event.url.clone(),
                            status: event.status,
                            body: body.clone(),
                        });
                        state.channel_uid = channel;
                        debug!(url = %event.url, "Primary payload captured");
                        progress(StatusUpdate::running("Captured product details JSON"));
                    }
                }
            }
        }

        if state.fallback.payload.is_none() {
            if let Some(channel) = fallback.matches(&event.url) {
                state.fallback.last_status = Some(event.status);
                if event.is_success() {
                    if let Some(body) = &event.body {
                        state.fallback.payload = Some(CapturedPayload {
                            url: event.url.clone(),
                            status: event.status,
                            body: body.clone(),
                        });
                        if state.channel_uid.is_none() {
                            state.channel_uid = channel;
                        }
                        debug!(url = %event.url, "Fallback payload captured");
                        progress(StatusUpdate::running(
                            "Captured fallback product-benefits JSON",
                        ));
                    }
                }
            }
        }
    }

    /// Returns `true` once the primary payload is recorded.
    #[must_use]
    pub fn has_primary(&self) -> bool {
        self.state.lock().primary.payload.is_some()
    }

    /// Returns the primary payload, if recorded.
    #[must_use]
    pub fn primary(&self) -> Option<CapturedPayload> {
        self.state.lock().primary.payload.clone()
    }

    /// Returns the fallback payload, if recorded.
    #[must_use]
    pub fn fallback(&self) -> Option<CapturedPayload> {
        self.state.lock().fallback.payload.clone()
    }

    /// Returns the channel identifier resolved from the first matching
    /// exchange, if any.
    #[must_use]
    pub fn channel_uid(&self) -> Option<String> {
        self.state.lock().channel_uid.clone()
    }

    /// Last HTTP status observed for the primary pattern, recorded even for
    /// attempts that did not lock the slot.
    #[must_use]
    pub fn last_primary_status(&self) -> Option<u16> {
        self.state.lock().primary.last_status
    }
}

// ============================================================================
// await_condition
// ============================================================================

/// Polls `predicate` every `interval` until it holds or `timeout` elapses.
///
/// Returns the predicate's final value; never errors and returns no later
/// than `timeout` plus one interval.
pub async fn await_condition(
    predicate: impl Fn() -> bool,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    predicate()
}

// ============================================================================
// fetch_json_with_retries
// ============================================================================

/// Outcome of a retried direct fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// A 2xx response with a decodable JSON body.
    Success {
        /// HTTP status code.
        status: u16,
        /// Decoded body.
        body: Value,
    },

    /// All attempts exhausted, or a 2xx response whose body did not decode.
    Failed {
        /// Last observed HTTP status, if any response arrived.
        status: Option<u16>,
        /// Last observed error.
        error: String,
    },
}

impl FetchOutcome {
    /// Returns `true` for [`FetchOutcome::Success`].
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Issues a direct request through the session's network identity, retrying
/// on any outcome other than a parseable 2xx.
///
/// Backoff between attempts is `backoff_base * attempt` plus a bounded
/// random jitter. A 2xx whose body fails to decode short-circuits: retrying
/// a parse failure against the same endpoint is pointless.
pub async fn fetch_json_with_retries(
    session: &dyn PageSession,
    url: &str,
    attempts: u32,
    backoff_base: Duration,
    progress: &ProgressSink,
) -> FetchOutcome {
    let headers = [
        (
            "accept".to_string(),
            "application/json, text/plain, */*".to_string(),
        ),
        (
            "accept-language".to_string(),
            "ko-KR,ko;q=0.9,en;q=0.8".to_string(),
        ),
    ];

    let mut last_status = None;
    let mut last_error = String::from("unknown");

    for attempt in 1..=attempts {
        match session.direct_request(url, &headers).await {
            Ok(response) => {
                progress(StatusUpdate::running(format!(
                    "benefits/by-products attempt {attempt}/{attempts} status={}",
                    response.status
                )));
                last_status = Some(response.status);

                if response.is_success() {
                    match response.body {
                        Some(body) => {
                            return FetchOutcome::Success {
                                status: response.status,
                                body,
                            };
                        }
                        None => {
                            return FetchOutcome::Failed {
                                status: Some(response.status),
                                error: "JSON parse failed".to_string(),
                            };
                        }
                    }
                }

                last_error = format!("HTTP {}", response.status);
            }
            Err(e) => {
                debug!(url = %url, attempt, error = %e, "Direct fetch attempt failed");
                last_error = e.to_string();
            }
        }

        if attempt < attempts {
            let jitter = rand::thread_rng().gen_range(FETCH_JITTER_MS);
            let delay = backoff_base * attempt + Duration::from_millis(jitter);
            tokio::time::sleep(delay).await;
        }
    }

    FetchOutcome::Failed {
        status: last_status,
        error: last_error,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::driver::Browser;
    use crate::driver::fake::{FakeBrowser, ScriptedFetch, SessionScript};

    const PRIMARY: &str = r"/i/v2/channels/([^/]+)/products/{id}(?:\?|$)";
    const FALLBACK: &str = r"/i/v2/channels/([^/]+)/product-benefits/{id}(?:\?|$)";

    fn patterns(id: &str) -> (CapturePattern, CapturePattern) {
        (
            CapturePattern::for_identifier(PRIMARY, id).expect("primary"),
            CapturePattern::for_identifier(FALLBACK, id).expect("fallback"),
        )
    }

    fn event(url: &str, status: u16, body: Option<Value>) -> ResponseEvent {
        ResponseEvent {
            url: url.into(),
            status,
            body,
        }
    }

    async fn coordinator_on_fake(
        id: &str,
        progress: ProgressSink,
    ) -> (CaptureCoordinator, Arc<crate::driver::fake::FakeSessionState>) {
        let browser = FakeBrowser::new();
        let session = browser.new_session(None).await.expect("session");
        let (primary, fallback) = patterns(id);
        let coordinator = CaptureCoordinator::attach(session.as_ref(), primary, fallback, progress);
        (coordinator, browser.session(0))
    }

    #[test]
    fn test_pattern_escapes_identifier() {
        let pattern = CapturePattern::for_identifier(PRIMARY, "12345").expect("pattern");
        assert!(
            pattern
                .matches("https://h/i/v2/channels/abc/products/12345?x=1")
                .is_some()
        );
        // A different product id must not match.
        assert!(
            pattern
                .matches("https://h/i/v2/channels/abc/products/123456")
                .is_none()
        );
    }

    #[test]
    fn test_pattern_requires_placeholder() {
        let err = CapturePattern::for_identifier("/static/path", "1").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn test_first_successful_match_wins() {
        let (coordinator, session) =
            coordinator_on_fake("7", crate::job::null_progress()).await;

        session.emit(event(
            "https://h/i/v2/channels/one/products/7",
            200,
            Some(json!({"seq": 1})),
        ));
        session.emit(event(
            "https://h/i/v2/channels/two/products/7",
            200,
            Some(json!({"seq": 2})),
        ));

        let payload = coordinator.primary().expect("payload");
        assert_eq!(payload.body, json!({"seq": 1}));
        assert_eq!(payload.url, "https://h/i/v2/channels/one/products/7");
        assert_eq!(coordinator.channel_uid().as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn test_failed_attempt_does_not_lock_slot() {
        let (coordinator, session) =
            coordinator_on_fake("7", crate::job::null_progress()).await;

        // 403, then 2xx with an undecodable body: neither locks the slot.
        session.emit(event("https://h/i/v2/channels/a/products/7", 403, None));
        assert!(!coordinator.has_primary());
        assert_eq!(coordinator.last_primary_status(), Some(403));

        session.emit(event("https://h/i/v2/channels/a/products/7", 200, None));
        assert!(!coordinator.has_primary());

        // A later success still lands.
        session.emit(event(
            "https://h/i/v2/channels/a/products/7",
            200,
            Some(json!({"ok": true})),
        ));
        assert!(coordinator.has_primary());
    }

    #[tokio::test]
    async fn test_fallback_only_capture() {
        let (coordinator, session) =
            coordinator_on_fake("7", crate::job::null_progress()).await;

        session.emit(event(
            "https://h/i/v2/channels/ch/product-benefits/7",
            200,
            Some(json!({"benefit": 1})),
        ));

        assert!(!coordinator.has_primary());
        assert!(coordinator.primary().is_none());
        let fallback = coordinator.fallback().expect("fallback");
        assert_eq!(fallback.body, json!({"benefit": 1}));
        // Fallback resolves the channel when the primary never did.
        assert_eq!(coordinator.channel_uid().as_deref(), Some("ch"));
    }

    #[tokio::test]
    async fn test_progress_fires_once_per_slot() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let progress: ProgressSink = Arc::new(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let (_coordinator, session) = coordinator_on_fake("7", progress).await;

        for _ in 0..3 {
            session.emit(event(
                "https://h/i/v2/channels/a/products/7",
                200,
                Some(json!({})),
            ));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        session.emit(event(
            "https://h/i/v2/channels/a/product-benefits/7",
            200,
            Some(json!({})),
        ));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_condition_bound() {
        let start = tokio::time::Instant::now();
        let held = await_condition(
            || false,
            Duration::from_secs(2),
            Duration::from_millis(250),
        )
        .await;
        assert!(!held);

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed <= Duration::from_millis(2250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_condition_observes_change() {
        let flag = Arc::new(AtomicUsize::new(0));
        let flag_clone = Arc::clone(&flag);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            flag_clone.store(1, Ordering::SeqCst);
        });

        let held = await_condition(
            move || flag.load(Ordering::SeqCst) == 1,
            Duration::from_secs(5),
            Duration::from_millis(250),
        )
        .await;
        assert!(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_retries_until_success() {
        let browser = FakeBrowser::new();
        browser.push_script(SessionScript {
            direct: VecDeque::from([
                ScriptedFetch::ConnectionError("tunnel reset".into()),
                ScriptedFetch::Respond {
                    status: 500,
                    body: None,
                },
                ScriptedFetch::Respond {
                    status: 200,
                    body: Some(json!({"won": true})),
                },
            ]),
            ..Default::default()
        });
        let session = browser.new_session(None).await.expect("session");

        let outcome = fetch_json_with_retries(
            session.as_ref(),
            "https://h/api/benefits",
            3,
            Duration::from_millis(400),
            &crate::job::null_progress(),
        )
        .await;

        match outcome {
            FetchOutcome::Success { status, body } => {
                assert_eq!(status, 200);
                assert_eq!(body, json!({"won": true}));
            }
            FetchOutcome::Failed { .. } => panic!("expected success"),
        }
        assert_eq!(browser.session(0).direct_requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_exhaustion_carries_last_error() {
        let browser = FakeBrowser::new();
        browser.push_script(SessionScript {
            direct: VecDeque::from([
                ScriptedFetch::Respond {
                    status: 500,
                    body: None,
                },
                ScriptedFetch::Respond {
                    status: 429,
                    body: None,
                },
            ]),
            ..Default::default()
        });
        let session = browser.new_session(None).await.expect("session");

        let outcome = fetch_json_with_retries(
            session.as_ref(),
            "https://h/api/benefits",
            2,
            Duration::from_millis(400),
            &crate::job::null_progress(),
        )
        .await;

        match outcome {
            FetchOutcome::Failed { status, error } => {
                assert_eq!(status, Some(429));
                assert_eq!(error, "HTTP 429");
            }
            FetchOutcome::Success { .. } => panic!("expected failure"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_parse_failure_short_circuits() {
        let browser = FakeBrowser::new();
        browser.push_script(SessionScript {
            direct: VecDeque::from([ScriptedFetch::Respond {
                status: 204,
                body: None,
            }]),
            ..Default::default()
        });
        let session = browser.new_session(None).await.expect("session");

        let outcome = fetch_json_with_retries(
            session.as_ref(),
            "https://h/api/benefits",
            3,
            Duration::from_millis(400),
            &crate::job::null_progress(),
        )
        .await;

        match outcome {
            FetchOutcome::Failed { status, error } => {
                assert_eq!(status, Some(204));
                assert_eq!(error, "JSON parse failed");
            }
            FetchOutcome::Success { .. } => panic!("expected failure"),
        }
        // One attempt only: a parse failure is not retried.
        assert_eq!(browser.session(0).direct_requests().len(), 1);
    }
}
