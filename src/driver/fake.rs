//! Scripted in-memory driver.
//!
//! Implements [`Browser`] and [`PageSession`] against canned scripts instead
//! of a live browser, so scheduling, capture, and recovery logic can be
//! exercised by injecting synthetic network events. Compiled for tests and,
//! behind the `test-util` feature, for benches and downstream consumers.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::driver::{
    Browser, FetchResponse, NavigateOptions, PageSession, ProxyServer, ResponseEvent,
    ResponseObserver,
};
use crate::error::{Error, Result};

// ============================================================================
// Scripts
// ============================================================================

/// Outcome of one scripted navigation.
#[derive(Debug, Clone)]
pub enum ScriptedNavigate {
    /// Navigation completes normally.
    Succeed,

    /// Navigation fails with a load error.
    Fail(String),

    /// Navigation exceeds its timeout.
    Timeout,
}

/// Outcome of one scripted direct request.
#[derive(Debug, Clone)]
pub enum ScriptedFetch {
    /// Request completes with this status and body.
    Respond {
        /// HTTP status code.
        status: u16,
        /// JSON body, if any.
        body: Option<Value>,
    },

    /// Request fails at the transport level.
    ConnectionError(String),
}

/// Script for one session's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SessionScript {
    /// Per-navigation outcomes, consumed in order. Exhausted → succeed.
    pub navigations: VecDeque<ScriptedNavigate>,

    /// Location reported after a successful navigation, overriding the
    /// requested URL. Used to simulate verification-wall redirects.
    pub location_after_navigate: Option<(String, String)>,

    /// Events pushed to the observer right after a successful navigation.
    pub emit_on_navigate: Vec<ResponseEvent>,

    /// Per-direct-request outcomes, consumed in order. Exhausted → 404.
    pub direct: VecDeque<ScriptedFetch>,
}

// ============================================================================
// FakeSessionState
// ============================================================================

/// Shared state of one fake session, visible to the test while a worker
/// drives the session concurrently.
pub struct FakeSessionState {
    script: Mutex<SessionScript>,
    location: Mutex<(String, String)>,
    observer: Mutex<Option<ResponseObserver>>,
    closed: AtomicBool,
    navigations: Mutex<Vec<String>>,
    direct_requests: Mutex<Vec<String>>,
}

impl FakeSessionState {
    fn new(script: SessionScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            location: Mutex::new((String::new(), String::new())),
            observer: Mutex::new(None),
            closed: AtomicBool::new(false),
            navigations: Mutex::new(Vec::new()),
            direct_requests: Mutex::new(Vec::new()),
        })
    }

    /// Pushes a synthetic response event to the registered observer.
    pub fn emit(&self, event: ResponseEvent) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer(&event);
        }
    }

    /// Overrides the reported page location.
    pub fn set_location(&self, url: impl Into<String>, title: impl Into<String>) {
        *self.location.lock() = (url.into(), title.into());
    }

    /// Returns `true` once the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// URLs navigated to, in order.
    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().clone()
    }

    /// URLs direct-fetched, in order.
    pub fn direct_requests(&self) -> Vec<String> {
        self.direct_requests.lock().clone()
    }
}

// ============================================================================
// FakeSession
// ============================================================================

struct FakeSession(Arc<FakeSessionState>);

#[async_trait]
impl PageSession for FakeSession {
    async fn navigate(&self, url: &str, options: &NavigateOptions) -> Result<()> {
        self.0.navigations.lock().push(url.to_string());

        let outcome = self
            .0
            .script
            .lock()
            .navigations
            .pop_front()
            .unwrap_or(ScriptedNavigate::Succeed);

        match outcome {
            ScriptedNavigate::Succeed => {}
            ScriptedNavigate::Fail(message) => return Err(Error::navigation(url, message)),
            ScriptedNavigate::Timeout => {
                return Err(Error::timeout("navigation", options.timeout.as_millis() as u64));
            }
        }

        let (loc_url, loc_title) = self
            .0
            .script
            .lock()
            .location_after_navigate
            .clone()
            .unwrap_or_else(|| (url.to_string(), String::new()));
        self.0.set_location(loc_url, loc_title);

        let events: Vec<ResponseEvent> =
            std::mem::take(&mut self.0.script.lock().emit_on_navigate);
        for event in events {
            self.0.emit(event);
        }

        Ok(())
    }

    async fn current_url(&self) -> String {
        self.0.location.lock().0.clone()
    }

    async fn current_title(&self) -> String {
        self.0.location.lock().1.clone()
    }

    fn observe_responses(&self, observer: ResponseObserver) {
        *self.0.observer.lock() = Some(observer);
    }

    async fn direct_request(
        &self,
        url: &str,
        _headers: &[(String, String)],
    ) -> Result<FetchResponse> {
        self.0.direct_requests.lock().push(url.to_string());

        let outcome = self
            .0
            .script
            .lock()
            .direct
            .pop_front()
            .unwrap_or(ScriptedFetch::Respond {
                status: 404,
                body: None,
            });

        match outcome {
            ScriptedFetch::Respond { status, body } => Ok(FetchResponse { status, body }),
            ScriptedFetch::ConnectionError(message) => Err(Error::connection(message)),
        }
    }

    async fn close(&self) -> Result<()> {
        self.0.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// FakeBrowser
// ============================================================================

/// Scripted [`Browser`] implementation.
///
/// Each `new_session` call consumes the next queued [`SessionScript`]
/// (default script when the queue is empty) and records the proxy it was
/// given, so tests can assert rotation behavior.
#[derive(Default)]
pub struct FakeBrowser {
    scripts: Mutex<VecDeque<SessionScript>>,
    sessions: Mutex<Vec<Arc<FakeSessionState>>>,
    session_proxies: Mutex<Vec<Option<String>>>,
    fail_sessions: Mutex<u32>,
}

impl FakeBrowser {
    /// Creates a fake browser with no scripts queued.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a script for the next session built.
    pub fn push_script(&self, script: SessionScript) {
        self.scripts.lock().push_back(script);
    }

    /// Makes the next `count` session builds fail.
    pub fn fail_next_sessions(&self, count: u32) {
        *self.fail_sessions.lock() += count;
    }

    /// Number of sessions built so far.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// State handle for the `index`-th session built.
    ///
    /// # Panics
    ///
    /// Panics if no such session exists yet (test bug).
    pub fn session(&self, index: usize) -> Arc<FakeSessionState> {
        self.sessions.lock()[index].clone()
    }

    /// Proxy server URLs handed to each session build, in order.
    pub fn session_proxies(&self) -> Vec<Option<String>> {
        self.session_proxies.lock().clone()
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn new_session(&self, proxy: Option<&ProxyServer>) -> Result<Box<dyn PageSession>> {
        {
            let mut failures = self.fail_sessions.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::session_start("scripted session failure"));
            }
        }

        let script = self.scripts.lock().pop_front().unwrap_or_default();
        let state = FakeSessionState::new(script);

        self.sessions.lock().push(state.clone());
        self.session_proxies
            .lock()
            .push(proxy.map(ProxyServer::server_url));

        Ok(Box::new(FakeSession(state)))
    }
}

// ============================================================================
// Tests
// ============================================================================
