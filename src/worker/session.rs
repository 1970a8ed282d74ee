//! One worker: a long-lived automation context executing one job at a time.
//!
//! A worker owns its context exclusively. Per execution it arms a
//! [`CaptureCoordinator`], navigates to the target page, sits out any
//! verification wall as a bounded `needs_manual` sub-state, waits for the
//! primary capture, and assembles the result from the primary payload plus
//! whichever benefits path succeeds first (direct fetch, then passive
//! fallback).
//!
//! Failure recovery: transient errors penalize the proxy entry in use and
//! rebuild the context against a freshly-rotated entry before the error
//! propagates, so the worker is always left reusable. Non-transient errors
//! propagate untouched — the context is presumed healthy.

// ============================================================================
// Imports
// ============================================================================

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::capture::{
    CaptureCoordinator, CapturePattern, FetchOutcome, await_condition, fetch_json_with_retries,
};
use crate::config::Config;
use crate::driver::{Browser, NavigateOptions, PageSession, WaitUntil};
use crate::error::{Error, Result};
use crate::identifiers::WorkerId;
use crate::job::{
    BenefitsKind, BenefitsPayload, CaptureResult, ParsedInput, ProgressSink, StatusUpdate,
};
use crate::proxy::{ProxyLease, ProxyPool};

// ============================================================================
// Constants
// ============================================================================

/// Pacing delay after the product page settles, in milliseconds.
const SETTLE_PACE_MS: RangeInclusive<u64> = 400..=900;

/// Pacing delay before the direct benefits fetch, in milliseconds.
const FETCH_PACE_MS: RangeInclusive<u64> = 250..=800;

// ============================================================================
// ExecutionContext
// ============================================================================

/// Shared collaborators handed to every execution.
#[derive(Clone)]
pub(crate) struct ExecutionContext {
    pub(crate) config: Arc<Config>,
    pub(crate) browser: Arc<dyn Browser>,
    pub(crate) proxies: Arc<ProxyPool>,
}

// ============================================================================
// Worker
// ============================================================================

/// One long-lived automation context bound to at most one job at a time.
pub struct Worker {
    id: WorkerId,
    busy: AtomicBool,
    inner: Mutex<WorkerInner>,
}

struct WorkerInner {
    session: Box<dyn PageSession>,
    lease: Option<ProxyLease>,
}

// ============================================================================
// Worker - Lifecycle
// ============================================================================

impl Worker {
    /// Builds a worker, acquiring a proxy lease and a fresh context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionStart`]; fatal to pool start-up.
    pub(crate) async fn start(
        id: WorkerId,
        browser: &Arc<dyn Browser>,
        proxies: &ProxyPool,
    ) -> Result<Self> {
        let lease = proxies.acquire();
        let session = browser
            .new_session(lease.as_ref().map(ProxyLease::server))
            .await
            .map_err(|e| match e {
                e @ Error::SessionStart { .. } => e,
                other => Error::session_start(other.to_string()),
            })?;

        info!(
            worker = %id,
            proxy = lease.as_ref().map(|l| l.server().server_url()),
            "Worker started"
        );

        Ok(Self {
            id,
            busy: AtomicBool::new(false),
            inner: Mutex::new(WorkerInner { session, lease }),
        })
    }

    /// This worker's stable identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Atomically reserves the worker for one job. Returns `false` when
    /// already busy.
    pub(crate) fn try_reserve(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Marks the worker idle again.
    pub(crate) fn release(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    /// Returns `true` while a job is running on this worker.
    #[inline]
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Worker - Execution
// ============================================================================

impl Worker {
    /// Runs one job to a terminal outcome, applying the recovery policy.
    pub(crate) async fn run_job(
        &self,
        cx: &ExecutionContext,
        input: &ParsedInput,
        progress: &ProgressSink,
    ) -> Result<CaptureResult> {
        let mut inner = self.inner.lock().await;

        match self.execute(&inner, cx, input, progress).await {
            Ok(result) => {
                if let Some(lease) = &inner.lease {
                    cx.proxies.report_success(lease);
                }
                Ok(result)
            }
            Err(err) => {
                warn!(worker = %self.id, error = %err, transient = err.is_transient(), "Job execution failed");
                if err.is_transient() {
                    if let Some(lease) = &inner.lease {
                        cx.proxies.report_failure(lease, cx.config.failure_cooldown);
                    }
                    self.rebuild(&mut inner, cx).await;
                }
                Err(err)
            }
        }
    }

    /// The per-job state machine.
    async fn execute(
        &self,
        inner: &WorkerInner,
        cx: &ExecutionContext,
        input: &ParsedInput,
        progress: &ProgressSink,
    ) -> Result<CaptureResult> {
        let session = inner.session.as_ref();
        let config = &cx.config;

        let primary = CapturePattern::for_identifier(&config.primary_template, &input.product_id)?;
        let fallback =
            CapturePattern::for_identifier(&config.fallback_template, &input.product_id)?;
        let coordinator =
            CaptureCoordinator::attach(session, primary, fallback, Arc::clone(progress));

        progress(StatusUpdate::running("Go to product page"));
        let page_url = config.product_page_url(input);
        let options = NavigateOptions {
            wait_until: WaitUntil::DomContentLoaded,
            timeout: config.navigation_timeout,
        };
        session.navigate(&page_url, &options).await?;

        pace(session, SETTLE_PACE_MS).await;

        let url = session.current_url().await;
        let title = session.current_title().await;
        if looks_like_verification(config, &url, &title) {
            progress(StatusUpdate::needs_manual(
                "Verification wall detected. Solve it in the browser and refresh.",
            ));
            self.await_verification_clear(session, cx, progress).await?;
            progress(StatusUpdate::running("Verification cleared"));
        }

        progress(StatusUpdate::running("Waiting for product details capture"));
        let captured = await_condition(
            || coordinator.has_primary(),
            config.capture_timeout,
            config.poll_interval,
        )
        .await;
        if !captured {
            return Err(Error::capture_timeout(
                "product details",
                coordinator.last_primary_status(),
            ));
        }
        let details = coordinator
            .primary()
            .ok_or_else(|| Error::assembly("primary payload missing after capture"))?;

        let channel_uid = details
            .body
            .pointer("/channel/channelUid")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| coordinator.channel_uid());
        let product_no = scalar_string(details.body.get("productNo"));
        let category_id = scalar_string(details.body.pointer("/category/categoryId"));

        let mut benefits: Option<BenefitsPayload> = None;

        if let (Some(channel), Some(product), Some(category)) =
            (channel_uid.as_deref(), product_no.as_deref(), category_id.as_deref())
        {
            let url = config.by_products_url(channel, product, category);
            pace(session, FETCH_PACE_MS).await;

            match fetch_json_with_retries(
                session,
                &url,
                config.fetch_attempts,
                config.fetch_backoff,
                progress,
            )
            .await
            {
                FetchOutcome::Success { status, body } => {
                    benefits = Some(BenefitsPayload {
                        kind: BenefitsKind::ByProducts,
                        url,
                        status,
                        body,
                    });
                }
                FetchOutcome::Failed { status, error } => {
                    debug!(worker = %self.id, ?status, error = %error, "Direct benefits fetch failed; falling back to passive capture");
                }
            }
        } else {
            debug!(worker = %self.id, "Primary payload lacks benefit identifiers; relying on passive capture");
        }

        if benefits.is_none() {
            progress(StatusUpdate::running(
                "Waiting for fallback product-benefits capture",
            ));
            await_condition(
                || coordinator.fallback().is_some(),
                config.fallback_timeout,
                config.poll_interval,
            )
            .await;

            if let Some(payload) = coordinator.fallback() {
                benefits = Some(BenefitsPayload {
                    kind: BenefitsKind::ProductBenefits,
                    url: payload.url,
                    status: payload.status,
                    body: payload.body,
                });
            }
        }

        let benefits = benefits.ok_or_else(|| Error::assembly("benefits capture failed"))?;

        Ok(CaptureResult {
            input: input.clone(),
            channel_uid,
            product_details: details,
            benefits,
            captured_at: Utc::now(),
        })
    }

    /// Sits on a verification wall until it clears or the deadline passes.
    ///
    /// Emits `needs_manual` once per poll so the job record keeps reporting
    /// the blocked state; the caller flips the record back to `running`.
    async fn await_verification_clear(
        &self,
        session: &dyn PageSession,
        cx: &ExecutionContext,
        progress: &ProgressSink,
    ) -> Result<()> {
        let timeout = cx.config.verification_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let url = session.current_url().await;
            let title = session.current_title().await;
            if !looks_like_verification(&cx.config, &url, &title) {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::verification_timeout(timeout.as_millis() as u64));
            }

            progress(StatusUpdate::needs_manual(
                "Waiting for manual verification. Solve it in the browser and refresh.",
            ));
            tokio::time::sleep(cx.config.verification_poll).await;
        }
    }

    /// Tears the context down and rebuilds it against a fresh proxy lease.
    ///
    /// A failed rebuild is logged but never masks the error that caused it;
    /// the next execution on this worker will surface the broken context.
    async fn rebuild(&self, inner: &mut WorkerInner, cx: &ExecutionContext) {
        if let Err(e) = inner.session.close().await {
            debug!(worker = %self.id, error = %e, "Stale context close failed");
        }

        let lease = cx.proxies.acquire();
        match cx
            .browser
            .new_session(lease.as_ref().map(ProxyLease::server))
            .await
        {
            Ok(session) => {
                info!(
                    worker = %self.id,
                    proxy = lease.as_ref().map(|l| l.server().server_url()),
                    "Worker context rebuilt"
                );
                inner.session = session;
                inner.lease = lease;
            }
            Err(e) => {
                error!(worker = %self.id, error = %e, "Worker rebuild failed");
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Heuristic for a verification wall: suspicious URL, suspicious title, or
/// any location off the allowed hosts.
fn looks_like_verification(config: &Config, url: &str, title: &str) -> bool {
    if config.verification_url_pattern.is_match(url) {
        return true;
    }
    if config.verification_title_pattern.is_match(title) {
        return true;
    }
    !config.allowed_host_pattern.is_match(url)
}

/// Random pacing delay through the session clock.
async fn pace(session: &dyn PageSession, range: RangeInclusive<u64>) {
    let ms = rand::thread_rng().gen_range(range);
    session.pause(Duration::from_millis(ms)).await;
}

/// Reads a JSON scalar as a string: strings pass through, numbers are
/// rendered. Anything else is treated as absent.
fn scalar_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;

    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    use crate::driver::ProxyServer;
    use crate::driver::fake::{
        FakeBrowser, ScriptedFetch, ScriptedNavigate, SessionScript,
    };
    use crate::job::JobStatus;

    fn test_config() -> Config {
        Config::builder()
            .navigation_timeout(Duration::from_secs(5))
            .capture_timeout(Duration::from_secs(3))
            .fallback_timeout(Duration::from_secs(2))
            .verification_timeout(Duration::from_secs(10))
            .failure_cooldown(Duration::from_secs(120))
            .build()
            .expect("config")
    }

    fn context(browser: Arc<FakeBrowser>, config: Config, proxies: Vec<ProxyServer>) -> ExecutionContext {
        ExecutionContext {
            config: Arc::new(config),
            browser,
            proxies: Arc::new(ProxyPool::new(proxies)),
        }
    }

    fn input() -> ParsedInput {
        ParsedInput {
            product_url: "https://smartstore.naver.com/shop/products/42".into(),
            store: "shop".into(),
            product_id: "42".into(),
        }
    }

    fn details_event() -> crate::driver::ResponseEvent {
        crate::driver::ResponseEvent {
            url: "https://smartstore.naver.com/i/v2/channels/chan/products/42".into(),
            status: 200,
            body: Some(json!({
                "channel": {"channelUid": "chan"},
                "productNo": 990,
                "category": {"categoryId": "50000"},
            })),
        }
    }

    fn recording_progress() -> (ProgressSink, Arc<PlMutex<Vec<StatusUpdate>>>) {
        let updates: Arc<PlMutex<Vec<StatusUpdate>>> = Arc::new(PlMutex::new(Vec::new()));
        let updates_clone = Arc::clone(&updates);
        let sink: ProgressSink = Arc::new(move |update| updates_clone.lock().push(update));
        (sink, updates)
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_direct_fetch() {
        let browser = FakeBrowser::new();
        browser.push_script(SessionScript {
            emit_on_navigate: vec![details_event()],
            direct: VecDeque::from([ScriptedFetch::Respond {
                status: 200,
                body: Some(json!({"benefit": "direct"})),
            }]),
            ..Default::default()
        });

        let cx = context(browser.clone(), test_config(), Vec::new());
        let worker = Worker::start(WorkerId::new(0), &cx.browser, &cx.proxies)
            .await
            .expect("worker");

        let (progress, _) = recording_progress();
        let result = worker
            .run_job(&cx, &input(), &progress)
            .await
            .expect("result");

        assert_eq!(result.channel_uid.as_deref(), Some("chan"));
        assert_eq!(result.benefits.kind, BenefitsKind::ByProducts);
        assert_eq!(result.benefits.body, json!({"benefit": "direct"}));
        assert_eq!(result.product_details.body["productNo"], 990);

        // The rendered fetch URL carries the resolved identifiers.
        let fetched = browser.session(0).direct_requests();
        assert_eq!(
            fetched,
            vec![
                "https://smartstore.naver.com/i/v2/channels/chan/benefits/by-products/990?categoryId=50000"
                    .to_string()
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_when_identifiers_missing() {
        let browser = FakeBrowser::new();
        let mut primary = details_event();
        primary.body = Some(json!({"channel": {"channelUid": "chan"}})); // no productNo/category
        browser.push_script(SessionScript {
            emit_on_navigate: vec![
                primary,
                crate::driver::ResponseEvent {
                    url: "https://smartstore.naver.com/i/v2/channels/chan/product-benefits/42"
                        .into(),
                    status: 200,
                    body: Some(json!({"benefit": "passive"})),
                },
            ],
            ..Default::default()
        });

        let cx = context(browser.clone(), test_config(), Vec::new());
        let worker = Worker::start(WorkerId::new(0), &cx.browser, &cx.proxies)
            .await
            .expect("worker");

        let result = worker
            .run_job(&cx, &input(), &crate::job::null_progress())
            .await
            .expect("result");

        assert_eq!(result.benefits.kind, BenefitsKind::ProductBenefits);
        assert_eq!(result.benefits.body, json!({"benefit": "passive"}));
        // No direct fetch was attempted without the identifiers.
        assert!(browser.session(0).direct_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_timeout_is_not_penalized() {
        let browser = FakeBrowser::new();
        browser.push_script(SessionScript::default()); // navigates fine, emits nothing

        let proxies = ProxyServer::parse_list("http://h0:8000").expect("proxies");
        let cx = context(browser.clone(), test_config(), proxies);
        let worker = Worker::start(WorkerId::new(0), &cx.browser, &cx.proxies)
            .await
            .expect("worker");

        let err = worker
            .run_job(&cx, &input(), &crate::job::null_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CaptureTimeout { .. }));

        // No proxy penalty, no rebuild.
        assert!(cx.proxies.snapshot()[0].cooldown_remaining.is_none());
        assert_eq!(browser.session_count(), 1);
        assert!(!browser.session(0).is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_penalizes_and_rebuilds() {
        let browser = FakeBrowser::new();
        browser.push_script(SessionScript {
            navigations: VecDeque::from([ScriptedNavigate::Fail("net reset".into())]),
            ..Default::default()
        });

        let proxies = ProxyServer::parse_list("http://h0:8000,http://h1:8001").expect("proxies");
        let cx = context(browser.clone(), test_config(), proxies);
        let worker = Worker::start(WorkerId::new(0), &cx.browser, &cx.proxies)
            .await
            .expect("worker");

        let err = worker
            .run_job(&cx, &input(), &crate::job::null_progress())
            .await
            .unwrap_err();
        assert!(err.is_transient());

        // The failed entry cools down and the context was rebuilt against
        // the next entry in rotation.
        let snapshot = cx.proxies.snapshot();
        assert_eq!(snapshot[0].fails, 1);
        assert!(snapshot[0].cooldown_remaining.is_some());

        assert!(browser.session(0).is_closed());
        assert_eq!(browser.session_count(), 2);
        assert_eq!(
            browser.session_proxies(),
            vec![
                Some("http://h0:8000".to_string()),
                Some("http://h1:8001".to_string())
            ]
        );

        // And the worker is immediately reusable on the rebuilt context.
        let err = worker
            .run_job(&cx, &input(), &crate::job::null_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CaptureTimeout { .. }));
        assert_eq!(browser.session(1).navigations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_wall_clears() {
        let browser = FakeBrowser::new();
        browser.push_script(SessionScript {
            location_after_navigate: Some((
                "https://verify.captcha-wall.example/challenge".into(),
                "Security check".into(),
            )),
            emit_on_navigate: vec![details_event()],
            direct: VecDeque::from([ScriptedFetch::Respond {
                status: 200,
                body: Some(json!({"benefit": "direct"})),
            }]),
            ..Default::default()
        });

        let cx = context(browser.clone(), test_config(), Vec::new());
        let worker = Worker::start(WorkerId::new(0), &cx.browser, &cx.proxies)
            .await
            .expect("worker");

        let (progress, updates) = recording_progress();

        let session = browser.session(0);
        let clear = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            session.set_location(
                "https://smartstore.naver.com/shop/products/42",
                "Product page",
            );
        });

        let result = worker.run_job(&cx, &input(), &progress).await.expect("result");
        clear.await.expect("clear task");

        assert_eq!(result.benefits.kind, BenefitsKind::ByProducts);

        let statuses: Vec<JobStatus> = updates.lock().iter().map(|u| u.status).collect();
        assert!(statuses.contains(&JobStatus::NeedsManual));
        // The wall clearing flips the stream back to running.
        let last_manual = statuses
            .iter()
            .rposition(|s| *s == JobStatus::NeedsManual)
            .expect("manual update");
        assert!(statuses[last_manual + 1..].contains(&JobStatus::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_deadline_is_not_penalized() {
        let browser = FakeBrowser::new();
        browser.push_script(SessionScript {
            location_after_navigate: Some((
                "https://verify.captcha-wall.example/challenge".into(),
                "Security check".into(),
            )),
            ..Default::default()
        });

        let proxies = ProxyServer::parse_list("http://h0:8000").expect("proxies");
        let cx = context(browser.clone(), test_config(), proxies);
        let worker = Worker::start(WorkerId::new(0), &cx.browser, &cx.proxies)
            .await
            .expect("worker");

        let err = worker
            .run_job(&cx, &input(), &crate::job::null_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VerificationTimeout { .. }));
        assert!(!err.is_transient());

        // The wall not clearing says nothing about the endpoint: no proxy
        // cooldown, no rebuild, the context stays up.
        assert!(cx.proxies.snapshot()[0].cooldown_remaining.is_none());
        assert_eq!(cx.proxies.snapshot()[0].fails, 0);
        assert_eq!(browser.session_count(), 1);
        assert!(!browser.session(0).is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_eases_proxy_pressure() {
        let browser = FakeBrowser::new();
        browser.push_script(SessionScript {
            emit_on_navigate: vec![details_event()],
            direct: VecDeque::from([ScriptedFetch::Respond {
                status: 200,
                body: Some(json!({})),
            }]),
            ..Default::default()
        });

        let proxies = ProxyServer::parse_list("http://h0:8000").expect("proxies");
        let cx = context(browser.clone(), test_config(), proxies);

        let worker = Worker::start(WorkerId::new(0), &cx.browser, &cx.proxies)
            .await
            .expect("worker");

        // Seed pressure so the success has something to ease.
        let lease = cx.proxies.acquire().expect("lease");
        cx.proxies.report_failure(&lease, Duration::ZERO);
        assert_eq!(cx.proxies.pressure(), 1);

        worker
            .run_job(&cx, &input(), &crate::job::null_progress())
            .await
            .expect("result");
        assert_eq!(cx.proxies.pressure(), 0);
    }

    #[test]
    fn test_verification_heuristic() {
        let config = test_config();

        assert!(looks_like_verification(
            &config,
            "https://smartstore.naver.com/captcha/page",
            ""
        ));
        assert!(looks_like_verification(
            &config,
            "https://smartstore.naver.com/shop/products/1",
            "보안 확인"
        ));
        // Off-host counts as a wall even with an innocuous title.
        assert!(looks_like_verification(
            &config,
            "https://elsewhere.example/landing",
            "Welcome"
        ));
        assert!(!looks_like_verification(
            &config,
            "https://smartstore.naver.com/shop/products/1",
            "Product page"
        ));
    }

    #[test]
    fn test_scalar_string() {
        assert_eq!(scalar_string(Some(&json!("abc"))), Some("abc".into()));
        assert_eq!(scalar_string(Some(&json!(42))), Some("42".into()));
        assert_eq!(scalar_string(Some(&json!({"nested": 1}))), None);
        assert_eq!(scalar_string(None), None);
    }
}
