//! Fixed-size worker pool with a FIFO queue.
//!
//! Submission is synchronous: the input is validated, a `queued` record is
//! created, and the job either dispatches immediately onto an idle worker or
//! waits in arrival order. Dispatch re-runs after every submission and after
//! every job completion, so the queue drains as fast as workers free up.
//!
//! The pool starts all of its automation contexts up front and refuses to
//! start at all if any of them fails to build. Degraded capacity would be
//! invisible to callers otherwise.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;
use crate::driver::Browser;
use crate::error::Result;
use crate::identifiers::{JobId, WorkerId};
use crate::job::{JobInput, JobRecord, JobStore, ParsedInput, ProgressSink, StatusUpdate, parse_input};
use crate::proxy::{EndpointStatus, ProxyPool};

use super::session::{ExecutionContext, Worker};

// ============================================================================
// QueuedJob
// ============================================================================

struct QueuedJob {
    id: JobId,
    input: ParsedInput,
}

// ============================================================================
// WorkerPool
// ============================================================================

/// Fixed-size pool of automation contexts plus the FIFO scheduler that
/// serializes jobs onto them.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use capture_pool::{Config, JobInput, WorkerPool};
/// # use capture_pool::driver::Browser;
///
/// # async fn example(browser: Arc<dyn Browser>) -> capture_pool::Result<()> {
/// let pool = WorkerPool::start(Config::builder().pool_size(2).build()?, browser).await?;
/// let handle = pool.submit(JobInput {
///     product_url: "https://smartstore.naver.com/shop/products/12345".into(),
/// })?;
/// let record = handle.wait(Duration::from_millis(500)).await;
/// # Ok(())
/// # }
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").finish_non_exhaustive()
    }
}

struct PoolShared {
    cx: ExecutionContext,
    workers: Vec<Arc<Worker>>,
    queue: Mutex<VecDeque<QueuedJob>>,
    store: Arc<JobStore>,
    sweeper: JoinHandle<()>,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

impl WorkerPool {
    /// Starts the pool: builds every automation context, then spawns the
    /// record sweeper.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionStart`](crate::Error::SessionStart) when any
    /// context fails to build. Contexts already built are dropped; the pool
    /// never starts at partial capacity.
    pub async fn start(config: Config, browser: Arc<dyn Browser>) -> Result<Self> {
        let config = Arc::new(config);
        let proxies = Arc::new(ProxyPool::new(config.proxies.clone()));
        let cx = ExecutionContext {
            config: Arc::clone(&config),
            browser,
            proxies,
        };

        let mut workers = Vec::with_capacity(config.pool_size);
        for index in 0..config.pool_size {
            let worker = Worker::start(WorkerId::new(index as u32), &cx.browser, &cx.proxies).await?;
            workers.push(Arc::new(worker));
        }

        let store = JobStore::new();
        let sweeper = store.spawn_sweeper(config.sweep_interval, config.job_ttl);

        info!(
            pool_size = config.pool_size,
            proxies = cx.proxies.len(),
            "Worker pool started"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                cx,
                workers,
                queue: Mutex::new(VecDeque::new()),
                store,
                sweeper,
            }),
        })
    }

    /// Validates and enqueues a job, dispatching immediately when a worker
    /// is idle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`](crate::Error::InvalidInput) when the
    /// product URL fails the structural check. Nothing is recorded for a
    /// rejected submission.
    pub fn submit(&self, input: JobInput) -> Result<JobHandle> {
        let parsed = parse_input(&input, &self.shared.cx.config.product_url_pattern)?;

        let id = JobId::new();
        self.shared.store.insert(id, input);
        self.shared
            .queue
            .lock()
            .push_back(QueuedJob { id, input: parsed });
        debug!(job = %id, "Job queued");

        self.shared.pump();

        Ok(JobHandle {
            id,
            store: Arc::clone(&self.shared.store),
        })
    }

    /// Returns a clone of the job's record, or `None` if unknown or swept.
    #[must_use]
    pub fn job(&self, id: JobId) -> Option<JobRecord> {
        self.shared.store.get(id)
    }

    /// Jobs waiting for a worker.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Workers currently executing a job.
    #[must_use]
    pub fn busy_workers(&self) -> usize {
        self.shared.workers.iter().filter(|w| w.is_busy()).count()
    }

    /// Configured worker count.
    #[inline]
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.shared.workers.len()
    }

    /// Point-in-time view of the proxy pool.
    #[must_use]
    pub fn proxy_status(&self) -> Vec<EndpointStatus> {
        self.shared.cx.proxies.snapshot()
    }
}

impl PoolShared {
    /// Drains the queue onto idle workers.
    ///
    /// Runs on every submission and every completion. Reserving the worker
    /// before popping the queue keeps dispatch atomic per job; when the pop
    /// comes back empty the worker is put back and the queue re-checked, so
    /// a submission racing the release is picked up by this loop instead of
    /// stranding its job.
    fn pump(self: &Arc<Self>) {
        loop {
            if self.queue.lock().is_empty() {
                return;
            }

            let Some(worker) = self.workers.iter().find(|w| w.try_reserve()).cloned() else {
                return;
            };

            let Some(job) = self.queue.lock().pop_front() else {
                worker.release();
                continue;
            };

            self.dispatch(worker, job);
        }
    }

    fn dispatch(self: &Arc<Self>, worker: Arc<Worker>, job: QueuedJob) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let QueuedJob { id, input } = job;
            info!(job = %id, worker = %worker.id(), "Job dispatched");

            let store = Arc::clone(&shared.store);
            let progress: ProgressSink = Arc::new(move |update| store.apply(id, update));
            progress(StatusUpdate::running(format!(
                "Assigned to {}",
                worker.id()
            )));

            match worker.run_job(&shared.cx, &input, &progress).await {
                Ok(result) => {
                    info!(job = %id, worker = %worker.id(), "Job done");
                    shared.store.resolve(id, result);
                }
                Err(err) => {
                    info!(job = %id, worker = %worker.id(), error = %err, "Job failed");
                    shared.store.reject(id, err.to_string());
                }
            }

            worker.release();
            shared.pump();
        });
    }
}

// ============================================================================
// JobHandle
// ============================================================================

/// Handle to a submitted job.
///
/// The handle only reads the job store; dropping it neither cancels nor
/// otherwise affects the job.
pub struct JobHandle {
    id: JobId,
    store: Arc<JobStore>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl JobHandle {
    /// The job's identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Returns a clone of the current record, or `None` once swept.
    #[must_use]
    pub fn record(&self) -> Option<JobRecord> {
        self.store.get(self.id)
    }

    /// Polls every `poll` until the record is terminal, returning it.
    /// Returns `None` if the record is swept while waiting.
    pub async fn wait(&self, poll: Duration) -> Option<JobRecord> {
        loop {
            match self.store.get(self.id) {
                Some(record) if record.status.is_terminal() => return Some(record),
                Some(_) => {}
                None => return None,
            }
            tokio::time::sleep(poll).await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
