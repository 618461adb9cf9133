//! Timed-callback substrate the session runs on.
//!
//! Two kinds of job:
//! - one-shot: run once at an absolute instant
//! - interval: run at `start + k * every` for every such instant strictly before `end`,
//!   or up to and including `last` with [`Scheduler::add_interval_through`]
//!
//! Each job gets its own cancellation token, a child of the scheduler's root token, so a
//! single job can be cancelled or the whole scheduler shut down. Callbacks return
//! `anyhow::Result`; a failure is logged and that firing is skipped, the job keeps its
//! schedule.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::{Instant, sleep_until};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

// floor for interval periods so a zero period cannot spin
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

#[derive(Default)]
struct Inner {
    root: CancellationToken,
    tracker: TaskTracker,
    next_id: AtomicU64,
    jobs: Mutex<HashMap<JobId, CancellationToken>>,
    failures: AtomicU64,
}

impl Inner {
    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget(&self, id: JobId) {
        self.jobs().remove(&id);
    }

    fn report(&self, name: &str, result: anyhow::Result<()>) {
        if let Err(e) = result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(job = %name, error = %e, "job failed, skipping this run");
        }
    }
}

/// Cloneable handle; all clones drive the same set of jobs.
///
/// Jobs are spawned on the current tokio runtime, so jobs must be added from inside one.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self) -> (JobId, CancellationToken) {
        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let token = self.inner.root.child_token();
        self.inner.jobs().insert(id, token.clone());
        (id, token)
    }

    /// Runs `job` once at `at`. An instant in the past fires immediately.
    pub fn add_once<F>(&self, name: impl Into<String>, at: Instant, job: F) -> JobId
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let (id, token) = self.register();
        let name = name.into();
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => debug!(job = %name, "cancelled before firing"),
                _ = sleep_until(at) => inner.report(&name, job()),
            }
            inner.forget(id);
        });
        id
    }

    /// Runs `job` every `every` from `start`, for firing instants strictly before `end`.
    pub fn add_interval<F>(
        &self,
        name: impl Into<String>,
        every: Duration,
        start: Instant,
        end: Instant,
        job: F,
    ) -> JobId
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.spawn_interval(name.into(), every, start, end, false, job)
    }

    /// Like [`Scheduler::add_interval`], but an instant landing exactly on `last` still fires.
    pub fn add_interval_through<F>(
        &self,
        name: impl Into<String>,
        every: Duration,
        start: Instant,
        last: Instant,
        job: F,
    ) -> JobId
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.spawn_interval(name.into(), every, start, last, true, job)
    }

    fn spawn_interval<F>(
        &self,
        name: String,
        every: Duration,
        start: Instant,
        end: Instant,
        inclusive: bool,
        job: F,
    ) -> JobId
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let (id, token) = self.register();
        let every = every.max(MIN_PERIOD);
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            let mut next = Some(start);
            while let Some(at) = next.filter(|at| *at < end || (inclusive && *at == end)) {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(job = %name, "stopped early");
                        break;
                    }
                    _ = sleep_until(at) => inner.report(&name, job()),
                }
                next = at.checked_add(every);
            }
            inner.forget(id);
        });
        id
    }

    /// Cancels a job that has not finished. Returns `false` if it already completed.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.inner.jobs().remove(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every pending one-shot and stops every interval job.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        self.inner.tracker.close();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// Resolves once [`Scheduler::shutdown`] has been called.
    pub async fn cancelled(&self) {
        self.inner.root.cancelled().await
    }

    /// Jobs that have not yet completed or been cancelled.
    pub fn pending(&self) -> usize {
        self.inner.jobs().len()
    }

    /// Callback failures seen so far.
    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Relaxed)
    }

    /// Waits until every spawned job task has exited.
    pub async fn wait(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}
