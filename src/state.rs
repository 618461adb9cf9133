use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use rand::{SeedableRng, rngs::StdRng};
use serde::Serialize;
use tokio::{sync::watch, time::Instant};

use crate::{
    errors::{SessionError, SessionResult},
    market_data::MarketData,
    orders::Side,
    report::SessionReport,
    schedule::OrderSchedule,
    scheduler::{JobId, Scheduler},
    trader::Trader,
};

/// Knobs that are not part of the order schedule itself.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Cancel a side's still-pending distribute jobs whenever that side is refreshed.
    /// Off by default: overlapping dispatches from consecutive refreshes are kept.
    pub cancel_superseded: bool,
    pub heartbeat: Duration,
    pub placement: Duration,
    /// Fixed seed for reproducible schedule math; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cancel_superseded: false,
            heartbeat: Duration::from_secs(5),
            placement: Duration::from_millis(50),
            seed: None,
        }
    }
}

/// `start` and `end` of the running session, fixed when it is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClock {
    pub start: Instant,
    pub end: Instant,
}

impl SessionClock {
    /// `None` when `start_delay` or `duration` reach past what an `Instant` can represent.
    pub fn new(now: Instant, start_delay: Duration, duration: Duration) -> Option<Self> {
        let start = now.checked_add(start_delay)?;
        Some(Self {
            start,
            end: start.checked_add(duration)?,
        })
    }

    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }

    /// Seconds since `start`; negative before the session opens.
    pub fn session_time(&self, at: Instant) -> f64 {
        if at >= self.start {
            at.duration_since(self.start).as_secs_f64()
        } else {
            -self.start.duration_since(at).as_secs_f64()
        }
    }

    /// Share of the session still to run at `at`, within `[0, 1]`.
    pub fn remaining_fraction(&self, at: Instant) -> f64 {
        let total = self.duration().as_secs_f64();
        if total <= 0.0 {
            return 0.0;
        }
        (self.end.saturating_duration_since(at).as_secs_f64() / total).clamp(0.0, 1.0)
    }
}

/// Counters bumped by the session's jobs.
#[derive(Debug, Default)]
pub struct SessionStats {
    heartbeats: AtomicU64,
    refreshes: AtomicU64,
    dispatches: AtomicU64,
    superseded: AtomicU64,
    placements: AtomicU64,
    submissions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub heartbeats: u64,
    pub refreshes: u64,
    pub dispatches: u64,
    pub superseded: u64,
    pub placements: u64,
    pub submissions: u64,
    pub job_failures: u64,
}

impl SessionStats {
    pub(crate) fn heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn supersede(&self, n: u64) {
        self.superseded.fetch_add(n, Ordering::Relaxed);
    }
    pub(crate) fn placement(&self, submitted: bool) {
        self.placements.fetch_add(1, Ordering::Relaxed);
        if submitted {
            self.submissions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self, job_failures: u64) -> StatsSnapshot {
        StatsSnapshot {
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            placements: self.placements.load(Ordering::Relaxed),
            submissions: self.submissions.load(Ordering::Relaxed),
            job_failures,
        }
    }
}

/// Everything the session's jobs share. Each job holds an `Arc` of this.
pub struct SessionState {
    pub(crate) trial_id: u64,
    pub(crate) buyers: Vec<String>,
    pub(crate) sellers: Vec<String>,
    pub(crate) traders: BTreeMap<String, Arc<dyn Trader>>,
    pub(crate) schedule: OrderSchedule,
    pub(crate) options: SessionOptions,
    pub(crate) market_data: Arc<dyn MarketData>,
    pub(crate) scheduler: Scheduler,
    pub(crate) stats: SessionStats,
    pub(crate) report_tx: watch::Sender<Option<SessionReport>>,
    order_id: AtomicU64,
    rng: Mutex<StdRng>,
    clock: OnceLock<SessionClock>,
    pending: Mutex<HashMap<Side, Vec<JobId>>>,
}

impl SessionState {
    pub fn new(
        trial_id: u64,
        buyers: Vec<Arc<dyn Trader>>,
        sellers: Vec<Arc<dyn Trader>>,
        schedule: OrderSchedule,
        market_data: Arc<dyn MarketData>,
        options: SessionOptions,
    ) -> SessionResult<Self> {
        if options.heartbeat.is_zero() || options.placement.is_zero() {
            return Err(SessionError::config("heartbeat and placement periods must be > 0"));
        }
        schedule.validate(buyers.len(), sellers.len())?;

        let mut seen = HashSet::new();
        let mut traders = BTreeMap::new();
        let buyer_ids: Vec<String> = buyers.iter().map(|t| t.id().to_string()).collect();
        let seller_ids: Vec<String> = sellers.iter().map(|t| t.id().to_string()).collect();
        for t in buyers.into_iter().chain(sellers) {
            let id = t.id().to_string();
            if !seen.insert(id.clone()) {
                return Err(SessionError::config(format!("duplicate participant id `{id}`")));
            }
            traders.insert(id, t);
        }

        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let (report_tx, _) = watch::channel(None);

        Ok(Self {
            trial_id,
            buyers: buyer_ids,
            sellers: seller_ids,
            traders,
            schedule,
            options,
            market_data,
            scheduler: Scheduler::new(),
            stats: SessionStats::default(),
            report_tx,
            order_id: AtomicU64::new(0),
            rng: Mutex::new(rng),
            clock: OnceLock::new(),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Strictly increasing, starting at 1.
    pub fn next_order_id(&self) -> u64 {
        self.order_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }

    pub(crate) fn ids(&self, side: Side) -> &[String] {
        match side {
            Side::Bid => &self.buyers,
            Side::Ask => &self.sellers,
        }
    }

    /// Fixes the session clock. Only the first call succeeds.
    pub(crate) fn start_clock(&self, start_delay: Duration, duration: Duration) -> SessionResult<SessionClock> {
        if duration.is_zero() {
            return Err(SessionError::config("session duration must be > 0"));
        }
        let clock = SessionClock::new(Instant::now(), start_delay, duration).ok_or_else(|| {
            SessionError::config(format!(
                "start delay {start_delay:?} plus duration {duration:?} is out of range"
            ))
        })?;
        self.clock
            .set(clock)
            .map_err(|_| SessionError::config(format!("session {} already started", self.trial_id)))?;
        Ok(clock)
    }

    pub fn clock(&self) -> Option<SessionClock> {
        self.clock.get().copied()
    }

    pub(crate) fn require_clock(&self) -> SessionResult<SessionClock> {
        self.clock()
            .ok_or_else(|| SessionError::config(format!("session {} has not started", self.trial_id)))
    }

    /// Records `jobs` as the side's pending dispatches and returns the ones they replace.
    pub(crate) fn replace_pending(&self, side: Side, jobs: Vec<JobId>) -> Vec<JobId> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.insert(side, jobs).unwrap_or_default()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.scheduler.failures())
    }
}
