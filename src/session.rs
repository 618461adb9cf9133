//! Market session orchestrator.
//!
//! A [`MarketSession`] owns the participant registry, the order-id counter and the job
//! scheduler. [`MarketSession::run`] fixes the session clock and schedules:
//!
//! | job | trigger | effect |
//! |---|---|---|
//! | heartbeat | every `heartbeat` over `[start, end)` | logs the share of time left |
//! | buy / sell refresh | every `interval` over `[start, end - interval]` | new issue-time schedule, one distribute job per participant |
//! | distribute | once, at the computed issue time if that is before `end` | prices a limit order for the zone in force and hands it to the participant |
//! | placement | every `placement` over `[start, end)` | one random participant may send an order to the exchange |
//! | end | once, at `end` | cancels live orders and publishes the report |
//!
//! Jobs run concurrently and share [`SessionState`] through an `Arc`.

use std::{sync::Arc, time::Duration};

use rand::{Rng, seq::SliceRandom};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::{
    errors::{SessionError, SessionResult},
    market_data::MarketData,
    orders::{DEFAULT_SYMBOL, HUMAN_CLIENT, Order, Side},
    report::{self, SessionReport},
    schedule::{OrderSchedule, compute_issue_times, compute_order_price, select_zone},
    state::{SessionClock, SessionOptions, SessionState, StatsSnapshot},
    trader::Trader,
};

pub struct MarketSession {
    state: Arc<SessionState>,
}

impl MarketSession {
    /// Builds a session over disjoint buyer and seller populations.
    ///
    /// # Errors
    /// `InvalidConfiguration` for duplicate participant ids, an empty side, or a schedule
    /// that cannot drive the given population.
    pub fn new(
        trial_id: u64,
        buyers: Vec<Arc<dyn Trader>>,
        sellers: Vec<Arc<dyn Trader>>,
        schedule: OrderSchedule,
        market_data: Arc<dyn MarketData>,
        options: SessionOptions,
    ) -> SessionResult<Self> {
        let state = SessionState::new(trial_id, buyers, sellers, schedule, market_data, options)?;
        Ok(Self {
            state: Arc::new(state),
        })
    }

    pub fn next_order_id(&self) -> u64 {
        self.state.next_order_id()
    }

    /// Builds a limit order with a fresh id. Omitted fields get ad-hoc defaults: client
    /// `HUMAN`, a random side, a whole quantity in `[10, 50]` and a price in
    /// `[1.00, 2.00]` rounded to cents.
    pub fn create_limit_order(
        &self,
        client_id: Option<&str>,
        side: Option<Side>,
        qty: Option<f64>,
        price: Option<f64>,
    ) -> SessionResult<Order> {
        self.state.create_limit_order(client_id, side, qty, price)
    }

    /// Starts the session `start_delay` from now for `duration`, and returns once every
    /// job is scheduled. Must be called from within a tokio runtime.
    pub fn run(&self, start_delay: Duration, duration: Duration) -> SessionResult<SessionClock> {
        Arc::clone(&self.state).run(start_delay, duration)
    }

    /// Tells every participant to cancel its live orders. Safe to repeat.
    pub fn cancel_open_orders(&self) {
        self.state.cancel_open_orders();
    }

    pub fn summarize(&self) -> SessionReport {
        self.state.summarize()
    }

    /// Cancels pending one-shot jobs and stops recurring ones before their natural end.
    pub fn abort(&self) {
        info!(trial = self.state.trial_id, "aborting market session");
        self.state.scheduler.shutdown();
    }

    /// Waits for the end-of-session report. `None` if the session was aborted or halted
    /// before it ended.
    pub async fn finished(&self) -> Option<SessionReport> {
        let mut rx = self.state.report_tx.subscribe();
        tokio::select! {
            biased;
            done = rx.wait_for(|r| r.is_some()) => done.ok().and_then(|r| (*r).clone()),
            _ = self.state.scheduler.cancelled() => self.report(),
        }
    }

    /// The report, once the session has ended.
    pub fn report(&self) -> Option<SessionReport> {
        self.state.report_tx.borrow().clone()
    }

    pub fn clock(&self) -> Option<SessionClock> {
        self.state.clock()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.state.stats()
    }

    pub fn trader(&self, id: &str) -> Option<Arc<dyn Trader>> {
        self.state.traders.get(id).cloned()
    }

    pub fn pending_jobs(&self) -> usize {
        self.state.scheduler.pending()
    }
}

impl SessionState {
    fn run(self: Arc<Self>, start_delay: Duration, duration: Duration) -> SessionResult<SessionClock> {
        let interval = Duration::try_from_secs_f64(self.schedule.interval)
            .map_err(|e| SessionError::config(format!("interval {}: {e}", self.schedule.interval)))?;
        let clock = self.start_clock(start_delay, duration)?;
        let scheduler = self.scheduler.clone();

        let state = Arc::clone(&self);
        scheduler.add_interval("heartbeat", self.options.heartbeat, clock.start, clock.end, move || {
            state.heartbeat();
            Ok(())
        });

        // the last refresh starts one interval before the end, so its window closes at `end`
        let last_refresh = clock.end.checked_sub(interval).filter(|at| *at >= clock.start);
        for side in [Side::Bid, Side::Ask] {
            let Some(last_refresh) = last_refresh else {
                info!(%side, "interval longer than the session, no schedule refresh");
                continue;
            };
            let state = Arc::clone(&self);
            scheduler.add_interval_through(
                format!("{side} schedule refresh"),
                interval,
                clock.start,
                last_refresh,
                move || Ok(state.schedule_side(side)?),
            );
        }

        let state = Arc::clone(&self);
        scheduler.add_interval("placement", self.options.placement, clock.start, clock.end, move || {
            state.place_order();
            Ok(())
        });

        let state = Arc::clone(&self);
        scheduler.add_once("end of session", clock.end, move || {
            state.end_session();
            Ok(())
        });

        info!(
            trial = self.trial_id,
            buyers = self.buyers.len(),
            sellers = self.sellers.len(),
            duration_secs = duration.as_secs_f64(),
            "open market"
        );
        Ok(clock)
    }

    pub(crate) fn create_limit_order(
        &self,
        client_id: Option<&str>,
        side: Option<Side>,
        qty: Option<f64>,
        price: Option<f64>,
    ) -> SessionResult<Order> {
        let (side, qty, price) = self.with_rng(|rng| {
            let side = side.unwrap_or_else(|| if rng.random_bool(0.5) { Side::Bid } else { Side::Ask });
            let qty = qty.unwrap_or_else(|| rng.random_range(10..=50) as f64);
            let price = price.unwrap_or_else(|| (rng.random_range(1.0..=2.0_f64) * 100.0).round() / 100.0);
            (side, qty, price)
        });
        let order = Order::limit(
            self.next_order_id(),
            client_id.unwrap_or(HUMAN_CLIENT),
            DEFAULT_SYMBOL,
            side,
            qty,
            price,
        )?;
        Ok(order)
    }

    fn heartbeat(&self) {
        self.stats.heartbeat();
        if let Some(clock) = self.clock() {
            let left = clock.remaining_fraction(Instant::now());
            info!("time left {:.0}%", left * 100.0);
        }
    }

    /// Draws a fresh issue-time schedule for one side and schedules a distribute job per
    /// participant. With `cancel_superseded`, pending dispatches of the previous refresh
    /// for this side are cancelled.
    pub(crate) fn schedule_side(self: &Arc<Self>, side: Side) -> SessionResult<()> {
        let clock = self.require_clock()?;
        let mut ids = self.ids(side).to_vec();
        let n = ids.len();
        let offsets = self.with_rng(|rng| {
            let offsets = compute_issue_times(n, self.schedule.time_mode, self.schedule.interval, true, rng)?;
            ids.shuffle(rng);
            Ok::<_, SessionError>(offsets)
        })?;
        self.stats.refresh();
        info!(%side, ?offsets, "creating schedule");

        let now = Instant::now();
        let mut jobs = Vec::with_capacity(n);
        for (index, (trader_id, offset)) in ids.into_iter().zip(offsets).enumerate() {
            let issue_at = Duration::try_from_secs_f64(offset)
                .ok()
                .and_then(|d| now.checked_add(d))
                .ok_or_else(|| SessionError::config(format!("issue offset {offset}s out of range")))?;
            // the end job clears the book at `end`; nothing may be handed out from then on
            if issue_at >= clock.end {
                debug!(%side, trader = %trader_id, offset, "issue time at or past session end, skipped");
                continue;
            }
            let session_time = clock.session_time(issue_at);
            let state = Arc::clone(self);
            let job = self.scheduler.add_once(
                format!("distribute {side} {trader_id}"),
                issue_at,
                move || Ok(state.run_distribute(index, &trader_id, n, side, session_time)?),
            );
            jobs.push(job);
        }

        let superseded = self.replace_pending(side, jobs);
        if self.options.cancel_superseded {
            let cancelled = superseded
                .into_iter()
                .filter(|id| self.scheduler.cancel(*id))
                .count() as u64;
            if cancelled > 0 {
                debug!(%side, cancelled, "cancelled superseded dispatches");
                self.stats.supersede(cancelled);
            }
        }
        Ok(())
    }

    /// Distribute-job boundary: a zone miss halts the session since nothing can be priced.
    fn run_distribute(
        &self,
        index: usize,
        trader_id: &str,
        n: usize,
        side: Side,
        session_time: f64,
    ) -> SessionResult<()> {
        let result = self.distribute(index, trader_id, n, side, session_time);
        if let Err(e) = &result {
            if e.halts_session() {
                error!(trial = self.trial_id, error = %e, "pricing cannot proceed, halting session");
                self.scheduler.shutdown();
            }
        }
        result
    }

    fn distribute(&self, index: usize, trader_id: &str, n: usize, side: Side, session_time: f64) -> SessionResult<()> {
        let (ranges, step_mode) = select_zone(session_time, self.schedule.zones(side))?;
        let price = self.with_rng(|rng| {
            compute_order_price(index, n, ranges, step_mode, self.schedule.tick_size, rng)
        })?;
        let trader = self
            .traders
            .get(trader_id)
            .ok_or_else(|| SessionError::config(format!("unknown participant `{trader_id}`")))?;
        let order = self.create_limit_order(Some(trader_id), Some(side), Some(1.0), Some(price))?;
        debug!(trader = trader_id, %order, session_time, "distributing order");
        trader.accept_limit_order(order);
        self.stats.dispatch();
        Ok(())
    }

    fn place_order(&self) {
        let Some(clock) = self.clock() else { return };
        let idx = self.with_rng(|rng| rng.random_range(0..self.traders.len()));
        let Some(trader) = self.traders.values().nth(idx) else { return };

        let remaining = clock.remaining_fraction(Instant::now());
        let book = self.market_data.snapshot();
        let proposed = trader.propose_order(remaining, &book);
        let submitted = proposed.is_some();
        if let Some(order) = proposed {
            debug!(trader = trader.id(), %order, "submitting order");
            trader.submit_order(order);
        }
        self.stats.placement(submitted);
    }

    pub(crate) fn cancel_open_orders(&self) {
        for trader in self.traders.values() {
            trader.cancel_all_live();
        }
    }

    pub(crate) fn summarize(&self) -> SessionReport {
        report::summarize(self.traders.values())
    }

    fn end_session(&self) {
        info!(trial = self.trial_id, "end of market session, cancelling live orders");
        self.cancel_open_orders();
        let report = self.summarize();
        info!(trial = self.trial_id, "session report\n{report}");
        self.report_tx.send_replace(Some(report));
        // dispatches still due at `end` would land after the book was cleared
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        market_data::WatchMarketData,
        schedule::{PriceRange, StepMode, TimeMode, Zone},
        trader::TraderKind,
    };

    fn schedule(time_mode: TimeMode, interval: f64) -> OrderSchedule {
        let zone = |min: f64, max: f64| Zone {
            from: -1.0,
            to: 1000.0,
            ranges: vec![PriceRange::new(min, max)],
            step_mode: StepMode::Fixed,
        };
        OrderSchedule {
            time_mode,
            interval,
            demand: vec![zone(1.0, 2.0)],
            supply: vec![zone(1.5, 2.5)],
            tick_size: 0.01,
        }
    }

    fn session(options: SessionOptions) -> MarketSession {
        let buyers = (0..3).map(|i| TraderKind::Giveaway.build(format!("B{i:02}"), None)).collect();
        let sellers = (0..3).map(|i| TraderKind::Giveaway.build(format!("S{i:02}"), None)).collect();
        let (_tx, md) = WatchMarketData::channel();
        MarketSession::new(
            1,
            buyers,
            sellers,
            schedule(TimeMode::Periodic, 10.0),
            Arc::new(md),
            SessionOptions {
                seed: Some(11),
                ..options
            },
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_refreshes_dispatch_twice_by_default() {
        let s = session(SessionOptions::default());
        s.state.start_clock(Duration::ZERO, Duration::from_secs(100)).unwrap();
        s.state.schedule_side(Side::Bid).unwrap();
        s.state.schedule_side(Side::Bid).unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        let stats = s.stats();
        assert_eq!(stats.dispatches, 6);
        assert_eq!(stats.superseded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_superseded_keeps_latest_refresh_only() {
        let s = session(SessionOptions {
            cancel_superseded: true,
            ..SessionOptions::default()
        });
        s.state.start_clock(Duration::ZERO, Duration::from_secs(100)).unwrap();
        s.state.schedule_side(Side::Bid).unwrap();
        s.state.schedule_side(Side::Bid).unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        let stats = s.stats();
        assert_eq!(stats.dispatches, 3);
        assert_eq!(stats.superseded, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_before_start_is_refused() {
        let s = session(SessionOptions::default());
        assert!(matches!(
            s.state.schedule_side(Side::Ask),
            Err(SessionError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_twice_is_refused() {
        let s = session(SessionOptions::default());
        s.run(Duration::ZERO, Duration::from_secs(30)).unwrap();
        assert!(s.run(Duration::ZERO, Duration::from_secs(30)).is_err());
        s.abort();
    }

    #[test]
    fn test_order_ids_start_at_one_and_increase() {
        let s = session(SessionOptions::default());
        assert_eq!(s.next_order_id(), 1);
        let o = s.create_limit_order(None, None, None, None).unwrap();
        assert_eq!(o.id(), 2);
        assert_eq!(o.client_id(), HUMAN_CLIENT);
        assert!((10.0..=50.0).contains(&o.quantity()));
        assert_eq!(o.quantity(), o.quantity().round());
        assert!((1.0..=2.0).contains(&o.price()));
        assert!(((o.price() * 100.0).round() - o.price() * 100.0).abs() < 1e-6);
        assert_eq!(s.next_order_id(), 3);
    }

    #[test]
    fn test_explicit_order_fields_are_kept() {
        let s = session(SessionOptions::default());
        let o = s
            .create_limit_order(Some("B01"), Some(Side::Ask), Some(1.0), Some(1.37))
            .unwrap();
        assert_eq!(o.client_id(), "B01");
        assert_eq!(o.side(), Side::Ask);
        assert_eq!(o.quantity(), 1.0);
        assert_eq!(o.price(), 1.37);
        assert!(s.create_limit_order(None, None, None, Some(-1.0)).is_err());
    }
}
