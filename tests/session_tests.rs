use std::{collections::HashSet, sync::Arc, time::Duration};

use market_session::{
    errors::SessionError,
    market_data::{BookSnapshot, WatchMarketData},
    orders::{OrderState, Side},
    schedule::{OrderSchedule, PriceRange, StepMode, TimeMode, Zone},
    session::MarketSession,
    state::SessionOptions,
    trader::{Agent, Giveaway, Shaver, Trader},
};

fn zones(to: f64, min: f64, max: f64, step_mode: StepMode) -> Vec<Zone> {
    vec![Zone {
        from: -1.0,
        to,
        ranges: vec![PriceRange::new(min, max)],
        step_mode,
    }]
}

fn schedule(time_mode: TimeMode, interval: f64, zone_end: f64) -> OrderSchedule {
    OrderSchedule {
        time_mode,
        interval,
        demand: zones(zone_end, 1.0, 2.0, StepMode::Fixed),
        supply: zones(zone_end, 1.0, 2.0, StepMode::Jittered),
        tick_size: 0.01,
    }
}

struct Population {
    buyers: Vec<Arc<Agent<Giveaway>>>,
    sellers: Vec<Arc<Agent<Shaver>>>,
}

impl Population {
    fn new(n_buyers: usize, n_sellers: usize) -> Self {
        Self {
            buyers: (0..n_buyers)
                .map(|i| Arc::new(Agent::new(format!("B{i:02}"), Giveaway)))
                .collect(),
            sellers: (0..n_sellers)
                .map(|i| Arc::new(Agent::new(format!("S{i:02}"), Shaver::default())))
                .collect(),
        }
    }

    fn session(&self, schedule: OrderSchedule, options: SessionOptions) -> Result<MarketSession, SessionError> {
        let buyers = self.buyers.iter().map(|a| a.clone() as Arc<dyn Trader>).collect();
        let sellers = self.sellers.iter().map(|a| a.clone() as Arc<dyn Trader>).collect();
        let (_tx, md) = WatchMarketData::channel();
        MarketSession::new(7, buyers, sellers, schedule, Arc::new(md), options)
    }

    fn all_orders(&self) -> Vec<market_session::orders::Order> {
        let mut orders: Vec<_> = self.buyers.iter().flat_map(|a| a.ledger().orders()).collect();
        orders.extend(self.sellers.iter().flat_map(|a| a.ledger().orders()));
        orders
    }
}

fn seeded() -> SessionOptions {
    SessionOptions {
        seed: Some(2024),
        ..SessionOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn heartbeat_fires_twelve_times_in_a_minute() {
    let pop = Population::new(2, 2);
    let session = pop.session(schedule(TimeMode::DripFixed, 30.0, 120.0), seeded()).unwrap();
    session.run(Duration::ZERO, Duration::from_secs(60)).unwrap();

    let report = session.finished().await;
    assert!(report.is_some());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(session.stats().heartbeats, 12);
}

#[tokio::test(start_paused = true)]
async fn full_session_distributes_submits_and_cancels() {
    let pop = Population::new(2, 2);
    let session = pop.session(schedule(TimeMode::DripFixed, 30.0, 120.0), seeded()).unwrap();
    session.run(Duration::ZERO, Duration::from_secs(60)).unwrap();

    let report = session.finished().await.expect("session should end normally");
    let stats = session.stats();

    // refreshes at t=0 and t=30 per side; the t=30 refresh's second issue time lands on
    // the end of the session and is skipped
    assert_eq!(stats.refreshes, 4);
    assert_eq!(stats.dispatches, 6);
    assert_eq!(stats.submissions, 6);
    assert_eq!(stats.placements, 1200);
    assert_eq!(stats.job_failures, 0);

    let orders = pop.all_orders();
    assert_eq!(orders.len(), 6);
    let ids: HashSet<u64> = orders.iter().map(|o| o.id()).collect();
    assert_eq!(ids, (1..=6).collect());
    assert!(orders.iter().all(|o| o.state() == OrderState::Cancelled));
    assert!(orders.iter().all(|o| o.quantity() == 1.0));

    // fixed demand over two buyers lands on both bounds
    let bids: Vec<f64> = pop
        .buyers
        .iter()
        .flat_map(|b| b.ledger().orders())
        .inspect(|o| assert_eq!(o.side(), Side::Bid))
        .map(|o| o.price())
        .collect();
    assert_eq!(bids.len(), 3);
    assert!(bids.iter().all(|p| *p == 1.0 || *p == 2.0), "{bids:?}");
    assert!(bids.contains(&1.0) && bids.contains(&2.0));

    // jittered supply stays within half a step of its slot
    for s in &pop.sellers {
        for o in s.ledger().orders() {
            assert_eq!(o.side(), Side::Ask);
            assert!((0.5..=2.5).contains(&o.price()), "{o}");
        }
    }

    assert_eq!(report.participants.len(), 4);
    let types: Vec<_> = report.groups.iter().map(|g| g.trader_type.as_str()).collect();
    assert_eq!(types, ["GVWY", "SHVR"]);
    assert_eq!(session.report(), Some(report));
    assert_eq!(session.pending_jobs(), 0);
}

async fn refresh_counts(duration_secs: u64, interval: f64) -> (u64, u64) {
    let pop = Population::new(2, 2);
    let session = pop.session(schedule(TimeMode::DripFixed, interval, 1000.0), seeded()).unwrap();
    session.run(Duration::ZERO, Duration::from_secs(duration_secs)).unwrap();
    session.finished().await.expect("session should end normally");
    let stats = session.stats();
    (stats.refreshes, stats.dispatches)
}

#[tokio::test(start_paused = true)]
async fn last_refresh_fires_one_interval_before_the_end() {
    // a single cycle: the t=0 refresh still runs, its t=30 issue time is the end
    assert_eq!(refresh_counts(30, 30.0).await, (2, 2));
    assert_eq!(refresh_counts(60, 30.0).await, (4, 6));
    // refreshes at 0, 10, .., 50 on both sides
    assert_eq!(refresh_counts(60, 10.0).await, (12, 22));
}

#[tokio::test(start_paused = true)]
async fn interval_longer_than_the_session_never_refreshes() {
    assert_eq!(refresh_counts(20, 30.0).await, (0, 0));
}

#[tokio::test(start_paused = true)]
async fn unrepresentable_session_length_is_refused() {
    let pop = Population::new(2, 2);
    let session = pop.session(schedule(TimeMode::DripFixed, 30.0, 120.0), seeded()).unwrap();
    assert!(matches!(
        session.run(Duration::ZERO, Duration::MAX),
        Err(SessionError::InvalidConfiguration(_))
    ));
    assert!(session.clock().is_none());
    assert_eq!(session.pending_jobs(), 0);
}

#[tokio::test(start_paused = true)]
async fn delayed_start_waits_before_firing() {
    let pop = Population::new(2, 2);
    let session = pop.session(schedule(TimeMode::DripFixed, 10.0, 120.0), seeded()).unwrap();
    let clock = session.run(Duration::from_secs(10), Duration::from_secs(20)).unwrap();
    assert_eq!(clock.duration(), Duration::from_secs(20));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(session.stats().heartbeats, 0);
    assert_eq!(session.stats().placements, 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(session.stats().heartbeats, 1);
    session.abort();
}

#[tokio::test(start_paused = true)]
async fn abort_stops_jobs_without_a_report() {
    let pop = Population::new(2, 2);
    let session = pop.session(schedule(TimeMode::DripPoisson, 10.0, 120.0), seeded()).unwrap();
    session.run(Duration::ZERO, Duration::from_secs(60)).unwrap();

    tokio::time::sleep(Duration::from_millis(12_500)).await;
    session.abort();
    assert!(session.finished().await.is_none());

    let beats = session.stats().heartbeats;
    assert_eq!(beats, 3);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(session.stats().heartbeats, beats);
    assert_eq!(session.pending_jobs(), 0);
    assert!(session.report().is_none());
}

#[tokio::test(start_paused = true)]
async fn zone_miss_halts_the_session() {
    let pop = Population::new(2, 2);
    // zones cover session time (-1, 5] only; the t=10 dispatches cannot be priced
    let session = pop.session(schedule(TimeMode::DripFixed, 10.0, 5.0), seeded()).unwrap();
    session.run(Duration::ZERO, Duration::from_secs(30)).unwrap();

    assert!(session.finished().await.is_none());
    let stats = session.stats();
    assert_eq!(stats.dispatches, 2);
    assert!(stats.job_failures >= 1);
    assert!(stats.heartbeats <= 3);
}

#[tokio::test(start_paused = true)]
async fn jitter_at_a_zero_lower_bound_still_hands_out_every_order() {
    let pop = Population::new(5, 5);
    let mut sched = schedule(TimeMode::DripFixed, 10.0, 1000.0);
    sched.demand = zones(1000.0, 0.0, 1.0, StepMode::Jittered);
    sched.supply = zones(1000.0, 0.0, 1.0, StepMode::Jittered);
    let session = pop.session(sched, seeded()).unwrap();
    session.run(Duration::ZERO, Duration::from_secs(100)).unwrap();
    session.finished().await.expect("session should end normally");

    let stats = session.stats();
    assert_eq!(stats.job_failures, 0);
    // 10 refreshes per side, the last one's final issue time is the end of the session
    assert_eq!(stats.dispatches, 2 * (10 * 5 - 1));
    assert!(pop.all_orders().iter().all(|o| o.price() >= 0.0));
}

#[tokio::test(start_paused = true)]
async fn placement_uses_the_market_snapshot() {
    let buyers: Vec<Arc<dyn Trader>> = vec![Arc::new(Agent::new("B00", Shaver::default())), Arc::new(Agent::new("B01", Shaver::default()))];
    let sellers: Vec<Arc<dyn Trader>> = vec![Arc::new(Agent::new("S00", Giveaway)), Arc::new(Agent::new("S01", Giveaway))];
    let (tx, md) = WatchMarketData::channel();
    tx.send(BookSnapshot {
        bids: vec![(1.10, 4.0)],
        asks: vec![(1.90, 4.0)],
    })
    .unwrap();
    let (outbox_tx, mut outbox) = tokio::sync::mpsc::unbounded_channel();
    let shaver = Arc::new(Agent::new("B02", Shaver::default()).with_outbox(outbox_tx));
    let mut buyers = buyers;
    buyers.push(shaver.clone());

    let mut sched = schedule(TimeMode::DripFixed, 30.0, 120.0);
    sched.demand = zones(120.0, 1.50, 1.80, StepMode::Fixed);
    let session = MarketSession::new(1, buyers, sellers, sched, Arc::new(md), seeded()).unwrap();
    session.run(Duration::ZERO, Duration::from_secs(60)).unwrap();
    session.finished().await.expect("report");

    let sent = outbox.try_recv().expect("shaver should have quoted");
    assert_eq!(sent.client_id(), "B02");
    assert!((sent.price() - 1.11).abs() < 1e-9, "{sent}");
}

#[test]
fn duplicate_ids_across_sides_are_rejected() {
    let buyers: Vec<Arc<dyn Trader>> = vec![Arc::new(Agent::new("T1", Giveaway)), Arc::new(Agent::new("T2", Giveaway))];
    let sellers: Vec<Arc<dyn Trader>> = vec![Arc::new(Agent::new("T1", Giveaway)), Arc::new(Agent::new("T3", Giveaway))];
    let (_tx, md) = WatchMarketData::channel();
    let err = MarketSession::new(
        1,
        buyers,
        sellers,
        schedule(TimeMode::DripFixed, 10.0, 60.0),
        Arc::new(md),
        seeded(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, SessionError::InvalidConfiguration(ref m) if m.contains("T1")));
}

#[test]
fn bad_setup_is_rejected_before_run() {
    let pop = Population::new(2, 0);
    assert!(matches!(
        pop.session(schedule(TimeMode::DripFixed, 10.0, 60.0), seeded()),
        Err(SessionError::InvalidConfiguration(_))
    ));

    let pop = Population::new(2, 2);
    assert!(matches!(
        pop.session(schedule(TimeMode::DripFixed, -5.0, 60.0), seeded()),
        Err(SessionError::InvalidConfiguration(_))
    ));

    assert!(matches!(
        pop.session(schedule(TimeMode::DripFixed, 1e20, 60.0), seeded()),
        Err(SessionError::InvalidConfiguration(_))
    ));

    // a lone seller cannot be spread by a jittered step
    let pop = Population::new(2, 1);
    assert!(matches!(
        pop.session(schedule(TimeMode::DripFixed, 10.0, 60.0), seeded()),
        Err(SessionError::InvalidConfiguration(_))
    ));
}

#[test]
fn cancel_open_orders_twice_matches_once() {
    let pop = Population::new(2, 2);
    let session = pop.session(schedule(TimeMode::DripFixed, 10.0, 60.0), seeded()).unwrap();
    for (i, b) in pop.buyers.iter().enumerate() {
        let o = session
            .create_limit_order(Some(b.id()), Some(Side::Bid), Some(1.0), Some(1.0 + i as f64 / 10.0))
            .unwrap();
        b.accept_limit_order(o);
    }
    // one of them already resting at the exchange
    let first = pop.buyers[0].ledger().orders()[0].id();
    pop.buyers[0].ledger().mark_booked(first).unwrap();

    session.cancel_open_orders();
    let once: Vec<_> = pop.all_orders().iter().map(|o| (o.id(), o.state())).collect();
    session.cancel_open_orders();
    let twice: Vec<_> = pop.all_orders().iter().map(|o| (o.id(), o.state())).collect();

    assert_eq!(once, twice);
    assert!(once.iter().all(|(_, s)| *s == OrderState::Cancelled));
}
