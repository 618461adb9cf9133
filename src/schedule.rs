//! Schedule math: *when* each participant receives a new assignment within a refresh
//! interval, and *what price* that assignment carries.
//!
//! Every randomized function takes the random source as `&mut R` so callers decide
//! whether draws come from a seeded `StdRng` (tests, reproducible runs) or the OS.
//!
//! ## Time modes
//! - `periodic`: everybody issues at the end of the window.
//! - `drip-fixed`: evenly spaced over `[0, interval]`.
//! - `drip-jitter`: evenly spaced slots, uniform jitter of up to one step inside each slot.
//! - `drip-poisson`: running sum of `Exp(n / interval)` inter-arrival draws.
//!
//! ## Step modes
//! - `fixed`: evenly spread between the zone's bounds by participant index.
//! - `jittered`: `fixed` plus a uniform integer perturbation of at most half a step.
//! - `random`: uniform over a (randomly chosen) range.
//!
//! Integer operations on prices (`floor`, `round`, integer jitter) are done in units of
//! the schedule's tick size.

use std::{fmt, str::FromStr, time::Duration};

use rand::Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{SessionError, SessionResult},
    orders::Side,
};

/// Tick used when a schedule does not set one.
pub const DEFAULT_TICK_SIZE: f64 = 0.01;

// absorbs representation error before flooring, e.g. 0.5 / 0.01 = 49.99999...
const TICK_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeMode {
    Periodic,
    DripFixed,
    DripJitter,
    DripPoisson,
}

impl TimeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeMode::Periodic => "periodic",
            TimeMode::DripFixed => "drip-fixed",
            TimeMode::DripJitter => "drip-jitter",
            TimeMode::DripPoisson => "drip-poisson",
        }
    }
}

impl FromStr for TimeMode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "periodic" => Ok(TimeMode::Periodic),
            "drip-fixed" => Ok(TimeMode::DripFixed),
            "drip-jitter" => Ok(TimeMode::DripJitter),
            "drip-poisson" => Ok(TimeMode::DripPoisson),
            other => Err(SessionError::config(format!("unknown time mode `{other}`"))),
        }
    }
}

impl TryFrom<String> for TimeMode {
    type Error = SessionError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeMode> for String {
    fn from(m: TimeMode) -> Self {
        m.as_str().to_string()
    }
}

impl fmt::Display for TimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StepMode {
    Fixed,
    Jittered,
    Random,
}

impl StepMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepMode::Fixed => "fixed",
            StepMode::Jittered => "jittered",
            StepMode::Random => "random",
        }
    }

    /// Modes that spread prices by participant index and so need at least two participants.
    pub fn needs_step(&self) -> bool {
        matches!(self, StepMode::Fixed | StepMode::Jittered)
    }
}

impl FromStr for StepMode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(StepMode::Fixed),
            "jittered" => Ok(StepMode::Jittered),
            "random" => Ok(StepMode::Random),
            other => Err(SessionError::config(format!("unknown step mode `{other}`"))),
        }
    }
}

impl TryFrom<String> for StepMode {
    type Error = SessionError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<StepMode> for String {
    fn from(m: StepMode) -> Self {
        m.as_str().to_string()
    }
}

impl fmt::Display for StepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A price band. Bounds may be given in either order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
}

impl PriceRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// `(low, high)` regardless of how the bounds were configured.
    pub fn bounds(&self) -> (f64, f64) {
        (self.min.min(self.max), self.min.max(self.max))
    }
}

/// Price ranges active during the session-time window `(from, to]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub from: f64,
    pub to: f64,
    pub ranges: Vec<PriceRange>,
    #[serde(rename = "stepmode", alias = "stepMode")]
    pub step_mode: StepMode,
}

impl Zone {
    pub fn contains(&self, session_time: f64) -> bool {
        self.from < session_time && session_time <= self.to
    }
}

/// The `orderSchedule` block of a session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSchedule {
    #[serde(rename = "timemode", alias = "timeMode")]
    pub time_mode: TimeMode,
    /// Seconds between schedule refreshes.
    pub interval: f64,
    pub demand: Vec<Zone>,
    pub supply: Vec<Zone>,
    #[serde(default = "default_tick_size")]
    pub tick_size: f64,
}

fn default_tick_size() -> f64 {
    DEFAULT_TICK_SIZE
}

impl OrderSchedule {
    pub fn zones(&self, side: Side) -> &[Zone] {
        match side {
            Side::Bid => &self.demand,
            Side::Ask => &self.supply,
        }
    }

    /// Checks the schedule against the population it will drive.
    pub fn validate(&self, buyers: usize, sellers: usize) -> SessionResult<()> {
        if self.interval <= 0.0 || Duration::try_from_secs_f64(self.interval).is_err() {
            return Err(SessionError::config(format!(
                "interval must be a positive number of seconds, got {}",
                self.interval
            )));
        }
        if !self.tick_size.is_finite() || self.tick_size <= 0.0 {
            return Err(SessionError::config(format!(
                "tick_size must be > 0, got {}",
                self.tick_size
            )));
        }
        for (side, count) in [(Side::Bid, buyers), (Side::Ask, sellers)] {
            if count < 1 {
                return Err(SessionError::config(format!("no participants on {side} side")));
            }
            let zones = self.zones(side);
            if zones.is_empty() {
                return Err(SessionError::config(format!("no zones configured for {side} side")));
            }
            for zone in zones {
                if zone.from >= zone.to {
                    return Err(SessionError::config(format!(
                        "{side} zone ({}, {}] is empty",
                        zone.from, zone.to
                    )));
                }
                if zone.ranges.is_empty() {
                    return Err(SessionError::config(format!(
                        "{side} zone ({}, {}] has no price ranges",
                        zone.from, zone.to
                    )));
                }
                if zone
                    .ranges
                    .iter()
                    .any(|r| !r.min.is_finite() || !r.max.is_finite() || r.min < 0.0 || r.max < 0.0)
                {
                    return Err(SessionError::config(format!(
                        "{side} zone ({}, {}] has a negative or non-finite bound",
                        zone.from, zone.to
                    )));
                }
                if count == 1 && zone.step_mode.needs_step() {
                    return Err(SessionError::config(format!(
                        "step mode `{}` needs at least two {side} participants",
                        zone.step_mode
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Issue-time offsets (seconds from the window start), one per participant.
///
/// With `fit_to_interval` the offsets are rescaled so the last arrival lands exactly on
/// `interval` and none exceeds it. Rescaling is skipped when the last offset already
/// equals `interval` or is zero.
pub fn compute_issue_times<R: Rng + ?Sized>(
    participant_count: usize,
    mode: TimeMode,
    interval: f64,
    fit_to_interval: bool,
    rng: &mut R,
) -> SessionResult<Vec<f64>> {
    if participant_count < 1 {
        return Err(SessionError::config("participant count must be >= 1"));
    }
    if !interval.is_finite() || interval <= 0.0 {
        return Err(SessionError::config(format!("interval must be > 0, got {interval}")));
    }

    let n = participant_count as f64;
    let step = if participant_count == 1 {
        interval
    } else {
        interval / (n - 1.0)
    };

    let mut offsets = Vec::with_capacity(participant_count);
    match mode {
        TimeMode::Periodic => offsets.resize(participant_count, interval),
        TimeMode::DripFixed => offsets.extend((0..participant_count).map(|i| i as f64 * step)),
        TimeMode::DripJitter => {
            for i in 0..participant_count {
                let u: f64 = rng.random();
                offsets.push(i as f64 * step + step * u);
            }
        }
        TimeMode::DripPoisson => {
            let inter_arrival = Exp::new(n / interval)
                .map_err(|e| SessionError::config(format!("poisson rate: {e}")))?;
            let mut arrival = 0.0;
            for _ in 0..participant_count {
                arrival += inter_arrival.sample(rng);
                offsets.push(arrival);
            }
        }
    }

    let last = offsets.last().copied().unwrap_or(interval);
    if fit_to_interval && last != interval && last > 0.0 {
        for t in offsets.iter_mut() {
            *t = (interval * (*t / last)).min(interval);
        }
    }
    Ok(offsets)
}

/// First zone whose `(from, to]` window contains `session_time`.
pub fn select_zone(session_time: f64, zones: &[Zone]) -> SessionResult<(&[PriceRange], StepMode)> {
    zones
        .iter()
        .find(|z| z.contains(session_time))
        .map(|z| (z.ranges.as_slice(), z.step_mode))
        .ok_or(SessionError::NoMatchingZone { session_time })
}

/// Price for the `index`-th of `participant_count` participants.
///
/// `fixed` and `jittered` need `participant_count >= 2`; callers validate that up front.
/// The result is never negative.
pub fn compute_order_price<R: Rng + ?Sized>(
    index: usize,
    participant_count: usize,
    ranges: &[PriceRange],
    step_mode: StepMode,
    tick_size: f64,
    rng: &mut R,
) -> SessionResult<f64> {
    let first = ranges
        .first()
        .ok_or_else(|| SessionError::config("zone has no price ranges"))?;
    if !tick_size.is_finite() || tick_size <= 0.0 {
        return Err(SessionError::config(format!("tick_size must be > 0, got {tick_size}")));
    }
    if let Some(bad) = ranges.iter().find(|r| !r.min.is_finite() || !r.max.is_finite()) {
        return Err(SessionError::config(format!(
            "price range [{}, {}] has a non-finite bound",
            bad.min, bad.max
        )));
    }
    let (pmin, pmax) = first.bounds();

    let price = match step_mode {
        StepMode::Fixed | StepMode::Jittered => {
            if participant_count < 2 {
                return Err(SessionError::config(format!(
                    "step mode `{step_mode}` needs at least two participants"
                )));
            }
            let step_ticks = (pmax - pmin) / (participant_count as f64 - 1.0) / tick_size;
            let offset_ticks = (index as f64 * step_ticks + TICK_EPSILON).floor();
            let jitter_ticks = if step_mode == StepMode::Jittered {
                let half_step = (step_ticks / 2.0).round() as i64;
                rng.random_range(-half_step..=half_step) as f64
            } else {
                0.0
            };
            // jitter below a lower bound near zero would give a negative limit price
            (pmin + (offset_ticks + jitter_ticks) * tick_size).max(0.0)
        }
        StepMode::Random => {
            let (lo, hi) = if ranges.len() > 1 {
                ranges[rng.random_range(0..ranges.len())].bounds()
            } else {
                (pmin, pmax)
            };
            let drawn: f64 = rng.random_range(lo..=hi);
            (drawn / tick_size).round() * tick_size
        }
    };
    Ok(snap_to_tick(price, tick_size))
}

/// Removes floating residue left by tick arithmetic (e.g. `1.5000000000000002`).
fn snap_to_tick(price: f64, tick_size: f64) -> f64 {
    (price / tick_size).round() * tick_size
}
