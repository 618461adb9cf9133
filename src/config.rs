//! Session configuration file.
//!
//! ```json
//! {
//!   "trial_id": 1,
//!   "duration_secs": 120,
//!   "buyers":  [{ "kind": "GVWY", "count": 5 }],
//!   "sellers": [{ "kind": "SHVR", "count": 5 }],
//!   "order_schedule": {
//!     "timemode": "drip-poisson",
//!     "interval": 30,
//!     "demand": [{ "from": 0, "to": 120, "ranges": [{ "min": 1.0, "max": 2.0 }], "stepmode": "fixed" }],
//!     "supply": [{ "from": 0, "to": 120, "ranges": [{ "min": 1.0, "max": 2.0 }], "stepmode": "fixed" }]
//!   }
//! }
//! ```

use std::{path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    errors::{SessionError, SessionResult},
    orders::Order,
    schedule::OrderSchedule,
    state::SessionOptions,
    trader::{Trader, TraderKind},
};

/// `count` participants of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderSpec {
    pub kind: TraderKind,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub trial_id: u64,
    #[serde(default)]
    pub start_delay_secs: f64,
    pub duration_secs: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub cancel_superseded: bool,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: f64,
    #[serde(default = "default_placement_secs")]
    pub placement_secs: f64,
    #[serde(alias = "orderSchedule")]
    pub order_schedule: OrderSchedule,
    pub buyers: Vec<TraderSpec>,
    pub sellers: Vec<TraderSpec>,
}

fn default_heartbeat_secs() -> f64 {
    5.0
}

fn default_placement_secs() -> f64 {
    0.05
}

fn secs(name: &str, value: f64) -> SessionResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| SessionError::config(format!("{name} must be a non-negative number of seconds, got {value}")))
}

impl SessionConfig {
    pub fn load(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SessionError::config(format!("reading {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> SessionResult<Self> {
        serde_json::from_str(raw).map_err(|e| SessionError::config(format!("parsing session config: {e}")))
    }

    pub fn start_delay(&self) -> SessionResult<Duration> {
        secs("start_delay_secs", self.start_delay_secs)
    }

    pub fn duration(&self) -> SessionResult<Duration> {
        secs("duration_secs", self.duration_secs)
    }

    pub fn options(&self) -> SessionResult<SessionOptions> {
        Ok(SessionOptions {
            cancel_superseded: self.cancel_superseded,
            heartbeat: secs("heartbeat_secs", self.heartbeat_secs)?,
            placement: secs("placement_secs", self.placement_secs)?,
            seed: self.seed,
        })
    }

    /// Buyers `B00, B01, ..` then sellers `S00, S01, ..`, numbered across all specs of a side.
    pub fn build_population(
        &self,
        outbox: Option<mpsc::UnboundedSender<Order>>,
    ) -> (Vec<Arc<dyn Trader>>, Vec<Arc<dyn Trader>>) {
        let build = |prefix: char, specs: &[TraderSpec]| -> Vec<Arc<dyn Trader>> {
            specs
                .iter()
                .flat_map(|spec| std::iter::repeat_n(spec.kind, spec.count))
                .enumerate()
                .map(|(i, kind)| kind.build(format!("{prefix}{i:02}"), outbox.clone()))
                .collect()
        };
        (build('B', &self.buyers), build('S', &self.sellers))
    }
}
