use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::Serialize;

use crate::trader::Trader;

/// One line per participant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantLine {
    pub id: String,
    pub trade_count: u64,
    pub balance: f64,
}

/// Profit aggregated over every participant of one type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeSummary {
    pub trader_type: String,
    pub count: usize,
    pub total_balance: f64,
    pub average_balance: f64,
}

/// End-of-session statistics. Participants are ordered by id, groups by type name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionReport {
    pub participants: Vec<ParticipantLine>,
    pub groups: Vec<TypeSummary>,
}

impl SessionReport {
    pub fn group(&self, trader_type: &str) -> Option<&TypeSummary> {
        self.groups.iter().find(|g| g.trader_type == trader_type)
    }
}

pub fn summarize<'a, I>(traders: I) -> SessionReport
where
    I: IntoIterator<Item = &'a Arc<dyn Trader>>,
{
    let mut participants = Vec::new();
    let mut by_type: BTreeMap<String, (usize, f64)> = BTreeMap::new();

    for t in traders {
        let balance = t.balance();
        participants.push(ParticipantLine {
            id: t.id().to_string(),
            trade_count: t.trade_count(),
            balance,
        });
        let entry = by_type.entry(t.trader_type().to_string()).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += balance;
    }
    participants.sort_by(|a, b| a.id.cmp(&b.id));

    let groups = by_type
        .into_iter()
        .map(|(trader_type, (count, total))| TypeSummary {
            trader_type,
            count,
            total_balance: total,
            average_balance: total / count as f64,
        })
        .collect();

    SessionReport {
        participants,
        groups,
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in &self.participants {
            writeln!(f, "{} N={} B={:.2}", p.id, p.trade_count, p.balance)?;
        }
        for g in &self.groups {
            writeln!(
                f,
                "{}, TOTAL={:.2}, AVERAGE={:.2}",
                g.trader_type, g.total_balance, g.average_balance
            )?;
        }
        Ok(())
    }
}
