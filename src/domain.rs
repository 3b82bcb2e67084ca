// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side { Buy, Sell }
impl Side { pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } } }

/// Jalur asal sebuah reading (push stream atau poll berkala)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel { Push, Poll }
impl Channel { pub fn as_str(&self) -> &'static str { match self { Channel::Push => "push", Channel::Poll => "poll" } } }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquitySnapshot { pub ts: DateTime<Utc>, pub net_liquidation: Decimal }
impl EquitySnapshot {
    pub fn now(net_liquidation: Decimal) -> Self { Self { ts: Utc::now(), net_liquidation } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline { pub value: Decimal, pub set_at: DateTime<Utc> }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownReading { pub pct: Decimal, pub from: EquitySnapshot }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot { pub symbol: String, pub qty: Decimal }

impl PositionSnapshot {
    pub fn new(symbol: impl Into<String>, qty: Decimal) -> Self { Self { symbol: symbol.into(), qty } }

    /// Long ditutup dengan Sell, short dengan Buy.
    pub fn offset_side(&self) -> Side {
        if self.qty.is_sign_negative() { Side::Buy } else { Side::Sell }
    }

    pub fn offset_qty(&self) -> Decimal { self.qty.abs() }

    pub fn is_flat(&self) -> bool { self.qty.is_zero() }
}

/// Order liquidation yang sudah diterima collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderHandle { pub cl_id: String, pub symbol: String, pub side: Side, pub qty: Decimal }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalStatus { Filled, Rejected(String), TimedOut }

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum OrderError {
    #[error("order submission failed: {0}")]
    SubmissionFailed(String),
    #[error("collaborator unreachable: {0}")]
    Unreachable(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("order timed out waiting for terminal status")]
    TimedOut,
    #[error("order status unavailable: {0}")]
    StatusUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderOutcome {
    pub position: PositionSnapshot,
    pub submitted: bool,
    pub filled: bool,
    pub error: Option<OrderError>,
}

impl OrderOutcome {
    pub fn flat(position: PositionSnapshot) -> Self {
        Self { position, submitted: false, filled: false, error: None }
    }
    pub fn filled(position: PositionSnapshot) -> Self {
        Self { position, submitted: true, filled: true, error: None }
    }
    pub fn failed(position: PositionSnapshot, submitted: bool, error: OrderError) -> Self {
        Self { position, submitted, filled: false, error: Some(error) }
    }

    /// Posisi dianggap tertutup jika terisi, atau memang sudah flat.
    pub fn is_closed(&self) -> bool { self.error.is_none() && (self.filled || self.position.is_flat()) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Verdict {
    Filled,
    Partial { failed: Vec<(String, String)> },
    Unreachable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationReport { pub outcomes: Vec<OrderOutcome>, pub verdict: Verdict }

impl LiquidationReport {
    pub fn from_outcomes(outcomes: Vec<OrderOutcome>) -> Self {
        let attempted: Vec<&OrderOutcome> = outcomes.iter().filter(|o| !o.position.is_flat()).collect();
        let all_unreachable = !attempted.is_empty()
            && attempted.iter().all(|o| matches!(o.error, Some(OrderError::Unreachable(_))));

        let verdict = if all_unreachable {
            let reason = attempted
                .iter()
                .find_map(|o| o.error.as_ref().map(|e| e.to_string()))
                .unwrap_or_default();
            Verdict::Unreachable { reason }
        } else if outcomes.iter().all(OrderOutcome::is_closed) {
            Verdict::Filled
        } else {
            let failed = outcomes
                .iter()
                .filter(|o| !o.is_closed())
                .map(|o| {
                    let why = o.error.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "not filled".to_string());
                    (o.position.symbol.clone(), why)
                })
                .collect();
            Verdict::Partial { failed }
        };
        Self { outcomes, verdict }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self { outcomes: Vec::new(), verdict: Verdict::Unreachable { reason: reason.into() } }
    }

    pub fn is_success(&self) -> bool { matches!(self.verdict, Verdict::Filled) }

    pub fn summary(&self) -> String {
        match &self.verdict {
            Verdict::Filled => format!("all {} positions closed", self.outcomes.len()),
            Verdict::Partial { failed } => {
                let items: Vec<String> = failed.iter().map(|(s, why)| format!("{s}: {why}")).collect();
                format!("{} of {} positions not closed [{}]", failed.len(), self.outcomes.len(), items.join("; "))
            }
            Verdict::Unreachable { reason } => format!("collaborator unreachable: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardState { Idle, Monitoring, Triggered, Liquidating, Completed, Failed }

impl GuardState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardState::Idle => "idle",
            GuardState::Monitoring => "monitoring",
            GuardState::Triggered => "triggered",
            GuardState::Liquidating => "liquidating",
            GuardState::Completed => "completed",
            GuardState::Failed => "failed",
        }
    }
    pub fn is_in_flight(&self) -> bool { matches!(self, GuardState::Triggered | GuardState::Liquidating) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn offset_side_is_opposite_of_position() {
        let long = PositionSnapshot::new("AAPL", dec!(100));
        let short = PositionSnapshot::new("MSFT", dec!(-50));
        assert_eq!(long.offset_side(), Side::Sell);
        assert_eq!(long.offset_qty(), dec!(100));
        assert_eq!(short.offset_side(), Side::Buy);
        assert_eq!(short.offset_qty(), dec!(50));
    }

    #[test]
    fn verdict_filled_counts_flat_positions_as_closed() {
        let report = LiquidationReport::from_outcomes(vec![
            OrderOutcome::filled(PositionSnapshot::new("AAPL", dec!(10))),
            OrderOutcome::flat(PositionSnapshot::new("IBM", dec!(0))),
        ]);
        assert!(report.is_success());
    }

    #[test]
    fn verdict_partial_lists_failed_symbols() {
        let report = LiquidationReport::from_outcomes(vec![
            OrderOutcome::filled(PositionSnapshot::new("AAPL", dec!(10))),
            OrderOutcome::failed(PositionSnapshot::new("MSFT", dec!(-5)), true, OrderError::TimedOut),
        ]);
        match &report.verdict {
            Verdict::Partial { failed } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].0, "MSFT");
            }
            other => panic!("unexpected verdict {other:?}"),
        }
        assert!(report.summary().contains("MSFT"));
    }

    #[test]
    fn verdict_unreachable_when_every_submission_unreachable() {
        let report = LiquidationReport::from_outcomes(vec![
            OrderOutcome::failed(PositionSnapshot::new("AAPL", dec!(10)), false, OrderError::Unreachable("down".into())),
            OrderOutcome::failed(PositionSnapshot::new("MSFT", dec!(5)), false, OrderError::Unreachable("down".into())),
        ]);
        assert!(matches!(report.verdict, Verdict::Unreachable { .. }));
        assert_eq!(report.outcomes.len(), 2);
    }
}
