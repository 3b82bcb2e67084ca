// ===============================
// src/liquidation.rs (flatten semua posisi)
// ===============================
//
// Satu order offsetting per posisi, di-fan-out bersamaan (join_all) sehingga
// satu order yang lambat tidak menahan yang lain. Setiap order dibatasi:
//   - submit          : submit_timeout
//   - status terminal : order_timeout (diteruskan ke collaborator) + grace
// Hasilnya selalu K outcome untuk K posisi, urutan sama dengan input.
//
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::domain::{LiquidationReport, OrderError, OrderOutcome, PositionSnapshot, TerminalStatus};
use crate::gateway::{AccountGateway, GatewayError};
use crate::metrics::LIQ_ORDERS;

const STATUS_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct LiquidatorCfg {
    pub submit_timeout: Duration,
    pub order_timeout: Duration,
}

pub struct Liquidator {
    gw: Arc<dyn AccountGateway>,
    cfg: LiquidatorCfg,
}

impl Liquidator {
    pub fn new(gw: Arc<dyn AccountGateway>, cfg: LiquidatorCfg) -> Self { Self { gw, cfg } }

    /// Batas untuk satu panggilan request/ack ke collaborator (submit, daftar posisi).
    pub fn request_timeout(&self) -> Duration { self.cfg.submit_timeout }

    pub async fn liquidate(&self, positions: Vec<PositionSnapshot>) -> LiquidationReport {
        info!(positions = positions.len(), "liquidation: submitting offsetting orders");
        let outcomes = join_all(positions.into_iter().map(|p| self.close_one(p))).await;
        LiquidationReport::from_outcomes(outcomes)
    }

    async fn close_one(&self, position: PositionSnapshot) -> OrderOutcome {
        if position.is_flat() {
            info!(symbol = %position.symbol, "liquidation: already flat, skipped");
            LIQ_ORDERS.with_label_values(&["flat"]).inc();
            return OrderOutcome::flat(position);
        }

        let handle = match timeout(self.cfg.submit_timeout, self.gw.submit_offsetting_order(&position)).await {
            Ok(Ok(h)) => h,
            Ok(Err(GatewayError::Unavailable(e))) => {
                return record(OrderOutcome::failed(position, false, OrderError::Unreachable(e)));
            }
            Ok(Err(e)) => {
                return record(OrderOutcome::failed(position, false, OrderError::SubmissionFailed(e.to_string())));
            }
            Err(_) => {
                // broker mungkin sudah menerima order; status tidak diketahui
                let e = OrderError::SubmissionFailed(format!(
                    "ack not received within {:?}, order state unknown",
                    self.cfg.submit_timeout
                ));
                return record(OrderOutcome::failed(position, true, e));
            }
        };

        info!(
            cl_id = %handle.cl_id,
            symbol = %handle.symbol,
            side = handle.side.as_str(),
            qty = %handle.qty,
            "liquidation: order submitted"
        );

        let bound = self.cfg.order_timeout + STATUS_GRACE;
        let outcome = match timeout(bound, self.gw.await_terminal_status(&handle, self.cfg.order_timeout)).await {
            Ok(Ok(TerminalStatus::Filled)) => OrderOutcome::filled(position),
            Ok(Ok(TerminalStatus::Rejected(r))) => OrderOutcome::failed(position, true, OrderError::Rejected(r)),
            Ok(Ok(TerminalStatus::TimedOut)) | Err(_) => OrderOutcome::failed(position, true, OrderError::TimedOut),
            Ok(Err(e)) => OrderOutcome::failed(position, true, OrderError::StatusUnavailable(e.to_string())),
        };
        record(outcome)
    }
}

fn record(outcome: OrderOutcome) -> OrderOutcome {
    let symbol = &outcome.position.symbol;
    match &outcome.error {
        None => {
            LIQ_ORDERS.with_label_values(&["filled"]).inc();
            info!(%symbol, qty = %outcome.position.qty, "liquidation: position closed");
        }
        Some(e) => {
            let label = match e {
                OrderError::TimedOut => "timed_out",
                OrderError::Rejected(_) => "rejected",
                OrderError::Unreachable(_) => "unreachable",
                OrderError::SubmissionFailed(_) => "submit_failed",
                OrderError::StatusUnavailable(_) => "status_unavailable",
            };
            LIQ_ORDERS.with_label_values(&[label]).inc();
            warn!(%symbol, qty = %outcome.position.qty, submitted = outcome.submitted, error = %e, "liquidation: position NOT closed");
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EquitySnapshot, OrderHandle, Verdict};
    use crate::gateway::{MockCfg, MockGateway};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn setup(positions: Vec<PositionSnapshot>) -> (Arc<MockGateway>, Liquidator) {
        let gw = Arc::new(MockGateway::new(MockCfg { equity: dec!(100000), positions, fill_ms: 10 }));
        let liq = Liquidator::new(
            gw.clone(),
            LiquidatorCfg { submit_timeout: Duration::from_millis(200), order_timeout: Duration::from_millis(100) },
        );
        (gw, liq)
    }

    #[tokio::test]
    async fn one_fill_one_timeout_is_partial() {
        let positions = vec![PositionSnapshot::new("AAPL", dec!(100)), PositionSnapshot::new("MSFT", dec!(-50))];
        let (gw, liq) = setup(positions.clone());
        gw.stall_symbol("MSFT");

        let report = liq.liquidate(positions).await;
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcomes[0].filled);
        assert_eq!(report.outcomes[0].position.symbol, "AAPL");
        assert!(!report.outcomes[1].filled);
        assert_eq!(report.outcomes[1].error, Some(OrderError::TimedOut));
        assert!(matches!(report.verdict, Verdict::Partial { .. }));
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn every_position_gets_exactly_one_order() {
        let positions: Vec<_> = (0..6).map(|i| PositionSnapshot::new(format!("S{i}"), dec!(10))).collect();
        let (gw, liq) = setup(positions.clone());
        gw.reject_symbol("S2");

        let report = liq.liquidate(positions).await;
        assert_eq!(report.outcomes.len(), 6);
        assert_eq!(gw.submitted_orders(), 6);
        assert_eq!(report.outcomes[2].error, Some(OrderError::Rejected("mock reject".into())));
        assert_eq!(report.outcomes.iter().filter(|o| o.filled).count(), 5);
    }

    #[tokio::test]
    async fn slow_orders_do_not_serialize() {
        let positions: Vec<_> = (0..5).map(|i| PositionSnapshot::new(format!("S{i}"), dec!(1))).collect();
        let (gw, liq) = setup(positions.clone());
        for i in 0..5 {
            gw.stall_symbol(&format!("S{i}"));
        }
        let started = Instant::now();
        let report = liq.liquidate(positions).await;
        // 5 x 100ms berurutan = 500ms; fan-out harus jauh di bawah itu
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(report.outcomes.iter().all(|o| o.error == Some(OrderError::TimedOut)));
    }

    #[tokio::test]
    async fn flat_positions_are_not_submitted() {
        let positions = vec![PositionSnapshot::new("AAPL", dec!(0)), PositionSnapshot::new("MSFT", dec!(3))];
        let (gw, liq) = setup(positions.clone());
        let report = liq.liquidate(positions).await;
        assert_eq!(gw.submitted_orders(), 1);
        assert!(!report.outcomes[0].submitted);
        assert!(report.is_success());
    }

    /// Collaborator yang tidak pernah menjawab submit atau mengabaikan timeout status.
    struct Unresponsive {
        inner: Arc<MockGateway>,
        hang_submit: bool,
        hang_status: bool,
    }

    #[async_trait]
    impl AccountGateway for Unresponsive {
        async fn subscribe_account_updates(&self) -> Result<mpsc::Receiver<EquitySnapshot>, GatewayError> {
            self.inner.subscribe_account_updates().await
        }
        async fn query_account_summary(&self) -> Result<EquitySnapshot, GatewayError> {
            self.inner.query_account_summary().await
        }
        async fn list_open_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
            self.inner.list_open_positions().await
        }
        async fn submit_offsetting_order(&self, p: &PositionSnapshot) -> Result<OrderHandle, GatewayError> {
            if self.hang_submit {
                return std::future::pending().await;
            }
            self.inner.submit_offsetting_order(p).await
        }
        async fn await_terminal_status(&self, h: &OrderHandle, t: Duration) -> Result<TerminalStatus, GatewayError> {
            if self.hang_status {
                return std::future::pending().await;
            }
            self.inner.await_terminal_status(h, t).await
        }
        async fn disconnect(&self) {
            self.inner.disconnect().await;
        }
    }

    fn unresponsive(hang_submit: bool, hang_status: bool) -> (LiquidatorCfg, Liquidator) {
        let (inner, _) = setup(vec![]);
        let cfg = LiquidatorCfg { submit_timeout: Duration::from_millis(200), order_timeout: Duration::from_millis(100) };
        let gw = Arc::new(Unresponsive { inner, hang_submit, hang_status });
        (cfg.clone(), Liquidator::new(gw, cfg))
    }

    #[tokio::test]
    async fn silent_submit_is_bounded_and_marked_unknown() {
        let positions = vec![PositionSnapshot::new("AAPL", dec!(1)), PositionSnapshot::new("MSFT", dec!(-2))];
        let (cfg, liq) = unresponsive(true, false);

        let started = Instant::now();
        let report = liq.liquidate(positions).await;
        assert!(started.elapsed() < cfg.submit_timeout + cfg.order_timeout + STATUS_GRACE);

        assert_eq!(report.outcomes.len(), 2);
        for o in &report.outcomes {
            assert!(!o.filled);
            // ack tidak datang: order bisa saja sudah hidup di broker
            assert!(o.submitted);
            assert!(matches!(&o.error, Some(OrderError::SubmissionFailed(m)) if m.contains("state unknown")));
        }
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn status_wait_ignoring_its_timeout_is_cut_off() {
        let positions = vec![PositionSnapshot::new("AAPL", dec!(1)), PositionSnapshot::new("MSFT", dec!(-2))];
        let (cfg, liq) = unresponsive(false, true);

        let started = Instant::now();
        let report = liq.liquidate(positions).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= cfg.order_timeout + STATUS_GRACE);
        assert!(elapsed < cfg.submit_timeout + cfg.order_timeout + STATUS_GRACE);

        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcomes.iter().all(|o| o.submitted && o.error == Some(OrderError::TimedOut)));
        assert!(matches!(report.verdict, Verdict::Partial { .. }));
    }

    #[tokio::test]
    async fn offline_collaborator_is_total_failure() {
        let positions = vec![PositionSnapshot::new("AAPL", dec!(1)), PositionSnapshot::new("MSFT", dec!(2))];
        let (gw, liq) = setup(positions.clone());
        gw.set_offline(true);
        let report = liq.liquidate(positions).await;
        assert_eq!(report.outcomes.len(), 2);
        assert!(matches!(report.verdict, Verdict::Unreachable { .. }));
    }
}
