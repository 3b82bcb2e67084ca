// ===============================
// src/monitor.rs (push & poll adapters)
// ===============================
//
// Dua konteks eksekusi berjalan bersamaan:
// - run_push : konsumsi stream snapshot dari collaborator
// - run_poll : query summary tiap poll_interval
// Keduanya masuk ke `on_snapshot` yang sama: baseline -> evaluate -> trigger.
// Pemenang trigger menjalankan liquidation inline di konteksnya sendiri.
//
use std::sync::Arc;
use std::time::Duration;

use tokio::{
    sync::{mpsc, watch},
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::domain::{Channel, EquitySnapshot, LiquidationReport};
use crate::drawdown::{self, to_bps};
use crate::gateway::AccountGateway;
use crate::guard::{Guard, Trigger};
use crate::liquidation::Liquidator;
use crate::metrics::{DRAWDOWN_BPS, GATEWAY_ERRORS, READINGS};

pub struct Monitor {
    gw: Arc<dyn AccountGateway>,
    guard: Arc<Guard>,
    liquidator: Liquidator,
}

impl Monitor {
    pub fn new(gw: Arc<dyn AccountGateway>, guard: Arc<Guard>, liquidator: Liquidator) -> Self {
        Self { gw, guard, liquidator }
    }

    pub fn guard(&self) -> &Arc<Guard> { &self.guard }

    /// Jalur bersama untuk setiap snapshot. Mengembalikan hasil trigger jika
    /// reading ini melewati threshold.
    pub async fn on_snapshot(&self, snap: EquitySnapshot, via: Channel) -> Option<Trigger> {
        if !self.guard.accepts_readings() {
            READINGS.with_label_values(&[via.as_str(), "discarded"]).inc();
            debug!(channel = via.as_str(), "reading discarded, guard not monitoring");
            return None;
        }

        let baseline = match self.guard.observe(&snap) {
            Ok(b) => b,
            Err(e) => {
                READINGS.with_label_values(&[via.as_str(), "invalid"]).inc();
                debug!(channel = via.as_str(), error = %e, "reading skipped");
                return None;
            }
        };

        let reading = match drawdown::evaluate(&snap, &baseline) {
            Ok(r) => r,
            Err(e) => {
                READINGS.with_label_values(&[via.as_str(), "invalid"]).inc();
                debug!(channel = via.as_str(), error = %e, "reading skipped");
                return None;
            }
        };

        READINGS.with_label_values(&[via.as_str(), "ok"]).inc();
        DRAWDOWN_BPS.set(to_bps(reading.pct));
        debug!(
            channel = via.as_str(),
            equity = %snap.net_liquidation,
            pct_bps = to_bps(reading.pct),
            "equity reading"
        );

        if !drawdown::breaches(&reading, self.guard.threshold()) {
            return None;
        }

        let outcome = self.guard.try_trigger(&reading);
        match outcome {
            Trigger::Won => {
                info!(channel = via.as_str(), "breach detected on this channel, running liquidation");
                let report = self.flatten().await;
                self.guard.finish(report);
            }
            Trigger::Lost => debug!(channel = via.as_str(), "breach already being handled"),
            Trigger::AlreadyTerminal => debug!(channel = via.as_str(), "guard already terminal"),
        }
        Some(outcome)
    }

    async fn flatten(&self) -> LiquidationReport {
        // Snapshot posisi diambil SEKALI di sini; perubahan setelahnya tidak
        // menambah / mengurangi batch.
        let bound = self.liquidator.request_timeout();
        match timeout(bound, self.gw.list_open_positions()).await {
            Ok(Ok(positions)) => self.liquidator.liquidate(positions).await,
            Ok(Err(e)) => {
                GATEWAY_ERRORS.with_label_values(&["list_positions"]).inc();
                warn!(error = %e, "liquidation: cannot list open positions");
                LiquidationReport::unreachable(e.to_string())
            }
            Err(_) => {
                GATEWAY_ERRORS.with_label_values(&["list_positions"]).inc();
                warn!(timeout_ms = bound.as_millis() as u64, "liquidation: position list timed out");
                LiquidationReport::unreachable(format!("position list timed out after {bound:?}"))
            }
        }
    }
}

/// Push context: berhenti saat shutdown atau saat collaborator menutup stream.
pub async fn run_push(
    monitor: Arc<Monitor>,
    mut rx: mpsc::Receiver<EquitySnapshot>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("push channel: started");
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() { break; }
            }
            maybe = rx.recv() => {
                match maybe {
                    Some(snap) => { monitor.on_snapshot(snap, Channel::Push).await; }
                    None => {
                        warn!("push channel: stream closed by collaborator, relying on polling");
                        break;
                    }
                }
            }
        }
    }
    info!("push channel: stopped");
}

/// Poll context: berhenti saat shutdown atau begitu guard meninggalkan Monitoring.
pub async fn run_poll(monitor: Arc<Monitor>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut state_rx = monitor.guard().subscribe();
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(every_ms = every.as_millis() as u64, "poll channel: started");

    loop {
        if !monitor.guard().accepts_readings() {
            info!(state = monitor.guard().state().as_str(), "poll channel: guard left monitoring");
            break;
        }
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() { break; }
            }
            changed = state_rx.changed() => {
                // loop ulang untuk cek state terbaru
                if changed.is_err() { break; }
            }
            _ = tick.tick() => {
                match timeout(every, monitor.gw.query_account_summary()).await {
                    Ok(Ok(snap)) => { monitor.on_snapshot(snap, Channel::Poll).await; }
                    Ok(Err(e)) => {
                        GATEWAY_ERRORS.with_label_values(&["query_summary"]).inc();
                        warn!(error = %e, "poll channel: account summary unavailable");
                    }
                    Err(_) => {
                        GATEWAY_ERRORS.with_label_values(&["query_summary"]).inc();
                        warn!("poll channel: account summary timed out");
                    }
                }
            }
        }
    }
    info!("poll channel: stopped");
}
