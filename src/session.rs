// ===============================
// src/session.rs (lifecycle satu sesi monitoring)
// ===============================
//
// Urutan shutdown:
//   1) sinyal shutdown diterima
//   2) tunggu guard keluar dari Triggered/Liquidating (liquidation tidak diinterupsi)
//   3) join konteks push & poll
//   4) disconnect() collaborator, tepat sekali
//
use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::config::GuardCfg;
use crate::domain::{Baseline, GuardState, LiquidationReport};
use crate::gateway::AccountGateway;
use crate::guard::Guard;
use crate::liquidation::{Liquidator, LiquidatorCfg};
use crate::metrics::GATEWAY_ERRORS;
use crate::monitor::{run_poll, run_push, Monitor};

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub state: GuardState,
    pub baseline: Option<Baseline>,
    pub report: Option<LiquidationReport>,
}

pub struct Session {
    gw: Arc<dyn AccountGateway>,
    guard: Arc<Guard>,
    monitor: Arc<Monitor>,
    cfg: GuardCfg,
}

impl Session {
    pub fn new(gw: Arc<dyn AccountGateway>, cfg: GuardCfg) -> Self {
        let guard = Arc::new(Guard::new(cfg.loss_threshold));
        let liquidator = Liquidator::new(
            gw.clone(),
            LiquidatorCfg { submit_timeout: cfg.submit_timeout, order_timeout: cfg.order_timeout },
        );
        let monitor = Arc::new(Monitor::new(gw.clone(), guard.clone(), liquidator));
        Self { gw, guard, monitor, cfg }
    }

    #[cfg(test)]
    pub fn guard(&self) -> Arc<Guard> { self.guard.clone() }

    /// Jalankan sampai `shutdown` bernilai true (atau sender-nya di-drop).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> SessionSummary {
        info!(
            threshold = %self.cfg.loss_threshold,
            poll_ms = self.cfg.poll_interval.as_millis() as u64,
            order_timeout_ms = self.cfg.order_timeout.as_millis() as u64,
            "guard session: starting"
        );

        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(2);

        match self.gw.subscribe_account_updates().await {
            Ok(rx) => tasks.push(tokio::spawn(run_push(self.monitor.clone(), rx, shutdown.clone()))),
            Err(e) => {
                // tanpa push, poller tetap jalan
                GATEWAY_ERRORS.with_label_values(&["subscribe"]).inc();
                warn!(error = %e, "push subscription failed, polling only");
            }
        }
        tasks.push(tokio::spawn(run_poll(self.monitor.clone(), self.cfg.poll_interval, shutdown.clone())));

        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!(state = self.guard.state().as_str(), "guard session: shutdown requested");

        let settled = self.guard.wait_settled().await;
        for t in tasks {
            if let Err(e) = t.await {
                warn!(?e, "guard session: channel task ended abnormally");
            }
        }

        self.gw.disconnect().await;
        info!(state = settled.as_str(), "guard session: collaborator released");

        SessionSummary { state: self.guard.state(), baseline: self.guard.baseline(), report: self.guard.report() }
    }
}
