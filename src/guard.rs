// ===============================
// src/guard.rs
// ===============================
//
// Guard state machine + baseline tracker.
//
// Semua state mutable sesi (GuardState, Baseline, laporan akhir) berada di
// belakang SATU mutex. Transisi Monitoring -> Triggered -> Liquidating adalah
// compare-and-set di dalam lock yang sama, jadi dari N pemanggil bersamaan
// hanya satu yang mendapat `Trigger::Won`.
//
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::domain::{Baseline, DrawdownReading, EquitySnapshot, GuardState, LiquidationReport};
use crate::drawdown::to_bps;
use crate::metrics::{BASELINE, BREACHES, GUARD_STATE};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("invalid baseline {0}: first equity value must be positive")]
    InvalidBaseline(Decimal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Won,
    Lost,
    AlreadyTerminal,
}

#[derive(Debug)]
struct Inner {
    state: GuardState,
    baseline: Option<Baseline>,
    report: Option<LiquidationReport>,
}

#[derive(Debug)]
pub struct Guard {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<GuardState>,
    threshold: Decimal,
}

impl Guard {
    pub fn new(threshold: Decimal) -> Self {
        let (state_tx, _rx) = watch::channel(GuardState::Idle);
        publish(GuardState::Idle);
        Self {
            inner: Mutex::new(Inner { state: GuardState::Idle, baseline: None, report: None }),
            state_tx,
            threshold,
        }
    }

    pub fn threshold(&self) -> Decimal { self.threshold }

    pub fn state(&self) -> GuardState { self.inner.lock().state }

    pub fn baseline(&self) -> Option<Baseline> { self.inner.lock().baseline.clone() }

    pub fn report(&self) -> Option<LiquidationReport> { self.inner.lock().report.clone() }

    /// Reading hanya dievaluasi saat Idle (menunggu baseline) atau Monitoring.
    pub fn accepts_readings(&self) -> bool {
        matches!(self.state(), GuardState::Idle | GuardState::Monitoring)
    }

    pub fn subscribe(&self) -> watch::Receiver<GuardState> { self.state_tx.subscribe() }

    /// Baseline tracker. Snapshot pertama (dari channel mana pun) yang menang
    /// lock menjadi baseline sesi; sesudahnya baseline tidak pernah berubah.
    pub fn observe(&self, snap: &EquitySnapshot) -> Result<Baseline, GuardError> {
        let mut g = self.inner.lock();
        if let Some(b) = &g.baseline {
            return Ok(b.clone());
        }
        if snap.net_liquidation <= Decimal::ZERO {
            return Err(GuardError::InvalidBaseline(snap.net_liquidation));
        }
        let b = Baseline { value: snap.net_liquidation, set_at: Utc::now() };
        g.baseline = Some(b.clone());
        if g.state == GuardState::Idle {
            g.state = GuardState::Monitoring;
            info!(baseline = %b.value, snapshot_ts = %snap.ts, "guard: idle -> monitoring");
            self.notify(GuardState::Monitoring);
        }
        BASELINE.set(to_cents(b.value));
        Ok(b)
    }

    /// Satu-satunya titik serialisasi: Monitoring -> Triggered -> Liquidating.
    pub fn try_trigger(&self, reading: &DrawdownReading) -> Trigger {
        let mut g = self.inner.lock();
        match g.state {
            GuardState::Monitoring => {
                g.state = GuardState::Triggered;
                BREACHES.inc();
                warn!(
                    pct_bps = to_bps(reading.pct),
                    pct = %reading.pct,
                    threshold = %self.threshold,
                    equity = %reading.from.net_liquidation,
                    snapshot_ts = %reading.from.ts,
                    "guard: threshold breached, liquidating"
                );
                g.state = GuardState::Liquidating;
                self.notify(GuardState::Liquidating);
                Trigger::Won
            }
            GuardState::Completed | GuardState::Failed => Trigger::AlreadyTerminal,
            GuardState::Idle | GuardState::Triggered | GuardState::Liquidating => Trigger::Lost,
        }
    }

    /// Liquidating -> Completed | Failed. Dipanggil sekali oleh pemenang trigger.
    pub fn finish(&self, report: LiquidationReport) -> GuardState {
        let mut g = self.inner.lock();
        if g.state != GuardState::Liquidating {
            warn!(state = g.state.as_str(), "guard: finish called outside liquidation, ignored");
            return g.state;
        }
        let next = if report.is_success() { GuardState::Completed } else { GuardState::Failed };
        match next {
            GuardState::Completed => info!(reason = %report.summary(), "guard: liquidating -> completed"),
            _ => error!(reason = %report.summary(), "guard: liquidating -> failed"),
        }
        g.state = next;
        g.report = Some(report);
        self.notify(next);
        next
    }

    /// Tunggu sampai tidak ada liquidation in-flight.
    pub async fn wait_settled(&self) -> GuardState {
        let mut rx = self.subscribe();
        loop {
            let s = *rx.borrow_and_update();
            if !s.is_in_flight() {
                return s;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    fn notify(&self, s: GuardState) {
        publish(s);
        self.state_tx.send_replace(s);
    }
}

fn publish(s: GuardState) {
    for label in ["idle", "monitoring", "triggered", "liquidating", "completed", "failed"] {
        GUARD_STATE.with_label_values(&[label]).set((label == s.as_str()) as i64);
    }
}

fn to_cents(v: Decimal) -> i64 {
    use rust_decimal::prelude::ToPrimitive;
    v.checked_mul(Decimal::from(100)).and_then(|d| d.round().to_i64()).unwrap_or(0)
}
