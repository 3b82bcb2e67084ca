// ===============================
// src/gateway.rs (collaborator interface + mock account)
// ===============================
//
// `AccountGateway` adalah satu-satunya permukaan broker yang dipakai guard:
// push stream snapshot, poll summary, daftar posisi, submit order offsetting,
// tunggu status terminal, dan disconnect.
//
// `MockGateway` mensimulasikan akun: ACK -> Filled setelah delay (seperti
// venue mock), dengan opsi reject/stall per symbol untuk pengujian.
//
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use ahash::AHashSet as HashSet;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::{sync::mpsc, time::sleep};
use tracing::{debug, info};

use crate::domain::{EquitySnapshot, OrderHandle, PositionSnapshot, TerminalStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("missing credentials: {0}")]
    Credentials(&'static str),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GatewayError::Protocol(e.to_string())
        } else {
            GatewayError::Unavailable(e.to_string())
        }
    }
}

#[async_trait]
pub trait AccountGateway: Send + Sync {
    /// Push channel: setiap update akun dikirim sebagai snapshot.
    async fn subscribe_account_updates(&self) -> Result<mpsc::Receiver<EquitySnapshot>, GatewayError>;

    /// Pull channel untuk poller.
    async fn query_account_summary(&self) -> Result<EquitySnapshot, GatewayError>;

    async fn list_open_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError>;

    async fn submit_offsetting_order(&self, position: &PositionSnapshot) -> Result<OrderHandle, GatewayError>;

    /// Harus kembali paling lambat setelah `timeout` dengan `TerminalStatus::TimedOut`.
    async fn await_terminal_status(
        &self,
        handle: &OrderHandle,
        timeout: Duration,
    ) -> Result<TerminalStatus, GatewayError>;

    async fn disconnect(&self);
}

pub fn new_cl_id() -> String {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    format!("LIQ-{}-{}", now, rand::thread_rng().gen::<u32>())
}

#[derive(Debug, Clone)]
pub struct MockCfg {
    pub equity: Decimal,
    pub positions: Vec<PositionSnapshot>,
    pub fill_ms: u64,
}

#[derive(Debug)]
struct Account {
    equity: Decimal,
    positions: HashMap<String, Decimal>,
    order: Vec<String>,
}

/// Simulated account. Reject/stall/offline knobs hanya untuk test.
pub struct MockGateway {
    account: Mutex<Account>,
    push_tx: Mutex<Option<mpsc::Sender<EquitySnapshot>>>,
    fill_ms: u64,
    reject: Mutex<HashSet<String>>,
    stall: Mutex<HashSet<String>>,
    offline: AtomicBool,
    submitted: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MockGateway {
    pub fn new(cfg: MockCfg) -> Self {
        let mut positions = HashMap::new();
        let mut order = Vec::new();
        for p in cfg.positions {
            order.push(p.symbol.clone());
            positions.insert(p.symbol, p.qty);
        }
        Self {
            account: Mutex::new(Account { equity: cfg.equity, positions, order }),
            push_tx: Mutex::new(None),
            fill_ms: cfg.fill_ms,
            reject: Mutex::new(HashSet::new()),
            stall: Mutex::new(HashSet::new()),
            offline: AtomicBool::new(false),
            submitted: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    pub fn reject_symbol(&self, symbol: &str) { self.reject.lock().insert(symbol.to_string()); }

    /// Order untuk symbol ini tidak pernah mencapai status terminal.
    #[cfg(test)]
    pub fn stall_symbol(&self, symbol: &str) { self.stall.lock().insert(symbol.to_string()); }

    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) { self.offline.store(offline, Ordering::SeqCst); }

    pub fn set_equity(&self, equity: Decimal) { self.account.lock().equity = equity; }

    pub fn equity(&self) -> Decimal { self.account.lock().equity }

    #[cfg(test)]
    pub fn submitted_orders(&self) -> usize { self.submitted.load(Ordering::SeqCst) }

    pub fn disconnect_count(&self) -> usize { self.disconnects.load(Ordering::SeqCst) }

    #[cfg(test)]
    pub fn position(&self, symbol: &str) -> Option<Decimal> { self.account.lock().positions.get(symbol).copied() }

    /// Kirim snapshot lewat push channel (no-op sebelum subscribe).
    pub async fn push(&self, equity: Decimal) -> bool {
        let tx = self.push_tx.lock().clone();
        match tx {
            Some(tx) => tx.send(EquitySnapshot::now(equity)).await.is_ok(),
            None => false,
        }
    }

    fn check_online(&self) -> Result<(), GatewayError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("mock gateway offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountGateway for MockGateway {
    async fn subscribe_account_updates(&self) -> Result<mpsc::Receiver<EquitySnapshot>, GatewayError> {
        self.check_online()?;
        let (tx, rx) = mpsc::channel(1024);
        *self.push_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn query_account_summary(&self) -> Result<EquitySnapshot, GatewayError> {
        self.check_online()?;
        Ok(EquitySnapshot::now(self.equity()))
    }

    async fn list_open_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
        self.check_online()?;
        let acct = self.account.lock();
        Ok(acct
            .order
            .iter()
            .filter_map(|s| acct.positions.get(s).map(|q| PositionSnapshot::new(s.clone(), *q)))
            .collect())
    }

    async fn submit_offsetting_order(&self, position: &PositionSnapshot) -> Result<OrderHandle, GatewayError> {
        self.check_online()?;
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let handle = OrderHandle {
            cl_id: new_cl_id(),
            symbol: position.symbol.clone(),
            side: position.offset_side(),
            qty: position.offset_qty(),
        };
        debug!(cl_id = %handle.cl_id, symbol = %handle.symbol, side = handle.side.as_str(), qty = %handle.qty, "mock: ACK");
        Ok(handle)
    }

    async fn await_terminal_status(
        &self,
        handle: &OrderHandle,
        timeout: Duration,
    ) -> Result<TerminalStatus, GatewayError> {
        if self.stall.lock().contains(&handle.symbol) {
            sleep(timeout).await;
            return Ok(TerminalStatus::TimedOut);
        }
        if self.reject.lock().contains(&handle.symbol) {
            return Ok(TerminalStatus::Rejected("mock reject".into()));
        }

        // jangan simpan ThreadRng melewati .await
        let jitter = if self.fill_ms > 0 { rand::thread_rng().gen_range(0..=self.fill_ms / 4) } else { 0 };
        let fill_after = Duration::from_millis(self.fill_ms + jitter);
        if fill_after > timeout {
            sleep(timeout).await;
            return Ok(TerminalStatus::TimedOut);
        }
        sleep(fill_after).await;

        let mut acct = self.account.lock();
        if let Some(q) = acct.positions.get_mut(&handle.symbol) {
            *q = Decimal::ZERO;
        }
        debug!(cl_id = %handle.cl_id, symbol = %handle.symbol, "mock: FILLED");
        Ok(TerminalStatus::Filled)
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        *self.push_tx.lock() = None;
        info!("mock gateway disconnected");
    }
}

/// Demo driver: random walk equity dengan drift (bps per langkah), dipush
/// setiap `every` dan juga terlihat oleh poller.
pub async fn run_mock_walk(gw: Arc<MockGateway>, drift_bps: i64, every: Duration) {
    loop {
        sleep(every).await;
        let step_bps = drift_bps + rand::thread_rng().gen_range(-10..=10);
        let next = {
            let cur = gw.equity();
            let next = cur + cur * Decimal::new(step_bps, 4);
            gw.set_equity(next.round_dp(2));
            gw.equity()
        };
        if !gw.push(next).await && gw.disconnect_count() > 0 {
            return;
        }
    }
}
