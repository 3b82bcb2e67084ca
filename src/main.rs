// ===============================
// src/main.rs
// ===============================
/*
 # jalankan demo mock (equity turun pelan sampai threshold tersentuh)
 RUST_LOG=info,equity_guard=debug cargo run -- --loss-threshold -0.01 --poll-interval-secs 5

 # status guard
 curl -s localhost:9898/metrics | egrep '^guard_(state|drawdown_bps|baseline_cents)'
*/
/*
=============================================================================
Project : equity_guard — async drawdown guard & account flattener in Rust
Module  : <module_name>.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Watches account equity via push stream and periodic polling
          (mock/Binance), fixes a session baseline, and liquidates every
          open position exactly once when drawdown breaches the threshold.
          Exposes Prometheus metrics and structured tracing logs.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod drawdown;
mod guard;
mod gateway;          // collaborator trait + mock account
mod binance;          // helper (signer/models) for Binance
mod gateway_binance;  // real Binance Spot (REST + User Data Stream)
mod liquidation;
mod monitor;
mod session;

use std::sync::Arc;

use tokio::{sync::watch, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::gateway::{AccountGateway, MockGateway};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    // ---- Load config ----
    let args = match config::load() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    info!(
        gateway = args.gateway_mode.as_str(),
        threshold = %args.guard.loss_threshold,
        poll_secs = args.guard.poll_interval.as_secs(),
        order_timeout_secs = args.guard.order_timeout.as_secs(),
        metrics_port = args.metrics_port,
        "startup config"
    );

    // ---- Collaborator ----
    let gw: Arc<dyn AccountGateway> = match (&args.gateway_mode, args.binance.clone()) {
        (config::GatewayMode::Mock, _) => {
            let mock = Arc::new(MockGateway::new(args.mock.clone()));
            info!(equity = %args.mock.equity, positions = ?args.mock.positions, drift_bps = args.mock_drift_bps, "mock account");
            tokio::spawn(gateway::run_mock_walk(mock.clone(), args.mock_drift_bps, Duration::from_secs(1)));
            mock as Arc<dyn AccountGateway>
        }
        (_, Some(bcfg)) => match gateway_binance::BinanceGateway::new(bcfg) {
            Ok(g) => Arc::new(g),
            Err(e) => {
                error!(error = %e, "binance gateway init failed");
                std::process::exit(2);
            }
        },
        (_, None) => {
            error!("binance mode without binance config");
            std::process::exit(2);
        }
    };

    // ---- Shutdown signal ----
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(e) => warn!(?e, "ctrl-c handler failed, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    // ---- Guard session ----
    let summary = session::Session::new(gw, args.guard.clone()).run(shutdown_rx).await;

    match &summary.report {
        Some(r) => info!(
            state = summary.state.as_str(),
            baseline = ?summary.baseline.as_ref().map(|b| b.value),
            outcome = %r.summary(),
            "guard session finished"
        ),
        None => info!(
            state = summary.state.as_str(),
            baseline = ?summary.baseline.as_ref().map(|b| b.value),
            "guard session finished without liquidation"
        ),
    }
}
