// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Guard --------
pub static GUARD_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("guard_state", "1 for the current guard state (label: state)"),
        &["state"],
    )
    .unwrap()
});

pub static BASELINE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("guard_baseline_cents", "session baseline equity (cents)").unwrap());

pub static DRAWDOWN_BPS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("guard_drawdown_bps", "last evaluated drawdown (bps)").unwrap());

pub static READINGS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("guard_readings_total", "equity readings by channel & result"),
        &["channel", "result"],
    )
    .unwrap()
});

pub static BREACHES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("guard_breaches_total", "threshold breaches that won the trigger").unwrap());

// -------- Liquidation --------
pub static LIQ_ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("liquidation_orders_total", "liquidation order outcomes"),
        &["result"],
    )
    .unwrap()
});

// -------- Collaborator health --------
pub static GATEWAY_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("gateway_errors_total", "collaborator call failures (label: op)"),
        &["op"],
    )
    .unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("account_ws_reconnects_total", "account stream reconnects").unwrap());

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(GUARD_STATE.clone())),
        REGISTRY.register(Box::new(BASELINE.clone())),
        REGISTRY.register(Box::new(DRAWDOWN_BPS.clone())),
        REGISTRY.register(Box::new(READINGS.clone())),
        REGISTRY.register(Box::new(BREACHES.clone())),
        REGISTRY.register(Box::new(LIQ_ORDERS.clone())),
        REGISTRY.register(Box::new(GATEWAY_ERRORS.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
    ] {
        if let Err(e) = m {
            error!(?e, "metrics register failed");
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// tiny HTTP 1.1 responder, any path returns the metrics page
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(%addr, ?e, "metrics bind failed, metrics disabled");
                return;
            }
        };
        info!(%addr, "metrics listening");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(?e, "metrics accept error"),
            }
        }
    });
}
