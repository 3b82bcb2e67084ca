// ===============================
// src/config.rs
// ===============================
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
use std::env;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::PositionSnapshot;
use crate::gateway::MockCfg;

/// Mode collaborator (sumber equity + venue order)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayMode {
    Mock,
    BinanceSandbox,
    BinanceMainnet,
}

impl GatewayMode {
    pub fn parse(s: &str) -> Option<GatewayMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock"            => Some(GatewayMode::Mock),
            "binance_sandbox" => Some(GatewayMode::BinanceSandbox),
            "binance_mainnet" => Some(GatewayMode::BinanceMainnet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayMode::Mock           => "mock",
            GatewayMode::BinanceSandbox => "binance_sandbox",
            GatewayMode::BinanceMainnet => "binance_mainnet",
        }
    }

    // Endpoint default per mode
    pub fn default_ws_url(&self) -> &'static str {
        match self {
            GatewayMode::Mock           => "wss://testnet.binance.vision/ws", // tidak dipakai saat mock
            GatewayMode::BinanceSandbox => "wss://testnet.binance.vision/ws",
            GatewayMode::BinanceMainnet => "wss://stream.binance.com:9443/ws",
        }
    }

    pub fn default_rest_url(&self) -> &'static str {
        match self {
            GatewayMode::Mock           => "https://testnet.binance.vision", // placeholder
            GatewayMode::BinanceSandbox => "https://testnet.binance.vision",
            GatewayMode::BinanceMainnet => "https://api.binance.com",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Parse { key: &'static str, value: String },
    #[error("loss threshold {0} must be a negative fraction greater than -1 (e.g. -0.01)")]
    Threshold(Decimal),
    #[error("{0} must be a positive integer")]
    NotPositive(&'static str),
    #[error("unknown gateway mode {0:?} (mock | binance_sandbox | binance_mainnet)")]
    Mode(String),
    #[error("{0} is required for binance modes")]
    Missing(&'static str),
}

/// Command-line overrides; anything not given falls back to env / .env.
#[derive(Parser, Debug, Default)]
#[command(name = "equity_guard", about = "Drawdown guard: flattens the account once equity falls past a threshold")]
pub struct Cli {
    /// Negative fraction, e.g. -0.01 for a 1% loss
    #[arg(long, allow_hyphen_values = true)]
    pub loss_threshold: Option<String>,
    #[arg(long)]
    pub poll_interval_secs: Option<u64>,
    #[arg(long)]
    pub order_timeout_secs: Option<u64>,
    /// mock | binance_sandbox | binance_mainnet
    #[arg(long)]
    pub gateway: Option<String>,
    #[arg(long)]
    pub metrics_port: Option<u16>,
}

#[derive(Clone, Debug)]
pub struct GuardCfg {
    pub loss_threshold: Decimal,
    pub poll_interval: Duration,
    pub order_timeout: Duration,
    pub submit_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct BinanceCfg {
    pub rest_url: String,
    pub ws_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window: u64,
    pub quote_asset: String,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub gateway_mode: GatewayMode,
    pub metrics_port: u16,
    pub guard: GuardCfg,
    pub binance: Option<BinanceCfg>,
    pub mock: MockCfg,
    pub mock_drift_bps: i64,
}

pub fn load() -> Result<Args, ConfigError> {
    // Pastikan .env dibaca
    let _ = dotenv();
    from_sources(&Cli::parse(), |k| env::var(k).ok())
}

/// Gabungkan CLI + env. `get` dipisah supaya bisa diuji tanpa menyentuh env proses.
pub fn from_sources(cli: &Cli, get: impl Fn(&str) -> Option<String>) -> Result<Args, ConfigError> {
    // ===== Guard =====
    let threshold_raw = cli
        .loss_threshold
        .clone()
        .or_else(|| get("LOSS_THRESHOLD"))
        .unwrap_or_else(|| "-0.01".to_string());
    let loss_threshold = Decimal::from_str(threshold_raw.trim())
        .map_err(|_| ConfigError::Parse { key: "LOSS_THRESHOLD", value: threshold_raw.clone() })?;
    if loss_threshold >= Decimal::ZERO || loss_threshold <= Decimal::NEGATIVE_ONE {
        return Err(ConfigError::Threshold(loss_threshold));
    }

    let poll_secs = positive(cli.poll_interval_secs, &get, "POLL_INTERVAL_SECS", 5)?;
    let order_timeout_secs = positive(cli.order_timeout_secs, &get, "ORDER_TIMEOUT_SECS", 30)?;
    let submit_timeout_secs = positive(None, &get, "SUBMIT_TIMEOUT_SECS", 10)?;

    let guard = GuardCfg {
        loss_threshold,
        poll_interval: Duration::from_secs(poll_secs),
        order_timeout: Duration::from_secs(order_timeout_secs),
        submit_timeout: Duration::from_secs(submit_timeout_secs),
    };

    // ===== Mode =====
    let mode_raw = cli.gateway.clone().or_else(|| get("GATEWAY_MODE")).unwrap_or_else(|| "mock".to_string());
    let gateway_mode = GatewayMode::parse(&mode_raw).ok_or(ConfigError::Mode(mode_raw.clone()))?;

    let metrics_port = match cli.metrics_port {
        Some(p) => p,
        None => parse_or(&get, "METRICS_PORT", 9898u16)?,
    };

    let binance = match gateway_mode {
        GatewayMode::Mock => None,
        GatewayMode::BinanceSandbox | GatewayMode::BinanceMainnet => Some(BinanceCfg {
            rest_url: get("BINANCE_REST_URL").unwrap_or_else(|| gateway_mode.default_rest_url().to_string()),
            ws_url: get("BINANCE_WS_URL").unwrap_or_else(|| gateway_mode.default_ws_url().to_string()),
            api_key: get("BINANCE_API_KEY").ok_or(ConfigError::Missing("BINANCE_API_KEY"))?,
            api_secret: get("BINANCE_API_SECRET").ok_or(ConfigError::Missing("BINANCE_API_SECRET"))?,
            recv_window: parse_or(&get, "BINANCE_RECV_WINDOW", 5000u64)?,
            quote_asset: get("QUOTE_ASSET").unwrap_or_else(|| "USDT".to_string()).to_ascii_uppercase(),
        }),
    };

    // ===== Mock account =====
    // MOCK_POSITIONS=AAPL:100,MSFT:-50
    let positions_raw = get("MOCK_POSITIONS").unwrap_or_else(|| "AAPL:100,MSFT:-50".to_string());
    let mock = MockCfg {
        equity: parse_or(&get, "MOCK_EQUITY", Decimal::from(100_000))?,
        positions: parse_positions(&positions_raw)?,
        fill_ms: parse_or(&get, "MOCK_FILL_MS", 200u64)?,
    };
    let mock_drift_bps = parse_or(&get, "MOCK_DRIFT_BPS", -5i64)?;

    Ok(Args { gateway_mode, metrics_port, guard, binance, mock, mock_drift_bps })
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Parse { key, value: v }),
        None => Ok(default),
    }
}

fn positive(
    cli: Option<u64>,
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    let v = match cli {
        Some(v) => v,
        None => parse_or(get, key, default)?,
    };
    if v == 0 {
        return Err(ConfigError::NotPositive(key));
    }
    Ok(v)
}

fn parse_positions(raw: &str) -> Result<Vec<PositionSnapshot>, ConfigError> {
    raw.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|item| {
            let bad = || ConfigError::Parse { key: "MOCK_POSITIONS", value: item.to_string() };
            let (sym, qty) = item.split_once(':').ok_or_else(bad)?;
            let qty = Decimal::from_str(qty.trim()).map_err(|_| bad())?;
            Ok(PositionSnapshot::new(sym.trim().to_ascii_uppercase(), qty))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap as HashMap;
    use rust_decimal_macros::dec;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_observed_behaviour() {
        let args = from_sources(&Cli::default(), env_of(&[])).unwrap();
        assert_eq!(args.guard.loss_threshold, dec!(-0.01));
        assert_eq!(args.guard.poll_interval, Duration::from_secs(5));
        assert_eq!(args.gateway_mode, GatewayMode::Mock);
        assert_eq!(args.mock.positions.len(), 2);
        assert_eq!(args.mock.positions[1].qty, dec!(-50));
        assert!(args.binance.is_none());
    }

    #[test]
    fn cli_overrides_env() {
        let cli = Cli { loss_threshold: Some("-0.05".into()), poll_interval_secs: Some(2), ..Cli::default() };
        let args = from_sources(&cli, env_of(&[("LOSS_THRESHOLD", "-0.02"), ("POLL_INTERVAL_SECS", "9")])).unwrap();
        assert_eq!(args.guard.loss_threshold, dec!(-0.05));
        assert_eq!(args.guard.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn rejects_non_negative_threshold_and_zero_intervals() {
        assert_eq!(
            from_sources(&Cli::default(), env_of(&[("LOSS_THRESHOLD", "0.01")])).unwrap_err(),
            ConfigError::Threshold(dec!(0.01))
        );
        assert!(matches!(
            from_sources(&Cli::default(), env_of(&[("LOSS_THRESHOLD", "-1.5")])),
            Err(ConfigError::Threshold(_))
        ));
        assert_eq!(
            from_sources(&Cli::default(), env_of(&[("ORDER_TIMEOUT_SECS", "0")])).unwrap_err(),
            ConfigError::NotPositive("ORDER_TIMEOUT_SECS")
        );
    }

    #[test]
    fn binance_mode_requires_credentials() {
        assert_eq!(
            from_sources(&Cli::default(), env_of(&[("GATEWAY_MODE", "binance_sandbox")])).unwrap_err(),
            ConfigError::Missing("BINANCE_API_KEY")
        );
        let args = from_sources(
            &Cli::default(),
            env_of(&[("GATEWAY_MODE", "binance_sandbox"), ("BINANCE_API_KEY", "k"), ("BINANCE_API_SECRET", "s")]),
        )
        .unwrap();
        let b = args.binance.unwrap();
        assert_eq!(b.rest_url, "https://testnet.binance.vision");
        assert_eq!(b.quote_asset, "USDT");
    }

    #[test]
    fn malformed_positions_are_reported() {
        assert!(matches!(
            from_sources(&Cli::default(), env_of(&[("MOCK_POSITIONS", "AAPL=1")])),
            Err(ConfigError::Parse { key: "MOCK_POSITIONS", .. })
        ));
    }
}
