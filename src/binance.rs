// ===============================
// src/binance.rs
// ===============================
use ahash::AHashMap as HashMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;

use crate::domain::PositionSnapshot;
use crate::gateway::GatewayError;

pub fn timestamp_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub fn sign_query(secret: &str, query: &str) -> Result<String, GatewayError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| GatewayError::Credentials("BINANCE_API_SECRET"))?;
    mac.update(query.as_bytes());
    let sig = mac.finalize().into_bytes();
    Ok(hex::encode(sig))
}

pub fn build_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ---- REST models ----
#[derive(Debug, Deserialize)]
pub struct AccountInfo {
    pub balances: Vec<Balance>,
}

#[derive(Debug, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    pub price: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct ListenKey {
    #[serde(rename = "listenKey")]
    pub listen_key: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderAck {
    pub symbol: String,
    #[serde(rename = "clientOrderId")]
    pub client_order_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderQuery {
    pub status: String, // NEW, PARTIALLY_FILLED, FILLED, CANCELED, REJECTED, EXPIRED, EXPIRED_IN_MATCH
    #[serde(rename = "executedQty", default)]
    pub executed_qty: Decimal,
}

// ---- Minimal user-data stream model ----
#[derive(Debug, Deserialize)]
pub struct WsEnvelope {
    #[serde(default)]
    pub e: Option<String>, // outboundAccountPosition, balanceUpdate, executionReport
    #[serde(rename = "E", default)]
    pub event_time: Option<u64>,
}

impl WsEnvelope {
    /// Event yang mengubah saldo -> equity perlu dihitung ulang.
    pub fn touches_balances(&self) -> bool {
        matches!(self.e.as_deref(), Some("outboundAccountPosition") | Some("balanceUpdate"))
    }
}

pub fn price_map(tickers: Vec<TickerPrice>) -> HashMap<String, Decimal> {
    tickers.into_iter().map(|t| (t.symbol, t.price)).collect()
}

/// Net liquidation dalam quote asset: saldo quote + sum(saldo aset x harga terakhir).
/// Aset tanpa pair ke quote asset diabaikan.
pub fn net_liquidation(balances: &[Balance], prices: &HashMap<String, Decimal>, quote: &str) -> Decimal {
    balances
        .iter()
        .map(|b| {
            let total = b.free + b.locked;
            if b.asset == quote {
                total
            } else {
                prices
                    .get(&format!("{}{}", b.asset, quote))
                    .map(|px| total * *px)
                    .unwrap_or(Decimal::ZERO)
            }
        })
        .sum()
}

/// Spot: setiap saldo non-quote yang punya pair ke quote asset adalah posisi long.
pub fn open_positions(balances: &[Balance], prices: &HashMap<String, Decimal>, quote: &str) -> Vec<PositionSnapshot> {
    balances
        .iter()
        .filter(|b| b.asset != quote && !b.free.is_zero())
        .filter_map(|b| {
            let symbol = format!("{}{}", b.asset, quote);
            prices.contains_key(&symbol).then(|| PositionSnapshot::new(symbol, b.free))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signature_matches_binance_reference_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn query_values_are_url_encoded() {
        let q = build_query(&[("symbol", "BTCUSDT".into()), ("newClientOrderId", "LIQ 1/2".into())]);
        assert_eq!(q, "symbol=BTCUSDT&newClientOrderId=LIQ%201%2F2");
    }

    fn balances() -> Vec<Balance> {
        serde_json::from_str::<AccountInfo>(
            r#"{"balances":[
                {"asset":"USDT","free":"1000.50","locked":"0.00"},
                {"asset":"BTC","free":"0.5","locked":"0.1"},
                {"asset":"ETH","free":"0","locked":"0"},
                {"asset":"DUST","free":"7","locked":"0"}
            ]}"#,
        )
        .unwrap()
        .balances
    }

    fn prices() -> HashMap<String, Decimal> {
        price_map(vec![
            TickerPrice { symbol: "BTCUSDT".into(), price: dec!(60000) },
            TickerPrice { symbol: "ETHUSDT".into(), price: dec!(3000) },
        ])
    }

    #[test]
    fn equity_sums_quote_and_priced_assets() {
        // 1000.50 + 0.6 * 60000
        assert_eq!(net_liquidation(&balances(), &prices(), "USDT"), dec!(37000.50));
    }

    #[test]
    fn positions_skip_quote_flat_and_unpriced_assets() {
        let p = open_positions(&balances(), &prices(), "USDT");
        assert_eq!(p, vec![PositionSnapshot::new("BTCUSDT", dec!(0.5))]);
    }

    #[test]
    fn account_events_are_recognised() {
        let ev: WsEnvelope = serde_json::from_str(r#"{"e":"outboundAccountPosition","E":1564034571105}"#).unwrap();
        assert!(ev.touches_balances());
        let other: WsEnvelope = serde_json::from_str(r#"{"e":"executionReport"}"#).unwrap();
        assert!(!other.touches_balances());
    }
}
