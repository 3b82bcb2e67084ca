// ===============================
// src/gateway_binance.rs
// ===============================
//
// Binance Spot sebagai AccountGateway:
// - pull  : GET /api/v3/account + /api/v3/ticker/price -> net liquidation (quote asset)
// - push  : user data stream WS; setiap event saldo memicu summary baru
// - order : MARKET order offsetting, status dipoll via GET /api/v3/order
//
// Catatan: quantity dikirim apa adanya; untuk produksi bulatkan ke stepSize
// LOT_SIZE dari exchangeInfo.
//
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tokio::{
    sync::{mpsc, watch},
    time::{sleep, Instant},
};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::binance::{
    build_query, net_liquidation, open_positions, price_map, sign_query, timestamp_ms, AccountInfo,
    ListenKey, OrderAck, OrderQuery, TickerPrice, WsEnvelope,
};
use crate::config::BinanceCfg;
use crate::domain::{EquitySnapshot, OrderHandle, PositionSnapshot, TerminalStatus};
use crate::gateway::{new_cl_id, AccountGateway, GatewayError};
use crate::metrics::{GATEWAY_ERRORS, WS_RECONNECTS};

const STATUS_POLL: Duration = Duration::from_millis(250);
const LISTEN_KEY_KEEPALIVE: Duration = Duration::from_secs(30 * 60);

struct Rest {
    http: reqwest::Client,
    cfg: BinanceCfg,
}

impl Rest {
    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, GatewayError> {
        let rsp = req.send().await?;
        let code = rsp.status();
        if code.is_success() {
            return Ok(rsp.json::<T>().await?);
        }
        let body = rsp.text().await.unwrap_or_default();
        if code.is_server_error() {
            Err(GatewayError::Unavailable(format!("{code}: {body}")))
        } else {
            Err(GatewayError::Rejected(format!("{code}: {body}")))
        }
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T, GatewayError> {
        params.push(("recvWindow", self.cfg.recv_window.to_string()));
        params.push(("timestamp", timestamp_ms().to_string()));
        let query = build_query(&params);
        let sig = sign_query(&self.cfg.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.cfg.rest_url, path, query, sig);
        self.send(self.http.request(method, url).header("X-MBX-APIKEY", &self.cfg.api_key))
            .await
    }

    /// Endpoint listenKey hanya butuh API key, tanpa signature.
    async fn keyed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T, GatewayError> {
        let mut url = format!("{}{}", self.cfg.rest_url, path);
        if !params.is_empty() {
            url = format!("{}?{}", url, build_query(&params));
        }
        self.send(self.http.request(method, url).header("X-MBX-APIKEY", &self.cfg.api_key))
            .await
    }

    async fn balances_and_prices(
        &self,
    ) -> Result<(AccountInfo, ahash::AHashMap<String, rust_decimal::Decimal>), GatewayError> {
        let acct: AccountInfo = self.signed(Method::GET, "/api/v3/account", vec![]).await?;
        let url = format!("{}/api/v3/ticker/price", self.cfg.rest_url);
        let tickers: Vec<TickerPrice> = self.send(self.http.get(url)).await?;
        Ok((acct, price_map(tickers)))
    }

    async fn summary(&self) -> Result<EquitySnapshot, GatewayError> {
        let (acct, prices) = self.balances_and_prices().await?;
        Ok(EquitySnapshot::now(net_liquidation(&acct.balances, &prices, &self.cfg.quote_asset)))
    }
}

pub struct BinanceGateway {
    rest: Arc<Rest>,
    listen_key: Mutex<Option<String>>,
    stop_tx: watch::Sender<bool>,
}

impl BinanceGateway {
    pub fn new(cfg: BinanceCfg) -> Result<Self, GatewayError> {
        if cfg.api_key.is_empty() {
            return Err(GatewayError::Credentials("BINANCE_API_KEY"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;
        let (stop_tx, _stop_rx) = watch::channel(false);
        Ok(Self { rest: Arc::new(Rest { http, cfg }), listen_key: Mutex::new(None), stop_tx })
    }
}

#[async_trait]
impl AccountGateway for BinanceGateway {
    async fn subscribe_account_updates(&self) -> Result<mpsc::Receiver<EquitySnapshot>, GatewayError> {
        let lk: ListenKey = self.rest.keyed(Method::POST, "/api/v3/userDataStream", vec![]).await?;
        *self.listen_key.lock() = Some(lk.listen_key.clone());

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(user_stream_loop(self.rest.clone(), lk.listen_key.clone(), tx, self.stop_tx.subscribe()));
        tokio::spawn(keepalive_loop(self.rest.clone(), lk.listen_key, self.stop_tx.subscribe()));
        Ok(rx)
    }

    async fn query_account_summary(&self) -> Result<EquitySnapshot, GatewayError> {
        self.rest.summary().await
    }

    async fn list_open_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
        let (acct, prices) = self.rest.balances_and_prices().await?;
        Ok(open_positions(&acct.balances, &prices, &self.rest.cfg.quote_asset))
    }

    async fn submit_offsetting_order(&self, position: &PositionSnapshot) -> Result<OrderHandle, GatewayError> {
        let handle = OrderHandle {
            cl_id: new_cl_id(),
            symbol: position.symbol.to_ascii_uppercase(),
            side: position.offset_side(),
            qty: position.offset_qty(),
        };
        let params = vec![
            ("symbol", handle.symbol.clone()),
            ("side", handle.side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", handle.qty.normalize().to_string()),
            ("newClientOrderId", handle.cl_id.clone()),
        ];
        let ack: OrderAck = self.rest.signed(Method::POST, "/api/v3/order", params).await?;
        info!(cl_id = %ack.client_order_id, symbol = %ack.symbol, status = %ack.status, "binance: order accepted");
        Ok(handle)
    }

    async fn await_terminal_status(
        &self,
        handle: &OrderHandle,
        timeout: Duration,
    ) -> Result<TerminalStatus, GatewayError> {
        let deadline = Instant::now() + timeout;
        loop {
            let params = vec![("symbol", handle.symbol.clone()), ("origClientOrderId", handle.cl_id.clone())];
            match self.rest.signed::<OrderQuery>(Method::GET, "/api/v3/order", params).await {
                Ok(q) => match q.status.as_str() {
                    "FILLED" => return Ok(TerminalStatus::Filled),
                    "CANCELED" | "REJECTED" | "EXPIRED" | "EXPIRED_IN_MATCH" => {
                        return Ok(TerminalStatus::Rejected(format!("{} (executed {})", q.status, q.executed_qty)));
                    }
                    _ => debug!(cl_id = %handle.cl_id, status = %q.status, "binance: order not final yet"),
                },
                Err(e) => {
                    GATEWAY_ERRORS.with_label_values(&["order_status"]).inc();
                    warn!(cl_id = %handle.cl_id, error = %e, "binance: order status query failed");
                }
            }
            if Instant::now() + STATUS_POLL >= deadline {
                return Ok(TerminalStatus::TimedOut);
            }
            sleep(STATUS_POLL).await;
        }
    }

    async fn disconnect(&self) {
        self.stop_tx.send_replace(true);
        let lk = self.listen_key.lock().take();
        if let Some(lk) = lk {
            let res: Result<serde_json::Value, _> =
                self.rest.keyed(Method::DELETE, "/api/v3/userDataStream", vec![("listenKey", lk)]).await;
            if let Err(e) = res {
                warn!(error = %e, "binance: listenKey close failed");
            }
        }
        info!("binance gateway disconnected");
    }
}

async fn keepalive_loop(rest: Arc<Rest>, listen_key: String, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() { return; }
            }
            _ = sleep(LISTEN_KEY_KEEPALIVE) => {
                let res: Result<serde_json::Value, _> = rest
                    .keyed(Method::PUT, "/api/v3/userDataStream", vec![("listenKey", listen_key.clone())])
                    .await;
                match res {
                    Ok(_) => debug!("binance: listenKey keepalive ok"),
                    Err(e) => {
                        GATEWAY_ERRORS.with_label_values(&["keepalive"]).inc();
                        warn!(error = %e, "binance: listenKey keepalive failed");
                    }
                }
            }
        }
    }
}

async fn user_stream_loop(
    rest: Arc<Rest>,
    listen_key: String,
    tx: mpsc::Sender<EquitySnapshot>,
    mut stop: watch::Receiver<bool>,
) {
    let ws_url = format!("{}/{}", rest.cfg.ws_url.trim_end_matches('/'), listen_key);
    let url = match Url::parse(&ws_url) {
        Ok(u) => u,
        Err(e) => {
            error!(?e, "bad userDataStream url");
            return;
        }
    };

    let mut attempt: u32 = 0;
    loop {
        info!("binance: connecting userDataStream");
        match connect_async(url.clone()).await {
            Ok((mut ws, _resp)) => {
                attempt = 0;
                loop {
                    tokio::select! {
                        res = stop.changed() => {
                            if res.is_err() || *stop.borrow() { return; }
                        }
                        frame = ws.next() => {
                            let Some(frame) = frame else { break };
                            match frame {
                                Ok(m) if m.is_text() => {
                                    let txt = m.into_text().unwrap_or_default();
                                    let Ok(env) = serde_json::from_str::<WsEnvelope>(&txt) else { continue };
                                    if !env.touches_balances() {
                                        continue;
                                    }
                                    debug!(event = ?env.e, event_time = ?env.event_time, "binance: balance event");
                                    match rest.summary().await {
                                        Ok(snap) => {
                                            if tx.send(snap).await.is_err() {
                                                return;
                                            }
                                        }
                                        Err(e) => {
                                            GATEWAY_ERRORS.with_label_values(&["push_summary"]).inc();
                                            warn!(error = %e, "binance: summary after account event failed");
                                        }
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    error!(?e, "userDataStream ws error");
                                    break;
                                }
                            }
                        }
                    }
                }
                warn!("userDataStream disconnected, reconnecting");
            }
            Err(e) => error!(?e, "connect userDataStream failed"),
        }

        WS_RECONNECTS.inc();
        // Exponential backoff + jitter
        attempt = attempt.saturating_add(1);
        let factor = 1u64 << attempt.min(6);
        let base_ms = 500u64.saturating_mul(factor);
        let jitter = rand::thread_rng().gen_range(0..=250);
        tokio::select! {
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() { return; }
            }
            _ = sleep(Duration::from_millis(base_ms + jitter)) => {}
        }
    }
}
