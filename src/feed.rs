//! Live price feed.
//!
//! One owning task holds the upstream WebSocket, parses mid/trade prices for
//! the configured coin, and publishes the most recent sample into shared
//! state. Callers read the cache via [`PriceFeed::price`]; staleness is judged
//! at the caller boundary against `price_stale_ms`. Reconnects are
//! self-scheduled 5 seconds after a close or error, and the connect attempt
//! itself is bounded by a 5 second timeout.

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle, surfaced through diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Closed,
    Connecting,
    Connected,
    Error,
}

/// Most recent observed price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceSample {
    pub price: f64,
    pub updated_at: i64,
}

/// Diagnostics snapshot for the feed endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct FeedDiag {
    pub state: ConnState,
    pub feed: String,
    pub coin: String,
    pub last_error: Option<String>,
    pub last_event_at: Option<i64>,
    pub last_update_at: Option<i64>,
    pub latest_price: Option<f64>,
}

#[derive(Debug)]
struct FeedShared {
    state: ConnState,
    latest_price: Option<f64>,
    last_update_at: Option<i64>,
    last_event_at: Option<i64>,
    last_error: Option<String>,
}

/// Singleton stateful consumer of the upstream price WebSocket.
pub struct PriceFeed {
    ws_url: String,
    feed_mode: String,
    coin: String,
    shared: RwLock<FeedShared>,
}

impl PriceFeed {
    pub fn new(ws_url: String, feed_mode: String, coin: String) -> Arc<Self> {
        Arc::new(Self {
            ws_url,
            feed_mode,
            coin,
            shared: RwLock::new(FeedShared {
                state: ConnState::Closed,
                latest_price: None,
                last_update_at: None,
                last_event_at: None,
                last_error: None,
            }),
        })
    }

    /// Spawn the owning socket task. Call once at startup.
    pub fn spawn(self: &Arc<Self>) {
        let feed = self.clone();
        tokio::spawn(async move {
            feed.run().await;
        });
    }

    /// Latest sample, or None when no price has been observed yet.
    pub fn price(&self) -> Option<PriceSample> {
        let shared = self.shared.read();
        match (shared.latest_price, shared.last_update_at) {
            (Some(price), Some(updated_at)) => Some(PriceSample { price, updated_at }),
            _ => None,
        }
    }

    pub fn diag(&self) -> FeedDiag {
        let shared = self.shared.read();
        FeedDiag {
            state: shared.state,
            feed: self.feed_mode.clone(),
            coin: self.coin.clone(),
            last_error: shared.last_error.clone(),
            last_event_at: shared.last_event_at,
            last_update_at: shared.last_update_at,
            latest_price: shared.latest_price,
        }
    }

    /// Connect/read forever, reconnecting on a fixed delay.
    async fn run(self: Arc<Self>) {
        loop {
            match self.connect_and_stream().await {
                Ok(()) => {
                    info!("price feed connection closed, reconnecting in {:?}", RECONNECT_DELAY);
                    self.set_state(ConnState::Closed);
                }
                Err(e) => {
                    warn!("price feed error: {:#}", e);
                    self.record_error(e.to_string());
                }
            }
            sleep(RECONNECT_DELAY).await;
        }
    }

    async fn connect_and_stream(&self) -> Result<()> {
        self.set_state(ConnState::Connecting);

        let (ws_stream, _) = timeout(CONNECT_TIMEOUT, connect_async(self.ws_url.as_str()))
            .await
            .context("websocket connect timed out")?
            .context("websocket connect failed")?;

        self.set_state(ConnState::Connected);
        info!(url = %self.ws_url, feed = %self.feed_mode, coin = %self.coin, "price feed connected");

        let (mut write, mut read) = ws_stream.split();

        let sub = serde_json::to_string(&json!({
            "method": "subscribe",
            "subscription": self.subscription_payload(),
        }))?;
        write
            .send(Message::Text(sub))
            .await
            .context("failed to send subscription")?;

        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => self.handle_message(&text),
                Ok(Message::Ping(ping)) => {
                    write
                        .send(Message::Pong(ping))
                        .await
                        .context("failed to send pong")?;
                }
                Ok(Message::Close(frame)) => {
                    info!("price feed closed by server: {:?}", frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(e).context("websocket read error");
                }
            }
        }

        Ok(())
    }

    /// Subscription shape depends on the feed mode.
    fn subscription_payload(&self) -> Value {
        match self.feed_mode.as_str() {
            "allMids" => json!({ "type": "allMids" }),
            "trades" => json!({ "type": "trades", "coin": self.coin }),
            other => json!({ "type": other, "coin": self.coin }),
        }
    }

    fn handle_message(&self, text: &str) {
        let now = Utc::now().timestamp_millis();
        self.shared.write().last_event_at = Some(now);

        let v: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!("unparseable feed message: {}", e);
                return;
            }
        };

        if let Some(price) = self.extract_price(&v) {
            if price.is_finite() {
                let mut shared = self.shared.write();
                shared.latest_price = Some(price);
                shared.last_update_at = Some(now);
            }
        }
    }

    fn extract_price(&self, v: &Value) -> Option<f64> {
        match v.get("channel").and_then(Value::as_str) {
            Some("allMids") => {
                let mids = v
                    .get("data")
                    .and_then(|d| d.get("mids"))
                    .or_else(|| v.get("mids"))?;
                parse_num(mids.get(&self.coin)?)
            }
            Some("trades") => {
                let trades = v.get("data").and_then(Value::as_array)?;
                let last = trades.last()?;
                parse_num(last.get("px").or_else(|| last.get("price"))?)
            }
            _ => None,
        }
    }

    fn set_state(&self, state: ConnState) {
        self.shared.write().state = state;
    }

    fn record_error(&self, msg: String) {
        let mut shared = self.shared.write();
        shared.state = ConnState::Error;
        shared.last_error = Some(msg);
    }
}

fn parse_num(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str()?.parse().ok())
}
