//! Upstream market-data session.
//!
//! Holds one WebSocket to the broker's data feed, translates hub
//! subscription diffs into wire frames, and parses inbound frames into
//! [`MarketEvent`]s for fan-out. Drops are reconnected with jittered
//! exponential backoff and a full resubscription from the hub's current
//! union; once the attempt budget is spent the hub is marked degraded while
//! reconnection keeps going at the capped delay.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;
use crate::error::{Result, TradewindError};
use crate::gateway::RetryPolicy;

use super::hub::{MarketEvent, StreamHealth, StreamHub, StreamType, UpstreamCommand};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct MarketDataFeed {
    url: String,
    hub: Arc<StreamHub>,
    config: StreamConfig,
    backoff: RetryPolicy,
}

impl MarketDataFeed {
    pub fn new(url: impl Into<String>, hub: Arc<StreamHub>, config: StreamConfig) -> Self {
        let backoff = RetryPolicy::new(
            config.reconnect_max_attempts,
            Duration::from_millis(config.reconnect_base_delay_ms),
            2.0,
            0.25,
        );
        Self {
            url: url.into(),
            hub,
            config,
            backoff,
        }
    }

    /// Session loop: connect, resubscribe, stream until failure, back off,
    /// repeat. Returns when the shutdown signal flips.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<UpstreamCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.connect().await {
                Ok(mut ws) => {
                    attempt = 0;
                    self.hub.set_health(StreamHealth::Live, "upstream connected");
                    if let Err(err) = self.resubscribe(&mut ws).await {
                        warn!(error = %err, "resubscription failed");
                        continue;
                    }
                    let reason = self.stream(&mut ws, &mut commands, &mut shutdown).await;
                    if *shutdown.borrow() {
                        let _ = ws.close(None).await;
                        break;
                    }
                    warn!(reason, "upstream session ended");
                }
                Err(err) => {
                    warn!(error = %err, attempt, "upstream connect failed");
                }
            }

            attempt += 1;
            if attempt >= self.config.reconnect_max_attempts {
                // Not silent and not fatal: clients see DEGRADED while the
                // loop keeps trying at the capped delay.
                self.hub.set_health(
                    StreamHealth::Degraded,
                    format!("upstream unreachable after {} attempts", attempt),
                );
            } else {
                self.hub
                    .set_health(StreamHealth::Reconnecting, "upstream reconnecting");
            }

            let delay = self.backoff.backoff_delay(attempt).min(MAX_BACKOFF);
            debug!(?delay, attempt, "reconnect backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("market data feed stopped");
    }

    async fn connect(&self) -> Result<WsStream> {
        info!(url = %self.url, "connecting upstream market data feed");
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TradewindError::Internal("upstream connect timed out".into()))??;
        Ok(ws)
    }

    /// Replay the hub's full union onto a fresh session.
    async fn resubscribe(&self, ws: &mut WsStream) -> Result<()> {
        let union: Vec<_> = self.hub.current_union().into_iter().collect();
        if union.is_empty() {
            return Ok(());
        }
        info!(pairs = union.len(), "resubscribing upstream union");
        self.send_frame(ws, "subscribe", &union).await
    }

    async fn stream(
        &mut self,
        ws: &mut WsStream,
        commands: &mut mpsc::UnboundedReceiver<UpstreamCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> &'static str {
        let mut ping = tokio::time::interval(Duration::from_secs(
            self.config.ping_interval_secs.max(1),
        ));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                frame = ws.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            if ws.send(Message::Pong(payload)).await.is_err() {
                                return "pong send failed";
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return "closed by upstream",
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            error!(error = %err, "upstream read error");
                            return "read error";
                        }
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else { return "command channel closed" };
                    let result = match command {
                        UpstreamCommand::Subscribe(pairs) => {
                            self.send_frame(ws, "subscribe", &pairs).await
                        }
                        UpstreamCommand::Unsubscribe(pairs) => {
                            self.send_frame(ws, "unsubscribe", &pairs).await
                        }
                    };
                    if let Err(err) = result {
                        error!(error = %err, "subscription frame failed");
                        return "write error";
                    }
                }
                _ = ping.tick() => {
                    if ws.send(Message::Ping(Vec::new())).await.is_err() {
                        return "ping send failed";
                    }
                }
                _ = shutdown.changed() => return "shutdown",
            }
        }
    }

    async fn send_frame(
        &self,
        ws: &mut WsStream,
        action: &str,
        pairs: &[(String, StreamType)],
    ) -> Result<()> {
        let frame = subscription_frame(action, pairs);
        ws.send(Message::Text(frame.to_string())).await?;
        Ok(())
    }

    fn handle_frame(&self, text: &str) {
        let parsed: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "unparseable upstream frame");
                return;
            }
        };
        // The feed batches events into arrays; single objects also occur
        match parsed {
            Value::Array(items) => {
                for item in items {
                    if let Some(event) = parse_event(&item) {
                        self.hub.publish(event);
                    }
                }
            }
            item => {
                if let Some(event) = parse_event(&item) {
                    self.hub.publish(event);
                }
            }
        }
    }
}

/// Build a subscription frame grouping symbols per stream family, e.g.
/// `{"action":"subscribe","quotes":["AAPL"],"trades":["MSFT"]}`.
fn subscription_frame(action: &str, pairs: &[(String, StreamType)]) -> Value {
    let mut quotes: HashSet<&str> = HashSet::new();
    let mut trades: HashSet<&str> = HashSet::new();
    let mut bars: HashSet<&str> = HashSet::new();
    for (symbol, stream) in pairs {
        match stream {
            StreamType::Quotes => quotes.insert(symbol),
            StreamType::Trades => trades.insert(symbol),
            StreamType::Bars => bars.insert(symbol),
        };
    }

    let mut frame = json!({ "action": action });
    if !quotes.is_empty() {
        frame["quotes"] = json!(quotes);
    }
    if !trades.is_empty() {
        frame["trades"] = json!(trades);
    }
    if !bars.is_empty() {
        frame["bars"] = json!(bars);
    }
    frame
}

/// Upstream frames carry the event kind in `T` and the symbol in `S`.
fn parse_event(value: &Value) -> Option<MarketEvent> {
    let stream_type = match value.get("T").and_then(Value::as_str)? {
        "q" => StreamType::Quotes,
        "t" => StreamType::Trades,
        "b" => StreamType::Bars,
        _ => return None,
    };
    let symbol = value.get("S").and_then(Value::as_str)?.to_string();
    Some(MarketEvent {
        symbol,
        stream_type,
        payload: value.clone(),
        timestamp: chrono::Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscription_frame_groups_by_family() {
        let pairs = vec![
            ("AAPL".to_string(), StreamType::Quotes),
            ("MSFT".to_string(), StreamType::Quotes),
            ("AAPL".to_string(), StreamType::Trades),
        ];
        let frame = subscription_frame("subscribe", &pairs);
        assert_eq!(frame["action"], "subscribe");
        let quotes = frame["quotes"].as_array().unwrap();
        assert_eq!(quotes.len(), 2);
        assert_eq!(frame["trades"].as_array().unwrap().len(), 1);
        assert!(frame.get("bars").is_none());
    }

    #[test]
    fn parses_quote_trade_and_bar_frames() {
        let quote = json!({"T": "q", "S": "AAPL", "bp": 189.98, "ap": 190.02});
        let event = parse_event(&quote).unwrap();
        assert_eq!(event.stream_type, StreamType::Quotes);
        assert_eq!(event.symbol, "AAPL");
        assert_eq!(event.payload["bp"], 189.98);

        let trade = json!({"T": "t", "S": "MSFT", "p": 401.5, "s": 100});
        assert_eq!(parse_event(&trade).unwrap().stream_type, StreamType::Trades);

        let bar = json!({"T": "b", "S": "NVDA", "c": 900.0});
        assert_eq!(parse_event(&bar).unwrap().stream_type, StreamType::Bars);
    }

    #[test]
    fn control_frames_are_ignored() {
        let ack = json!({"T": "subscription", "quotes": ["AAPL"]});
        assert!(parse_event(&ack).is_none());
        let no_type = json!({"S": "AAPL"});
        assert!(parse_event(&no_type).is_none());
    }
}
