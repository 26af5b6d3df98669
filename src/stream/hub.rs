//! Real-Time Stream Hub
//!
//! One upstream market-data session fans out to any number of downstream
//! clients. The hub owns the client registry, keeps the upstream
//! subscription equal to the union of client subscriptions, and isolates
//! slow consumers: a client whose queue is full loses that event, nobody
//! else does.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upstream stream families a client can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Quotes,
    Trades,
    Bars,
}

impl StreamType {
    pub const ALL: [StreamType; 3] = [StreamType::Quotes, StreamType::Trades, StreamType::Bars];
}

/// One market data event, fanned out verbatim to matching clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    pub symbol: String,
    pub stream_type: StreamType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Inbound control frames from downstream clients
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlMessage {
    Subscribe {
        symbols: Vec<String>,
        #[serde(default)]
        streams: Vec<StreamType>,
    },
    Unsubscribe {
        symbols: Vec<String>,
        #[serde(default)]
        streams: Vec<StreamType>,
    },
    Ping,
}

/// Upstream session health, pushed to clients on change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamHealth {
    Live,
    Reconnecting,
    Degraded,
}

/// Outbound frames toward downstream clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Event { event: MarketEvent },
    Pong,
    Status { health: StreamHealth, detail: String },
}

/// Instructions for the upstream session, emitted when the union of client
/// subscriptions changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamCommand {
    Subscribe(Vec<(String, StreamType)>),
    Unsubscribe(Vec<(String, StreamType)>),
}

struct ClientHandle {
    tx: mpsc::Sender<OutboundMessage>,
    symbols: HashSet<String>,
    streams: HashSet<StreamType>,
}

impl ClientHandle {
    fn wants(&self, event: &MarketEvent) -> bool {
        self.streams.contains(&event.stream_type) && self.symbols.contains(&event.symbol)
    }
}

pub struct StreamHub {
    clients: DashMap<Uuid, ClientHandle>,
    /// What the upstream session is (or should be) subscribed to
    desired: Mutex<HashSet<(String, StreamType)>>,
    commands_tx: mpsc::UnboundedSender<UpstreamCommand>,
    health_tx: watch::Sender<StreamHealth>,
    queue_size: usize,
    dropped: AtomicU64,
}

impl StreamHub {
    pub fn new(queue_size: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<UpstreamCommand>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (health_tx, _) = watch::channel(StreamHealth::Reconnecting);
        let hub = Arc::new(Self {
            clients: DashMap::new(),
            desired: Mutex::new(HashSet::new()),
            commands_tx,
            health_tx,
            queue_size: queue_size.max(1),
            dropped: AtomicU64::new(0),
        });
        (hub, commands_rx)
    }

    /// Register a downstream client; returns its id and the queue the
    /// transport drains toward the socket.
    pub fn register_client(&self) -> (Uuid, mpsc::Receiver<OutboundMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_size);
        self.clients.insert(
            id,
            ClientHandle {
                tx,
                symbols: HashSet::new(),
                streams: HashSet::new(),
            },
        );
        info!(client_id = %id, clients = self.clients.len(), "stream client connected");
        (id, rx)
    }

    pub fn unregister_client(&self, id: Uuid) {
        if self.clients.remove(&id).is_some() {
            info!(client_id = %id, clients = self.clients.len(), "stream client disconnected");
            self.recompute_union();
        }
    }

    /// Apply a control frame from one client.
    pub fn handle_control(&self, id: Uuid, message: ControlMessage) {
        match message {
            ControlMessage::Subscribe { symbols, streams } => {
                let streams = if streams.is_empty() {
                    StreamType::ALL.to_vec()
                } else {
                    streams
                };
                if let Some(mut client) = self.clients.get_mut(&id) {
                    client.symbols.extend(symbols.into_iter().map(normalize));
                    client.streams.extend(streams);
                }
                self.recompute_union();
            }
            ControlMessage::Unsubscribe { symbols, streams } => {
                if let Some(mut client) = self.clients.get_mut(&id) {
                    for symbol in symbols {
                        client.symbols.remove(&normalize(symbol));
                    }
                    for stream in streams {
                        client.streams.remove(&stream);
                    }
                }
                self.recompute_union();
            }
            ControlMessage::Ping => {
                if let Some(client) = self.clients.get(&id) {
                    let _ = client.tx.try_send(OutboundMessage::Pong);
                }
            }
        }
    }

    /// Fan an event out to every client whose subscription matches. A full
    /// client queue drops the event for that client only.
    pub fn publish(&self, event: MarketEvent) {
        for client in self.clients.iter() {
            if !client.wants(&event) {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = client
                .tx
                .try_send(OutboundMessage::Event { event: event.clone() })
            {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    client_id = %client.key(),
                    symbol = %event.symbol,
                    total_dropped = total,
                    "client queue full, event dropped"
                );
            }
        }
    }

    /// Current union of client subscriptions, the set the upstream session
    /// must hold. Used for full resubscription after a reconnect.
    pub fn current_union(&self) -> HashSet<(String, StreamType)> {
        match self.desired.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Update upstream health and notify every connected client.
    pub fn set_health(&self, health: StreamHealth, detail: impl Into<String>) {
        let detail = detail.into();
        if *self.health_tx.borrow() == health {
            return;
        }
        self.health_tx.send_replace(health);
        info!(?health, detail, "upstream stream health changed");
        for client in self.clients.iter() {
            let _ = client.tx.try_send(OutboundMessage::Status {
                health,
                detail: detail.clone(),
            });
        }
    }

    pub fn health(&self) -> StreamHealth {
        *self.health_tx.borrow()
    }

    pub fn health_watch(&self) -> watch::Receiver<StreamHealth> {
        self.health_tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Recompute the union and emit the incremental diff toward the
    /// upstream session.
    fn recompute_union(&self) {
        let mut union: HashSet<(String, StreamType)> = HashSet::new();
        for client in self.clients.iter() {
            for symbol in &client.symbols {
                for stream in &client.streams {
                    union.insert((symbol.clone(), *stream));
                }
            }
        }

        let mut desired = match self.desired.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let added: Vec<_> = union.difference(&desired).cloned().collect();
        let removed: Vec<_> = desired.difference(&union).cloned().collect();
        *desired = union;
        drop(desired);

        if !added.is_empty() {
            debug!(count = added.len(), "upstream subscribe");
            let _ = self.commands_tx.send(UpstreamCommand::Subscribe(added));
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "upstream unsubscribe");
            let _ = self.commands_tx.send(UpstreamCommand::Unsubscribe(removed));
        }
    }
}

fn normalize(symbol: impl AsRef<str>) -> String {
    symbol.as_ref().trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(symbol: &str, stream_type: StreamType) -> MarketEvent {
        MarketEvent {
            symbol: symbol.into(),
            stream_type,
            payload: json!({"p": 190.0}),
            timestamp: Utc::now(),
        }
    }

    fn subscribe(symbols: &[&str], streams: &[StreamType]) -> ControlMessage {
        ControlMessage::Subscribe {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            streams: streams.to_vec(),
        }
    }

    #[tokio::test]
    async fn events_reach_only_matching_clients() {
        let (hub, _commands) = StreamHub::new(8);
        let (quotes_id, mut quotes_rx) = hub.register_client();
        let (trades_id, mut trades_rx) = hub.register_client();

        hub.handle_control(quotes_id, subscribe(&["AAPL"], &[StreamType::Quotes]));
        hub.handle_control(trades_id, subscribe(&["MSFT"], &[StreamType::Trades]));

        hub.publish(event("MSFT", StreamType::Trades));

        let received = trades_rx.recv().await.unwrap();
        assert!(matches!(
            received,
            OutboundMessage::Event { event } if event.symbol == "MSFT"
        ));
        assert!(quotes_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn union_tracks_subscriptions() {
        let (hub, mut commands) = StreamHub::new(8);
        let (a, _rx_a) = hub.register_client();
        let (b, _rx_b) = hub.register_client();

        hub.handle_control(a, subscribe(&["AAPL"], &[StreamType::Quotes]));
        hub.handle_control(b, subscribe(&["AAPL", "MSFT"], &[StreamType::Quotes]));

        assert!(matches!(
            commands.recv().await.unwrap(),
            UpstreamCommand::Subscribe(_)
        ));
        // Second subscribe only adds MSFT
        let second = commands.recv().await.unwrap();
        assert_eq!(
            second,
            UpstreamCommand::Subscribe(vec![("MSFT".into(), StreamType::Quotes)])
        );

        // AAPL is still wanted by b after a unsubscribes
        hub.handle_control(
            a,
            ControlMessage::Unsubscribe {
                symbols: vec!["AAPL".into()],
                streams: vec![],
            },
        );
        assert_eq!(
            hub.current_union(),
            [
                ("AAPL".to_string(), StreamType::Quotes),
                ("MSFT".to_string(), StreamType::Quotes)
            ]
            .into_iter()
            .collect()
        );

        // When b disconnects, both symbols drop from the union
        hub.unregister_client(b);
        assert!(hub.current_union().is_empty());
        loop {
            match commands.try_recv() {
                Ok(UpstreamCommand::Unsubscribe(pairs)) if pairs.len() == 2 => break,
                Ok(_) => continue,
                Err(_) => panic!("expected unsubscribe for the full union"),
            }
        }
    }

    #[tokio::test]
    async fn slow_client_does_not_stall_others() {
        let (hub, _commands) = StreamHub::new(1);
        let (slow, _slow_rx) = hub.register_client();
        let (fast, mut fast_rx) = hub.register_client();
        hub.handle_control(slow, subscribe(&["AAPL"], &[StreamType::Quotes]));
        hub.handle_control(fast, subscribe(&["AAPL"], &[StreamType::Quotes]));

        // The slow client's queue holds one event; the second overflows for
        // it alone while the fast client drains in between.
        hub.publish(event("AAPL", StreamType::Quotes));
        fast_rx.recv().await.unwrap();
        hub.publish(event("AAPL", StreamType::Quotes));
        fast_rx.recv().await.unwrap();

        assert_eq!(hub.dropped_events(), 1);
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let (hub, _commands) = StreamHub::new(8);
        let (id, mut rx) = hub.register_client();
        hub.handle_control(id, ControlMessage::Ping);
        assert!(matches!(rx.recv().await.unwrap(), OutboundMessage::Pong));
    }

    #[tokio::test]
    async fn health_change_broadcasts_once() {
        let (hub, _commands) = StreamHub::new(8);
        let (_id, mut rx) = hub.register_client();

        hub.set_health(StreamHealth::Live, "connected");
        hub.set_health(StreamHealth::Live, "connected");
        assert!(matches!(
            rx.recv().await.unwrap(),
            OutboundMessage::Status { health: StreamHealth::Live, .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn symbols_are_normalized() {
        let (hub, _commands) = StreamHub::new(8);
        let (id, mut rx) = hub.register_client();
        hub.handle_control(id, subscribe(&[" aapl "], &[StreamType::Quotes]));

        hub.publish(event("AAPL", StreamType::Quotes));
        assert!(matches!(rx.recv().await.unwrap(), OutboundMessage::Event { .. }));
    }
}
