//! Real-time market data streaming: one upstream session, many downstream
//! clients, subscription union in between.

pub mod hub;
pub mod upstream;
pub mod ws;

pub use hub::{
    ControlMessage, MarketEvent, OutboundMessage, StreamHealth, StreamHub, StreamType,
    UpstreamCommand,
};
pub use upstream::MarketDataFeed;
