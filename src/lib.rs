//! Tradewind: an orchestration engine for automated stock trading.
//!
//! The crate wires five cooperating services around one upstream brokerage
//! API: a strategy scheduler, a signal monitor, a risk manager, an order
//! execution gateway and a real-time stream hub. All upstream traffic funnels
//! through a rate-limited TTL cache gateway so the broker's request quota is
//! spent on work that matters.

pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod store;
pub mod stream;

pub use config::AppConfig;
pub use error::{BrokerError, MonitorError, Result, TradewindError};
pub use gateway::Gateway;
