pub mod market;
pub mod order;
pub mod risk;
pub mod signal;
pub mod strategy;

pub use market::{AccountSnapshot, Bar, Portfolio, Position, Quote, Timeframe};
pub use order::{
    BracketIntent, BracketState, Order, OrderIntent, OrderSide, OrderSnapshot, OrderStatus,
    OrderType, TimeInForce,
};
pub use risk::{BreachEvent, RiskRule, RuleAction, RuleKind, Verdict};
pub use signal::{Signal, SignalKind};
pub use strategy::{IndicatorConfig, LiveStrategy, StrategyCommand, StrategyStatus};
