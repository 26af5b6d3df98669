//! Orchestration core: scheduling, signal generation, risk checks and
//! order execution.

pub mod executor;
pub mod indicators;
pub mod monitor;
pub mod risk;
pub mod scheduler;

pub use executor::OrderExecutor;
pub use monitor::SignalMonitor;
pub use risk::{RiskDecision, RiskManager};
pub use scheduler::StrategyScheduler;
