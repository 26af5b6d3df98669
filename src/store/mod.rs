//! Persistence collaborator boundary.
//!
//! The core never touches storage directly; every read and write of
//! strategies, rules, signals and orders goes through these accessors.
//! Real storage lives outside the crate; [`MemoryStore`] backs dry-run mode
//! and tests.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{LiveStrategy, Order, RiskRule, Signal};
use crate::error::Result;

#[async_trait]
pub trait StrategyStore: Send + Sync {
    async fn list_strategies(&self) -> Result<Vec<LiveStrategy>>;

    async fn get_strategy(&self, id: Uuid) -> Result<Option<LiveStrategy>>;

    async fn insert_strategy(&self, strategy: &LiveStrategy) -> Result<()>;

    /// Durably record a strategy state transition or counter update.
    async fn update_strategy(&self, strategy: &LiveStrategy) -> Result<()>;

    async fn delete_strategy(&self, id: Uuid) -> Result<()>;

    async fn list_rules(&self, user_id: Uuid) -> Result<Vec<RiskRule>>;

    async fn insert_rule(&self, rule: &RiskRule) -> Result<()>;

    async fn update_rule(&self, rule: &RiskRule) -> Result<()>;

    async fn record_signal(&self, signal: &Signal) -> Result<()>;

    async fn update_signal(&self, signal: &Signal) -> Result<()>;

    async fn record_order(&self, order: &Order) -> Result<()>;

    async fn update_order(&self, order: &Order) -> Result<()>;
}
