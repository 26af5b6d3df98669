use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{LiveStrategy, Order, RiskRule, Signal};
use crate::error::{Result, TradewindError};

use super::StrategyStore;

/// In-memory store for dry-run mode and tests
#[derive(Default)]
pub struct MemoryStore {
    strategies: RwLock<HashMap<Uuid, LiveStrategy>>,
    rules: RwLock<HashMap<Uuid, RiskRule>>,
    signals: RwLock<HashMap<Uuid, Signal>>,
    orders: RwLock<HashMap<String, Order>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_signal(&self, id: Uuid) -> Option<Signal> {
        self.signals.read().await.get(&id).cloned()
    }

    pub async fn list_signals(&self, strategy_id: Uuid) -> Vec<Signal> {
        self.signals
            .read()
            .await
            .values()
            .filter(|s| s.strategy_id == strategy_id)
            .cloned()
            .collect()
    }

    pub async fn get_order(&self, client_order_id: &str) -> Option<Order> {
        self.orders.read().await.get(client_order_id).cloned()
    }

    pub async fn list_orders(&self) -> Vec<Order> {
        self.orders.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl StrategyStore for MemoryStore {
    async fn list_strategies(&self) -> Result<Vec<LiveStrategy>> {
        Ok(self.strategies.read().await.values().cloned().collect())
    }

    async fn get_strategy(&self, id: Uuid) -> Result<Option<LiveStrategy>> {
        Ok(self.strategies.read().await.get(&id).cloned())
    }

    async fn insert_strategy(&self, strategy: &LiveStrategy) -> Result<()> {
        self.strategies
            .write()
            .await
            .insert(strategy.id, strategy.clone());
        Ok(())
    }

    async fn update_strategy(&self, strategy: &LiveStrategy) -> Result<()> {
        let mut strategies = self.strategies.write().await;
        if !strategies.contains_key(&strategy.id) {
            return Err(TradewindError::StrategyNotFound(strategy.id));
        }
        strategies.insert(strategy.id, strategy.clone());
        Ok(())
    }

    async fn delete_strategy(&self, id: Uuid) -> Result<()> {
        let mut strategies = self.strategies.write().await;
        strategies
            .remove(&id)
            .map(|_| ())
            .ok_or(TradewindError::StrategyNotFound(id))
    }

    async fn list_rules(&self, user_id: Uuid) -> Result<Vec<RiskRule>> {
        Ok(self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_rule(&self, rule: &RiskRule) -> Result<()> {
        self.rules.write().await.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn update_rule(&self, rule: &RiskRule) -> Result<()> {
        self.rules.write().await.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn record_signal(&self, signal: &Signal) -> Result<()> {
        self.signals.write().await.insert(signal.id, signal.clone());
        Ok(())
    }

    async fn update_signal(&self, signal: &Signal) -> Result<()> {
        self.signals.write().await.insert(signal.id, signal.clone());
        Ok(())
    }

    async fn record_order(&self, order: &Order) -> Result<()> {
        self.orders
            .write()
            .await
            .insert(order.client_order_id.clone(), order.clone());
        Ok(())
    }

    async fn update_order(&self, order: &Order) -> Result<()> {
        self.orders
            .write()
            .await
            .insert(order.client_order_id.clone(), order.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IndicatorConfig;

    #[tokio::test]
    async fn strategy_round_trip() {
        let store = MemoryStore::new();
        let strategy = LiveStrategy::new(
            Uuid::new_v4(),
            "test",
            vec!["AAPL".into()],
            IndicatorConfig::MaCrossover { fast: 5, slow: 20 },
            60,
        );

        store.insert_strategy(&strategy).await.unwrap();
        let fetched = store.get_strategy(strategy.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "test");

        store.delete_strategy(strategy.id).await.unwrap();
        assert!(store.get_strategy(strategy.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_missing_strategy_fails() {
        let store = MemoryStore::new();
        let strategy = LiveStrategy::new(
            Uuid::new_v4(),
            "test",
            vec!["AAPL".into()],
            IndicatorConfig::MaCrossover { fast: 5, slow: 20 },
            60,
        );
        assert!(store.update_strategy(&strategy).await.is_err());
    }
}
