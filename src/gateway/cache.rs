//! Short-lived response cache keyed by logical upstream resource.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::domain::{AccountSnapshot, Bar, OrderSnapshot, Position, Quote, Timeframe};

/// Logical key for an upstream resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Account,
    Positions,
    OpenOrders,
    Quote(String),
    Bars(String, Timeframe),
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKey::Account => write!(f, "account"),
            ResourceKey::Positions => write!(f, "positions"),
            ResourceKey::OpenOrders => write!(f, "orders"),
            ResourceKey::Quote(symbol) => write!(f, "quote:{}", symbol),
            ResourceKey::Bars(symbol, tf) => write!(f, "bars:{}:{}", symbol, tf),
        }
    }
}

/// Typed payloads stored in the cache
#[derive(Debug, Clone)]
pub enum CachedValue {
    Account(AccountSnapshot),
    Positions(Vec<Position>),
    OpenOrders(Vec<OrderSnapshot>),
    Quote(Quote),
    Bars(Vec<Bar>),
}

#[derive(Debug)]
struct CacheEntry {
    value: CachedValue,
    fetched_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.fetched_at) < self.ttl
    }
}

/// TTL cache with single-flight de-duplication.
///
/// The lock covers only the check-and-update; the in-flight set keeps two
/// concurrent misses for the same key from both going upstream, which would
/// break the one-call-per-TTL guarantee.
#[derive(Debug, Default)]
pub struct TtlCache {
    entries: Mutex<HashMap<ResourceKey, CacheEntry>>,
    in_flight: Mutex<HashSet<ResourceKey>>,
    flight_done: Notify,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh value for the key, if any.
    pub fn get(&self, key: &ResourceKey) -> Option<CachedValue> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries
            .get(key)
            .filter(|e| e.is_fresh(Instant::now()))
            .map(|e| e.value.clone())
    }

    pub fn insert(&self, key: ResourceKey, value: CachedValue, ttl: Duration) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(
            key,
            CacheEntry {
                value,
                fetched_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &ResourceKey) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.remove(key);
    }

    /// Claim the fetch for a key. Returns true when the caller becomes the
    /// fetcher; false when another task is already fetching it.
    pub fn begin_fetch(&self, key: &ResourceKey) -> bool {
        let mut in_flight = self.in_flight.lock().expect("cache lock poisoned");
        in_flight.insert(key.clone())
    }

    /// Release the fetch claim and wake waiters, whether or not it succeeded.
    pub fn end_fetch(&self, key: &ResourceKey) {
        let mut in_flight = self.in_flight.lock().expect("cache lock poisoned");
        in_flight.remove(key);
        drop(in_flight);
        self.flight_done.notify_waiters();
    }

    /// Wait until the fetch claimed for `key` has been released. The waiter
    /// is registered before the claim is re-checked, so an `end_fetch`
    /// landing between the failed claim and this call cannot be missed.
    pub async fn wait_for_fetch(&self, key: &ResourceKey) {
        loop {
            let notified = self.flight_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let in_flight = self.in_flight.lock().expect("cache lock poisoned");
                if !in_flight.contains(key) {
                    return;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn quote() -> Quote {
        Quote {
            symbol: "AAPL".into(),
            bid: dec!(189.95),
            ask: dec!(190.05),
            last: dec!(190),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn fresh_entry_returned_within_ttl() {
        let cache = TtlCache::new();
        let key = ResourceKey::Quote("AAPL".into());
        cache.insert(
            key.clone(),
            CachedValue::Quote(quote()),
            Duration::from_secs(60),
        );
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn expired_entry_not_returned() {
        let cache = TtlCache::new();
        let key = ResourceKey::Quote("AAPL".into());
        cache.insert(key.clone(), CachedValue::Quote(quote()), Duration::ZERO);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn invalidation_removes_entry() {
        let cache = TtlCache::new();
        let key = ResourceKey::Positions;
        cache.insert(
            key.clone(),
            CachedValue::Positions(vec![]),
            Duration::from_secs(60),
        );
        cache.invalidate(&key);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn fetch_claim_is_exclusive() {
        let cache = TtlCache::new();
        let key = ResourceKey::Account;
        assert!(cache.begin_fetch(&key));
        assert!(!cache.begin_fetch(&key));
        cache.end_fetch(&key);
        assert!(cache.begin_fetch(&key));
    }

    #[tokio::test]
    async fn wait_returns_when_claim_was_already_released() {
        let cache = TtlCache::new();
        let key = ResourceKey::Account;
        assert!(cache.begin_fetch(&key));
        assert!(!cache.begin_fetch(&key));
        // The release lands before the wait begins; the waiter must still
        // observe it instead of blocking on a notification that already fired.
        cache.end_fetch(&key);
        tokio::time::timeout(Duration::from_millis(500), cache.wait_for_fetch(&key))
            .await
            .expect("wait_for_fetch missed the released claim");
    }

    #[tokio::test]
    async fn wait_wakes_when_fetch_ends_later() {
        let cache = std::sync::Arc::new(TtlCache::new());
        let key = ResourceKey::Positions;
        assert!(cache.begin_fetch(&key));

        let waiter = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move { cache.wait_for_fetch(&key).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.end_fetch(&key);

        tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter never woke after end_fetch")
            .unwrap();
    }
}
