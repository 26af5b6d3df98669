//! Gateway behavior against the paper broker: TTL caching, rate budget
//! exhaustion, write invalidation and broker-side idempotency.

use rust_decimal_macros::dec;
use std::sync::Arc;

use tradewind::adapters::PaperBroker;
use tradewind::config::{GatewayConfig, RetryConfig};
use tradewind::domain::{OrderIntent, OrderSide, Timeframe};
use tradewind::error::BrokerError;
use tradewind::gateway::Gateway;

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay_ms: 1,
        multiplier: 2.0,
        jitter: 0.0,
    }
}

fn gateway_with(config: GatewayConfig) -> (Gateway, Arc<PaperBroker>) {
    let broker = Arc::new(PaperBroker::new());
    (Gateway::new(broker.clone(), config), broker)
}

#[tokio::test]
async fn repeated_reads_within_ttl_hit_upstream_once() {
    let (gateway, broker) = gateway_with(GatewayConfig {
        retry: fast_retry(),
        ..GatewayConfig::default()
    });
    broker.set_quote("AAPL", dec!(189.98), dec!(190.02)).await;

    for _ in 0..5 {
        gateway.quote("AAPL").await.unwrap();
    }
    assert_eq!(broker.call_count(), 1);

    // A different key fetches separately
    gateway.quote("MSFT").await.unwrap();
    assert_eq!(broker.call_count(), 2);

    // Bars keyed by symbol and timeframe
    broker.set_bars("AAPL", &[dec!(100), dec!(101)]).await;
    gateway.bars("AAPL", Timeframe::Min5, 10).await.unwrap();
    gateway.bars("AAPL", Timeframe::Min5, 10).await.unwrap();
    assert_eq!(broker.call_count(), 3);
}

#[tokio::test]
async fn exhausted_budget_fails_fast_instead_of_waiting_out_the_window() {
    let (gateway, broker) = gateway_with(GatewayConfig {
        rate_limit_per_minute: 2,
        budget_wait_ms: 50,
        retry: RetryConfig {
            max_attempts: 1,
            base_delay_ms: 1,
            multiplier: 1.0,
            jitter: 0.0,
        },
        ..GatewayConfig::default()
    });

    gateway.quote("AAPL").await.unwrap();
    gateway.quote("MSFT").await.unwrap();
    assert_eq!(gateway.budget_in_window(), 2);

    // Third distinct read cannot get a slot within the wait bound; the next
    // slot frees a minute out, so this returns RateLimited without blocking.
    let err = gateway.quote("NVDA").await.unwrap_err();
    assert!(matches!(err, BrokerError::RateLimited(_)));
    assert_eq!(broker.call_count(), 2);

    // Cached keys still serve without touching the budget
    gateway.quote("AAPL").await.unwrap();
    assert_eq!(broker.call_count(), 2);
}

#[tokio::test]
async fn writes_invalidate_account_state_but_not_market_data() {
    let (gateway, broker) = gateway_with(GatewayConfig {
        retry: fast_retry(),
        ..GatewayConfig::default()
    });
    broker.set_quote("AAPL", dec!(189.98), dec!(190.02)).await;

    gateway.account().await.unwrap();
    gateway.positions().await.unwrap();
    gateway.quote("AAPL").await.unwrap();
    let before = broker.call_count();

    let intent = OrderIntent::market("AAPL", OrderSide::Buy, dec!(5));
    gateway.submit_order(&intent).await.unwrap();

    // Account-shaped reads refetch after the write
    gateway.account().await.unwrap();
    gateway.positions().await.unwrap();
    assert_eq!(broker.call_count(), before + 3);

    // Quote cache was left alone
    gateway.quote("AAPL").await.unwrap();
    assert_eq!(broker.call_count(), before + 3);
}

#[tokio::test]
async fn transient_upstream_failures_are_retried_to_success() {
    let (gateway, broker) = gateway_with(GatewayConfig {
        retry: fast_retry(),
        ..GatewayConfig::default()
    });
    broker
        .inject_failures(BrokerError::from_status(503, "unavailable"), 2)
        .await;

    gateway.account().await.unwrap();
    assert_eq!(broker.call_count(), 3);
}

#[tokio::test]
async fn validation_failures_are_not_retried() {
    let (gateway, broker) = gateway_with(GatewayConfig {
        retry: fast_retry(),
        ..GatewayConfig::default()
    });
    broker
        .inject_failures(BrokerError::from_status(422, "bad qty"), 1)
        .await;

    let intent = OrderIntent::market("AAPL", OrderSide::Buy, dec!(5));
    let err = gateway.submit_order(&intent).await.unwrap_err();
    assert!(matches!(err, BrokerError::Validation { status: 422, .. }));
    assert_eq!(broker.call_count(), 1);
}

#[tokio::test]
async fn resubmitting_a_client_order_id_is_idempotent_at_the_broker() {
    let (gateway, broker) = gateway_with(GatewayConfig {
        retry: fast_retry(),
        ..GatewayConfig::default()
    });
    broker.set_quote("AAPL", dec!(189.98), dec!(190.02)).await;

    let intent = OrderIntent::market("AAPL", OrderSide::Buy, dec!(5));
    let first = gateway.submit_order(&intent).await.unwrap();
    let second = gateway.submit_order(&intent).await.unwrap();
    assert_eq!(first.upstream_order_id, second.upstream_order_id);

    let positions = gateway.positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].qty, dec!(5));
}
