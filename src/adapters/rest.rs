//! Brokerage REST adapter.
//!
//! Thin reqwest client for an Alpaca-style trading API. All responses are
//! normalized into the domain types and every failure is classified into a
//! [`BrokerError`] before it leaves this module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::domain::{
    AccountSnapshot, Bar, OrderIntent, OrderSnapshot, OrderStatus, Position, Quote, Timeframe,
};
use crate::error::BrokerError;

use super::broker::BrokerApi;

const KEY_HEADER: &str = "apca-api-key-id";
const SECRET_HEADER: &str = "apca-api-secret-key";

#[derive(Clone)]
pub struct RestBroker {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl RestBroker {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        request_timeout: std::time::Duration,
    ) -> Result<Self, BrokerError> {
        let http = Client::builder()
            .user_agent("tradewind/0.1")
            .timeout(request_timeout)
            .build()
            .map_err(|e| BrokerError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        })
    }

    fn auth_headers(&self) -> Result<HeaderMap, BrokerError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(KEY_HEADER),
            HeaderValue::from_str(&self.api_key)
                .map_err(|_| BrokerError::Auth("invalid API key".to_string()))?,
        );
        headers.insert(
            HeaderName::from_static(SECRET_HEADER),
            HeaderValue::from_str(&self.api_secret)
                .map_err(|_| BrokerError::Auth("invalid API secret".to_string()))?,
        );
        Ok(headers)
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, ?method, "broker request");

        let mut req = self
            .http
            .request(method, &url)
            .headers(self.auth_headers()?);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                BrokerError::Timeout(format!("{} timed out", url))
            } else {
                BrokerError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrokerError::from_status(status.as_u16(), message));
        }

        // DELETE endpoints answer 204 with an empty body
        if status == StatusCode::NO_CONTENT {
            return serde_json::from_value(serde_json::Value::Null)
                .map_err(|e| BrokerError::Transport(format!("empty response: {}", e)));
        }

        resp.json::<T>()
            .await
            .map_err(|e| BrokerError::Transport(format!("malformed response: {}", e)))
    }
}

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, BrokerError> {
    raw.parse::<Decimal>()
        .map_err(|e| BrokerError::Transport(format!("bad decimal in {}: {}", field, e)))
}

fn parse_status(raw: &str) -> OrderStatus {
    match raw {
        "partially_filled" => OrderStatus::PartiallyFilled,
        "filled" => OrderStatus::Filled,
        "canceled" | "pending_cancel" => OrderStatus::Canceled,
        "rejected" => OrderStatus::Rejected,
        "expired" => OrderStatus::Expired,
        // new / accepted / pending_new all map to live-but-unfilled
        _ => OrderStatus::New,
    }
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    cash: String,
    buying_power: String,
    equity: String,
    #[serde(default)]
    daytrade_pnl: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    symbol: String,
    qty: String,
    avg_entry_price: String,
    market_value: String,
    unrealized_pl: String,
}

#[derive(Debug, Deserialize)]
struct WireQuote {
    symbol: String,
    bid_price: String,
    ask_price: String,
    last_price: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WireBar {
    o: String,
    h: String,
    l: String,
    c: String,
    v: String,
    t: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WireBars {
    bars: Vec<WireBar>,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    id: String,
    client_order_id: String,
    status: String,
    filled_qty: String,
    #[serde(default)]
    filled_avg_price: Option<String>,
    updated_at: DateTime<Utc>,
}

impl WireOrder {
    fn into_snapshot(self) -> Result<OrderSnapshot, BrokerError> {
        let avg_fill_price = match self.filled_avg_price.as_deref() {
            Some(raw) if !raw.is_empty() => Some(parse_decimal(raw, "filled_avg_price")?),
            _ => None,
        };
        Ok(OrderSnapshot {
            upstream_order_id: self.id,
            client_order_id: self.client_order_id,
            status: parse_status(&self.status),
            filled_qty: parse_decimal(&self.filled_qty, "filled_qty")?,
            avg_fill_price,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl BrokerApi for RestBroker {
    async fn account(&self) -> Result<AccountSnapshot, BrokerError> {
        let wire: WireAccount = self.request(Method::GET, "/v2/account", None).await?;
        Ok(AccountSnapshot {
            cash: parse_decimal(&wire.cash, "cash")?,
            buying_power: parse_decimal(&wire.buying_power, "buying_power")?,
            equity: parse_decimal(&wire.equity, "equity")?,
            daily_realized_pnl: wire
                .daytrade_pnl
                .as_deref()
                .map(|raw| parse_decimal(raw, "daytrade_pnl"))
                .transpose()?
                .unwrap_or(Decimal::ZERO),
            timestamp: Utc::now(),
        })
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let wire: Vec<WirePosition> = self.request(Method::GET, "/v2/positions", None).await?;
        wire.into_iter()
            .map(|p| {
                Ok(Position {
                    qty: parse_decimal(&p.qty, "qty")?,
                    avg_entry_price: parse_decimal(&p.avg_entry_price, "avg_entry_price")?,
                    market_value: parse_decimal(&p.market_value, "market_value")?,
                    unrealized_pnl: parse_decimal(&p.unrealized_pl, "unrealized_pl")?,
                    symbol: p.symbol,
                })
            })
            .collect()
    }

    async fn quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let path = format!("/v2/quotes/{}/latest", symbol);
        let wire: WireQuote = self.request(Method::GET, &path, None).await?;
        Ok(Quote {
            bid: parse_decimal(&wire.bid_price, "bid_price")?,
            ask: parse_decimal(&wire.ask_price, "ask_price")?,
            last: parse_decimal(&wire.last_price, "last_price")?,
            symbol: wire.symbol,
            timestamp: wire.timestamp,
        })
    }

    async fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        let path = format!(
            "/v2/bars/{}?timeframe={}&limit={}",
            symbol,
            timeframe.as_str(),
            limit
        );
        let wire: WireBars = self.request(Method::GET, &path, None).await?;
        wire.bars
            .into_iter()
            .map(|b| {
                Ok(Bar {
                    open: parse_decimal(&b.o, "o")?,
                    high: parse_decimal(&b.h, "h")?,
                    low: parse_decimal(&b.l, "l")?,
                    close: parse_decimal(&b.c, "c")?,
                    volume: parse_decimal(&b.v, "v")?,
                    timestamp: b.t,
                })
            })
            .collect()
    }

    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderSnapshot, BrokerError> {
        let mut body = json!({
            "client_order_id": intent.client_order_id,
            "symbol": intent.symbol,
            "side": intent.side,
            "type": intent.order_type,
            "time_in_force": intent.time_in_force,
        });
        if let Some(qty) = intent.qty {
            body["qty"] = json!(qty.to_string());
        }
        if let Some(notional) = intent.notional {
            body["notional"] = json!(notional.to_string());
        }
        if let Some(price) = intent.limit_price {
            body["limit_price"] = json!(price.to_string());
        }
        if let Some(price) = intent.stop_price {
            body["stop_price"] = json!(price.to_string());
        }

        let wire: WireOrder = self.request(Method::POST, "/v2/orders", Some(body)).await?;
        wire.into_snapshot()
    }

    async fn cancel_order(&self, upstream_order_id: &str) -> Result<(), BrokerError> {
        let path = format!("/v2/orders/{}", upstream_order_id);
        let _: Option<serde_json::Value> = self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn replace_order(
        &self,
        upstream_order_id: &str,
        qty: Option<Decimal>,
        limit_price: Option<Decimal>,
    ) -> Result<OrderSnapshot, BrokerError> {
        let mut body = json!({});
        if let Some(qty) = qty {
            body["qty"] = json!(qty.to_string());
        }
        if let Some(price) = limit_price {
            body["limit_price"] = json!(price.to_string());
        }
        let path = format!("/v2/orders/{}", upstream_order_id);
        let wire: WireOrder = self.request(Method::PATCH, &path, Some(body)).await?;
        wire.into_snapshot()
    }

    async fn get_order(&self, upstream_order_id: &str) -> Result<OrderSnapshot, BrokerError> {
        let path = format!("/v2/orders/{}", upstream_order_id);
        let wire: WireOrder = self.request(Method::GET, &path, None).await?;
        wire.into_snapshot()
    }

    async fn open_orders(&self) -> Result<Vec<OrderSnapshot>, BrokerError> {
        let wire: Vec<WireOrder> = self
            .request(Method::GET, "/v2/orders?status=open", None)
            .await?;
        wire.into_iter().map(|o| o.into_snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_status_mapping() {
        assert_eq!(parse_status("new"), OrderStatus::New);
        assert_eq!(parse_status("accepted"), OrderStatus::New);
        assert_eq!(parse_status("partially_filled"), OrderStatus::PartiallyFilled);
        assert_eq!(parse_status("filled"), OrderStatus::Filled);
        assert_eq!(parse_status("canceled"), OrderStatus::Canceled);
        assert_eq!(parse_status("rejected"), OrderStatus::Rejected);
        assert_eq!(parse_status("expired"), OrderStatus::Expired);
    }

    #[test]
    fn wire_order_to_snapshot() {
        let wire = WireOrder {
            id: "up-1".into(),
            client_order_id: "c-1".into(),
            status: "filled".into(),
            filled_qty: "10".into(),
            filled_avg_price: Some("189.95".into()),
            updated_at: Utc::now(),
        };
        let snap = wire.into_snapshot().unwrap();
        assert_eq!(snap.status, OrderStatus::Filled);
        assert_eq!(snap.filled_qty, Decimal::from(10));
        assert!(snap.avg_fill_price.is_some());
    }
}
