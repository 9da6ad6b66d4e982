//! Kite Connect REST client.

use crate::api::BrokerApi;
use crate::types::{OrderParams, TrackedOrder, TrackedPosition};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const KITE_HEADER_VERSION: &str = "3";

/// Last traded price quote for one instrument.
#[derive(Debug, Clone, Deserialize)]
pub struct LtpQuote {
    pub instrument_token: u32,
    pub last_price: f64,
}

/// Net and day position books as returned by the broker.
#[derive(Debug, Clone, Default)]
pub struct PositionBook {
    pub net: Vec<TrackedPosition>,
    pub day: Vec<TrackedPosition>,
}

/// Authenticated REST client for one user's Kite session.
pub struct KiteClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: String,
}

impl KiteClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            access_token: access_token.into(),
        })
    }

    fn auth_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.access_token)
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .query(query)
            .header("Authorization", self.auth_header())
            .header("X-Kite-Version", KITE_HEADER_VERSION)
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .form(form)
            .header("Authorization", self.auth_header())
            .header("X-Kite-Version", KITE_HEADER_VERSION)
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    /// Unwrap the broker's `{status, data}` envelope, mapping error payloads
    /// onto typed error kinds.
    async fn unwrap_envelope<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let envelope: Envelope<T> = response.json().await?;

        if envelope.status == "success" {
            return envelope
                .data
                .ok_or_else(|| Error::Data("missing data in success response".to_string()));
        }

        let message = envelope
            .message
            .unwrap_or_else(|| format!("request failed with HTTP {status}"));
        Err(match envelope.error_type.as_deref() {
            Some("TokenException") | Some("PermissionException") => Error::Token(message),
            Some("InputException") => Error::Input(message),
            Some("OrderException") | Some("MarginException") => Error::OrderRejected(message),
            _ if status == StatusCode::FORBIDDEN => Error::Token(message),
            _ if status == StatusCode::BAD_REQUEST => Error::Input(message),
            _ => Error::Api {
                message,
                status: Some(status.as_u16()),
            },
        })
    }
}

#[async_trait]
impl BrokerApi for KiteClient {
    async fn positions(&self) -> Result<PositionBook> {
        let data: PositionsData = self.get("/portfolio/positions", &[]).await?;
        Ok(PositionBook {
            net: data.net.into_iter().map(Into::into).collect(),
            day: data.day.into_iter().map(Into::into).collect(),
        })
    }

    async fn orders(&self) -> Result<Vec<TrackedOrder>> {
        let data: Vec<OrderRow> = self.get("/orders", &[]).await?;
        Ok(data.into_iter().map(Into::into).collect())
    }

    async fn ltp(&self, instruments: &[String]) -> Result<HashMap<String, LtpQuote>> {
        let query: Vec<(&str, String)> = instruments.iter().map(|i| ("i", i.clone())).collect();
        self.get("/quote/ltp", &query).await
    }

    async fn place_order(&self, params: &OrderParams) -> Result<String> {
        let mut form: Vec<(&str, String)> = vec![
            ("exchange", params.exchange.clone()),
            ("tradingsymbol", params.trading_symbol.clone()),
            ("transaction_type", params.transaction_type.as_str().to_string()),
            ("quantity", params.quantity.to_string()),
            ("product", params.product.clone()),
            ("order_type", params.order_type.as_str().to_string()),
        ];
        if let Some(price) = params.price {
            form.push(("price", price.to_string()));
        }
        if let Some(trigger_price) = params.trigger_price {
            form.push(("trigger_price", trigger_price.to_string()));
        }
        if let Some(tag) = &params.tag {
            form.push(("tag", tag.clone()));
        }

        debug!(
            symbol = %params.trading_symbol,
            side = %params.transaction_type.as_str(),
            quantity = params.quantity,
            "Placing order"
        );

        let data: OrderIdData = self
            .post_form(&format!("/orders/{}", params.variety), &form)
            .await?;
        Ok(data.order_id)
    }
}

// Wire types

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    message: Option<String>,
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PositionsData {
    #[serde(default)]
    net: Vec<PositionRow>,
    #[serde(default)]
    day: Vec<PositionRow>,
}

#[derive(Debug, Deserialize)]
struct OrderIdData {
    order_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PositionRow {
    instrument_token: u32,
    tradingsymbol: String,
    exchange: String,
    product: String,
    quantity: i64,
    average_price: f64,
    last_price: f64,
    pnl: f64,
    buy_quantity: i64,
    sell_quantity: i64,
    buy_price: f64,
    sell_price: f64,
    multiplier: i64,
}

impl From<PositionRow> for TrackedPosition {
    fn from(row: PositionRow) -> Self {
        let now = Utc::now();
        TrackedPosition {
            instrument_token: row.instrument_token,
            trading_symbol: row.tradingsymbol,
            exchange: row.exchange,
            product: row.product,
            quantity: row.quantity,
            average_price: row.average_price,
            last_price: row.last_price,
            pnl: row.pnl,
            buy_quantity: row.buy_quantity,
            sell_quantity: row.sell_quantity,
            buy_price: row.buy_price,
            sell_price: row.sell_price,
            multiplier: if row.multiplier == 0 { 1 } else { row.multiplier },
            first_seen: now,
            last_updated: now,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OrderRow {
    order_id: String,
    exchange_order_id: Option<String>,
    tradingsymbol: String,
    exchange: String,
    transaction_type: String,
    order_type: String,
    product: String,
    variety: String,
    status: String,
    quantity: i64,
    filled_quantity: i64,
    price: f64,
    average_price: f64,
    trigger_price: Option<f64>,
    tag: Option<String>,
    order_timestamp: Option<String>,
}

impl From<OrderRow> for TrackedOrder {
    fn from(row: OrderRow) -> Self {
        TrackedOrder {
            order_id: row.order_id,
            exchange_order_id: row.exchange_order_id,
            trading_symbol: row.tradingsymbol,
            exchange: row.exchange,
            transaction_type: row.transaction_type,
            order_type: row.order_type,
            product: row.product,
            variety: row.variety,
            status: row.status,
            quantity: row.quantity,
            filled_quantity: row.filled_quantity,
            price: row.price,
            average_price: row.average_price,
            trigger_price: row.trigger_price,
            tag: row.tag,
            order_timestamp: row.order_timestamp.as_deref().and_then(parse_broker_timestamp),
        }
    }
}

/// Broker timestamps come as `YYYY-MM-DD HH:MM:SS` in exchange-local time;
/// RFC 3339 is accepted too.
fn parse_broker_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_row_conversion() {
        let json = r#"{
            "instrument_token": 273924,
            "tradingsymbol": "SENSEX25D0486000CE",
            "exchange": "BFO",
            "product": "NRML",
            "quantity": 1000,
            "average_price": 366.89,
            "last_price": 370.0,
            "pnl": 3110.0,
            "buy_quantity": 1000,
            "sell_quantity": 0,
            "buy_price": 366.89,
            "sell_price": 0.0,
            "multiplier": 1
        }"#;
        let row: PositionRow = serde_json::from_str(json).unwrap();
        let pos: TrackedPosition = row.into();
        assert_eq!(pos.trading_symbol, "SENSEX25D0486000CE");
        assert_eq!(pos.quantity, 1000);
        assert_eq!(pos.entry_price(), 366.89);
    }

    #[test]
    fn test_position_row_defaults_missing_fields() {
        let row: PositionRow = serde_json::from_str(r#"{"tradingsymbol": "INFY"}"#).unwrap();
        let pos: TrackedPosition = row.into();
        assert_eq!(pos.quantity, 0);
        assert_eq!(pos.multiplier, 1);
    }

    #[test]
    fn test_envelope_error_mapping() {
        let env: Envelope<OrderIdData> = serde_json::from_str(
            r#"{"status": "error", "message": "Token is invalid", "error_type": "TokenException"}"#,
        )
        .unwrap();
        assert_eq!(env.status, "error");
        assert_eq!(env.error_type.as_deref(), Some("TokenException"));
    }

    #[test]
    fn test_broker_timestamp_formats() {
        assert!(parse_broker_timestamp("2025-12-04 15:20:01").is_some());
        assert!(parse_broker_timestamp("2025-12-04T15:20:01+05:30").is_some());
        assert!(parse_broker_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_ltp_response_shape() {
        let json = r#"{
            "BFO:SENSEX25D0486000CE": {"instrument_token": 273924, "last_price": 467.0}
        }"#;
        let data: HashMap<String, LtpQuote> = serde_json::from_str(json).unwrap();
        let quote = &data["BFO:SENSEX25D0486000CE"];
        assert_eq!(quote.instrument_token, 273924);
        assert_eq!(quote.last_price, 467.0);
    }
}
