use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{AdapterError, Result};

/// Key of the nested metadata map on raw order payloads
const META_KEY: &str = "meta";
/// Key of the affiliate code inside the metadata map
const AFF_CODE_KEY: &str = "aff_code";

/// Venue order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "STOP")]
    Stop,
    #[serde(rename = "EXCHANGE LIMIT")]
    ExchangeLimit,
    #[serde(rename = "EXCHANGE MARKET")]
    ExchangeMarket,
    #[serde(rename = "EXCHANGE STOP")]
    ExchangeStop,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
            OrderType::Stop => "STOP",
            OrderType::ExchangeLimit => "EXCHANGE LIMIT",
            OrderType::ExchangeMarket => "EXCHANGE MARKET",
            OrderType::ExchangeStop => "EXCHANGE STOP",
        }
    }

    pub fn has_price(&self) -> bool {
        !matches!(self, OrderType::Market | OrderType::ExchangeMarket)
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed order model.
///
/// `amount` is signed: positive buys, negative sells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Venue assigned id, known once the order was acknowledged
    pub id: Option<u64>,
    /// Group id
    pub gid: Option<u64>,
    /// Client id, unique per day
    pub cid: u64,
    /// UTC date the cid was issued on (`YYYY-MM-DD`)
    pub cid_date: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    #[serde(default)]
    pub flags: u32,
    pub affiliate_code: Option<String>,
}

impl Order {
    fn new(symbol: &str, order_type: OrderType, amount: Decimal, price: Option<Decimal>) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            gid: None,
            cid: now.timestamp_millis().max(0) as u64,
            cid_date: now.format("%Y-%m-%d").to_string(),
            symbol: symbol.to_string(),
            order_type,
            amount,
            price,
            flags: 0,
            affiliate_code: None,
        }
    }

    pub fn exchange_limit(symbol: &str, amount: Decimal, price: Decimal) -> Self {
        Self::new(symbol, OrderType::ExchangeLimit, amount, Some(price))
    }

    pub fn exchange_market(symbol: &str, amount: Decimal) -> Self {
        Self::new(symbol, OrderType::ExchangeMarket, amount, None)
    }

    pub fn with_gid(mut self, gid: u64) -> Self {
        self.gid = Some(gid);
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_buy(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    /// Payload of a new-order (`on`) packet
    pub fn to_new_order_packet(&self) -> Value {
        let mut packet = Map::new();
        if let Some(gid) = self.gid {
            packet.insert("gid".to_string(), json!(gid));
        }
        packet.insert("cid".to_string(), json!(self.cid));
        packet.insert("type".to_string(), json!(self.order_type.as_str()));
        packet.insert("symbol".to_string(), json!(self.symbol));
        packet.insert("amount".to_string(), json!(self.amount.to_string()));
        if let Some(price) = self.price.filter(|_| self.order_type.has_price()) {
            packet.insert("price".to_string(), json!(price.to_string()));
        }
        packet.insert("flags".to_string(), json!(self.flags));
        if let Some(code) = &self.affiliate_code {
            packet.insert(META_KEY.to_string(), json!({ AFF_CODE_KEY: code }));
        }
        Value::Object(packet)
    }

    /// Payload of a cancel (`oc`) packet
    pub fn to_cancel_packet(&self) -> Value {
        match self.id {
            Some(id) => json!({ "id": id }),
            None => json!({ "cid": self.cid, "cid_date": self.cid_date }),
        }
    }
}

/// Order payload handed to the adapter.
///
/// Either the typed [`Order`] model or an opaque key/value payload that is
/// forwarded to the venue as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderRequest {
    Model(Order),
    Raw(Map<String, Value>),
}

impl From<Order> for OrderRequest {
    fn from(order: Order) -> Self {
        OrderRequest::Model(order)
    }
}

impl From<Map<String, Value>> for OrderRequest {
    fn from(payload: Map<String, Value>) -> Self {
        OrderRequest::Raw(payload)
    }
}

impl OrderRequest {
    /// Attach an affiliate code.
    ///
    /// The typed model carries it as a first-class field; raw payloads get it
    /// under `meta.aff_code`, creating the `meta` map if needed.
    pub fn apply_affiliate_code(&mut self, code: &str) {
        match self {
            OrderRequest::Model(order) => {
                order.affiliate_code = Some(code.to_string());
            }
            OrderRequest::Raw(payload) => {
                let meta = payload
                    .entry(META_KEY.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !meta.is_object() {
                    debug!("Replacing non-object order meta {:?} to attach affiliate code", meta);
                    *meta = Value::Object(Map::new());
                }
                if let Value::Object(meta) = meta {
                    meta.insert(AFF_CODE_KEY.to_string(), Value::String(code.to_string()));
                }
            }
        }
    }

    /// Affiliate code currently attached, if any
    pub fn affiliate_code(&self) -> Option<&str> {
        match self {
            OrderRequest::Model(order) => order.affiliate_code.as_deref(),
            OrderRequest::Raw(payload) => payload
                .get(META_KEY)
                .and_then(|meta| meta.get(AFF_CODE_KEY))
                .and_then(Value::as_str),
        }
    }

    /// Client id, if the payload carries one
    pub fn cid(&self) -> Option<u64> {
        match self {
            OrderRequest::Model(order) => Some(order.cid),
            OrderRequest::Raw(payload) => payload.get("cid").and_then(Value::as_u64),
        }
    }

    pub fn new_order_packet(&self) -> Value {
        match self {
            OrderRequest::Model(order) => order.to_new_order_packet(),
            OrderRequest::Raw(payload) => Value::Object(payload.clone()),
        }
    }

    /// Build the cancel payload: by venue id, or by `cid` + `cid_date`
    pub fn cancel_packet(&self) -> Result<Value> {
        match self {
            OrderRequest::Model(order) => Ok(order.to_cancel_packet()),
            OrderRequest::Raw(payload) => {
                if let Some(id) = payload.get("id").filter(|v| !v.is_null()) {
                    return Ok(json!({ "id": id }));
                }
                match (payload.get("cid"), payload.get("cid_date")) {
                    (Some(cid), Some(date)) => Ok(json!({ "cid": cid, "cid_date": date })),
                    _ => Err(AdapterError::Validation(
                        "cancel requires either id or cid + cid_date".to_string(),
                    )),
                }
            }
        }
    }
}

/// Acknowledgement that an order packet reached the venue socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    /// Socket the packet was written to
    pub index: usize,
    pub cid: Option<u64>,
    /// The full frame as written
    pub packet: Value,
    pub sent_at: DateTime<Utc>,
}

impl OrderAck {
    pub fn new(index: usize, cid: Option<u64>, packet: Value) -> Self {
        Self {
            index,
            cid,
            packet,
            sent_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn model_gets_first_class_affiliate_code() {
        let mut req = OrderRequest::from(Order::exchange_limit("tBTCUSD", dec!(0.5), dec!(30000)));
        req.apply_affiliate_code("ref-1");

        let OrderRequest::Model(order) = &req else {
            panic!("expected model");
        };
        assert_eq!(order.affiliate_code.as_deref(), Some("ref-1"));
        assert_eq!(req.new_order_packet()["meta"]["aff_code"], "ref-1");
    }

    #[test]
    fn raw_payload_gets_nested_meta() {
        let mut payload = Map::new();
        payload.insert("symbol".to_string(), json!("tETHUSD"));
        let mut req = OrderRequest::from(payload);
        req.apply_affiliate_code("ref-2");

        assert_eq!(req.affiliate_code(), Some("ref-2"));
        assert_eq!(req.new_order_packet()["meta"], json!({ "aff_code": "ref-2" }));
    }

    #[test]
    fn raw_payload_keeps_existing_meta_fields() {
        let mut payload = Map::new();
        payload.insert("meta".to_string(), json!({ "source": "algo" }));
        let mut req = OrderRequest::Raw(payload);
        req.apply_affiliate_code("ref-3");

        assert_eq!(
            req.new_order_packet()["meta"],
            json!({ "source": "algo", "aff_code": "ref-3" })
        );
    }

    #[test]
    fn raw_payload_with_scalar_meta_is_replaced() {
        let mut payload = Map::new();
        payload.insert("meta".to_string(), json!("junk"));
        let mut req = OrderRequest::Raw(payload);
        req.apply_affiliate_code("ref-4");

        assert_eq!(req.affiliate_code(), Some("ref-4"));
    }

    #[test]
    fn market_orders_omit_price() {
        let order = Order::exchange_market("tBTCUSD", dec!(-1));
        let packet = order.to_new_order_packet();
        assert!(packet.get("price").is_none());
        assert_eq!(packet["amount"], "-1");
        assert_eq!(packet["type"], "EXCHANGE MARKET");
        assert!(packet.get("meta").is_none());
    }

    #[test]
    fn cancel_packet_prefers_venue_id() {
        let mut order = Order::exchange_limit("tBTCUSD", dec!(1), dec!(100));
        let by_cid = order.to_cancel_packet();
        assert_eq!(by_cid["cid"], json!(order.cid));

        order.id = Some(42);
        assert_eq!(order.to_cancel_packet(), json!({ "id": 42 }));
    }

    #[test]
    fn raw_cancel_requires_an_identifier() {
        let req = OrderRequest::Raw(Map::new());
        assert!(matches!(req.cancel_packet(), Err(AdapterError::Validation(_))));

        let mut payload = Map::new();
        payload.insert("id".to_string(), json!(7));
        assert_eq!(
            OrderRequest::Raw(payload).cancel_packet().unwrap(),
            json!({ "id": 7 })
        );
    }
}
