//! Socket transport seam.
//!
//! The adapter only ever talks to these traits; [`ws::WsPool`] is the
//! production implementation.

pub mod ws;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::domain::{OrderAck, OrderRequest, RawEvent};
use crate::error::Result;

pub use ws::WsPool;

/// An active channel subscription on one socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub chan_id: u64,
    /// Channel type, e.g. `trades`
    pub channel: String,
    /// Descriptive fields sent by the venue (`symbol`, `key`, `prec`, ...)
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl ChannelInfo {
    /// True when the channel type matches and every filter field is present
    /// with an equal value. An empty filter matches any channel of the type.
    pub fn matches(&self, channel: &str, filter: &Map<String, Value>) -> bool {
        if self.channel != channel {
            return false;
        }

        filter
            .iter()
            .all(|(key, expected)| self.fields.get(key) == Some(expected))
    }
}

/// Extra authentication arguments merged into the next auth packet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthArgs {
    /// Dead man switch, `4` = active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dms: Option<u8>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One duplexed connection to the venue
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Socket: Send + Sync {
    fn index(&self) -> usize;

    fn is_authenticated(&self) -> bool;

    /// Write a raw packet
    async fn send(&self, packet: Value) -> Result<()>;

    async fn subscribe(&self, channel: &str, filter: &Map<String, Value>) -> Result<()>;

    async fn unsubscribe(&self, chan_id: u64) -> Result<()>;

    /// Currently known active subscriptions
    fn channels(&self) -> Vec<ChannelInfo>;

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck>;

    async fn cancel_order(&self, order: &OrderRequest) -> Result<OrderAck>;
}

/// Pool of sockets plus its raw event stream
#[async_trait]
pub trait SocketPool: Send + Sync {
    async fn open(&self) -> Result<()>;

    async fn reconnect_all(&self) -> Result<()>;

    async fn close_all(&self) -> Result<()>;

    /// Pick a socket index for one-off operations
    fn sample_index(&self) -> Option<usize>;

    fn socket(&self, index: usize) -> Option<Arc<dyn Socket>>;

    /// First authenticated socket, if any
    fn auth_socket(&self) -> Option<Arc<dyn Socket>>;

    fn update_auth_args(&self, args: AuthArgs);

    fn events(&self) -> broadcast::Receiver<RawEvent>;
}

/// Handle returned by `get_connection`: a socket index plus the socket itself
#[derive(Clone)]
pub struct Connection {
    pub index: usize,
    pub socket: Arc<dyn Socket>,
}

impl Connection {
    pub fn new(index: usize, socket: Arc<dyn Socket>) -> Self {
        Self { index, socket }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("index", &self.index)
            .field("authenticated", &self.socket.is_authenticated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel(chan_id: u64, channel: &str, fields: Value) -> ChannelInfo {
        ChannelInfo {
            chan_id,
            channel: channel.to_string(),
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    fn filter(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn channel_matching_requires_type_and_all_filter_fields() {
        let info = channel(17, "trades", json!({ "symbol": "tBTCUSD" }));

        assert!(info.matches("trades", &filter(json!({ "symbol": "tBTCUSD" }))));
        assert!(!info.matches("trades", &filter(json!({ "symbol": "tETHUSD" }))));
        assert!(!info.matches("ticker", &filter(json!({ "symbol": "tBTCUSD" }))));
        // filter key the channel does not carry
        assert!(!info.matches(
            "trades",
            &filter(json!({ "symbol": "tBTCUSD", "prec": "P0" }))
        ));
    }

    #[test]
    fn empty_filter_matches_any_channel_of_type() {
        let info = channel(3, "candles", json!({ "key": "trade:1m:tBTCUSD" }));
        assert!(info.matches("candles", &Map::new()));
        assert!(!info.matches("book", &Map::new()));
    }

    #[test]
    fn auth_args_flatten_extra_fields() {
        let mut extra = Map::new();
        extra.insert("calc".to_string(), json!(1));
        let args = AuthArgs {
            dms: Some(4),
            extra,
        };
        assert_eq!(serde_json::to_value(&args).unwrap(), json!({ "dms": 4, "calc": 1 }));
    }
}
