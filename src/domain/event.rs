//! Raw transport events and the domain events re-emitted to strategy code.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TransportFault;

/// Lifecycle state of a single socket in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketState {
    Connecting,
    Open,
    Reconnecting,
    Closing,
    Closed,
}

impl SocketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketState::Connecting => "connecting",
            SocketState::Open => "open",
            SocketState::Reconnecting => "reconnecting",
            SocketState::Closing => "closing",
            SocketState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload of a data-carrying channel event
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelData {
    pub data: Value,
    /// Channel metadata (chanId, channel, symbol, ...), if the transport supplied any
    pub meta: Option<Value>,
}

impl ChannelData {
    pub fn new(data: Value, meta: Option<Value>) -> Self {
        Self { data, meta }
    }
}

/// Event kinds produced by the socket transport
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Error(TransportFault),
    Ticker(ChannelData),
    Trades(ChannelData),
    Candles(ChannelData),
    Book(ChannelData),
    ManagedBook(ChannelData),
    ManagedCandles(ChannelData),
    Notification(ChannelData),
    SocketUpdated { index: usize, state: SocketState },
    /// Venue announced an imminent server restart
    ServerRestart { index: usize },
    /// A socket re-established its connection after a drop
    Reopen { index: usize },
    Open { index: usize },
    AuthSuccess(Value),
    AuthError(Value),
    AuthNotification(Value),
    OrderSnapshot(Value),
    OrderNew(Value),
    OrderUpdate(Value),
    OrderClose(Value),
    /// Untransformed trades frame
    RawTrades(Value),
    /// Untransformed book frame
    RawBook(Value),
    /// Anything the transport saw but has no mapping for
    Unrecognized { name: String, payload: Value },
}

impl RawEvent {
    /// Transport-side event name, used for logging
    pub fn name(&self) -> &str {
        match self {
            RawEvent::Error(_) => "error",
            RawEvent::Ticker(_) => "ticker",
            RawEvent::Trades(_) => "trades",
            RawEvent::Candles(_) => "candles",
            RawEvent::Book(_) => "book",
            RawEvent::ManagedBook(_) => "managed:book",
            RawEvent::ManagedCandles(_) => "managed:candles",
            RawEvent::Notification(_) => "notification",
            RawEvent::SocketUpdated { .. } => "socket:updated",
            RawEvent::ServerRestart { .. } => "event:info-server-restart",
            RawEvent::Reopen { .. } => "reopen",
            RawEvent::Open { .. } => "open",
            RawEvent::AuthSuccess(_) => "event:auth:success",
            RawEvent::AuthError(_) => "event:auth:error",
            RawEvent::AuthNotification(_) => "auth:n",
            RawEvent::OrderSnapshot(_) => "auth:os",
            RawEvent::OrderNew(_) => "auth:on",
            RawEvent::OrderUpdate(_) => "auth:ou",
            RawEvent::OrderClose(_) => "auth:oc",
            RawEvent::RawTrades(_) => "data:trades",
            RawEvent::RawBook(_) => "data:book",
            RawEvent::Unrecognized { name, .. } => name,
        }
    }
}

/// Topics of `data:<topic>` domain events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataTopic {
    Ticker,
    Trades,
    Candles,
    Book,
    ManagedBook,
    ManagedCandles,
    Notification,
}

impl DataTopic {
    pub fn event_name(&self) -> &'static str {
        match self {
            DataTopic::Ticker => "data:ticker",
            DataTopic::Trades => "data:trades",
            DataTopic::Candles => "data:candles",
            DataTopic::Book => "data:book",
            DataTopic::ManagedBook => "data:managed:book",
            DataTopic::ManagedCandles => "data:managed:candles",
            DataTopic::Notification => "data:notification",
        }
    }
}

/// Events consumed by strategy / algo code
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    /// `data:<topic>` with `(data, meta)`; meta is an empty object when absent
    Data {
        topic: DataTopic,
        data: Value,
        meta: Value,
    },
    /// `meta:error`
    MetaError(TransportFault),
    /// `meta:connection:update`
    ConnectionUpdate { index: usize, state: SocketState },
    /// `meta:reload`: order/book state must be resynchronised from scratch
    Reload,
    Open { index: usize },
    AuthSuccess(Value),
    AuthError(Value),
    AuthNotification(Value),
    OrderSnapshot(Value),
    /// `valid` is the reconnect guard's verdict at the moment the event was emitted
    OrderNew { payload: Value, valid: bool },
    OrderUpdate { payload: Value, valid: bool },
    OrderClose { payload: Value, valid: bool },
    /// Plain `trades` event carrying the untransformed frame
    Trades(Value),
    /// Plain `book` event carrying the untransformed frame
    Book(Value),
}

impl DomainEvent {
    pub fn data(topic: DataTopic, data: ChannelData) -> Self {
        DomainEvent::Data {
            topic,
            data: data.data,
            meta: data.meta.unwrap_or_else(|| Value::Object(Map::new())),
        }
    }

    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::Data { topic, .. } => topic.event_name(),
            DomainEvent::MetaError(_) => "meta:error",
            DomainEvent::ConnectionUpdate { .. } => "meta:connection:update",
            DomainEvent::Reload => "meta:reload",
            DomainEvent::Open { .. } => "open",
            DomainEvent::AuthSuccess(_) => "auth:success",
            DomainEvent::AuthError(_) => "auth:error",
            DomainEvent::AuthNotification(_) => "auth:n",
            DomainEvent::OrderSnapshot(_) => "order:snapshot",
            DomainEvent::OrderNew { .. } => "order:new",
            DomainEvent::OrderUpdate { .. } => "order:update",
            DomainEvent::OrderClose { .. } => "order:close",
            DomainEvent::Trades(_) => "trades",
            DomainEvent::Book(_) => "book",
        }
    }

    /// Order lifecycle events whose validity depends on the reconnect guard
    pub fn is_order_lifecycle(&self) -> bool {
        self.order_event_valid().is_some()
    }

    /// Validity stamped on an order lifecycle event; `None` for every other event
    pub fn order_event_valid(&self) -> Option<bool> {
        match self {
            DomainEvent::OrderNew { valid, .. }
            | DomainEvent::OrderUpdate { valid, .. }
            | DomainEvent::OrderClose { valid, .. } => Some(*valid),
            _ => None,
        }
    }

    /// Overwrite the validity of an order lifecycle event; other events pass through
    pub fn with_order_validity(mut self, is_valid: bool) -> Self {
        match &mut self {
            DomainEvent::OrderNew { valid, .. }
            | DomainEvent::OrderUpdate { valid, .. }
            | DomainEvent::OrderClose { valid, .. } => *valid = is_valid,
            _ => {}
        }
        self
    }
}
