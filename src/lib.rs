pub mod adapter;
pub mod audit;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod signing;
pub mod transport;

pub use crate::adapter::{AdapterState, AlgoOrderAdapter, NotifyLevel, PendingOrderAction};
pub use crate::audit::{audit_candle_gaps, find_gaps, CandleSource, GapReport};
pub use crate::config::AdapterConfig;
pub use crate::domain::{Candle, DomainEvent, Order, OrderRequest, RawEvent, Timeframe};
pub use crate::error::{AdapterError, Result};
pub use crate::transport::{Connection, Socket, SocketPool, WsPool};
