//! Raw transport event to domain event mapping.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::guard::ReconnectGuard;
use crate::domain::{DataTopic, DomainEvent, RawEvent};

/// Domain events buffered per subscriber before it starts lagging
pub const DOMAIN_EVENT_CAPACITY: usize = 4096;

/// Outcome of routing one raw event
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Forward to subscribers
    Emit(DomainEvent),
    /// Enter the order-event suppression window
    ServerRestart,
    /// Leave the suppression window and emit `meta:reload`
    Reopen,
    /// No mapping; not forwarded
    Drop,
}

/// The fixed raw → domain mapping table.
///
/// Order lifecycle events come out marked valid; [`dispatch`] restamps them
/// with the guard state at emission time.
pub fn route(event: RawEvent) -> Routed {
    let emitted = match event {
        RawEvent::Error(fault) => DomainEvent::MetaError(fault),
        RawEvent::Ticker(data) => DomainEvent::data(DataTopic::Ticker, data),
        RawEvent::Trades(data) => DomainEvent::data(DataTopic::Trades, data),
        RawEvent::Candles(data) => DomainEvent::data(DataTopic::Candles, data),
        RawEvent::Book(data) => DomainEvent::data(DataTopic::Book, data),
        RawEvent::ManagedBook(data) => DomainEvent::data(DataTopic::ManagedBook, data),
        RawEvent::ManagedCandles(data) => DomainEvent::data(DataTopic::ManagedCandles, data),
        RawEvent::Notification(data) => DomainEvent::data(DataTopic::Notification, data),
        RawEvent::SocketUpdated { index, state } => DomainEvent::ConnectionUpdate { index, state },
        RawEvent::ServerRestart { .. } => return Routed::ServerRestart,
        RawEvent::Reopen { .. } => return Routed::Reopen,
        RawEvent::Open { index } => DomainEvent::Open { index },
        RawEvent::AuthSuccess(payload) => DomainEvent::AuthSuccess(payload),
        RawEvent::AuthError(payload) => DomainEvent::AuthError(payload),
        RawEvent::AuthNotification(payload) => DomainEvent::AuthNotification(payload),
        RawEvent::OrderSnapshot(payload) => DomainEvent::OrderSnapshot(payload),
        RawEvent::OrderNew(payload) => DomainEvent::OrderNew {
            payload,
            valid: true,
        },
        RawEvent::OrderUpdate(payload) => DomainEvent::OrderUpdate {
            payload,
            valid: true,
        },
        RawEvent::OrderClose(payload) => DomainEvent::OrderClose {
            payload,
            valid: true,
        },
        RawEvent::RawTrades(frame) => DomainEvent::Trades(frame),
        RawEvent::RawBook(frame) => DomainEvent::Book(frame),
        RawEvent::Unrecognized { .. } => return Routed::Drop,
    };

    Routed::Emit(emitted)
}

/// Fan-out of domain events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DOMAIN_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget; having no subscribers is fine
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Apply one raw event: update the guard and publish what the table yields
pub fn dispatch(event: RawEvent, guard: &ReconnectGuard, bus: &EventBus) {
    let name = event.name().to_string();

    match route(event) {
        Routed::Emit(domain) => {
            bus.publish(domain.with_order_validity(guard.order_events_valid()));
        }
        Routed::ServerRestart => {
            guard.on_server_restart();
        }
        Routed::Reopen => {
            guard.on_reopen();
            bus.publish(DomainEvent::Reload);
        }
        Routed::Drop => debug!("Dropping unmapped transport event {}", name),
    }
}

/// Pump the transport stream into the bus until the pool's sender goes away
pub fn spawn_router(
    mut raw: broadcast::Receiver<RawEvent>,
    guard: Arc<ReconnectGuard>,
    bus: EventBus,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match raw.recv().await {
                Ok(event) => dispatch(event, &guard, &bus),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "event router lagged behind transport");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("transport event stream closed; router stopping");
                    break;
                }
            }
        }
    })
}
