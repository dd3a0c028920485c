//! Delayed, cancellable order submission and cancellation.
//!
//! Every scheduled action owns a registry slot. Firing and cancellation both
//! remove the slot, and only the party that removes it gets to act, so an
//! action transmits at most once and never after it was cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::domain::{OrderAck, OrderRequest};
use crate::error::{AdapterError, Result};
use crate::transport::{Connection, Socket};

type Registry = Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderAction {
    Submit,
    Cancel,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Submit => "submit",
            OrderAction::Cancel => "cancel",
        }
    }
}

/// Handle to a scheduled order action
#[derive(Debug)]
pub struct PendingOrderAction {
    id: u64,
    action: OrderAction,
    registry: Registry,
    result: oneshot::Receiver<Result<OrderAck>>,
}

impl PendingOrderAction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn action(&self) -> OrderAction {
        self.action
    }

    /// Cancel before the delay elapses. Returns false if the action already
    /// fired or was cancelled.
    pub fn cancel(&self) -> bool {
        remove_slot(&self.registry, self.id)
    }

    /// Wait for the transmit result. Cancelled actions yield
    /// [`AdapterError::Cancelled`].
    pub async fn wait(self) -> Result<OrderAck> {
        self.result.await.map_err(|_| AdapterError::Cancelled)?
    }
}

fn remove_slot(registry: &Registry, id: u64) -> bool {
    match registry.lock() {
        Ok(mut pending) => pending.remove(&id).is_some(),
        Err(_) => {
            warn!("pending action registry poisoned");
            false
        }
    }
}

#[derive(Debug)]
pub struct OrderActionScheduler {
    affiliate_code: Option<String>,
    pending: Registry,
    next_id: AtomicU64,
}

impl OrderActionScheduler {
    pub fn new(affiliate_code: Option<String>) -> Self {
        Self {
            affiliate_code: affiliate_code.filter(|code| !code.is_empty()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn affiliate_code(&self) -> Option<&str> {
        self.affiliate_code.as_deref()
    }

    /// Actions scheduled but neither fired nor cancelled
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Schedule a submit after `delay`, attaching the affiliate code first
    pub fn schedule_submit(
        &self,
        connection: &Connection,
        delay: Duration,
        mut order: OrderRequest,
    ) -> Result<PendingOrderAction> {
        if let Some(code) = &self.affiliate_code {
            order.apply_affiliate_code(code);
        }
        self.schedule(OrderAction::Submit, connection, delay, order)
    }

    /// Schedule a cancel after `delay`
    pub fn schedule_cancel(
        &self,
        connection: &Connection,
        delay: Duration,
        order: OrderRequest,
    ) -> Result<PendingOrderAction> {
        self.schedule(OrderAction::Cancel, connection, delay, order)
    }

    /// Invalidate every pending action without transmitting. Returns how many
    /// were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained = match self.pending.lock() {
            Ok(mut pending) => pending.drain().count(),
            Err(_) => 0,
        };
        if drained > 0 {
            debug!("Cancelled {} pending order actions", drained);
        }
        drained
    }

    fn schedule(
        &self,
        action: OrderAction,
        connection: &Connection,
        delay: Duration,
        order: OrderRequest,
    ) -> Result<PendingOrderAction> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let (result_tx, result_rx) = oneshot::channel();

        self.pending
            .lock()
            .map_err(|_| AdapterError::Internal("pending action registry poisoned".to_string()))?
            .insert(id, cancel_tx);

        let registry = Arc::clone(&self.pending);
        let socket: Arc<dyn Socket> = Arc::clone(&connection.socket);
        let index = connection.index;

        debug!(
            "Scheduled order {} #{} on socket {} in {:?}",
            action.as_str(),
            id,
            index,
            delay
        );

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                // explicit cancel or teardown dropped the sender
                _ = &mut cancel_rx => return,
            }

            if !remove_slot(&registry, id) {
                return;
            }

            let result = match action {
                OrderAction::Submit => socket.submit_order(&order).await,
                OrderAction::Cancel => socket.cancel_order(&order).await,
            };
            if let Err(e) = &result {
                warn!("Order {} #{} failed on socket {}: {}", action.as_str(), id, index, e);
            }
            let _ = result_tx.send(result);
        });

        Ok(PendingOrderAction {
            id,
            action,
            registry: Arc::clone(&self.pending),
            result: result_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Order;
    use crate::transport::MockSocket;
    use rust_decimal_macros::dec;
    use serde_json::{json, Map};
    use tokio_test::{assert_err, assert_ok};

    fn connection(socket: MockSocket) -> Connection {
        Connection::new(0, Arc::new(socket))
    }

    fn ack(order: &OrderRequest) -> Result<OrderAck> {
        Ok(OrderAck::new(0, order.cid(), json!([])))
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_action_never_transmits() {
        let mut socket = MockSocket::new();
        socket.expect_submit_order().times(0);
        let conn = connection(socket);

        let scheduler = OrderActionScheduler::new(None);
        let order = Order::exchange_limit("tBTCUSD", dec!(0.1), dec!(30000));
        let pending = scheduler
            .schedule_submit(&conn, Duration::from_millis(1000), order.into())
            .unwrap();

        assert!(pending.cancel());
        assert!(!pending.cancel());
        tokio::time::advance(Duration::from_millis(2000)).await;

        assert_eq!(scheduler.pending_count(), 0);
        assert!(matches!(pending.wait().await, Err(AdapterError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay_with_affiliate_code() {
        let mut socket = MockSocket::new();
        socket
            .expect_submit_order()
            .withf(|order| order.affiliate_code() == Some("aff-1"))
            .times(1)
            .returning(ack);
        let conn = connection(socket);

        let scheduler = OrderActionScheduler::new(Some("aff-1".to_string()));
        let mut raw = Map::new();
        raw.insert("cid".to_string(), json!(7));
        let pending = scheduler
            .schedule_submit(&conn, Duration::from_millis(500), raw.into())
            .unwrap();
        assert_eq!(scheduler.pending_count(), 1);

        let ack = assert_ok!(pending.wait().await);
        assert_eq!(ack.cid, Some(7));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_affiliate_code_leaves_payload_untouched() {
        let mut socket = MockSocket::new();
        socket
            .expect_submit_order()
            .withf(|order| match order {
                OrderRequest::Raw(payload) => !payload.contains_key("meta"),
                OrderRequest::Model(_) => false,
            })
            .times(1)
            .returning(ack);
        let conn = connection(socket);

        let scheduler = OrderActionScheduler::new(Some(String::new()));
        assert!(scheduler.affiliate_code().is_none());
        let pending = scheduler
            .schedule_submit(&conn, Duration::ZERO, Map::new().into())
            .unwrap();
        assert_ok!(pending.wait().await);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_action_skips_affiliate_and_propagates_errors() {
        let mut socket = MockSocket::new();
        socket
            .expect_cancel_order()
            .withf(|order| order.affiliate_code().is_none())
            .times(1)
            .returning(|_| Err(AdapterError::NotConnected(0)));
        let conn = connection(socket);

        let scheduler = OrderActionScheduler::new(Some("aff-1".to_string()));
        let mut raw = Map::new();
        raw.insert("id".to_string(), json!(123));
        let pending = scheduler
            .schedule_cancel(&conn, Duration::from_millis(10), raw.into())
            .unwrap();
        assert_eq!(pending.action(), OrderAction::Cancel);

        let err = assert_err!(pending.wait().await);
        assert!(matches!(err, AdapterError::NotConnected(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_invalidates_everything() {
        let mut socket = MockSocket::new();
        socket.expect_submit_order().times(0);
        socket.expect_cancel_order().times(0);
        let conn = connection(socket);

        let scheduler = OrderActionScheduler::new(None);
        let a = scheduler
            .schedule_submit(&conn, Duration::from_secs(1), Map::new().into())
            .unwrap();
        let b = scheduler
            .schedule_cancel(&conn, Duration::from_secs(2), Map::new().into())
            .unwrap();
        assert_ne!(a.id(), b.id());

        assert_eq!(scheduler.cancel_all(), 2);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(matches!(a.wait().await, Err(AdapterError::Cancelled)));
        assert!(matches!(b.wait().await, Err(AdapterError::Cancelled)));
    }
}
