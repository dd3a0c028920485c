//! Algo order adapter.
//!
//! Owns the socket pool, re-emits transport events as [`DomainEvent`]s,
//! drives the keep-alive heartbeat and schedules delayed order actions.

pub mod guard;
pub mod heartbeat;
pub mod router;
pub mod scheduler;

pub use guard::{GuardState, ReconnectGuard};
pub use heartbeat::{heartbeat_packet, Heartbeat, HEARTBEAT_INTERVAL};
pub use router::{route, EventBus, Routed};
pub use scheduler::{OrderAction, OrderActionScheduler, PendingOrderAction};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AdapterConfig;
use crate::domain::{DomainEvent, OrderAck, OrderRequest, Timeframe};
use crate::error::{AdapterError, Result};
use crate::transport::{AuthArgs, Connection, SocketPool, WsPool};

/// UI notification level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl NotifyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyLevel::Info => "info",
            NotifyLevel::Success => "success",
            NotifyLevel::Warning => "warning",
            NotifyLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for NotifyLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(NotifyLevel::Info),
            "success" => Ok(NotifyLevel::Success),
            "warning" | "warn" => Ok(NotifyLevel::Warning),
            "error" => Ok(NotifyLevel::Error),
            other => Err(format!("unknown notify level: {}", other)),
        }
    }
}

/// `[0, "n", null, {type: "ucm-notify-ui", info: {level, message}}]`
pub fn notify_packet(level: NotifyLevel, message: &str) -> Value {
    json!([0, "n", null, {
        "type": "ucm-notify-ui",
        "info": { "level": level.as_str(), "message": message }
    }])
}

/// Snapshot of adapter flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdapterState {
    pub ignore_order_events: bool,
    pub heartbeat_active: bool,
}

pub struct AlgoOrderAdapter {
    config: AdapterConfig,
    pool: Arc<dyn SocketPool>,
    bus: EventBus,
    guard: Arc<ReconnectGuard>,
    heartbeat: Heartbeat,
    scheduler: OrderActionScheduler,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl AlgoOrderAdapter {
    /// Build an adapter over any pool implementation
    pub fn new(config: AdapterConfig, pool: Arc<dyn SocketPool>) -> Result<Self> {
        config.validate()?;

        let scheduler = OrderActionScheduler::new(config.affiliate_code().map(str::to_string));

        Ok(Self {
            config,
            pool,
            bus: EventBus::default(),
            guard: Arc::new(ReconnectGuard::new()),
            heartbeat: Heartbeat::new(HEARTBEAT_INTERVAL),
            scheduler,
            router: Mutex::new(None),
        })
    }

    /// Build an adapter over the WebSocket pool
    pub fn with_ws_pool(config: AdapterConfig) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(WsPool::new(&config)?);
        Self::new(config, pool)
    }

    /// Supported candle timeframes as `(label, code)`, shortest first
    pub fn time_frames() -> Vec<(&'static str, &'static str)> {
        Timeframe::ALL
            .iter()
            .map(|tf| (tf.label(), tf.as_str()))
            .collect()
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Open the pool and start the heartbeat if enabled
    pub async fn connect(&self) -> Result<()> {
        self.config.require_credentials()?;

        // subscribe before opening so no early event is missed
        self.ensure_router()?;
        self.pool.open().await?;
        info!("Adapter connected to {}", self.config.ws_url);

        if self.config.with_heartbeat {
            self.heartbeat.start(Arc::clone(&self.pool));
        }
        Ok(())
    }

    /// Re-establish every socket. The heartbeat is restarted, never doubled.
    pub async fn reconnect(&self) -> Result<()> {
        self.heartbeat.stop();
        self.ensure_router()?;

        let result = self.pool.reconnect_all().await;

        if self.config.with_heartbeat {
            self.heartbeat.start(Arc::clone(&self.pool));
        }
        result
    }

    /// Stop the heartbeat, drop pending order actions, close all sockets
    pub async fn disconnect(&self) -> Result<()> {
        self.heartbeat.stop();

        let cancelled = self.scheduler.cancel_all();
        if cancelled > 0 {
            info!("Discarded {} pending order actions on disconnect", cancelled);
        }

        self.pool.close_all().await?;
        info!("Adapter disconnected");
        Ok(())
    }

    fn ensure_router(&self) -> Result<()> {
        let mut slot = self
            .router
            .lock()
            .map_err(|_| AdapterError::Internal("router lock poisoned".to_string()))?;

        let running = slot.as_ref().is_some_and(|task| !task.is_finished());
        if !running {
            *slot = Some(router::spawn_router(
                self.pool.events(),
                Arc::clone(&self.guard),
                self.bus.clone(),
            ));
            debug!("Event router started");
        }
        Ok(())
    }

    /// Sample a connection for one-off operations
    pub fn get_connection(&self) -> Result<Connection> {
        let index = self
            .pool
            .sample_index()
            .ok_or_else(|| AdapterError::Transport("socket pool is empty".to_string()))?;
        let socket = self
            .pool
            .socket(index)
            .ok_or(AdapterError::NotConnected(index))?;
        Ok(Connection::new(index, socket))
    }

    pub async fn subscribe(
        &self,
        connection: &Connection,
        channel: &str,
        filter: &Map<String, Value>,
    ) -> Result<()> {
        debug!("Subscribing to {} {:?} on socket {}", channel, filter, connection.index);
        connection.socket.subscribe(channel, filter).await
    }

    /// Unsubscribe from the active channel matching `channel` and `filter`.
    /// An unknown channel is logged and ignored.
    pub async fn unsubscribe(
        &self,
        connection: &Connection,
        channel: &str,
        filter: &Map<String, Value>,
    ) -> Result<()> {
        let found = connection
            .socket
            .channels()
            .into_iter()
            .find(|info| info.matches(channel, filter));

        match found {
            Some(info) => connection.socket.unsubscribe(info.chan_id).await,
            None => {
                warn!("error unsubscribing: unknown channel {} {:?}", channel, filter);
                Ok(())
            }
        }
    }

    /// Schedule an order submission after `delay`
    pub fn submit_order(
        &self,
        connection: &Connection,
        delay: Duration,
        order: impl Into<OrderRequest>,
    ) -> Result<PendingOrderAction> {
        self.scheduler
            .schedule_submit(connection, delay, order.into())
    }

    /// Schedule an order cancellation after `delay`
    pub fn cancel_order(
        &self,
        connection: &Connection,
        delay: Duration,
        order: impl Into<OrderRequest>,
    ) -> Result<PendingOrderAction> {
        self.scheduler
            .schedule_cancel(connection, delay, order.into())
    }

    pub async fn submit_order_with_delay(
        &self,
        connection: &Connection,
        delay: Duration,
        order: impl Into<OrderRequest>,
    ) -> Result<OrderAck> {
        self.submit_order(connection, delay, order)?.wait().await
    }

    pub async fn cancel_order_with_delay(
        &self,
        connection: &Connection,
        delay: Duration,
        order: impl Into<OrderRequest>,
    ) -> Result<OrderAck> {
        self.cancel_order(connection, delay, order)?.wait().await
    }

    pub async fn send_heartbeat(&self) -> Result<()> {
        heartbeat::send_heartbeat(self.pool.as_ref(), self.heartbeat.mids()).await
    }

    /// Send a packet over the first authenticated socket
    pub async fn send_with_any_connection(&self, packet: Value) -> Result<()> {
        let socket = self
            .pool
            .auth_socket()
            .ok_or(AdapterError::NoAuthenticatedConnection)?;
        socket.send(packet).await
    }

    /// Best-effort UI notification
    pub async fn notify(
        &self,
        connection: &Connection,
        level: NotifyLevel,
        message: &str,
    ) -> Result<()> {
        connection.socket.send(notify_packet(level, message)).await
    }

    /// Merged into the auth packet on the next (re)authentication
    pub fn update_auth_args(&self, args: AuthArgs) {
        self.pool.update_auth_args(args);
    }

    /// False while a venue restart window is open; order close events seen
    /// then may not be user cancellations.
    ///
    /// This is the live guard state. Events already queued on a subscriber
    /// carry their own verdict, see [`DomainEvent::order_event_valid`].
    pub fn order_events_valid(&self) -> bool {
        self.guard.order_events_valid()
    }

    pub fn state(&self) -> AdapterState {
        AdapterState {
            ignore_order_events: !self.guard.order_events_valid(),
            heartbeat_active: self.heartbeat.is_active(),
        }
    }

    pub fn guard_state(&self) -> watch::Receiver<GuardState> {
        self.guard.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DomainEvent> {
        self.bus.subscribe()
    }

    pub fn pending_actions(&self) -> usize {
        self.scheduler.pending_count()
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeat.sent_count()
    }
}

impl Drop for AlgoOrderAdapter {
    fn drop(&mut self) {
        self.heartbeat.stop();
        self.scheduler.cancel_all();
        if let Ok(mut slot) = self.router.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}
