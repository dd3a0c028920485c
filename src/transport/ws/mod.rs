//! WebSocket socket pool.
//!
//! Each socket runs in its own task: connect, authenticate, restore
//! subscriptions, then pump frames until the session ends. Dropped sessions
//! are retried with linear backoff plus jitter.

mod connect;
mod socket;

pub use connect::connect_websocket;
pub use socket::{WsSocket, INFO_SERVER_RESTART};

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::AdapterConfig;
use crate::domain::{RawEvent, SocketState};
use crate::error::{AdapterError, Result, TransportFault};
use crate::signing::{ApiCredentials, HmacAuth};
use crate::transport::{AuthArgs, Socket, SocketPool};
use socket::SessionEnd;

/// Raw events buffered per subscriber before it starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Maximum reconnection delay
const MAX_RECONNECT_DELAY_SECS: u64 = 60;

/// Transport settings derived from [`AdapterConfig`]
#[derive(Debug, Clone)]
pub struct WsPoolConfig {
    pub url: Url,
    pub proxy: Option<String>,
    pub connections: usize,
    pub packet_watchdog: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl WsPoolConfig {
    pub fn from_adapter_config(config: &AdapterConfig) -> Result<Self> {
        Ok(Self {
            url: Url::parse(&config.ws_url)?,
            proxy: config.proxy.clone().filter(|p| !p.trim().is_empty()),
            connections: config.connections.max(1),
            packet_watchdog: Duration::from_millis(config.packet_watchdog_ms),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(MAX_RECONNECT_DELAY_SECS),
        })
    }

    /// Backoff before the given reconnect attempt, jitter excluded
    pub fn backoff(&self, attempt: u32) -> Duration {
        (self.reconnect_delay * attempt).min(self.max_reconnect_delay)
    }
}

/// State shared between the pool handle and its socket tasks
pub(crate) struct PoolShared {
    pub(crate) config: WsPoolConfig,
    auth: Option<HmacAuth>,
    auth_args: RwLock<AuthArgs>,
    event_tx: broadcast::Sender<RawEvent>,
}

impl PoolShared {
    pub(crate) fn emit(&self, event: RawEvent) {
        // No receivers is not an error; the adapter may not be listening yet
        let _ = self.event_tx.send(event);
    }

    /// Signed auth packet for a fresh session, `None` without credentials
    pub(crate) fn auth_packet(&self) -> Result<Option<Value>> {
        let Some(auth) = &self.auth else {
            return Ok(None);
        };
        let args = self
            .auth_args
            .read()
            .map_err(|_| AdapterError::Internal("auth args lock poisoned".to_string()))?
            .clone();
        auth.build_auth_packet(&args).map(Some)
    }
}

/// Production [`SocketPool`] over tokio-tungstenite
pub struct WsPool {
    shared: Arc<PoolShared>,
    sockets: Vec<Arc<WsSocket>>,
    tasks: Mutex<Vec<JoinHandle<Result<()>>>>,
    next_sample: AtomicUsize,
}

impl WsPool {
    pub fn new(config: &AdapterConfig) -> Result<Self> {
        let pool_config = WsPoolConfig::from_adapter_config(config)?;

        let auth = config.has_credentials().then(|| {
            HmacAuth::new(ApiCredentials::new(
                config.api_key.clone(),
                config.api_secret.clone(),
            ))
        });
        let auth_args = AuthArgs {
            dms: config.dms,
            ..AuthArgs::default()
        };

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let sockets = (0..pool_config.connections)
            .map(|index| Arc::new(WsSocket::new(index)))
            .collect();

        Ok(Self {
            shared: Arc::new(PoolShared {
                config: pool_config,
                auth,
                auth_args: RwLock::new(auth_args),
                event_tx,
            }),
            sockets,
            tasks: Mutex::new(Vec::new()),
            next_sample: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn socket_states(&self) -> Vec<SocketState> {
        self.sockets.iter().map(|s| s.state()).collect()
    }
}

/// Connection loop of one socket; returns once the pool is closed, with an
/// error if the session could not be shut down cleanly
async fn run_socket(socket: Arc<WsSocket>, shared: Arc<PoolShared>) -> Result<()> {
    let index = socket.index();
    let mut attempt: u32 = 0;
    let mut opened_before = false;
    let mut shutdown_rx = socket.shutdown.subscribe();

    loop {
        let closing = *shutdown_rx.borrow();
        if closing {
            break;
        }

        let connecting = if opened_before {
            SocketState::Reconnecting
        } else {
            SocketState::Connecting
        };
        socket.set_state(connecting, &shared);
        info!("Socket {} connecting to {}", index, shared.config.url);

        let end = match connect_websocket(&shared.config.url, shared.config.proxy.as_deref()).await
        {
            Ok(stream) => {
                let reopened = opened_before;
                opened_before = true;
                attempt = 0;
                let end = socket.run_session(stream, &shared, reopened).await;
                socket.reset_session_state();
                match end {
                    Err(e) if *shutdown_rx.borrow() => {
                        error!("Socket {} failed to close: {}", index, e);
                        socket.set_state(SocketState::Closed, &shared);
                        return Err(e);
                    }
                    end => end,
                }
            }
            Err(e) => Err(e),
        };

        match end {
            Ok(SessionEnd::Closed) => break,
            Ok(SessionEnd::Reconnect) => {
                debug!("Socket {} reconnecting immediately", index);
                continue;
            }
            Ok(SessionEnd::Dropped) => {
                warn!("Socket {} connection dropped by venue", index);
                attempt = attempt.saturating_add(1);
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                error!("Socket {} error (attempt {}): {}", index, attempt, e);
                shared.emit(RawEvent::Error(TransportFault::from_error(Some(index), &e)));
            }
        }

        socket.set_state(SocketState::Reconnecting, &shared);

        let delay = shared.config.backoff(attempt);
        let jitter_range = (delay.as_millis() as u64 / 4).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_range));
        let final_delay = delay + jitter;

        info!(
            "Reconnecting socket {} in {:?} (attempt {})",
            index,
            final_delay,
            attempt + 1
        );

        tokio::select! {
            _ = tokio::time::sleep(final_delay) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    socket.set_state(SocketState::Closed, &shared);
    info!("Socket {} closed", index);
    Ok(())
}

#[async_trait]
impl SocketPool for WsPool {
    async fn open(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        if !tasks.is_empty() {
            debug!("Socket pool already open");
            return Ok(());
        }

        info!("Opening socket pool with {} connections", self.sockets.len());
        for socket in &self.sockets {
            socket.shutdown.send_replace(false);
            tasks.push(tokio::spawn(run_socket(
                Arc::clone(socket),
                Arc::clone(&self.shared),
            )));
        }
        Ok(())
    }

    async fn reconnect_all(&self) -> Result<()> {
        let running = {
            let mut tasks = self.tasks.lock().await;
            tasks.retain(|task| !task.is_finished());
            !tasks.is_empty()
        };
        if !running {
            return self.open().await;
        }

        for socket in &self.sockets {
            if socket.state() == SocketState::Open {
                socket.reconnect.notify_one();
            }
        }
        Ok(())
    }

    async fn close_all(&self) -> Result<()> {
        for socket in &self.sockets {
            socket.shutdown.send_replace(true);
        }

        let tasks: Vec<JoinHandle<Result<()>>> = self.tasks.lock().await.drain(..).collect();
        let mut failures = Vec::new();
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e.to_string()),
                Err(e) => {
                    warn!("Socket task ended abnormally: {}", e);
                    failures.push(format!("socket task ended abnormally: {}", e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(AdapterError::Transport(format!(
                "socket pool close failed: {}",
                failures.join("; ")
            )));
        }
        info!("Socket pool closed");
        Ok(())
    }

    fn sample_index(&self) -> Option<usize> {
        if self.sockets.is_empty() {
            return None;
        }
        Some(self.next_sample.fetch_add(1, Ordering::Relaxed) % self.sockets.len())
    }

    fn socket(&self, index: usize) -> Option<Arc<dyn Socket>> {
        self.sockets
            .get(index)
            .map(|socket| Arc::clone(socket) as Arc<dyn Socket>)
    }

    fn auth_socket(&self) -> Option<Arc<dyn Socket>> {
        self.sockets
            .iter()
            .find(|socket| socket.is_authenticated())
            .map(|socket| Arc::clone(socket) as Arc<dyn Socket>)
    }

    fn update_auth_args(&self, args: AuthArgs) {
        match self.shared.auth_args.write() {
            Ok(mut current) => {
                if args.dms.is_some() {
                    current.dms = args.dms;
                }
                current.extra.extend(args.extra);
                debug!("Auth args updated: {:?}", *current);
            }
            Err(_) => error!("auth args lock poisoned; update dropped"),
        }
    }

    fn events(&self) -> broadcast::Receiver<RawEvent> {
        self.shared.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(connections: usize) -> AdapterConfig {
        AdapterConfig {
            connections,
            ..AdapterConfig::with_credentials("key", "secret")
        }
    }

    #[test]
    fn backoff_grows_linearly_and_caps() {
        let cfg = WsPoolConfig::from_adapter_config(&AdapterConfig::default()).unwrap();
        assert_eq!(cfg.backoff(0), Duration::ZERO);
        assert_eq!(cfg.backoff(3), Duration::from_secs(3));
        assert_eq!(cfg.backoff(500), Duration::from_secs(60));
    }

    #[test]
    fn sample_index_round_robins() {
        let pool = WsPool::new(&config(3)).unwrap();
        let picks: Vec<_> = (0..4).filter_map(|_| pool.sample_index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn no_auth_socket_before_authentication() {
        let pool = WsPool::new(&config(2)).unwrap();
        assert!(pool.auth_socket().is_none());
        assert_eq!(pool.socket(1).map(|s| s.index()), Some(1));
        assert!(pool.socket(2).is_none());
        assert!(pool
            .socket_states()
            .iter()
            .all(|s| *s == SocketState::Closed));
    }

    #[test]
    fn auth_args_are_merged_into_auth_packet() {
        let pool = WsPool::new(&config(1)).unwrap();
        let mut extra = serde_json::Map::new();
        extra.insert("calc".to_string(), json!(1));
        pool.update_auth_args(AuthArgs { dms: Some(4), extra });

        let packet = pool.shared.auth_packet().unwrap().unwrap();
        assert_eq!(packet["dms"], 4);
        assert_eq!(packet["calc"], 1);
        assert_eq!(packet["apiKey"], "key");
    }

    #[tokio::test]
    async fn close_all_reports_failed_socket_tasks() {
        let pool = WsPool::new(&config(3)).unwrap();
        {
            let mut tasks = pool.tasks.lock().await;
            tasks.push(tokio::spawn(async { Ok(()) }));
            tasks.push(tokio::spawn(async {
                Err(AdapterError::Transport("socket 1 close frame failed".to_string()))
            }));
            tasks.push(tokio::spawn(async { panic!("socket task blew up") }));
        }

        let err = pool.close_all().await.unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, AdapterError::Transport(_)));
        assert!(message.contains("socket 1 close frame failed"));
        assert!(message.contains("ended abnormally"));

        // every task was joined; a second close is clean
        assert!(pool.tasks.lock().await.is_empty());
        assert!(pool.close_all().await.is_ok());
    }

    #[tokio::test]
    async fn close_all_on_idle_pool_is_ok() {
        let pool = WsPool::new(&config(2)).unwrap();
        assert!(pool.close_all().await.is_ok());
    }

    #[test]
    fn no_auth_packet_without_credentials() {
        let pool = WsPool::new(&AdapterConfig::default()).unwrap();
        assert!(pool.shared.auth_packet().unwrap().is_none());
    }
}
