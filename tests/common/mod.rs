//! In-process socket pool for adapter integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use venue_adapter::config::AdapterConfig;
use venue_adapter::domain::{OrderAck, OrderRequest, RawEvent};
use venue_adapter::error::{AdapterError, Result};
use venue_adapter::transport::{AuthArgs, ChannelInfo, Socket, SocketPool};

#[derive(Default)]
pub struct FakeSocket {
    pub index: usize,
    pub authenticated: AtomicBool,
    pub fail_sends: AtomicBool,
    pub sent: Mutex<Vec<Value>>,
    pub subscriptions: Mutex<Vec<(String, Map<String, Value>)>>,
    pub unsubscribed: Mutex<Vec<u64>>,
    pub channels: Mutex<Vec<ChannelInfo>>,
    pub submitted: Mutex<Vec<OrderRequest>>,
    pub cancelled: Mutex<Vec<OrderRequest>>,
}

impl FakeSocket {
    pub fn new(index: usize, authenticated: bool) -> Self {
        Self {
            index,
            authenticated: AtomicBool::new(authenticated),
            ..Self::default()
        }
    }

    pub fn add_channel(&self, chan_id: u64, channel: &str, fields: Value) {
        self.channels.lock().unwrap().push(ChannelInfo {
            chan_id,
            channel: channel.to_string(),
            fields: fields.as_object().cloned().unwrap_or_default(),
        });
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent packets of the given `[0, "n", null, {type}]` kind
    pub fn sent_of_type(&self, kind: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|packet| packet[3]["type"] == kind)
            .collect()
    }

    pub fn submitted(&self) -> Vec<OrderRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<OrderRequest> {
        self.cancelled.lock().unwrap().clone()
    }

    fn check_link(&self) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(AdapterError::NotConnected(self.index));
        }
        Ok(())
    }
}

#[async_trait]
impl Socket for FakeSocket {
    fn index(&self) -> usize {
        self.index
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn send(&self, packet: Value) -> Result<()> {
        self.check_link()?;
        self.sent.lock().unwrap().push(packet);
        Ok(())
    }

    async fn subscribe(&self, channel: &str, filter: &Map<String, Value>) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((channel.to_string(), filter.clone()));
        Ok(())
    }

    async fn unsubscribe(&self, chan_id: u64) -> Result<()> {
        self.unsubscribed.lock().unwrap().push(chan_id);
        self.channels
            .lock()
            .unwrap()
            .retain(|info| info.chan_id != chan_id);
        Ok(())
    }

    fn channels(&self) -> Vec<ChannelInfo> {
        self.channels.lock().unwrap().clone()
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        self.check_link()?;
        self.submitted.lock().unwrap().push(order.clone());
        Ok(OrderAck::new(self.index, order.cid(), order.new_order_packet()))
    }

    async fn cancel_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        self.check_link()?;
        let packet = order.cancel_packet()?;
        self.cancelled.lock().unwrap().push(order.clone());
        Ok(OrderAck::new(self.index, order.cid(), packet))
    }
}

pub struct FakePool {
    pub sockets: Vec<Arc<FakeSocket>>,
    pub event_tx: broadcast::Sender<RawEvent>,
    pub opens: AtomicUsize,
    pub reconnects: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_close: AtomicBool,
    pub auth_args: Mutex<Vec<AuthArgs>>,
    next: AtomicUsize,
}

impl FakePool {
    /// `authenticated[i]` sets the auth flag of socket `i`
    pub fn new(authenticated: &[bool]) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            sockets: authenticated
                .iter()
                .enumerate()
                .map(|(i, auth)| Arc::new(FakeSocket::new(i, *auth)))
                .collect(),
            event_tx,
            opens: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
            auth_args: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        })
    }

    pub fn emit(&self, event: RawEvent) {
        self.event_tx.send(event).expect("router should be subscribed");
    }

    pub fn socket_at(&self, index: usize) -> Arc<FakeSocket> {
        Arc::clone(&self.sockets[index])
    }
}

#[async_trait]
impl SocketPool for FakePool {
    async fn open(&self) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reconnect_all(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close_all(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(AdapterError::Transport(
                "socket 0 close frame failed".to_string(),
            ));
        }
        Ok(())
    }

    fn sample_index(&self) -> Option<usize> {
        if self.sockets.is_empty() {
            return None;
        }
        Some(self.next.fetch_add(1, Ordering::SeqCst) % self.sockets.len())
    }

    fn socket(&self, index: usize) -> Option<Arc<dyn Socket>> {
        self.sockets
            .get(index)
            .map(|s| Arc::clone(s) as Arc<dyn Socket>)
    }

    fn auth_socket(&self) -> Option<Arc<dyn Socket>> {
        self.sockets
            .iter()
            .find(|s| s.is_authenticated())
            .map(|s| Arc::clone(s) as Arc<dyn Socket>)
    }

    fn update_auth_args(&self, args: AuthArgs) {
        self.auth_args.lock().unwrap().push(args);
    }

    fn events(&self) -> broadcast::Receiver<RawEvent> {
        self.event_tx.subscribe()
    }
}

pub fn test_config(with_heartbeat: bool, affiliate_code: Option<&str>) -> AdapterConfig {
    AdapterConfig {
        with_heartbeat,
        affiliate_code: affiliate_code.map(str::to_string),
        ..AdapterConfig::with_credentials("test-key", "test-secret")
    }
}
