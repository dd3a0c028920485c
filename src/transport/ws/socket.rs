use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{interval, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::connect::WsStream;
use super::PoolShared;
use crate::domain::{ChannelData, OrderAck, OrderRequest, RawEvent, SocketState};
use crate::error::{AdapterError, Result, TransportFault};
use crate::transport::{ChannelInfo, Socket};

/// Info code the venue sends ahead of a server restart
pub const INFO_SERVER_RESTART: i64 = 20051;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// `close_all` was requested
    Closed,
    /// `reconnect_all` was requested or the watchdog fired
    Reconnect,
    /// The venue closed the stream
    Dropped,
}

/// One socket of the pool.
///
/// The connection itself lives in a task driven by [`WsSocket::run_session`];
/// this struct is the shared handle used to write packets and inspect state.
pub struct WsSocket {
    index: usize,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    state: watch::Sender<SocketState>,
    authenticated: AtomicBool,
    channels: DashMap<u64, ChannelInfo>,
    /// Subscriptions restored on every (re)open
    wanted: Mutex<Vec<(String, Map<String, Value>)>>,
    pub(crate) reconnect: Notify,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl WsSocket {
    pub fn new(index: usize) -> Self {
        let (state, _) = watch::channel(SocketState::Closed);
        let (shutdown, _) = watch::channel(false);

        Self {
            index,
            outbound: Mutex::new(None),
            state,
            authenticated: AtomicBool::new(false),
            channels: DashMap::new(),
            wanted: Mutex::new(Vec::new()),
            reconnect: Notify::new(),
            shutdown,
        }
    }

    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    /// Record a state change and publish it if it differs from the current one
    pub(crate) fn set_state(&self, state: SocketState, shared: &PoolShared) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Socket {} state {} -> {}", self.index, previous, state);
            shared.emit(RawEvent::SocketUpdated {
                index: self.index,
                state,
            });
        }
    }

    fn subscribe_packet(channel: &str, filter: &Map<String, Value>) -> Value {
        let mut packet = filter.clone();
        packet.insert("event".to_string(), json!("subscribe"));
        packet.insert("channel".to_string(), json!(channel));
        Value::Object(packet)
    }

    fn channel_meta(info: &ChannelInfo) -> Value {
        let mut meta = info.fields.clone();
        meta.insert("chanId".to_string(), json!(info.chan_id));
        meta.insert("channel".to_string(), json!(info.channel));
        Value::Object(meta)
    }

    fn write_frame(&self, frame: &Value) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        let guard = self
            .outbound
            .lock()
            .map_err(|_| AdapterError::Internal("socket outbound lock poisoned".to_string()))?;
        let tx = guard.as_ref().ok_or(AdapterError::NotConnected(self.index))?;
        tx.send(Message::Text(text))
            .map_err(|_| AdapterError::NotConnected(self.index))
    }

    pub(crate) fn reset_session_state(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
        self.channels.clear();
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = None;
        }
    }

    /// Drive one connected session until it ends.
    ///
    /// `reopened` is true for every session after the first successful one.
    pub(crate) async fn run_session(
        &self,
        stream: WsStream,
        shared: &PoolShared,
        reopened: bool,
    ) -> Result<SessionEnd> {
        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = Some(tx);
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let closing = *shutdown_rx.borrow();
        if closing {
            self.reset_session_state();
            return Ok(SessionEnd::Closed);
        }

        self.set_state(SocketState::Open, shared);
        shared.emit(RawEvent::Open { index: self.index });
        if reopened {
            info!("Socket {} reopened", self.index);
            shared.emit(RawEvent::Reopen { index: self.index });
        }

        if let Some(packet) = shared.auth_packet()? {
            write.send(Message::Text(serde_json::to_string(&packet)?)).await?;
            debug!("Socket {} sent auth request", self.index);
        }

        let restore: Vec<(String, Map<String, Value>)> = self
            .wanted
            .lock()
            .map(|wanted| wanted.clone())
            .unwrap_or_default();
        for (channel, filter) in &restore {
            let packet = Self::subscribe_packet(channel, filter);
            write.send(Message::Text(serde_json::to_string(&packet)?)).await?;
        }
        if !restore.is_empty() {
            info!("Socket {} restored {} subscriptions", self.index, restore.len());
        }

        let watchdog = shared.config.packet_watchdog;
        let mut ping_interval = interval(PING_INTERVAL);
        let mut watchdog_interval = interval((watchdog / 3).max(Duration::from_millis(100)));
        let mut last_packet = Instant::now();

        let outcome = loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_packet = Instant::now();
                            for event in self.handle_text(&text) {
                                shared.emit(event);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_packet = Instant::now();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_packet = Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("Socket {} received close frame: {:?}", self.index, frame);
                            break Ok(SessionEnd::Dropped);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(AdapterError::from(e)),
                        None => break Ok(SessionEnd::Dropped),
                    }
                }
                Some(out) = rx.recv() => {
                    write.send(out).await?;
                }
                _ = self.reconnect.notified() => {
                    info!("Socket {} reconnect requested", self.index);
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!("Socket {} close before reconnect failed: {}", self.index, e);
                    }
                    break Ok(SessionEnd::Reconnect);
                }
                changed = shutdown_rx.changed() => {
                    let closing = changed.is_err() || *shutdown_rx.borrow();
                    if closing {
                        self.set_state(SocketState::Closing, shared);
                        break match write.send(Message::Close(None)).await {
                            Ok(()) => Ok(SessionEnd::Closed),
                            Err(e) => Err(AdapterError::Transport(format!(
                                "socket {} close frame failed: {}",
                                self.index, e
                            ))),
                        };
                    }
                }
                _ = ping_interval.tick() => {
                    write.send(Message::Ping(vec![])).await?;
                }
                _ = watchdog_interval.tick() => {
                    if last_packet.elapsed() > watchdog {
                        warn!(
                            "Socket {} received no packet for {:?}; forcing reconnect",
                            self.index, watchdog
                        );
                        break Ok(SessionEnd::Reconnect);
                    }
                }
            }
        };

        self.reset_session_state();
        outcome
    }

    /// Decode one inbound text frame into raw events, updating the
    /// channel table and auth flag along the way.
    pub(crate) fn handle_text(&self, text: &str) -> Vec<RawEvent> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!("Socket {} received undecodable frame: {}", self.index, e);
                return vec![RawEvent::Error(TransportFault::new(
                    Some(self.index),
                    format!("undecodable frame: {}", e),
                ))];
            }
        };

        match value {
            Value::Object(obj) => self.handle_event(obj),
            Value::Array(frame) => self.handle_channel_frame(frame),
            other => vec![RawEvent::Unrecognized {
                name: "message".to_string(),
                payload: other,
            }],
        }
    }

    fn handle_event(&self, obj: Map<String, Value>) -> Vec<RawEvent> {
        let event = obj
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match event.as_str() {
            "info" => {
                let code = obj.get("code").and_then(Value::as_i64);
                if code == Some(INFO_SERVER_RESTART) {
                    warn!("Socket {} received server restart notice", self.index);
                    return vec![RawEvent::ServerRestart { index: self.index }];
                }
                debug!("Socket {} info: {:?}", self.index, obj);
                vec![]
            }
            "auth" => {
                let ok = obj.get("status").and_then(Value::as_str) == Some("OK");
                self.authenticated.store(ok, Ordering::SeqCst);
                if ok {
                    info!("Socket {} authenticated", self.index);
                    vec![RawEvent::AuthSuccess(Value::Object(obj))]
                } else {
                    warn!("Socket {} authentication failed: {:?}", self.index, obj.get("msg"));
                    vec![RawEvent::AuthError(Value::Object(obj))]
                }
            }
            "subscribed" => {
                let Some(chan_id) = obj.get("chanId").and_then(Value::as_u64) else {
                    return vec![];
                };
                let channel = obj
                    .get("channel")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let fields: Map<String, Value> = obj
                    .into_iter()
                    .filter(|(key, _)| !matches!(key.as_str(), "event" | "chanId" | "channel"))
                    .collect();
                debug!("Socket {} subscribed to {} ({})", self.index, channel, chan_id);
                self.channels.insert(
                    chan_id,
                    ChannelInfo {
                        chan_id,
                        channel,
                        fields,
                    },
                );
                vec![]
            }
            "unsubscribed" => {
                if let Some(chan_id) = obj.get("chanId").and_then(Value::as_u64) {
                    self.channels.remove(&chan_id);
                    debug!("Socket {} unsubscribed from {}", self.index, chan_id);
                }
                vec![]
            }
            "error" => {
                let msg = obj
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                let code = obj.get("code").cloned().unwrap_or(Value::Null);
                vec![RawEvent::Error(TransportFault::new(
                    Some(self.index),
                    format!("{} (code {})", msg, code),
                ))]
            }
            "conf" | "pong" => vec![],
            other => vec![RawEvent::Unrecognized {
                name: format!("event:{}", other),
                payload: Value::Object(obj),
            }],
        }
    }

    fn handle_channel_frame(&self, frame: Vec<Value>) -> Vec<RawEvent> {
        let Some(chan_id) = frame.first().and_then(Value::as_u64) else {
            return vec![RawEvent::Unrecognized {
                name: "frame".to_string(),
                payload: Value::Array(frame),
            }];
        };

        if frame.get(1).and_then(Value::as_str) == Some("hb") {
            return vec![];
        }

        if chan_id == 0 {
            return self.handle_auth_frame(frame);
        }

        let Some(info) = self.channels.get(&chan_id).map(|entry| entry.value().clone()) else {
            debug!("Socket {} frame for unknown channel {}", self.index, chan_id);
            return vec![RawEvent::Unrecognized {
                name: "data:unknown-channel".to_string(),
                payload: Value::Array(frame),
            }];
        };

        // Updates carry a type tag (`te`, `tu`, ...) before the payload
        let data = match frame.get(1) {
            Some(Value::String(_)) => frame.get(2).cloned().unwrap_or(Value::Null),
            Some(value) => value.clone(),
            None => Value::Null,
        };
        let channel_data = ChannelData::new(data, Some(Self::channel_meta(&info)));

        match info.channel.as_str() {
            "ticker" => vec![RawEvent::Ticker(channel_data)],
            "candles" => vec![RawEvent::Candles(channel_data)],
            "trades" => vec![
                RawEvent::RawTrades(Value::Array(frame)),
                RawEvent::Trades(channel_data),
            ],
            "book" => vec![
                RawEvent::RawBook(Value::Array(frame)),
                RawEvent::Book(channel_data),
            ],
            other => vec![RawEvent::Unrecognized {
                name: format!("data:{}", other),
                payload: Value::Array(frame),
            }],
        }
    }

    fn handle_auth_frame(&self, frame: Vec<Value>) -> Vec<RawEvent> {
        let kind = frame
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let payload = frame.get(2).cloned().unwrap_or(Value::Null);

        match kind.as_str() {
            "os" => vec![RawEvent::OrderSnapshot(payload)],
            "on" => vec![RawEvent::OrderNew(payload)],
            "ou" => vec![RawEvent::OrderUpdate(payload)],
            "oc" => vec![RawEvent::OrderClose(payload)],
            "n" => vec![
                RawEvent::AuthNotification(payload.clone()),
                RawEvent::Notification(ChannelData::new(
                    payload,
                    Some(json!({ "chanId": 0, "channel": "auth" })),
                )),
            ],
            other => vec![RawEvent::Unrecognized {
                name: format!("auth:{}", other),
                payload: Value::Array(frame),
            }],
        }
    }

    fn remember_subscription(&self, channel: &str, filter: &Map<String, Value>) {
        if let Ok(mut wanted) = self.wanted.lock() {
            let entry = (channel.to_string(), filter.clone());
            if !wanted.contains(&entry) {
                wanted.push(entry);
            }
        }
    }

    fn forget_subscription(&self, info: &ChannelInfo) {
        if let Ok(mut wanted) = self.wanted.lock() {
            wanted.retain(|(channel, filter)| !info.matches(channel, filter));
        }
    }
}

#[async_trait]
impl Socket for WsSocket {
    fn index(&self) -> usize {
        self.index
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn send(&self, packet: Value) -> Result<()> {
        self.write_frame(&packet)
    }

    async fn subscribe(&self, channel: &str, filter: &Map<String, Value>) -> Result<()> {
        self.remember_subscription(channel, filter);

        match self.write_frame(&Self::subscribe_packet(channel, filter)) {
            Ok(()) => Ok(()),
            Err(AdapterError::NotConnected(_)) => {
                debug!(
                    "Socket {} not connected; {} subscription queued for next open",
                    self.index, channel
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn unsubscribe(&self, chan_id: u64) -> Result<()> {
        if let Some(info) = self.channels.get(&chan_id).map(|entry| entry.value().clone()) {
            self.forget_subscription(&info);
        }
        self.write_frame(&json!({ "event": "unsubscribe", "chanId": chan_id }))
    }

    fn channels(&self) -> Vec<ChannelInfo> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let frame = json!([0, "on", null, order.new_order_packet()]);
        self.write_frame(&frame)?;
        debug!("Socket {} submitted order cid={:?}", self.index, order.cid());
        Ok(OrderAck::new(self.index, order.cid(), frame))
    }

    async fn cancel_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let frame = json!([0, "oc", null, order.cancel_packet()?]);
        self.write_frame(&frame)?;
        debug!("Socket {} cancelled order cid={:?}", self.index, order.cid());
        Ok(OrderAck::new(self.index, order.cid(), frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribed(socket: &WsSocket, chan_id: u64, channel: &str, symbol: &str) {
        let events = socket.handle_text(
            &json!({
                "event": "subscribed",
                "channel": channel,
                "chanId": chan_id,
                "symbol": symbol,
            })
            .to_string(),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn server_restart_info_is_recognised() {
        let socket = WsSocket::new(1);
        let events = socket.handle_text(r#"{"event":"info","code":20051,"msg":"Stopping"}"#);
        assert_eq!(events, vec![RawEvent::ServerRestart { index: 1 }]);

        let events = socket.handle_text(r#"{"event":"info","version":2,"platform":{"status":1}}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn auth_response_sets_flag() {
        let socket = WsSocket::new(0);
        assert!(!socket.is_authenticated());

        let events = socket.handle_text(r#"{"event":"auth","status":"OK","userId":1}"#);
        assert!(matches!(events.as_slice(), [RawEvent::AuthSuccess(_)]));
        assert!(socket.is_authenticated());

        let events = socket.handle_text(r#"{"event":"auth","status":"FAILED","msg":"apikey: invalid"}"#);
        assert!(matches!(events.as_slice(), [RawEvent::AuthError(_)]));
        assert!(!socket.is_authenticated());
    }

    #[test]
    fn subscribed_channels_are_tracked_and_removed() {
        let socket = WsSocket::new(0);
        subscribed(&socket, 17, "trades", "tBTCUSD");

        let channels = socket.channels();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].channel, "trades");
        assert_eq!(channels[0].fields.get("symbol"), Some(&json!("tBTCUSD")));

        socket.handle_text(r#"{"event":"unsubscribed","status":"OK","chanId":17}"#);
        assert!(socket.channels().is_empty());
    }

    #[test]
    fn trade_updates_produce_raw_and_data_events() {
        let socket = WsSocket::new(0);
        subscribed(&socket, 17, "trades", "tBTCUSD");

        let events = socket.handle_text(r#"[17,"te",[401597395,1574694478808,0.005,7245.3]]"#);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], RawEvent::RawTrades(Value::Array(f)) if f.len() == 3));
        match &events[1] {
            RawEvent::Trades(data) => {
                assert_eq!(data.data, json!([401597395u64, 1574694478808u64, 0.005, 7245.3]));
                let meta = data.meta.as_ref().unwrap();
                assert_eq!(meta["chanId"], 17);
                assert_eq!(meta["symbol"], "tBTCUSD");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn heartbeat_frames_are_consumed() {
        let socket = WsSocket::new(0);
        subscribed(&socket, 5, "ticker", "tBTCUSD");
        assert!(socket.handle_text(r#"[5,"hb"]"#).is_empty());
        assert!(socket.handle_text(r#"[0,"hb"]"#).is_empty());
    }

    #[test]
    fn auth_channel_order_frames() {
        let socket = WsSocket::new(0);
        assert!(matches!(
            socket.handle_text(r#"[0,"oc",[1,2,3]]"#).as_slice(),
            [RawEvent::OrderClose(_)]
        ));
        assert!(matches!(
            socket.handle_text(r#"[0,"os",[]]"#).as_slice(),
            [RawEvent::OrderSnapshot(_)]
        ));

        let events = socket.handle_text(r#"[0,"n",[1,"on-req",null,null,[],null,"SUCCESS","ok"]]"#);
        assert!(matches!(
            events.as_slice(),
            [RawEvent::AuthNotification(_), RawEvent::Notification(_)]
        ));

        let events = socket.handle_text(r#"[0,"ws",[]]"#);
        assert!(matches!(events.as_slice(), [RawEvent::Unrecognized { name, .. }] if name == "auth:ws"));
    }

    #[test]
    fn frames_for_unknown_channels_are_unrecognized() {
        let socket = WsSocket::new(0);
        let events = socket.handle_text(r#"[99,[1,2,3]]"#);
        assert!(matches!(events.as_slice(), [RawEvent::Unrecognized { .. }]));
    }

    #[tokio::test]
    async fn writes_fail_when_not_connected() {
        let socket = WsSocket::new(3);
        let err = socket.send(json!([0, "n", null, {}])).await.unwrap_err();
        assert!(matches!(err, AdapterError::NotConnected(3)));

        // subscriptions are queued instead
        assert!(socket.subscribe("trades", &Map::new()).await.is_ok());
    }

    #[tokio::test]
    async fn submit_writes_on_frame() {
        let socket = WsSocket::new(0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        *socket.outbound.lock().unwrap() = Some(tx);

        let mut payload = Map::new();
        payload.insert("cid".to_string(), json!(11));
        let ack = socket
            .submit_order(&OrderRequest::Raw(payload))
            .await
            .unwrap();
        assert_eq!(ack.cid, Some(11));

        let Some(Message::Text(text)) = rx.recv().await else {
            panic!("expected text frame");
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame, json!([0, "on", null, { "cid": 11 }]));
    }
}
