use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{AdapterError, Result};
use crate::signing::MonotonicMillis;
use crate::transport::SocketPool;

/// Keep-alive period while heartbeats are enabled
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2500);

/// `[0, "n", null, {mid, type: "ucm-hb", info: {}}]`
pub fn heartbeat_packet(mid: u64) -> Value {
    json!([0, "n", null, { "mid": mid, "type": "ucm-hb", "info": {} }])
}

/// Send one heartbeat over the first authenticated socket
pub async fn send_heartbeat(pool: &dyn SocketPool, mids: &MonotonicMillis) -> Result<()> {
    let socket = pool
        .auth_socket()
        .ok_or(AdapterError::NoAuthenticatedConnection)?;
    socket.send(heartbeat_packet(mids.next())).await
}

/// Periodic heartbeat task. At most one timer runs at any time.
#[derive(Debug)]
pub struct Heartbeat {
    period: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    mids: Arc<MonotonicMillis>,
    sent: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            task: Mutex::new(None),
            mids: Arc::new(MonotonicMillis::new()),
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn mids(&self) -> &MonotonicMillis {
        &self.mids
    }

    /// Heartbeats successfully written since construction
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// (Re)start the timer; any previous timer is stopped first
    pub fn start(&self, pool: Arc<dyn SocketPool>) {
        let Ok(mut slot) = self.task.lock() else {
            warn!("heartbeat lock poisoned; timer not started");
            return;
        };
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let period = self.period;
        let mids = Arc::clone(&self.mids);
        let sent = Arc::clone(&self.sent);

        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match send_heartbeat(pool.as_ref(), &mids).await {
                    Ok(()) => {
                        sent.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(AdapterError::NoAuthenticatedConnection) => {
                        debug!("No authenticated socket; heartbeat skipped");
                    }
                    Err(e) => warn!("Heartbeat send failed: {}", e),
                }
            }
        }));
        debug!("Heartbeat started ({:?})", period);
    }

    /// Stop the timer. Returns true if one was running.
    pub fn stop(&self) -> bool {
        let Ok(mut slot) = self.task.lock() else {
            return false;
        };
        match slot.take() {
            Some(task) => {
                task.abort();
                debug!("Heartbeat stopped");
                true
            }
            None => false,
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
