//! Order-event suppression across venue restarts.
//!
//! When the venue announces a restart, the dead man switch cancels every
//! resting order and those `order:close` events arrive before the socket
//! drops. They cannot be told apart from user cancellations, so consumers
//! must treat order lifecycle events as invalid until the socket reopens.

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    Normal,
    Suppressing,
}

#[derive(Debug)]
pub struct ReconnectGuard {
    state: watch::Sender<GuardState>,
}

impl Default for ReconnectGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectGuard {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GuardState::Normal);
        Self { state }
    }

    /// Server restart notice: enter the suppression window.
    ///
    /// Returns true when this call changed the state.
    pub fn on_server_restart(&self) -> bool {
        let previous = self.state.send_replace(GuardState::Suppressing);
        if previous == GuardState::Normal {
            warn!("Venue restart announced; order events suppressed until reopen");
        }
        previous == GuardState::Normal
    }

    /// Socket reopened: leave the suppression window.
    ///
    /// Returns true when this call changed the state. Callers emit
    /// `meta:reload` on every reopen regardless.
    pub fn on_reopen(&self) -> bool {
        let previous = self.state.send_replace(GuardState::Normal);
        if previous == GuardState::Suppressing {
            info!("Socket reopened; order events valid again");
        }
        previous == GuardState::Suppressing
    }

    pub fn state(&self) -> GuardState {
        *self.state.borrow()
    }

    pub fn order_events_valid(&self) -> bool {
        self.state() == GuardState::Normal
    }

    pub fn subscribe(&self) -> watch::Receiver<GuardState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_then_reopen_round_trip() {
        let guard = ReconnectGuard::new();
        assert!(guard.order_events_valid());

        assert!(guard.on_server_restart());
        assert!(!guard.order_events_valid());
        // repeated notices keep the window open
        assert!(!guard.on_server_restart());
        assert_eq!(guard.state(), GuardState::Suppressing);

        assert!(guard.on_reopen());
        assert!(guard.order_events_valid());
        assert!(!guard.on_reopen());
    }

    #[tokio::test]
    async fn observers_see_transitions() {
        let guard = ReconnectGuard::new();
        let mut rx = guard.subscribe();

        guard.on_server_restart();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), GuardState::Suppressing);

        guard.on_reopen();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), GuardState::Normal);
    }
}
