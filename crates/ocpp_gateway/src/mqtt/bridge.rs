use crate::buffer::OutboundBuffer;
use crate::mqtt::SubscriptionId;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("broker connection is down")]
    NotConnected,
    #[error("broker request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Waiting before the next connection attempt.
    Backoff,
    /// Shut down; no further attempts.
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Backoff => "backoff",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the broker connection.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeStatus {
    pub state: ConnectionState,
    /// When the current outage started; `None` while connected.
    pub disconnected_since: Option<Instant>,
    /// Successful connections so far, including the first.
    pub connections: u64,
    pub last_error: Option<String>,
}

impl BridgeStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn outage_duration(&self) -> Option<Duration> {
        self.disconnected_since.map(|since| since.elapsed())
    }
}

/// Connection state shared between a bridge handle and its event loop.
pub struct BridgeState {
    status: RwLock<BridgeStatus>,
}

impl BridgeState {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(BridgeStatus {
                state: ConnectionState::Connecting,
                disconnected_since: Some(Instant::now()),
                connections: 0,
                last_error: None,
            }),
        }
    }

    pub fn snapshot(&self) -> BridgeStatus {
        self.status.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.read().is_connected()
    }

    pub fn mark_connected(&self) {
        let mut status = self.status.write();
        status.state = ConnectionState::Connected;
        status.disconnected_since = None;
        status.connections += 1;
        status.last_error = None;
    }

    pub fn mark_connecting(&self) {
        let mut status = self.status.write();
        status.state = ConnectionState::Connecting;
        status.disconnected_since.get_or_insert_with(Instant::now);
    }

    pub fn mark_backoff(&self, error: impl Into<String>) {
        let mut status = self.status.write();
        status.state = ConnectionState::Backoff;
        status.disconnected_since.get_or_insert_with(Instant::now);
        status.last_error = Some(error.into());
    }

    pub fn mark_stopped(&self) {
        let mut status = self.status.write();
        status.state = ConnectionState::Stopped;
        status.disconnected_since.get_or_insert_with(Instant::now);
    }
}

impl Default for BridgeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared broker connection used by every session.
///
/// All operations return immediately: publishes fail fast while the broker is
/// unreachable and subscriptions are remembered and replayed on reconnect.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait MessageBridge: Send + Sync {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BridgeError>;

    /// Routes publications on `topic` into `sink` until unsubscribed or replaced.
    fn subscribe(
        &self,
        topic: &str,
        device_id: &str,
        sink: Arc<OutboundBuffer>,
    ) -> Result<SubscriptionId, BridgeError>;

    /// Drops the route if `id` still owns it.
    fn unsubscribe(&self, topic: &str, id: SubscriptionId);

    fn status(&self) -> BridgeStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_transitions_track_outage() {
        let state = BridgeState::new();
        assert_eq!(state.snapshot().state, ConnectionState::Connecting);
        assert!(state.snapshot().disconnected_since.is_some());

        state.mark_connected();
        let status = state.snapshot();
        assert!(status.is_connected());
        assert!(status.outage_duration().is_none());
        assert_eq!(status.connections, 1);

        state.mark_backoff("connection reset");
        let outage_start = state.snapshot().disconnected_since;
        assert!(outage_start.is_some());
        assert_eq!(state.snapshot().last_error.as_deref(), Some("connection reset"));

        state.mark_connecting();
        assert_eq!(state.snapshot().disconnected_since, outage_start);

        state.mark_connected();
        assert_eq!(state.snapshot().connections, 2);
        assert!(state.snapshot().last_error.is_none());
    }

    #[test]
    fn test_stopped_is_not_connected() {
        let state = BridgeState::new();
        state.mark_connected();
        state.mark_stopped();
        assert!(!state.is_connected());
        assert_eq!(state.snapshot().state.to_string(), "stopped");
    }
}
