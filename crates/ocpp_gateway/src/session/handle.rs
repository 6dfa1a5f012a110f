use crate::auth::DeviceIdentity;
use crate::buffer::OutboundBuffer;
use crate::session::CloseReason;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Handshaking,
    Active,
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Handshaking => "handshaking",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    /// A newer connection for the same charge point took over.
    Evicted,
    /// The gateway is shutting down.
    Shutdown,
    /// The broker has been unreachable for longer than tolerated.
    BrokerOutage,
}

/// Per-session relay counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    publish_failures: AtomicU64,
    encode_failures: AtomicU64,
    inbound_sequence: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatsSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub publish_failures: u64,
    pub encode_failures: u64,
    pub dropped_outbound: u64,
}

impl SessionStats {
    /// Next device→cloud sequence number, starting at 1.
    pub fn next_inbound_sequence(&self) -> u64 {
        self.inbound_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared view of one device connection.
///
/// The relay tasks own the socket; everything else (registry, supervisor,
/// a newer connection for the same id) interacts with the session through
/// this handle.
pub struct SessionHandle {
    session_id: u64,
    identity: DeviceIdentity,
    outbound: Arc<OutboundBuffer>,
    state: watch::Sender<SessionState>,
    drain: CancellationToken,
    kill: CancellationToken,
    drain_reason: Mutex<Option<DrainReason>>,
    close_reason: Mutex<Option<CloseReason>>,
    stats: SessionStats,
    opened_at: DateTime<Utc>,
}

impl SessionHandle {
    pub fn new(identity: DeviceIdentity, outbound: Arc<OutboundBuffer>) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Handshaking);
        Arc::new(Self {
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            outbound,
            state,
            drain: CancellationToken::new(),
            kill: CancellationToken::new(),
            drain_reason: Mutex::new(None),
            close_reason: Mutex::new(None),
            stats: SessionStats::default(),
            opened_at: Utc::now(),
        })
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn device_id(&self) -> &str {
        &self.identity.id
    }

    pub fn outbound(&self) -> &Arc<OutboundBuffer> {
        &self.outbound
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn drain_reason(&self) -> Option<DrainReason> {
        *self.drain_reason.lock()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    pub fn stats_snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            frames_in: self.stats.frames_in.load(Ordering::Relaxed),
            frames_out: self.stats.frames_out.load(Ordering::Relaxed),
            publish_failures: self.stats.publish_failures.load(Ordering::Relaxed),
            encode_failures: self.stats.encode_failures.load(Ordering::Relaxed),
            dropped_outbound: self.outbound.dropped(),
        }
    }

    /// Handshaking → Active. Fails if the session was drained or closed meanwhile.
    pub fn mark_active(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Handshaking {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Moves a live session to Draining. Returns false if it was already
    /// draining or closed, in which case the first reason is kept.
    pub fn begin_drain(&self, reason: DrainReason) -> bool {
        let started = self.state.send_if_modified(|state| match state {
            SessionState::Handshaking | SessionState::Active => {
                *state = SessionState::Draining;
                true
            }
            SessionState::Draining | SessionState::Closed => false,
        });
        if started {
            *self.drain_reason.lock() = Some(reason);
            self.drain.cancel();
        }
        started
    }

    /// Abandons any remaining flush and tears the connection down.
    pub fn force_close(&self) {
        self.kill.cancel();
    }

    /// Records why the relay stopped. The first reason wins.
    pub fn set_close_reason(&self, reason: CloseReason) {
        self.close_reason.lock().get_or_insert(reason);
    }

    /// Terminal transition. Idempotent.
    pub fn mark_closed(&self) {
        self.state.send_replace(SessionState::Closed);
        self.drain.cancel();
        self.kill.cancel();
    }

    pub fn drained(&self) -> WaitForCancellationFuture<'_> {
        self.drain.cancelled()
    }

    pub fn killed(&self) -> WaitForCancellationFuture<'_> {
        self.kill.cancelled()
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Waits until the session reaches Closed. Returns false on timeout.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == SessionState::Closed))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("device_id", &self.identity.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMethod;
    use crate::buffer::OverflowPolicy;
    use crate::ocpp::OcppVersion;

    fn handle() -> Arc<SessionHandle> {
        let identity = DeviceIdentity {
            id: "CP-001".to_string(),
            version: OcppVersion::V16,
            auth_method: AuthMethod::RegistryOnly,
            authorized_at: Utc::now(),
        };
        SessionHandle::new(identity, Arc::new(OutboundBuffer::new(8, OverflowPolicy::DropOldest)))
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(handle().session_id(), handle().session_id());
    }

    #[test]
    fn test_happy_path_transitions() {
        let session = handle();
        assert_eq!(session.state(), SessionState::Handshaking);
        assert!(session.mark_active());
        assert!(!session.mark_active());
        assert!(session.begin_drain(DrainReason::Shutdown));
        assert_eq!(session.state(), SessionState::Draining);
        session.mark_closed();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.is_killed());
    }

    #[test]
    fn test_first_drain_reason_wins() {
        let session = handle();
        session.mark_active();
        assert!(session.begin_drain(DrainReason::Evicted));
        assert!(!session.begin_drain(DrainReason::Shutdown));
        assert_eq!(session.drain_reason(), Some(DrainReason::Evicted));
    }

    #[test]
    fn test_closed_session_cannot_activate_or_drain() {
        let session = handle();
        session.mark_closed();
        assert!(!session.mark_active());
        assert!(!session.begin_drain(DrainReason::Shutdown));
        assert_eq!(session.drain_reason(), None);
    }

    #[test]
    fn test_drain_during_handshake_blocks_activation() {
        let session = handle();
        assert!(session.begin_drain(DrainReason::Evicted));
        assert!(!session.mark_active());
    }

    #[tokio::test]
    async fn test_wait_closed() {
        let session = handle();
        assert!(!session.wait_closed(Duration::from_millis(20)).await);

        let closer = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.mark_closed();
        });
        assert!(session.wait_closed(Duration::from_secs(1)).await);
        assert!(session.wait_closed(Duration::from_millis(1)).await);
    }

    #[test]
    fn test_stats_snapshot() {
        let session = handle();
        session.stats().record_in();
        session.stats().record_in();
        session.stats().record_out();
        session.stats().record_publish_failure();
        assert_eq!(session.stats().next_inbound_sequence(), 1);
        assert_eq!(session.stats().next_inbound_sequence(), 2);

        let snapshot = session.stats_snapshot();
        assert_eq!(snapshot.frames_in, 2);
        assert_eq!(snapshot.frames_out, 1);
        assert_eq!(snapshot.publish_failures, 1);
        assert_eq!(snapshot.dropped_outbound, 0);
    }
}
