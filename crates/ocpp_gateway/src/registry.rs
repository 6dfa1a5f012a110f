use crate::session::{DrainReason, SessionHandle, SessionState};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// What happens when a charge point connects while it already has a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Latest connection wins; the existing session is drained.
    #[default]
    ReplaceExisting,
    /// The newcomer is refused and the existing session is untouched.
    RejectNew,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "replace_existing" => Ok(DuplicatePolicy::ReplaceExisting),
            "reject_new" => Ok(DuplicatePolicy::RejectNew),
            other => Err(format!("unknown duplicate policy: {other}")),
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicatePolicy::ReplaceExisting => f.write_str("replace_existing"),
            DuplicatePolicy::RejectNew => f.write_str("reject_new"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("charge point {0} already has an active session")]
    AlreadyConnected(String),
    #[error("gateway is shutting down")]
    Closed,
}

/// Live sessions keyed by charge point identifier.
///
/// At most one session per identifier. All mutations take the write lock, so
/// registrations for the same identifier are linearized.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    policy: DuplicatePolicy,
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            policy,
            closed: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Installs `session` under its device id.
    ///
    /// With [`DuplicatePolicy::ReplaceExisting`] a previous session is moved to
    /// `Draining` and returned so the caller can wait for it to close. A
    /// previous session that is already on its way out never blocks a
    /// newcomer, whatever the policy.
    pub async fn register(
        &self,
        session: Arc<SessionHandle>,
    ) -> Result<Option<Arc<SessionHandle>>, RegistryError> {
        let device_id = session.device_id().to_string();
        let mut sessions = self.sessions.write().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }

        if let Some(existing) = sessions.get(&device_id) {
            let live = matches!(
                existing.state(),
                SessionState::Handshaking | SessionState::Active
            );
            if live && self.policy == DuplicatePolicy::RejectNew {
                return Err(RegistryError::AlreadyConnected(device_id));
            }
        }

        let previous = sessions.insert(device_id, session);
        if let Some(previous) = &previous {
            previous.begin_drain(DrainReason::Evicted);
        }
        Ok(previous)
    }

    /// Removes the entry only if it still points at `session`.
    pub async fn unregister(&self, session: &SessionHandle) -> bool {
        let mut sessions = self.sessions.write().await;
        let owned = sessions
            .get(session.device_id())
            .is_some_and(|current| current.session_id() == session.session_id());
        if owned {
            sessions.remove(session.device_id());
        } else {
            debug!(
                device_id = session.device_id(),
                session_id = session.session_id(),
                "registry entry already replaced"
            );
        }
        owned
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(device_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Refuses all further registrations. Existing entries are kept.
    pub async fn close(&self) {
        let _sessions = self.sessions.write().await;
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Moves every registered session to `Draining` and returns them.
    pub async fn drain_all(&self, reason: DrainReason) -> Vec<Arc<SessionHandle>> {
        let sessions = self.snapshot().await;
        for session in &sessions {
            session.begin_drain(reason);
        }
        sessions
    }

    pub async fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.read().await.values().cloned().collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DuplicatePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthMethod, DeviceIdentity};
    use crate::buffer::{OutboundBuffer, OverflowPolicy};
    use crate::ocpp::OcppVersion;
    use chrono::Utc;

    fn session(id: &str) -> Arc<SessionHandle> {
        let identity = DeviceIdentity {
            id: id.to_string(),
            version: OcppVersion::V201,
            auth_method: AuthMethod::RegistryOnly,
            authorized_at: Utc::now(),
        };
        SessionHandle::new(identity, Arc::new(OutboundBuffer::new(4, OverflowPolicy::DropOldest)))
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = SessionRegistry::default();
        let first = session("CP-001");
        assert!(registry.register(first.clone()).await.unwrap().is_none());
        assert!(registry.register(session("CP-002")).await.unwrap().is_none());

        assert_eq!(registry.count().await, 2);
        let found = registry.get("CP-001").await.unwrap();
        assert_eq!(found.session_id(), first.session_id());
        assert!(registry.get("CP-404").await.is_none());
    }

    #[tokio::test]
    async fn test_replace_existing_drains_previous() {
        let registry = SessionRegistry::new(DuplicatePolicy::ReplaceExisting);
        let first = session("CP-001");
        first.mark_active();
        registry.register(first.clone()).await.unwrap();

        let second = session("CP-001");
        let evicted = registry.register(second.clone()).await.unwrap().unwrap();

        assert_eq!(evicted.session_id(), first.session_id());
        assert_eq!(first.state(), SessionState::Draining);
        assert_eq!(first.drain_reason(), Some(DrainReason::Evicted));
        assert_eq!(registry.count().await, 1);
        assert_eq!(
            registry.get("CP-001").await.unwrap().session_id(),
            second.session_id()
        );
    }

    #[tokio::test]
    async fn test_reject_new_keeps_live_session() {
        let registry = SessionRegistry::new(DuplicatePolicy::RejectNew);
        let first = session("CP-001");
        first.mark_active();
        registry.register(first.clone()).await.unwrap();

        let err = registry.register(session("CP-001")).await.unwrap_err();
        assert_eq!(err, RegistryError::AlreadyConnected("CP-001".to_string()));
        assert_eq!(first.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_reject_new_admits_when_previous_is_draining() {
        let registry = SessionRegistry::new(DuplicatePolicy::RejectNew);
        let first = session("CP-001");
        registry.register(first.clone()).await.unwrap();
        first.begin_drain(DrainReason::Shutdown);

        let second = session("CP-001");
        assert!(registry.register(second).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_unregister_is_noop() {
        let registry = SessionRegistry::default();
        let first = session("CP-001");
        let second = session("CP-001");
        registry.register(first.clone()).await.unwrap();
        registry.register(second.clone()).await.unwrap();

        assert!(!registry.unregister(&first).await);
        assert_eq!(registry.count().await, 1);
        assert!(registry.unregister(&second).await);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_drain_all() {
        let registry = SessionRegistry::default();
        for id in ["CP-001", "CP-002", "CP-003"] {
            let s = session(id);
            s.mark_active();
            registry.register(s).await.unwrap();
        }

        let drained = registry.drain_all(DrainReason::Shutdown).await;
        assert_eq!(drained.len(), 3);
        assert!(drained.iter().all(|s| s.state() == SessionState::Draining));
        // Entries stay until each session unregisters itself.
        assert_eq!(registry.count().await, 3);
    }

    #[tokio::test]
    async fn test_concurrent_registrations_leave_one_entry() {
        let registry = Arc::new(SessionRegistry::default());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.register(session("CP-001")).await.unwrap()
            }));
        }
        let mut evicted = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                evicted += 1;
            }
        }
        assert_eq!(evicted, 31);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_closed_registry_refuses_registrations() {
        let registry = SessionRegistry::default();
        registry.register(session("CP-001")).await.unwrap();
        registry.close().await;

        assert_eq!(
            registry.register(session("CP-002")).await.unwrap_err(),
            RegistryError::Closed
        );
        assert!(registry.is_closed());
        assert_eq!(registry.count().await, 1);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "reject-new".parse::<DuplicatePolicy>(),
            Ok(DuplicatePolicy::RejectNew)
        );
        assert_eq!(DuplicatePolicy::default().to_string(), "replace_existing");
        assert!("newest".parse::<DuplicatePolicy>().is_err());
    }
}
