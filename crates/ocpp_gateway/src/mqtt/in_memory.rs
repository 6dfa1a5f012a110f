use crate::buffer::OutboundBuffer;
use crate::mqtt::{
    BridgeError, BridgeState, BridgeStatus, DispatchOutcome, MessageBridge, RouteTable,
    SubscriptionId,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

/// Broker stand-in with the same contract as the MQTT bridge.
///
/// Publications are recorded instead of sent and `deliver` plays the role of
/// the broker pushing a message to subscribers. Used for tests and local runs
/// without a broker.
pub struct InMemoryBridge {
    routes: RouteTable,
    state: BridgeState,
    published: Mutex<Vec<(String, Bytes)>>,
    reject_publishes: Mutex<bool>,
}

impl InMemoryBridge {
    /// Creates a bridge that reports itself connected.
    pub fn connected() -> Self {
        let bridge = Self::disconnected();
        bridge.state.mark_connected();
        bridge
    }

    pub fn disconnected() -> Self {
        Self {
            routes: RouteTable::new(),
            state: BridgeState::new(),
            published: Mutex::new(Vec::new()),
            reject_publishes: Mutex::new(false),
        }
    }

    /// Simulates the broker connection going up or down.
    pub fn set_connected(&self, connected: bool) {
        if connected {
            self.state.mark_connected();
        } else {
            self.state.mark_backoff("simulated broker outage");
        }
    }

    /// Makes publishes fail as if the request queue were full.
    pub fn set_reject_publishes(&self, reject: bool) {
        *self.reject_publishes.lock() = reject;
    }

    /// Delivers a broker publication to whichever session subscribed to `topic`.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> DispatchOutcome {
        self.routes.dispatch(topic, payload.into())
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Bytes> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.routes.contains(topic)
    }

    pub fn subscription_count(&self) -> usize {
        self.routes.len()
    }
}

impl MessageBridge for InMemoryBridge {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BridgeError> {
        if !self.state.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        if *self.reject_publishes.lock() {
            return Err(BridgeError::Rejected("request queue full".to_string()));
        }
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        device_id: &str,
        sink: Arc<OutboundBuffer>,
    ) -> Result<SubscriptionId, BridgeError> {
        Ok(self.routes.insert(topic, device_id, sink).0)
    }

    fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        self.routes.remove(topic, id);
    }

    fn status(&self) -> BridgeStatus {
        self.state.snapshot()
    }
}
