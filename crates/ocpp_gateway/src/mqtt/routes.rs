use crate::buffer::{OutboundBuffer, PushOutcome};
use crate::message::Message;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Identifies one subscription so that only its owner can remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Route {
    id: SubscriptionId,
    device_id: String,
    sink: Arc<OutboundBuffer>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// No session is subscribed to the topic.
    NoRoute,
    Delivered(PushOutcome),
}

/// Exact-topic routing from broker publications to session buffers.
///
/// At most one route per topic. Installing a route replaces the previous one
/// and removal only succeeds for the id that installed the current route, so
/// an evicted session cleaning up late cannot tear down its successor.
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, Route>>,
    next_id: AtomicU64,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a route. Returns the new id and the id it replaced, if any.
    pub fn insert(
        &self,
        topic: &str,
        device_id: &str,
        sink: Arc<OutboundBuffer>,
    ) -> (SubscriptionId, Option<SubscriptionId>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let route = Route {
            id,
            device_id: device_id.to_string(),
            sink,
        };
        let replaced = self.routes.write().insert(topic.to_string(), route).map(|r| r.id);
        (id, replaced)
    }

    /// Removes the route for `topic` if it is still owned by `id`.
    pub fn remove(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut routes = self.routes.write();
        match routes.get(topic) {
            Some(route) if route.id == id => {
                routes.remove(topic);
                true
            }
            _ => false,
        }
    }

    /// Hands a broker publication to the subscribed session without blocking.
    pub fn dispatch(&self, topic: &str, payload: Bytes) -> DispatchOutcome {
        let routes = self.routes.read();
        let Some(route) = routes.get(topic) else {
            debug!(topic = %topic, "no session subscribed, dropping publication");
            return DispatchOutcome::NoRoute;
        };

        let outcome = route
            .sink
            .push(Message::cloud_to_device(route.device_id.clone(), payload));
        match &outcome {
            PushOutcome::Queued => {}
            PushOutcome::DroppedOldest(old) => warn!(
                device_id = %route.device_id,
                dropped_sequence = old.sequence,
                "outbound buffer full, dropped oldest message"
            ),
            PushOutcome::Rejected => warn!(
                device_id = %route.device_id,
                "outbound buffer full, rejected newest message"
            ),
            PushOutcome::Closed => debug!(
                device_id = %route.device_id,
                "session draining, publication not accepted"
            ),
        }
        DispatchOutcome::Delivered(outcome)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.routes.read().contains_key(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        self.routes.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::OverflowPolicy;

    fn buffer() -> Arc<OutboundBuffer> {
        Arc::new(OutboundBuffer::new(2, OverflowPolicy::RejectNewest))
    }

    #[tokio::test]
    async fn test_dispatch_reaches_subscribed_buffer() {
        let table = RouteTable::new();
        let sink = buffer();
        table.insert("CP-001/out", "CP-001", sink.clone());

        assert_eq!(
            table.dispatch("CP-001/out", Bytes::from_static(b"{\"x\":1}")),
            DispatchOutcome::Delivered(PushOutcome::Queued)
        );
        let message = sink.pop().await.unwrap();
        assert_eq!(message.device_id, "CP-001");
        assert_eq!(message.payload, "{\"x\":1}");
    }

    #[test]
    fn test_dispatch_without_route() {
        let table = RouteTable::new();
        assert_eq!(
            table.dispatch("CP-404/out", Bytes::from_static(b"{}")),
            DispatchOutcome::NoRoute
        );
    }

    #[test]
    fn test_replacement_and_owner_checked_removal() {
        let table = RouteTable::new();
        let (old_id, replaced) = table.insert("CP-001/out", "CP-001", buffer());
        assert!(replaced.is_none());

        let new_sink = buffer();
        let (new_id, replaced) = table.insert("CP-001/out", "CP-001", new_sink.clone());
        assert_eq!(replaced, Some(old_id));
        assert_ne!(old_id, new_id);

        assert!(!table.remove("CP-001/out", old_id));
        assert!(table.contains("CP-001/out"));
        table.dispatch("CP-001/out", Bytes::from_static(b"{}"));
        assert_eq!(new_sink.len(), 1);

        assert!(table.remove("CP-001/out", new_id));
        assert!(table.is_empty());
    }

    #[test]
    fn test_full_buffer_reports_rejection() {
        let table = RouteTable::new();
        table.insert("CP-001/out", "CP-001", buffer());
        for _ in 0..2 {
            table.dispatch("CP-001/out", Bytes::from_static(b"{}"));
        }
        assert_eq!(
            table.dispatch("CP-001/out", Bytes::from_static(b"{}")),
            DispatchOutcome::Delivered(PushOutcome::Rejected)
        );
    }
}
