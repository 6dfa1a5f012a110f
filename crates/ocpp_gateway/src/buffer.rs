use crate::message::Message;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// What to do with a cloud→device message when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room.
    DropOldest,
    /// Keep the queue as is and discard the incoming message.
    RejectNewest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "reject_newest" => Ok(OverflowPolicy::RejectNewest),
            other => Err(format!("unknown overflow policy: {other}")),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::DropOldest => f.write_str("drop_oldest"),
            OverflowPolicy::RejectNewest => f.write_str("reject_newest"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the returned message.
    DroppedOldest(Message),
    /// Buffer full; the pushed message was discarded.
    Rejected,
    /// Buffer no longer accepts messages.
    Closed,
}

struct Inner {
    queue: VecDeque<Message>,
    closed: bool,
    next_sequence: u64,
}

/// Bounded single-consumer queue between the broker dispatch and a session writer.
///
/// Producers never block. The length never exceeds `capacity`. Once closed,
/// pushes are refused while the consumer can still drain what is queued.
pub struct OutboundBuffer {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl OutboundBuffer {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
                next_sequence: 1,
            }),
            notify: Notify::new(),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, mut message: Message) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }

            let mut evicted = None;
            if inner.queue.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::RejectNewest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return PushOutcome::Rejected;
                    }
                    OverflowPolicy::DropOldest => {
                        evicted = inner.queue.pop_front();
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            message.sequence = inner.next_sequence;
            inner.next_sequence += 1;
            inner.queue.push_back(message);

            match evicted {
                Some(old) => PushOutcome::DroppedOldest(old),
                None => PushOutcome::Queued,
            }
        };

        self.notify.notify_one();
        outcome
    }

    /// Waits for the next message. Returns `None` once closed and empty.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(message) = inner.queue.pop_front() {
                    return Some(message);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stops accepting messages. Already queued messages remain poppable.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Messages discarded because of overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn msg(payload: &'static str) -> Message {
        Message::cloud_to_device("CP-001", Bytes::from_static(payload.as_bytes()))
    }

    #[tokio::test]
    async fn test_fifo_order_and_sequence_numbers() {
        let buffer = OutboundBuffer::new(4, OverflowPolicy::DropOldest);
        assert_eq!(buffer.push(msg("a")), PushOutcome::Queued);
        assert_eq!(buffer.push(msg("b")), PushOutcome::Queued);

        let first = buffer.pop().await.unwrap();
        let second = buffer.pop().await.unwrap();
        assert_eq!(first.payload, "a");
        assert_eq!(second.payload, "b");
        assert_eq!((first.sequence, second.sequence), (1, 2));
    }

    #[tokio::test]
    async fn test_drop_oldest_never_exceeds_capacity() {
        let buffer = OutboundBuffer::new(3, OverflowPolicy::DropOldest);
        for i in 0..100 {
            let payload = Bytes::from(format!("m{i}"));
            buffer.push(Message::cloud_to_device("CP-001", payload));
            assert!(buffer.len() <= 3);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped(), 97);
        assert_eq!(buffer.pop().await.unwrap().payload, "m97");
    }

    #[tokio::test]
    async fn test_reject_newest_keeps_queue() {
        let buffer = OutboundBuffer::new(2, OverflowPolicy::RejectNewest);
        buffer.push(msg("a"));
        buffer.push(msg("b"));
        assert_eq!(buffer.push(msg("c")), PushOutcome::Rejected);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped(), 1);
        assert_eq!(buffer.pop().await.unwrap().payload, "a");
    }

    #[tokio::test]
    async fn test_drop_oldest_returns_evicted_message() {
        let buffer = OutboundBuffer::new(1, OverflowPolicy::DropOldest);
        buffer.push(msg("a"));
        match buffer.push(msg("b")) {
            PushOutcome::DroppedOldest(old) => assert_eq!(old.payload, "a"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let buffer = OutboundBuffer::new(4, OverflowPolicy::DropOldest);
        buffer.push(msg("a"));
        buffer.close();

        assert_eq!(buffer.push(msg("b")), PushOutcome::Closed);
        assert_eq!(buffer.pop().await.unwrap().payload, "a");
        assert!(buffer.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push_and_close() {
        let buffer = Arc::new(OutboundBuffer::new(4, OverflowPolicy::DropOldest));

        let consumer = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let first = buffer.pop().await;
                let second = buffer.pop().await;
                (first, second)
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.push(msg("late"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        let (first, second) = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.unwrap().payload, "late");
        assert!(second.is_none());
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("drop_oldest".parse::<OverflowPolicy>(), Ok(OverflowPolicy::DropOldest));
        assert_eq!("Reject-Newest".parse::<OverflowPolicy>(), Ok(OverflowPolicy::RejectNewest));
        assert!("block".parse::<OverflowPolicy>().is_err());
    }
}
