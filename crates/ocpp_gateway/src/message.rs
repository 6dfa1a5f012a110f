use bytes::Bytes;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    DeviceToCloud,
    CloudToDevice,
}

/// One relayed payload. Never persisted by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub device_id: String,
    pub direction: Direction,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
    /// Per-session, per-direction sequence number. Diagnostics only.
    pub sequence: u64,
}

impl Message {
    pub fn cloud_to_device(device_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            device_id: device_id.into(),
            direction: Direction::CloudToDevice,
            payload,
            received_at: Utc::now(),
            sequence: 0,
        }
    }

    pub fn device_to_cloud(device_id: impl Into<String>, payload: Bytes, sequence: u64) -> Self {
        Self {
            device_id: device_id.into(),
            direction: Direction::DeviceToCloud,
            payload,
            received_at: Utc::now(),
            sequence,
        }
    }
}
