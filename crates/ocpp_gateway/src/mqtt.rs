mod backoff;
mod bridge;
mod client;
mod in_memory;
mod routes;
mod topic;

pub use backoff::Backoff;
pub use bridge::*;
pub use client::{MqttBridge, MqttBridgeConfig, MqttBridgeEventLoop, TlsFiles, parse_qos};
pub use in_memory::InMemoryBridge;
pub use routes::{DispatchOutcome, RouteTable, SubscriptionId};
pub use topic::*;
pub use rumqttc::QoS;
