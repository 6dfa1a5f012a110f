//! OCPP WebSocket to MQTT gateway.
//!
//! Charge points connect over WebSocket with an OCPP-J subprotocol. Each
//! authorized connection becomes a session that relays frames verbatim
//! between the charge point and two broker topics: `{id}/in` for
//! device→cloud traffic and `{id}/out` for cloud→device traffic.

pub mod auth;
pub mod buffer;
pub mod gateway;
pub mod health;
pub mod listener;
pub mod message;
pub mod mqtt;
pub mod ocpp;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use gateway::{GatewayProcess, OcppGateway, OcppGatewayConfig};

#[cfg(any(test, feature = "testing"))]
pub use mqtt::MockMessageBridge;
