use crate::buffer::OutboundBuffer;
use crate::mqtt::{
    Backoff, BridgeError, BridgeState, BridgeStatus, MessageBridge, RouteTable, SubscriptionId,
};
use anyhow::Context;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const RESUBSCRIBE_BATCH: usize = 100;

/// PEM files used to authenticate the gateway to the broker.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MqttBridgeConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub qos: QoS,
    /// Plain TCP when `None`.
    pub tls: Option<TlsFiles>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Capacity of the request queue between handles and the event loop.
    pub request_capacity: usize,
    pub max_packet_size: usize,
}

impl Default for MqttBridgeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            client_id: "ocpp-gateway".to_string(),
            keep_alive: Duration::from_secs(30),
            qos: QoS::AtMostOnce,
            tls: None,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            request_capacity: 1024,
            max_packet_size: 256 * 1024,
        }
    }
}

/// Parses a QoS level given as `0`/`1`/`2` or by name.
pub fn parse_qos(value: &str) -> Result<QoS, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "0" | "at_most_once" => Ok(QoS::AtMostOnce),
        "1" | "at_least_once" => Ok(QoS::AtLeastOnce),
        "2" | "exactly_once" => Ok(QoS::ExactlyOnce),
        other => Err(format!("unknown QoS level: {other}")),
    }
}

fn load_tls(files: &TlsFiles) -> anyhow::Result<TlsConfiguration> {
    let ca = std::fs::read(&files.ca_path)
        .with_context(|| format!("read CA certificate {}", files.ca_path.display()))?;
    let cert = std::fs::read(&files.cert_path)
        .with_context(|| format!("read client certificate {}", files.cert_path.display()))?;
    let key = std::fs::read(&files.key_path)
        .with_context(|| format!("read client key {}", files.key_path.display()))?;

    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth: Some((cert, key)),
    })
}

/// Handle to the shared broker connection. Cheap to share across sessions.
pub struct MqttBridge {
    client: AsyncClient,
    routes: Arc<RouteTable>,
    state: Arc<BridgeState>,
    qos: QoS,
}

/// Drives the broker connection. Must be running for any handle to make progress.
pub struct MqttBridgeEventLoop {
    eventloop: EventLoop,
    client: AsyncClient,
    routes: Arc<RouteTable>,
    state: Arc<BridgeState>,
    backoff: Backoff,
    qos: QoS,
    endpoint: String,
}

impl MqttBridge {
    /// Builds the bridge handle and its event loop. Certificates are read here, once.
    pub fn new(config: &MqttBridgeConfig) -> anyhow::Result<(Arc<Self>, MqttBridgeEventLoop)> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(config.max_packet_size, config.max_packet_size);
        if let Some(files) = &config.tls {
            options.set_transport(Transport::tls_with_config(load_tls(files)?));
        }

        let (client, eventloop) = AsyncClient::new(options, config.request_capacity);
        let routes = Arc::new(RouteTable::new());
        let state = Arc::new(BridgeState::new());

        let bridge = Arc::new(Self {
            client: client.clone(),
            routes: Arc::clone(&routes),
            state: Arc::clone(&state),
            qos: config.qos,
        });
        let event_loop = MqttBridgeEventLoop {
            eventloop,
            client,
            routes,
            state,
            backoff: Backoff::new(config.backoff_initial, config.backoff_max),
            qos: config.qos,
            endpoint: format!("{}:{}", config.host, config.port),
        };
        Ok((bridge, event_loop))
    }

    pub fn subscription_count(&self) -> usize {
        self.routes.len()
    }
}

impl MessageBridge for MqttBridge {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BridgeError> {
        if !self.state.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        self.client
            .try_publish(topic, self.qos, false, payload.to_vec())
            .map_err(|e| BridgeError::Rejected(e.to_string()))
    }

    fn subscribe(
        &self,
        topic: &str,
        device_id: &str,
        sink: Arc<OutboundBuffer>,
    ) -> Result<SubscriptionId, BridgeError> {
        let (id, replaced) = self.routes.insert(topic, device_id, sink);
        if let Some(replaced) = replaced {
            debug!(topic = %topic, replaced = %replaced, subscription = %id, "route replaced");
        }

        // While disconnected the route is replayed on the next CONNACK.
        if self.state.is_connected() && self.client.try_subscribe(topic, self.qos).is_err() {
            let client = self.client.clone();
            let topic = topic.to_string();
            let qos = self.qos;
            tokio::spawn(async move {
                if let Err(e) = client.subscribe(&topic, qos).await {
                    warn!(topic = %topic, error = %e, "failed to queue subscribe");
                }
            });
        }
        Ok(id)
    }

    fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        if !self.routes.remove(topic, id) {
            debug!(topic = %topic, subscription = %id, "route already replaced, keeping broker subscription");
            return;
        }
        if self.state.is_connected() && self.client.try_unsubscribe(topic).is_err() {
            let client = self.client.clone();
            let topic = topic.to_string();
            tokio::spawn(async move {
                if let Err(e) = client.unsubscribe(&topic).await {
                    warn!(topic = %topic, error = %e, "failed to queue unsubscribe");
                }
            });
        }
    }

    fn status(&self) -> BridgeStatus {
        self.state.snapshot()
    }
}

impl MqttBridgeEventLoop {
    /// Polls the connection until `shutdown` fires, reconnecting with backoff.
    #[instrument(name = "mqtt_bridge", skip_all, fields(endpoint = %self.endpoint))]
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let Self {
            mut eventloop,
            client,
            routes,
            state,
            mut backoff,
            qos,
            endpoint,
        } = self;

        info!(endpoint = %endpoint, "starting MQTT bridge");
        state.mark_connecting();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("shutdown signal received");
                    state.mark_stopped();
                    if client.try_disconnect().is_ok() {
                        flush_disconnect(&mut eventloop).await;
                    }
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        state.mark_connected();
                        backoff.reset();
                        info!(session_present = ack.session_present, "connected to MQTT broker");
                        if !ack.session_present {
                            resubscribe(&client, &routes, qos);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        routes.dispatch(&publish.topic, publish.payload);
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        let failures = ack
                            .return_codes
                            .iter()
                            .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                            .count();
                        if failures > 0 {
                            warn!(pkid = ack.pkid, failures, "broker refused subscriptions");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "MQTT connection error");
                        state.mark_backoff(e.to_string());

                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                state.mark_stopped();
                                break;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        state.mark_connecting();
                    }
                }
            }
        }

        info!("MQTT bridge stopped");
        Ok(())
    }
}

/// Polls until the DISCONNECT packet is written, bounded to half a second.
async fn flush_disconnect(eventloop: &mut EventLoop) {
    let flushed = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        debug!("timed out flushing MQTT disconnect");
    }
}

fn resubscribe(client: &AsyncClient, routes: &RouteTable, qos: QoS) {
    let topics = routes.topics();
    if topics.is_empty() {
        return;
    }
    info!(count = topics.len(), "restoring subscriptions");

    let client = client.clone();
    tokio::spawn(async move {
        for batch in topics.chunks(RESUBSCRIBE_BATCH) {
            let filters = batch
                .iter()
                .map(|topic| SubscribeFilter::new(topic.clone(), qos))
                .collect::<Vec<_>>();
            if let Err(e) = client.subscribe_many(filters).await {
                warn!(error = %e, "failed to restore subscriptions");
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::OverflowPolicy;
    use crate::mqtt::ConnectionState;

    fn local_config() -> MqttBridgeConfig {
        MqttBridgeConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_qos() {
        assert_eq!(parse_qos("0"), Ok(QoS::AtMostOnce));
        assert_eq!(parse_qos("at_least_once"), Ok(QoS::AtLeastOnce));
        assert_eq!(parse_qos(" 2 "), Ok(QoS::ExactlyOnce));
        assert!(parse_qos("3").is_err());
    }

    #[test]
    fn test_missing_certificates_fail_construction() {
        let config = MqttBridgeConfig {
            tls: Some(TlsFiles {
                ca_path: "/nonexistent/ca.pem".into(),
                cert_path: "/nonexistent/iot.pem".into(),
                key_path: "/nonexistent/iot.key".into(),
            }),
            ..local_config()
        };
        let err = MqttBridge::new(&config).err().unwrap();
        assert!(format!("{err:#}").contains("CA certificate"));
    }

    #[tokio::test]
    async fn test_publish_fails_fast_before_connect() {
        let (bridge, _event_loop) = MqttBridge::new(&local_config()).unwrap();
        assert_eq!(
            bridge.publish("CP-001/in", Bytes::from_static(b"[2,\"1\",\"Heartbeat\",{}]")),
            Err(BridgeError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_keeps_route() {
        let (bridge, _event_loop) = MqttBridge::new(&local_config()).unwrap();
        let sink = Arc::new(OutboundBuffer::new(4, OverflowPolicy::DropOldest));

        let id = bridge.subscribe("CP-001/out", "CP-001", sink).unwrap();
        assert_eq!(bridge.subscription_count(), 1);

        bridge.unsubscribe("CP-001/out", id);
        assert_eq!(bridge.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_broker_enters_backoff_and_stops_on_shutdown() {
        let (bridge, event_loop) = MqttBridge::new(&local_config()).unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(event_loop.run(shutdown.clone()));

        let mut saw_backoff = false;
        for _ in 0..100 {
            if bridge.status().state == ConnectionState::Backoff {
                saw_backoff = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_backoff);
        assert!(bridge.status().outage_duration().is_some());
        assert_eq!(
            bridge.publish("CP-001/in", Bytes::from_static(b"{}")),
            Err(BridgeError::NotConnected)
        );

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(bridge.status().state, ConnectionState::Stopped);
    }
}
