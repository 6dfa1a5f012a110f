use anyhow::{Context, anyhow};
use common::postgres::PostgresConfig;
use common::telemetry::TelemetryConfig;
use config::{Config, ConfigError, Environment};
use ocpp_gateway::buffer::OverflowPolicy;
use ocpp_gateway::listener::ListenerSettings;
use ocpp_gateway::mqtt::{MqttBridgeConfig, TlsFiles, parse_qos};
use ocpp_gateway::ocpp::parse_version_list;
use ocpp_gateway::registry::DuplicatePolicy;
use ocpp_gateway::session::SessionSettings;
use ocpp_gateway::supervisor::SupervisorSettings;
use ocpp_gateway::OcppGatewayConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Where charge point records come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryBackend {
    Postgres,
    /// Comma-separated allow-list from the environment; every listed id is active.
    Static,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Generated once per process; tags the MQTT client id and telemetry
    #[serde(skip, default = "new_instance_id")]
    pub instance_id: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Listener
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Enabled subprotocols, comma-separated
    #[serde(default = "default_ocpp_protocols")]
    pub ocpp_protocols: String,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    // Sessions
    #[serde(default = "default_outbound_buffer_capacity")]
    pub outbound_buffer_capacity: usize,

    /// drop_oldest or reject_newest
    #[serde(default = "default_overflow_policy")]
    pub overflow_policy: String,

    /// replace_existing or reject_new
    #[serde(default = "default_duplicate_policy")]
    pub duplicate_policy: String,

    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,

    #[serde(default = "default_drain_grace_secs")]
    pub drain_grace_secs: u64,

    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    // Supervisor
    #[serde(default = "default_broker_outage_tolerance_secs")]
    pub broker_outage_tolerance_secs: u64,

    #[serde(default = "default_load_report_interval_secs")]
    pub load_report_interval_secs: u64,

    #[serde(default = "default_health_enabled")]
    pub health_enabled: bool,

    #[serde(default = "default_health_port")]
    pub health_port: u16,

    // MQTT broker
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,

    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,

    /// Client id prefix; the instance id is appended so replicas never
    /// share a broker session
    #[serde(default = "default_mqtt_client_id")]
    pub mqtt_client_id: String,

    /// Use `mqtt_client_id` verbatim
    #[serde(default)]
    pub mqtt_client_id_fixed: bool,

    #[serde(default = "default_mqtt_keep_alive_secs")]
    pub mqtt_keep_alive_secs: u64,

    /// 0, 1 or 2
    #[serde(default = "default_mqtt_qos")]
    pub mqtt_qos: String,

    /// Use the client certificate below; plain TCP otherwise
    #[serde(default = "default_mqtt_tls_enabled")]
    pub mqtt_tls_enabled: bool,

    #[serde(default = "default_mqtt_ca_path")]
    pub mqtt_ca_path: String,

    #[serde(default = "default_mqtt_cert_path")]
    pub mqtt_cert_path: String,

    #[serde(default = "default_mqtt_key_path")]
    pub mqtt_key_path: String,

    #[serde(default = "default_mqtt_backoff_initial_ms")]
    pub mqtt_backoff_initial_ms: u64,

    #[serde(default = "default_mqtt_backoff_max_secs")]
    pub mqtt_backoff_max_secs: u64,

    #[serde(default = "default_mqtt_request_capacity")]
    pub mqtt_request_capacity: usize,

    // Charge point registry
    /// postgres or static
    #[serde(default = "default_registry_backend")]
    pub registry_backend: String,

    /// Allow-list used by the static backend, comma-separated
    #[serde(default)]
    pub static_charge_points: String,

    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    #[serde(default = "default_postgres_max_pool_size")]
    pub postgres_max_pool_size: usize,

    // OpenTelemetry
    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    80
}

fn default_ocpp_protocols() -> String {
    "ocpp1.6,ocpp2.0,ocpp2.0.1".to_string()
}

fn default_max_frame_size() -> usize {
    64 * 1024
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_outbound_buffer_capacity() -> usize {
    256
}

fn default_overflow_policy() -> String {
    "drop_oldest".to_string()
}

fn default_duplicate_policy() -> String {
    "replace_existing".to_string()
}

fn default_auth_timeout_secs() -> u64 {
    5
}

fn default_drain_grace_secs() -> u64 {
    10
}

fn default_flush_timeout_ms() -> u64 {
    2000
}

fn default_broker_outage_tolerance_secs() -> u64 {
    30
}

fn default_load_report_interval_secs() -> u64 {
    60
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_port() -> u16 {
    8081
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    8883
}

fn new_instance_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn default_mqtt_client_id() -> String {
    "ocpp-gateway".to_string()
}

fn default_mqtt_keep_alive_secs() -> u64 {
    30
}

fn default_mqtt_qos() -> String {
    "0".to_string()
}

fn default_mqtt_tls_enabled() -> bool {
    true
}

fn default_mqtt_ca_path() -> String {
    "/etc/iot-certificates/AmazonRootCA1.pem".to_string()
}

fn default_mqtt_cert_path() -> String {
    "/etc/iot-certificates/iot.pem".to_string()
}

fn default_mqtt_key_path() -> String {
    "/etc/iot-certificates/iot.key".to_string()
}

fn default_mqtt_backoff_initial_ms() -> u64 {
    500
}

fn default_mqtt_backoff_max_secs() -> u64 {
    30
}

fn default_mqtt_request_capacity() -> usize {
    1024
}

fn default_registry_backend() -> String {
    "postgres".to_string()
}

fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "charge_points".to_string()
}

fn default_postgres_username() -> String {
    "ocpp_gateway".to_string()
}

fn default_postgres_password() -> String {
    "ocpp_gateway".to_string()
}

fn default_postgres_max_pool_size() -> usize {
    10
}

fn default_otel_enabled() -> bool {
    false
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "ocpp-gateway".to_string()
}

impl ServiceConfig {
    /// Load configuration from `OCPP_GATEWAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("OCPP_GATEWAY"))
            .build()?
            .try_deserialize()
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.otel_service_name.clone(),
            service_instance_id: Some(self.instance_id.clone()),
            otel_endpoint: self.otel_endpoint.clone(),
            otel_enabled: self.otel_enabled,
            log_level: self.log_level.clone(),
        }
    }

    pub fn registry_backend(&self) -> anyhow::Result<RegistryBackend> {
        match self.registry_backend.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(RegistryBackend::Postgres),
            "static" => Ok(RegistryBackend::Static),
            other => Err(anyhow!("unknown registry backend: {other}")),
        }
    }

    pub fn static_charge_point_ids(&self) -> Vec<String> {
        self.static_charge_points
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn postgres_config(&self) -> PostgresConfig {
        PostgresConfig {
            host: self.postgres_host.clone(),
            port: self.postgres_port,
            database: self.postgres_database.clone(),
            username: self.postgres_username.clone(),
            password: self.postgres_password.clone(),
            max_pool_size: self.postgres_max_pool_size,
        }
    }

    pub fn mqtt_instance_client_id(&self) -> String {
        if self.mqtt_client_id_fixed {
            return self.mqtt_client_id.clone();
        }
        format!("{}-{}", self.mqtt_client_id, self.instance_id)
    }

    pub fn mqtt_config(&self) -> anyhow::Result<MqttBridgeConfig> {
        let tls = self.mqtt_tls_enabled.then(|| TlsFiles {
            ca_path: PathBuf::from(&self.mqtt_ca_path),
            cert_path: PathBuf::from(&self.mqtt_cert_path),
            key_path: PathBuf::from(&self.mqtt_key_path),
        });

        Ok(MqttBridgeConfig {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            client_id: self.mqtt_instance_client_id(),
            keep_alive: Duration::from_secs(self.mqtt_keep_alive_secs),
            qos: parse_qos(&self.mqtt_qos).map_err(|e| anyhow!(e))?,
            tls,
            backoff_initial: Duration::from_millis(self.mqtt_backoff_initial_ms),
            backoff_max: Duration::from_secs(self.mqtt_backoff_max_secs),
            request_capacity: self.mqtt_request_capacity,
            max_packet_size: MqttBridgeConfig::default().max_packet_size.max(self.max_frame_size),
        })
    }

    pub fn gateway_config(&self) -> anyhow::Result<OcppGatewayConfig> {
        let enabled_versions =
            parse_version_list(&self.ocpp_protocols).context("invalid OCPP protocol list")?;
        if enabled_versions.is_empty() {
            return Err(anyhow!("at least one OCPP protocol must be enabled"));
        }
        let overflow_policy = self
            .overflow_policy
            .parse::<OverflowPolicy>()
            .map_err(|e| anyhow!(e))?;
        let duplicate_policy = self
            .duplicate_policy
            .parse::<DuplicatePolicy>()
            .map_err(|e| anyhow!(e))?;

        let listen_addr: SocketAddr = format!("{}:{}", self.listen_host, self.listen_port)
            .parse()
            .context("invalid listener address")?;
        let health_addr = if self.health_enabled {
            let addr: SocketAddr = format!("{}:{}", self.listen_host, self.health_port)
                .parse()
                .context("invalid health address")?;
            Some(addr)
        } else {
            None
        };
        let drain_grace = Duration::from_secs(self.drain_grace_secs);

        Ok(OcppGatewayConfig {
            listen_addr,
            health_addr,
            listener: ListenerSettings {
                enabled_versions,
                handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
                max_frame_size: self.max_frame_size,
            },
            session: SessionSettings {
                max_frame_size: self.max_frame_size,
                buffer_capacity: self.outbound_buffer_capacity,
                overflow_policy,
                drain_grace,
                flush_timeout: Duration::from_millis(self.flush_timeout_ms),
            },
            supervisor: SupervisorSettings {
                drain_grace,
                outage_tolerance: Duration::from_secs(self.broker_outage_tolerance_secs),
                load_report_interval: Duration::from_secs(self.load_report_interval_secs),
                ..SupervisorSettings::default()
            },
            duplicate_policy,
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
        })
    }
}
