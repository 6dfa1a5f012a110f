use opentelemetry_sdk::{logs::LoggerProvider, trace::TracerProvider as SdkTracerProvider};

/// How a gateway process reports logs and traces.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// `service.name` resource attribute; also the tracer name.
    pub service_name: String,
    /// `service.instance.id` resource attribute. Gateway replicas share a
    /// service name, so this is what tells their spans apart.
    pub service_instance_id: Option<String>,
    pub otel_endpoint: String,
    pub otel_enabled: bool,
    /// Fallback filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "ocpp-gateway".to_string(),
            service_instance_id: None,
            otel_endpoint: "http://localhost:4317".to_string(),
            otel_enabled: false,
            log_level: "info".to_string(),
        }
    }
}

/// OTLP providers kept alive until shutdown so buffered spans and logs are flushed.
pub struct TelemetryProviders {
    pub tracer_provider: SdkTracerProvider,
    pub logger_provider: LoggerProvider,
}
