mod config;

use common::auth::Argon2PasswordService;
use common::domain::{ChargePointRepository, InMemoryChargePointRepository};
use common::postgres::{PostgresChargePointRepository, PostgresClient};
use common::telemetry::{TelemetryProviders, init_telemetry, shutdown_telemetry};
use config::{RegistryBackend, ServiceConfig};
use ocpp_gateway::OcppGateway;
use ocpp_gateway::mqtt::MqttBridge;
use runner::Runner;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Tracing + optional OpenTelemetry export for traces and logs
    let telemetry_providers: Option<TelemetryProviders> =
        match init_telemetry(&config.telemetry_config()) {
            Ok(providers) => providers,
            Err(e) => {
                eprintln!("Failed to initialize telemetry: {}", e);
                std::process::exit(1);
            }
        };

    info!(
        instance_id = %config.instance_id,
        listen_port = config.listen_port,
        mqtt_host = %config.mqtt_host,
        mqtt_port = config.mqtt_port,
        registry_backend = %config.registry_backend,
        otel_enabled = config.otel_enabled,
        "Starting ocpp-gateway"
    );

    let (gateway_config, mqtt_config) = match config
        .gateway_config()
        .and_then(|gateway| Ok((gateway, config.mqtt_config()?)))
    {
        Ok(configs) => configs,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    let drain_grace = gateway_config.supervisor.drain_grace;
    info!(client_id = %mqtt_config.client_id, "MQTT client id");

    let charge_points = match create_charge_point_repository(&config).await {
        Ok(repository) => repository,
        Err(e) => {
            error!("Failed to initialize charge point registry: {:#}", e);
            std::process::exit(1);
        }
    };

    let (bridge, event_loop) = match MqttBridge::new(&mqtt_config) {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("Failed to initialize MQTT bridge: {:#}", e);
            std::process::exit(1);
        }
    };

    // The broker connection outlives the runner processes so draining
    // sessions can still flush; it is stopped by the closer below.
    let bridge_shutdown = CancellationToken::new();
    let bridge_task = tokio::spawn({
        let token = bridge_shutdown.clone();
        async move { event_loop.run(token).await }
    });

    let gateway = match OcppGateway::new(
        gateway_config,
        bridge,
        charge_points,
        Arc::new(Argon2PasswordService::new()),
    )
    .await
    {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to initialize OCPP gateway: {:#}", e);
            std::process::exit(1);
        }
    };
    let supervisor = gateway.supervisor();

    let mut runner = Runner::new();
    for (name, process) in gateway.into_runner_processes() {
        runner = runner.with_named_process(name, process);
    }

    runner = runner
        .with_closer(move || async move {
            info!("Draining OCPP sessions...");
            supervisor.shutdown().await;
            Ok(())
        })
        .with_closer(move || async move {
            info!("Disconnecting from MQTT broker...");
            bridge_shutdown.cancel();
            match bridge_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("MQTT event loop ended with error: {:#}", e),
                Err(e) => warn!("MQTT event loop task failed: {}", e),
            }

            // Shutdown telemetry and flush pending traces and logs
            shutdown_telemetry(telemetry_providers);
            Ok(())
        })
        .with_closer_timeout(drain_grace + Duration::from_secs(5));

    runner.run().await;
}

async fn create_charge_point_repository(
    config: &ServiceConfig,
) -> anyhow::Result<Arc<dyn ChargePointRepository>> {
    match config.registry_backend()? {
        RegistryBackend::Postgres => {
            info!("Connecting to PostgreSQL charge point registry...");
            let client = PostgresClient::new(&config.postgres_config())?;
            client.ping().await?;
            Ok(Arc::new(PostgresChargePointRepository::new(client)))
        }
        RegistryBackend::Static => {
            let ids = config.static_charge_point_ids();
            if ids.is_empty() {
                warn!("Static charge point registry is empty; every connection will be denied");
            }
            info!(charge_points = ids.len(), "Using static charge point registry");
            Ok(Arc::new(InMemoryChargePointRepository::with_active_ids(ids)))
        }
    }
}
