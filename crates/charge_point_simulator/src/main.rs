mod messages;

use anyhow::{Context, anyhow};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use common::auth::{Argon2PasswordService, PasswordService};
use common::telemetry::{TelemetryConfig, init_telemetry};
use futures::{SinkExt, StreamExt};
use ocpp_gateway::auth::Credential;
use ocpp_gateway::ocpp::{Envelope, FrameCodec, OcppVersion};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Charge point simulator for manual checks against the OCPP gateway.
#[derive(Parser)]
#[command(name = "charge-point-simulator")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect as a charge point, boot and send heartbeats
    Connect(ConnectArgs),

    /// Print the argon2 hash to store in the charge point registry
    HashPassword {
        /// Plaintext password
        password: String,
    },
}

#[derive(Args)]
struct ConnectArgs {
    /// Gateway base URL; the charge point id is appended as the last path segment
    #[arg(long, default_value = "ws://localhost:80/ocpp")]
    url: String,

    /// Charge point identifier
    #[arg(long, default_value = "CP-001")]
    id: String,

    /// Subprotocol to offer (ocpp1.6, ocpp2.0, ocpp2.0.1)
    #[arg(long, default_value = "ocpp1.6")]
    protocol: String,

    /// Password for HTTP Basic authentication
    #[arg(long, env = "CHARGE_POINT_PASSWORD")]
    password: Option<String>,

    /// Heartbeat interval used until the gateway replies to the boot notification
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Stop after this many heartbeats; runs until interrupted when omitted
    #[arg(long)]
    heartbeats: Option<u64>,

    #[arg(long, default_value = "Simulator")]
    vendor: String,

    #[arg(long, default_value = "SIM-1")]
    model: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&TelemetryConfig {
        service_name: "charge-point-simulator".to_string(),
        log_level: cli.log_level.clone(),
        ..TelemetryConfig::default()
    })?;

    match cli.command {
        Commands::Connect(args) => connect(args).await,
        Commands::HashPassword { password } => {
            let hash = Argon2PasswordService::new().hash_password(&password)?;
            println!("{hash}");
            Ok(())
        }
    }
}

async fn connect(args: ConnectArgs) -> anyhow::Result<()> {
    let version = OcppVersion::from_subprotocol(&args.protocol)?;
    let codec = FrameCodec::new(version);
    let url = format!("{}/{}", args.url.trim_end_matches('/'), args.id);

    let mut request = url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(version.subprotocol()));
    if let Some(password) = &args.password {
        let credential = Credential::new(args.id.clone(), password.clone());
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&credential.to_authorization_header())?,
        );
    }

    let (ws, _) = connect_async(request)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    info!(%url, protocol = %version, "connected");
    let (mut sink, mut stream) = ws.split();

    // unique id -> action, for matching replies
    let mut pending: HashMap<String, String> = HashMap::new();

    let boot_id = messages::new_unique_id();
    let boot = messages::boot_notification(version, &args.vendor, &args.model);
    sink.send(Message::Text(messages::call(&boot_id, "BootNotification", boot)))
        .await?;
    pending.insert(boot_id, "BootNotification".to_string());

    let mut interval = Duration::from_secs(args.heartbeat_secs.max(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    let mut sent_heartbeats = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, closing");
                break;
            }
            _ = ticker.tick() => {
                if args.heartbeats.is_some_and(|limit| sent_heartbeats >= limit) {
                    break;
                }
                let id = messages::new_unique_id();
                sink.send(Message::Text(messages::call(&id, "Heartbeat", json!({})))).await?;
                pending.insert(id, "Heartbeat".to_string());
                sent_heartbeats += 1;
            }
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "gateway closed the connection");
                        return Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(anyhow!(e).context("connection failed")),
                    None => return Err(anyhow!("connection ended without close frame")),
                };

                let frame = match codec.decode(Bytes::from(text)) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "ignoring malformed frame from gateway");
                        continue;
                    }
                };
                info!(envelope = %frame.envelope, "received");

                match &frame.envelope {
                    Envelope::Call { unique_id, action } => {
                        let reply = messages::reply_to_call(version, unique_id, action);
                        sink.send(Message::Text(reply)).await?;
                    }
                    Envelope::CallResult { unique_id } => {
                        let action = pending.remove(unique_id);
                        if action.as_deref() == Some("BootNotification") {
                            let payload = call_payload(&frame.payload);
                            if let Some(secs) = messages::heartbeat_interval(&payload) {
                                interval = Duration::from_secs(secs);
                                ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                                info!(interval_secs = secs, "heartbeat interval set by central system");
                            }
                        }
                    }
                    Envelope::CallError { unique_id, error_code } => {
                        let action = pending.remove(unique_id);
                        warn!(?action, %error_code, "call rejected");
                    }
                }
            }
        }
    }

    sink.send(Message::Close(None)).await?;
    debug!(sent_heartbeats, "done");
    Ok(())
}

/// Payload of a CALLRESULT, the third array element.
fn call_payload(raw: &[u8]) -> Value {
    serde_json::from_slice::<Value>(raw)
        .ok()
        .and_then(|value| value.get(2).cloned())
        .unwrap_or(Value::Null)
}
