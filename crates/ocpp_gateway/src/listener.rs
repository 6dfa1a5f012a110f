mod handshake;

pub use handshake::*;

use crate::auth::AuthorizationResolver;
use crate::ocpp::{DEFAULT_MAX_FRAME_SIZE, OcppVersion};
use crate::session::{SessionContext, run_session};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Versions offered to charge points, in no particular order.
    pub enabled_versions: Vec<OcppVersion>,
    pub handshake_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            enabled_versions: OcppVersion::ALL.to_vec(),
            handshake_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Shared state behind every accepted connection.
#[derive(Clone)]
pub struct ListenerContext {
    pub session: SessionContext,
    pub resolver: Arc<AuthorizationResolver>,
    pub settings: ListenerSettings,
    /// Tracks per-connection tasks so shutdown can wait for them.
    pub tracker: TaskTracker,
    /// True while the accept loop runs.
    pub accepting: Arc<AtomicBool>,
}

/// Accepts charge point connections on one port.
pub struct GatewayListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: ListenerContext,
}

impl GatewayListener {
    pub async fn bind(addr: SocketAddr, ctx: ListenerContext) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind listener on {addr}"))?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "listener bound");
        Ok(Self {
            listener,
            local_addr,
            ctx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop. Returns once `shutdown` fires; sessions keep running and
    /// are drained separately.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let accepting = self.ctx.accepting.clone();
        accepting.store(true, Ordering::Release);
        info!(
            address = %self.local_addr,
            versions = ?self.ctx.settings.enabled_versions,
            "accepting charge point connections"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = self.ctx.clone();
                        let span = info_span!("connection", %peer);
                        self.ctx
                            .tracker
                            .spawn(handle_connection(stream, ctx).instrument(span));
                    }
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning.
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        accepting.store(false, Ordering::Release);
        info!("listener stopped accepting");
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, ctx: ListenerContext) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }

    let enabled = ctx.settings.enabled_versions.clone();
    let mut negotiated = None;
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        match negotiate(request, &enabled) {
            Ok(outcome) => {
                response.headers_mut().insert(
                    header::SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_static(outcome.version.subprotocol()),
                );
                negotiated = Some(outcome);
                Ok(response)
            }
            Err(e) => {
                info!(error = %e, path = request.uri().path(), "refusing upgrade");
                Err(e.to_response())
            }
        }
    };

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(ctx.settings.max_frame_size);
    config.max_frame_size = Some(ctx.settings.max_frame_size);

    let upgrade = tokio::time::timeout(
        ctx.settings.handshake_timeout,
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config)),
    )
    .await;
    let mut ws = match upgrade {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(error = %e, "websocket handshake failed");
            return;
        }
        Err(_) => {
            warn!("websocket handshake timed out");
            return;
        }
    };
    let Some(outcome) = negotiated else {
        return;
    };

    let identity = match ctx
        .resolver
        .authorize(&outcome.device_id, outcome.version, outcome.credential.as_ref())
        .await
    {
        Ok(identity) => identity,
        Err(reason) => {
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: reason.to_string().into(),
            };
            let _ = ws.close(Some(frame)).await;
            return;
        }
    };

    if !ctx.accepting.load(Ordering::Acquire) {
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: "gateway shutting down".into(),
        };
        let _ = ws.close(Some(frame)).await;
        return;
    }

    run_session(ws, identity, ctx.session.clone()).await;
}
