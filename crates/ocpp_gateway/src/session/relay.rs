use crate::auth::DeviceIdentity;
use crate::buffer::OutboundBuffer;
use crate::message::Message;
use crate::mqtt::{BridgeError, MessageBridge, cloud_to_device_topic, device_to_cloud_topic};
use crate::ocpp::{FrameCodec, FrameError};
use crate::registry::{RegistryError, SessionRegistry};
use crate::session::{CloseReason, DrainReason, SessionHandle, SessionSettings};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::error::CapacityError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, instrument, warn};

/// Everything a session needs besides its socket.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<SessionRegistry>,
    pub bridge: Arc<dyn MessageBridge>,
    pub settings: SessionSettings,
}

/// Runs an authorized connection from registration to close.
///
/// The session is registered first (draining any older session for the same
/// charge point and waiting for it to close), then subscribed to its
/// cloud→device topic, then relayed in both directions until either side
/// ends it. On return the subscription is gone, the registry no longer points
/// at this session and its state is `Closed`.
#[instrument(
    name = "session",
    skip_all,
    fields(device_id = %identity.id, version = %identity.version, session_id = tracing::field::Empty)
)]
pub async fn run_session<S>(
    mut ws: WebSocketStream<S>,
    identity: DeviceIdentity,
    ctx: SessionContext,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let settings = &ctx.settings;
    let codec = FrameCodec::new(identity.version).with_max_frame_size(settings.max_frame_size);
    let outbound = Arc::new(OutboundBuffer::new(
        settings.buffer_capacity,
        settings.overflow_policy,
    ));
    let handle = SessionHandle::new(identity, outbound.clone());
    Span::current().record("session_id", handle.session_id());
    let device_id = handle.device_id().to_string();

    match ctx.registry.register(handle.clone()).await {
        Ok(Some(evicted)) => {
            info!(evicted_session = evicted.session_id(), "evicting previous session");
            if !evicted.wait_closed(settings.drain_grace).await {
                warn!(evicted_session = evicted.session_id(), "previous session did not drain in time");
                evicted.force_close();
                evicted.wait_closed(settings.flush_timeout).await;
            }
        }
        Ok(None) => {}
        Err(RegistryError::AlreadyConnected(_)) => {
            info!("refusing duplicate connection");
            return refuse(ws, &handle, &ctx, CloseReason::Duplicate).await;
        }
        Err(RegistryError::Closed) => {
            let reason = CloseReason::Drained(DrainReason::Shutdown);
            return refuse(ws, &handle, &ctx, reason).await;
        }
    }

    let topic_out = cloud_to_device_topic(&device_id);
    let subscription = match ctx.bridge.subscribe(&topic_out, &device_id, outbound.clone()) {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, topic = %topic_out, "failed to subscribe");
            return refuse(ws, &handle, &ctx, CloseReason::BrokerUnavailable).await;
        }
    };

    if !handle.mark_active() {
        // Drained while waiting on the previous session.
        ctx.bridge.unsubscribe(&topic_out, subscription);
        let reason = CloseReason::Drained(handle.drain_reason().unwrap_or(DrainReason::Evicted));
        return refuse(ws, &handle, &ctx, reason).await;
    }
    info!(topic = %topic_out, "session active");

    let (sink, stream) = ws.split();
    let writer_done = CancellationToken::new();
    let mut writer = tokio::spawn(write_loop(
        sink,
        handle.clone(),
        codec,
        settings.flush_timeout,
        writer_done.clone(),
    ));

    let reason = read_loop(stream, &handle, &codec, ctx.bridge.as_ref(), &writer_done).await;
    handle.set_close_reason(reason.clone());

    ctx.bridge.unsubscribe(&topic_out, subscription);
    outbound.close();

    let flush_bound = match reason {
        CloseReason::Drained(_) => settings.drain_grace,
        _ => settings.flush_timeout,
    };
    if tokio::time::timeout(flush_bound, &mut writer).await.is_err() {
        warn!(pending = outbound.len(), "flush timed out, forcing close");
        handle.force_close();
        if tokio::time::timeout(settings.flush_timeout, &mut writer).await.is_err() {
            warn!("writer stalled after forced close, aborting");
            writer.abort();
        }
    }

    ctx.registry.unregister(&handle).await;
    handle.mark_closed();

    let stats = handle.stats_snapshot();
    info!(
        reason = %reason,
        frames_in = stats.frames_in,
        frames_out = stats.frames_out,
        publish_failures = stats.publish_failures,
        dropped_outbound = stats.dropped_outbound,
        "session closed"
    );
    reason
}

async fn refuse<S>(
    mut ws: WebSocketStream<S>,
    handle: &Arc<SessionHandle>,
    ctx: &SessionContext,
    reason: CloseReason,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handle.set_close_reason(reason.clone());
    let close = ws.close(Some(reason.close_frame()));
    if tokio::time::timeout(ctx.settings.flush_timeout, close).await.is_err() {
        debug!("close handshake timed out");
    }
    ctx.registry.unregister(handle).await;
    handle.mark_closed();
    reason
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    handle: &SessionHandle,
    codec: &FrameCodec,
    bridge: &dyn MessageBridge,
    writer_done: &CancellationToken,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let topic_in = device_to_cloud_topic(handle.device_id());

    loop {
        let next = tokio::select! {
            biased;
            _ = handle.killed() => return CloseReason::ForceClosed,
            _ = handle.drained() => {
                return CloseReason::Drained(handle.drain_reason().unwrap_or(DrainReason::Shutdown));
            }
            _ = writer_done.cancelled() => {
                return CloseReason::TransportError("write side closed".to_string());
            }
            next = stream.next() => next,
        };

        let raw = match next {
            None => return CloseReason::TransportError("connection ended".to_string()),
            Some(Err(WsError::Capacity(CapacityError::MessageTooLong { size, max_size }))) => {
                warn!(size, limit = max_size, "oversized frame from charge point");
                return CloseReason::Malformed(FrameError::TooLarge {
                    size,
                    limit: max_size,
                });
            }
            Some(Err(e)) => return CloseReason::TransportError(e.to_string()),
            Some(Ok(WsMessage::Text(text))) => Bytes::from(text),
            Some(Ok(WsMessage::Binary(_))) => {
                warn!("binary frame from charge point");
                return CloseReason::Malformed(FrameError::Malformed(
                    "binary frames are not part of OCPP-J".to_string(),
                ));
            }
            Some(Ok(WsMessage::Close(frame))) => {
                debug!(?frame, "charge point closed the connection");
                return CloseReason::DeviceClosed;
            }
            Some(Ok(_)) => continue,
        };

        let frame = match codec.decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "malformed frame from charge point");
                return CloseReason::Malformed(e);
            }
        };

        let message = Message::device_to_cloud(
            handle.device_id(),
            frame.payload,
            handle.stats().next_inbound_sequence(),
        );
        debug!(envelope = %frame.envelope, sequence = message.sequence, "device frame");

        match bridge.publish(&topic_in, message.payload) {
            Ok(()) => handle.stats().record_in(),
            Err(BridgeError::NotConnected) => {
                handle.stats().record_publish_failure();
                warn!(sequence = message.sequence, "broker unavailable, dropping device frame");
            }
            Err(BridgeError::Rejected(reason)) => {
                handle.stats().record_publish_failure();
                warn!(sequence = message.sequence, reason = %reason, "publish rejected, dropping device frame");
            }
        }
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    handle: Arc<SessionHandle>,
    codec: FrameCodec,
    close_timeout: Duration,
    done: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let outbound = handle.outbound().clone();

    loop {
        let next = tokio::select! {
            biased;
            _ = handle.killed() => break,
            next = outbound.pop() => next,
        };
        let Some(message) = next else { break };

        let text = match codec.encode(&message.payload) {
            Ok(text) => text,
            Err(e) => {
                handle.stats().record_encode_failure();
                warn!(error = %e, sequence = message.sequence, "dropping undeliverable broker payload");
                continue;
            }
        };
        if tracing::enabled!(tracing::Level::DEBUG) {
            match codec.sniff(&text) {
                Some(envelope) => debug!(%envelope, sequence = message.sequence, "cloud frame"),
                None => debug!(sequence = message.sequence, "cloud payload without OCPP envelope"),
            }
        }

        let sent = tokio::select! {
            biased;
            _ = handle.killed() => break,
            sent = sink.send(WsMessage::Text(text)) => sent,
        };
        if let Err(e) = sent {
            debug!(error = %e, "websocket write failed");
            done.cancel();
            return;
        }
        handle.stats().record_out();
    }

    let reason = handle.close_reason().unwrap_or(CloseReason::ForceClosed);
    let frame = match (&reason, handle.is_killed()) {
        (CloseReason::Drained(_), true) => CloseReason::ForceClosed.close_frame(),
        _ => reason.close_frame(),
    };
    // A killed writer may sit behind a peer that stopped reading.
    let close = async {
        let _ = sink.send(WsMessage::Close(Some(frame))).await;
        let _ = sink.close().await;
    };
    if tokio::time::timeout(close_timeout, close).await.is_err() {
        debug!("close frame not delivered in time");
    }
    done.cancel();
}
