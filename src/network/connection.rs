//! One client connection after the WebSocket upgrade.
//!
//! ```text
//! validate + track ──▶ register with hub ──▶ liveness probe
//!                                               │
//!        ┌──────────────── select! ◀────────────┘
//!        │  inbound frame  -> permission check -> hub.broadcast_to_room
//!        │  pong           -> extend deadline, refresh tracker TTL
//!        │  outbound frame -> write (write_timeout)
//!        │  probe dead / transport closed by hub -> leave
//!        └──▶ unregister, untrack, stop probe, release admission slot
//! ```

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::GatewayContext;
use super::session::Session;
use crate::admission::{AdmissionPermit, PingSink};
use crate::bus::{Event, EventKind};
use crate::error::{DeliveryError, TrackerError};
use crate::hub::{ChannelTransport, ConnectionState, Transport};
use crate::tracker::SendDecision;

/// Write half of the socket, shared by the loop and the liveness probe.
struct SocketWriter<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    timeout: Duration,
}

impl<S> SocketWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: Message) -> Result<(), DeliveryError> {
        let write = async { self.sink.lock().await.send(message).await };
        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!(error = %e, "socket write failed");
                Err(DeliveryError::Closed)
            }
            Err(_) => Err(DeliveryError::Timeout),
        }
    }

    /// Push out a queued automatic pong.
    async fn flush(&self) -> Result<(), DeliveryError> {
        let flush = async { self.sink.lock().await.flush().await };
        match tokio::time::timeout(self.timeout, flush).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::Closed),
            Err(_) => Err(DeliveryError::Timeout),
        }
    }

    async fn close(&self, code: CloseCode, reason: impl Into<Cow<'static, str>>) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if let Err(e) = self.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "close frame not sent");
        }
    }
}

#[async_trait]
impl<S> PingSink for SocketWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn ping(&self) -> Result<(), DeliveryError> {
        self.send(Message::Ping(Vec::new())).await
    }
}

/// Why the read/write loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    PeerClosed,
    PeerGone,
    Unresponsive,
    ClosedByHub,
    WriteFailed,
}

/// Drive one upgraded connection to completion.
#[instrument(skip_all, fields(conn = %Uuid::new_v4(), %addr, room = %session.room_id, user = %session.user_id))]
pub(crate) async fn serve<S>(
    ws: WebSocketStream<S>,
    addr: SocketAddr,
    session: Session,
    ctx: GatewayContext,
    permit: AdmissionPermit,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = ws.split();
    let writer = Arc::new(SocketWriter {
        sink: Mutex::new(sink),
        timeout: ctx.admission.config().write_timeout(),
    });

    if let Err(e) = ctx
        .tracker
        .validate_and_track(&session.room_id, &session.user_id)
        .await
    {
        info!(reason = e.error_code(), "room join refused");
        writer.close(CloseCode::from(e.close_code()), e.to_string()).await;
        return;
    }

    let (transport, mut outbound) = ChannelTransport::channel(ctx.hub.config().outbound_queue);
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let state = ConnectionState::new(
        session.room_id.as_str(),
        session.user_id.as_str(),
        Arc::clone(&transport),
    );
    if let Err(e) = ctx.hub.register(Arc::clone(&state)).await {
        warn!(error = %e, "hub registration failed");
        untrack(&ctx, &session).await;
        writer.close(CloseCode::Error, "registration failed").await;
        return;
    }
    info!("connection established");

    let probe = ctx
        .admission
        .spawn_liveness_probe(Arc::clone(&writer) as Arc<dyn PingSink>);

    let exit = loop {
        tokio::select! {
            () = probe.dead() => break Exit::Unresponsive,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break Exit::ClosedByHub };
                let text = String::from_utf8_lossy(&frame).into_owned();
                if let Err(e) = writer.send(Message::Text(text)).await {
                    debug!(error = %e, "frame write failed");
                    break Exit::WriteFailed;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&ctx, &session, transport.as_ref(), text.as_bytes()).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        handle_inbound(&ctx, &session, transport.as_ref(), &data).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        probe.record_pong();
                        state.touch();
                        refresh(&ctx, &session).await;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        if writer.flush().await.is_err() {
                            break Exit::WriteFailed;
                        }
                    }
                    Some(Ok(Message::Close(_))) => break Exit::PeerClosed,
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "read failed");
                        break Exit::PeerGone;
                    }
                    None => break Exit::PeerGone,
                }
            }
        }
    };

    ctx.hub.unregister(&state).await;
    // A newer connection of the same user may own the tracked slot now.
    if !ctx.hub.is_user_online(&session.room_id, &session.user_id) {
        untrack(&ctx, &session).await;
    }
    probe.stop().await;
    match exit {
        Exit::ClosedByHub => writer.close(CloseCode::Away, "connection replaced or server stopping").await,
        Exit::Unresponsive => writer.close(CloseCode::Policy, "pong timeout").await,
        // The close reply is already queued.
        Exit::PeerClosed => {
            let _ = writer.flush().await;
        }
        Exit::PeerGone | Exit::WriteFailed => {}
    }
    info!(?exit, "connection closed");
    drop(permit);
}

async fn untrack(ctx: &GatewayContext, session: &Session) {
    if let Err(e) = ctx
        .tracker
        .remove_connection(&session.room_id, &session.user_id)
        .await
    {
        warn!(error = %e, "failed to remove tracked connection");
    }
}

async fn refresh(ctx: &GatewayContext, session: &Session) {
    match ctx
        .tracker
        .refresh_connection(&session.room_id, &session.user_id)
        .await
    {
        Ok(true) => {}
        Ok(false) => debug!("tracked connection expired before refresh"),
        Err(e) => warn!(error = %e, "failed to refresh tracked connection"),
    }
}

/// Turn one client frame into a room event.
async fn handle_inbound(ctx: &GatewayContext, session: &Session, reply: &dyn Transport, raw: &[u8]) {
    let mut event: Event = match serde_json::from_slice(raw) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "unparseable client frame");
            send_error(ctx, reply, "invalid_frame", "frame is not a valid event");
            return;
        }
    };
    if matches!(
        event.kind,
        EventKind::Presence | EventKind::Notification | EventKind::System
    ) {
        send_error(ctx, reply, "reserved_type", "event type is reserved for the server");
        return;
    }
    // Identity comes from the session, never from the frame.
    event.room_id = Some(session.room_id.clone());
    event.user_id = Some(session.user_id.clone());

    match check_permission(ctx, session, event.kind).await {
        Ok(SendDecision::Allowed) => {}
        Ok(SendDecision::Denied(reason)) => {
            debug!(kind = ?event.kind, %reason, "client event denied");
            send_error(ctx, reply, "forbidden", &reason.to_string());
            return;
        }
        Err(e) => {
            warn!(error = %e, "permission check failed");
            send_error(ctx, reply, e.error_code(), &e.to_string());
            return;
        }
    }

    if let Err(e) = ctx.hub.broadcast_to_room(&session.room_id, &event).await {
        warn!(error = %e, "room broadcast failed");
    }
}

async fn check_permission(
    ctx: &GatewayContext,
    session: &Session,
    kind: EventKind,
) -> Result<SendDecision, TrackerError> {
    let role = session.role.as_deref();
    let (room, user) = (session.room_id.as_str(), session.user_id.as_str());
    match kind {
        EventKind::Sticker => ctx.tracker.can_user_send_sticker(room, user, role).await,
        EventKind::Reaction => ctx.tracker.can_user_send_reaction(room, user, role).await,
        _ => ctx.tracker.can_user_send_message(room, user, role).await,
    }
}

/// Best-effort error frame to the sender only.
fn send_error(ctx: &GatewayContext, reply: &dyn Transport, code: &str, message: &str) {
    let event = Event::new(EventKind::System, json!({ "error": code, "message": message }));
    match ctx.admission.buffers().encode_json(&event) {
        Ok(frame) => {
            if let Err(e) = reply.send(frame) {
                debug!(error = %e, "error frame dropped");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode error frame"),
    }
}
