//! Gateway - WebSocket listener that accepts incoming connections.
//!
//! Every accepted socket passes admission before anything else is allocated
//! for it, then upgrades with origin checking and session resolution and
//! hands off to its own connection task.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::connection;
use super::session::{Session, SessionResolver};
use crate::admission::{AdmissionPermit, ConnectionAdmission};
use crate::config::ListenConfig;
use crate::hub::PresenceHub;
use crate::tracker::RoomConnectionTracker;

/// Everything a connection task needs.
#[derive(Clone)]
pub struct GatewayContext {
    pub admission: Arc<ConnectionAdmission>,
    pub tracker: Arc<RoomConnectionTracker>,
    pub hub: Arc<PresenceHub>,
    pub resolver: Arc<dyn SessionResolver>,
    /// Every connection task, so shutdown can wait for their cleanup.
    pub connections: TaskTracker,
}

/// The Gateway accepts incoming WebSocket connections and spawns handlers.
pub struct Gateway {
    listener: TcpListener,
    allow_origins: Arc<[String]>,
    ctx: GatewayContext,
}

impl Gateway {
    /// Bind the gateway to the configured address.
    pub async fn bind(config: &ListenConfig, ctx: GatewayContext) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.address).await?;
        info!(address = %listener.local_addr()?, "WebSocket listener bound");
        if ctx.admission.config().enable_compression {
            debug!("per-message compression requested but not negotiated");
        }
        Ok(Self {
            listener,
            allow_origins: config.allow_origins.clone().into(),
            ctx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled.
    #[instrument(skip_all, name = "gateway")]
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept WebSocket connection");
                    continue;
                }
            };

            let permit = match self.ctx.admission.admit(addr.ip()) {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(%addr, reason = e.error_code(), "WebSocket connection rejected");
                    drop(stream);
                    continue;
                }
            };

            debug!(%addr, "WebSocket connection attempt");
            let ctx = self.ctx.clone();
            let allowed = Arc::clone(&self.allow_origins);
            self.ctx.connections.spawn(async move {
                accept(stream, addr, permit, ctx, allowed).await;
            });
        }
        info!("gateway stopped accepting");
        Ok(())
    }
}

async fn accept(
    stream: TcpStream,
    addr: SocketAddr,
    permit: AdmissionPermit,
    ctx: GatewayContext,
    allowed: Arc<[String]>,
) {
    let config = ctx.admission.config();
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%addr, error = %e, "failed to set TCP_NODELAY");
    }
    let stream = BufReader::with_capacity(config.read_buffer_size, stream);
    let handshake_timeout = config.read_timeout();

    let mut session: Option<Session> = None;
    let resolver = Arc::clone(&ctx.resolver);
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        check_origin(&allowed, req, addr)?;
        match resolver.resolve(req) {
            Ok(resolved) => {
                session = Some(resolved);
                Ok(response)
            }
            Err(e) => {
                debug!(%addr, reason = e.error_code(), "session rejected");
                Err(reject(e.http_status(), e.to_string()))
            }
        }
    };

    let handshake = accept_hdr_async_with_config(
        stream,
        callback,
        Some(ctx.admission.websocket_config()),
    );
    let ws = match tokio::time::timeout(handshake_timeout, handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!(%addr, error = %e, "WebSocket handshake failed");
            return;
        }
        Err(_) => {
            warn!(%addr, timeout = ?handshake_timeout, "WebSocket handshake timed out");
            return;
        }
    };
    // The callback only returns Ok after storing a session.
    let Some(session) = session else {
        return;
    };
    connection::serve(ws, addr, session, ctx, permit).await;
}

/// An empty allow-list admits every origin.
fn check_origin(allowed: &[String], req: &Request, addr: SocketAddr) -> Result<(), ErrorResponse> {
    if allowed.is_empty() {
        return Ok(());
    }
    if let Some(origin) = req.headers().get("Origin").and_then(|o| o.to_str().ok()) {
        if allowed.iter().any(|a| a == origin || a == "*") {
            return Ok(());
        }
        warn!(%addr, origin = %origin, "WebSocket CORS rejected");
    }
    Err(reject(StatusCode::FORBIDDEN, "CORS origin not allowed".to_string()))
}

fn reject(status: StatusCode, body: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(origin: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/ws?userId=u&roomId=r");
        if let Some(origin) = origin {
            builder = builder.header("Origin", origin);
        }
        builder.body(()).unwrap()
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[test]
    fn empty_allow_list_admits_everyone() {
        assert!(check_origin(&[], &request(None), addr()).is_ok());
    }

    #[test]
    fn origin_must_be_listed() {
        let allowed = vec!["https://chat.example".to_string()];
        assert!(check_origin(&allowed, &request(Some("https://chat.example")), addr()).is_ok());

        let err = check_origin(&allowed, &request(Some("https://evil.example")), addr()).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert!(check_origin(&allowed, &request(None), addr()).is_err());
    }

    #[test]
    fn wildcard_admits_any_origin() {
        let allowed = vec!["*".to_string()];
        assert!(check_origin(&allowed, &request(Some("https://any.example")), addr()).is_ok());
    }
}
