//! Test server management.
//!
//! Runs a full roomlink service and gateway inside the test process on an
//! ephemeral port.

use roomlink::clock::{Clock, SystemClock};
use roomlink::config::Config;
use roomlink::network::{Gateway, QuerySessionResolver};
use roomlink::service::Service;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A test server instance.
pub struct TestServer {
    addr: SocketAddr,
    service: Service,
    shutdown: CancellationToken,
    gateway: JoinHandle<anyhow::Result<()>>,
}

#[allow(dead_code)]
impl TestServer {
    /// Spawn a server. `extra` is appended to a minimal TOML configuration.
    pub async fn spawn(extra: &str) -> anyhow::Result<Self> {
        Self::spawn_with_clock(extra, Arc::new(SystemClock)).await
    }

    pub async fn spawn_with_clock(extra: &str, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let content = format!(
            r#"
[server]
name = "roomlink-test"
instance = "test-{}"

[listen]
address = "127.0.0.1:0"
{extra}
"#,
            uuid::Uuid::new_v4().simple()
        );
        let config = Config::from_toml(&content)?;
        let service = Service::build_with_clock(&config, clock).await?;
        let gateway = Gateway::bind(
            &config.listen,
            service.gateway_context(Arc::new(QuerySessionResolver)),
        )
        .await?;
        let addr = gateway.local_addr()?;
        let shutdown = CancellationToken::new();
        let gateway = tokio::spawn(gateway.run(shutdown.clone()));
        Ok(Self {
            addr,
            service,
            shutdown,
            gateway,
        })
    }

    pub fn url(&self, user: &str, room: &str) -> String {
        format!("ws://{}/ws?userId={user}&roomId={room}", self.addr)
    }

    pub fn url_with_role(&self, user: &str, room: &str, role: &str) -> String {
        format!("{}&role={role}", self.url(user, room))
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Wait until the hub reports `user` online in `room`.
    pub async fn wait_online(&self, room: &str, user: &str) -> bool {
        let hub = &self.service.hub;
        super::eventually(Duration::from_secs(5), || hub.is_user_online(room, user)).await
    }

    pub async fn wait_offline(&self, room: &str, user: &str) -> bool {
        let hub = &self.service.hub;
        super::eventually(Duration::from_secs(5), || !hub.is_user_online(room, user)).await
    }

    /// Stop accepting, shut the service down and hand it back for inspection.
    pub async fn stop(self) -> Service {
        self.shutdown.cancel();
        let _ = self.gateway.await;
        self.service.shutdown().await;
        self.service
    }
}
