//! Integration test common infrastructure.
//!
//! Provides an in-process test server, a WebSocket test client and small
//! builders for hubs that share one in-memory broker.

pub mod client;
pub mod fleet;
pub mod server;

#[allow(unused_imports)]
pub use client::TestClient;
#[allow(unused_imports)]
pub use fleet::{Collector, Instance, connection, log_instance, pubsub_instance};
#[allow(unused_imports)]
pub use server::TestServer;

use std::time::Duration;

/// Poll `condition` until it holds or `within` elapses.
#[allow(dead_code)]
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
