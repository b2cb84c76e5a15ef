//! Test client for WebSocket connections.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// What the next frame from the server turned out to be.
#[derive(Debug)]
pub enum Received {
    Event(Value),
    Closed(Option<u16>),
}

/// A test WebSocket client.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[allow(dead_code)]
impl TestClient {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let (ws, _response) = connect_async(url).await?;
        Ok(Self { ws })
    }

    pub async fn send(&mut self, event: Value) -> anyhow::Result<()> {
        self.ws.send(Message::Text(event.to_string())).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, text: &str) -> anyhow::Result<()> {
        self.ws.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Next event or close, skipping control frames.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> anyhow::Result<Received> {
        loop {
            let message = tokio::time::timeout(timeout, self.ws.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for a frame"))?;
            match message {
                Some(Ok(Message::Text(text))) => return Ok(Received::Event(serde_json::from_str(&text)?)),
                Some(Ok(Message::Binary(data))) => return Ok(Received::Event(serde_json::from_slice(&data)?)),
                Some(Ok(Message::Close(frame))) => {
                    return Ok(Received::Closed(frame.map(|f| u16::from(f.code))));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(Received::Closed(None)),
            }
        }
    }

    pub async fn recv(&mut self) -> anyhow::Result<Value> {
        match self.recv_timeout(RECV_TIMEOUT).await? {
            Received::Event(event) => Ok(event),
            Received::Closed(code) => anyhow::bail!("connection closed ({code:?})"),
        }
    }

    /// Skip events until one of type `kind` arrives.
    pub async fn recv_type(&mut self, kind: &str) -> anyhow::Result<Value> {
        loop {
            let event = self.recv().await?;
            if event["type"] == kind {
                return Ok(event);
            }
        }
    }

    /// Wait for the server to close the connection and return the close code.
    pub async fn expect_close(&mut self) -> anyhow::Result<Option<u16>> {
        loop {
            if let Received::Closed(code) = self.recv_timeout(RECV_TIMEOUT).await? {
                return Ok(code);
            }
        }
    }

    /// True if nothing but control frames arrive within `timeout`.
    pub async fn is_quiet(&mut self, timeout: Duration) -> bool {
        self.recv_timeout(timeout).await.is_err()
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
