//! Outbound path of one client connection.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::error::DeliveryError;

/// A connection's outbound side as seen by the hub.
///
/// `send` never waits: a frame is either queued for the connection's writer
/// or the attempt fails, so one slow client cannot hold up a broadcast.
pub trait Transport: Send + Sync {
    fn send(&self, frame: Bytes) -> Result<(), DeliveryError>;

    /// Ask the writer to send a close frame and stop. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// [`Transport`] backed by a bounded queue drained by the connection task.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

impl ChannelTransport {
    /// Create a transport and the receiving half its writer drains.
    pub fn channel(capacity: usize) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        (
            Self {
                tx,
                closed: closed.clone(),
            },
            OutboundQueue { rx, closed },
        )
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Bytes) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

/// Writer side of a [`ChannelTransport`].
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
}

impl OutboundQueue {
    /// Next frame, or `None` once the transport is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            frame = self.rx.recv() => frame,
        }
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_fails_without_blocking() {
        let (transport, mut queue) = ChannelTransport::channel(1);
        transport.send(Bytes::from_static(b"a")).unwrap();
        assert_eq!(
            transport.send(Bytes::from_static(b"b")),
            Err(DeliveryError::QueueFull)
        );
        assert_eq!(queue.recv().await.unwrap(), Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn close_is_observed_by_both_halves() {
        let (transport, mut queue) = ChannelTransport::channel(4);
        transport.send(Bytes::from_static(b"queued")).unwrap();
        transport.close();
        transport.close();
        assert!(transport.is_closed());
        assert!(queue.is_closed());
        assert_eq!(
            transport.send(Bytes::from_static(b"x")),
            Err(DeliveryError::Closed)
        );
        assert!(queue.recv().await.is_none());
    }

    #[test]
    fn dropped_writer_closes_transport() {
        let (transport, queue) = ChannelTransport::channel(4);
        drop(queue);
        assert!(transport.is_closed());
        assert_eq!(
            transport.send(Bytes::from_static(b"x")),
            Err(DeliveryError::Closed)
        );
    }
}
