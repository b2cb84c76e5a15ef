//! Per-connection liveness probing.
//!
//! A probe pings the peer every `ping_interval`. Every pong pushes the read
//! deadline `pong_wait` into the future. The probe gives up, and cancels its
//! token, when a ping cannot be written within `write_timeout` or when the
//! deadline passes without a pong.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::DeliveryError;

/// Where pings are written. Implemented by the connection's writer.
#[async_trait]
pub trait PingSink: Send + Sync {
    async fn ping(&self) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessSettings {
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_timeout: Duration,
}

pub struct LivenessProbe {
    token: CancellationToken,
    handle: JoinHandle<()>,
    deadline: Arc<Mutex<Instant>>,
    pong_wait: Duration,
}

impl LivenessProbe {
    pub(crate) fn spawn(sink: Arc<dyn PingSink>, settings: LivenessSettings) -> Self {
        let token = CancellationToken::new();
        let deadline = Arc::new(Mutex::new(Instant::now() + settings.pong_wait));
        let handle = tokio::spawn(run(sink, settings, token.clone(), deadline.clone()));
        Self {
            token,
            handle,
            deadline,
            pong_wait: settings.pong_wait,
        }
    }

    /// The peer answered; extend the read deadline.
    pub fn record_pong(&self) {
        *self.deadline.lock() = Instant::now() + self.pong_wait;
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    /// Resolves once the probe has declared the peer dead or was stopped.
    pub fn dead(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_dead(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the probe and wait for its task to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            debug!(error = %e, "liveness task ended abnormally");
        }
    }
}

#[instrument(skip_all)]
async fn run(
    sink: Arc<dyn PingSink>,
    settings: LivenessSettings,
    token: CancellationToken,
    deadline: Arc<Mutex<Instant>>,
) {
    let mut ticker = tokio::time::interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let expires = *deadline.lock();
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep_until(expires) => {
                // A pong may have moved the deadline while we slept.
                if *deadline.lock() <= Instant::now() {
                    debug!("no pong before deadline");
                    break;
                }
            }
            _ = ticker.tick() => {
                match tokio::time::timeout(settings.write_timeout, sink.ping()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(error = %e, "ping write failed");
                        break;
                    }
                    Err(_) => {
                        debug!("ping write timed out");
                        break;
                    }
                }
            }
        }
    }
    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        pings: AtomicUsize,
        broken: AtomicBool,
    }

    #[async_trait]
    impl PingSink for CountingSink {
        async fn ping(&self) -> Result<(), DeliveryError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(DeliveryError::Closed);
            }
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn settings() -> LivenessSettings {
        LivenessSettings {
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pings_on_interval_while_pongs_arrive() {
        let sink = Arc::new(CountingSink::default());
        let probe = LivenessProbe::spawn(sink.clone(), settings());

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            probe.record_pong();
        }
        tokio::task::yield_now().await;
        assert!(!probe.is_dead());
        assert!(sink.pings.load(Ordering::SeqCst) >= 3);
        probe.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pongs_kill_the_probe() {
        let sink = Arc::new(CountingSink::default());
        let probe = LivenessProbe::spawn(sink, settings());
        tokio::time::timeout(Duration::from_secs(61), probe.dead())
            .await
            .unwrap();
        assert!(probe.is_dead());
        probe.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ping_exits_the_task() {
        let sink = Arc::new(CountingSink::default());
        sink.broken.store(true, Ordering::SeqCst);
        let probe = LivenessProbe::spawn(sink, settings());
        tokio::time::timeout(Duration::from_secs(31), probe.dead())
            .await
            .unwrap();
        probe.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pong_extends_deadline() {
        let probe = LivenessProbe::spawn(Arc::new(CountingSink::default()), settings());
        let first = probe.deadline();
        tokio::time::sleep(Duration::from_secs(5)).await;
        probe.record_pong();
        assert!(probe.deadline() > first);
        probe.stop().await;
    }
}
