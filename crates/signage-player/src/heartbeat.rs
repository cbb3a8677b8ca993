//! Liveness reporting.  Ticks come from the timer service; every tick fires
//! one heartbeat call whose result is fed back to the core as an event.  A
//! failure is only counted; the next tick is the retry.

use std::sync::Arc;
use std::time::Duration;

use signage_proto::protocol::DeviceIdentity;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::timer::{TimerHandle, TimerService};

pub struct HeartbeatReporter {
    backend: Arc<dyn Backend>,
    interval: Duration,
    ticker: Option<TimerHandle>,
    consecutive_failures: u32,
}

impl HeartbeatReporter {
    pub fn new(backend: Arc<dyn Backend>, interval: Duration) -> Self {
        Self {
            backend,
            interval,
            ticker: None,
            consecutive_failures: 0,
        }
    }

    /// Start ticking.  Restarting replaces the previous ticker.
    pub fn start<E, F>(&mut self, timers: &TimerService<E>, tick: F)
    where
        E: Send + 'static,
        F: FnMut() -> E + Send + 'static,
    {
        self.consecutive_failures = 0;
        self.ticker = Some(timers.every(self.interval, tick));
    }

    pub fn stop(&mut self) {
        self.ticker = None;
        self.consecutive_failures = 0;
    }

    /// Send one heartbeat in the background; `wrap` turns the outcome into a
    /// core event.
    pub fn beat<E, F>(&self, device: &DeviceIdentity, tx: mpsc::Sender<E>, wrap: F)
    where
        E: Send + 'static,
        F: FnOnce(Result<(), String>) -> E + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let device = device.clone();
        tokio::spawn(async move {
            let result = backend
                .heartbeat(&device)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(wrap(result)).await;
        });
    }

    /// Record the outcome of one heartbeat.  Returns the failure streak.
    pub fn record(&mut self, result: Result<(), String>) -> u32 {
        match result {
            Ok(()) => {
                if self.consecutive_failures > 0 {
                    debug!(
                        "heartbeat: recovered after {} failures",
                        self.consecutive_failures
                    );
                }
                self.consecutive_failures = 0;
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    "heartbeat: failed ({} in a row): {}",
                    self.consecutive_failures, e
                );
            }
        }
        self.consecutive_failures
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[derive(Debug, PartialEq)]
    enum Ev {
        Tick,
        Result(Result<(), String>),
    }

    fn device() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "dev-1".into(),
            device_name: "Lobby".into(),
            pairing_code: "AB12CD".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_interval_until_stopped() {
        let (tx, mut rx) = mpsc::channel(16);
        let timers = TimerService::new(tx);
        let backend = Arc::new(MemoryBackend::new());
        let mut hb = HeartbeatReporter::new(backend, Duration::from_secs(30));

        hb.start(&timers, || Ev::Tick);
        tokio::time::sleep(Duration::from_secs(95)).await;
        let mut ticks = 0;
        while let Ok(ev) = rx.try_recv() {
            assert_eq!(ev, Ev::Tick);
            ticks += 1;
        }
        assert_eq!(ticks, 3);

        hb.stop();
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_retried() {
        let (tx, mut rx) = mpsc::channel(16);
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_heartbeats(2);
        let mut hb = HeartbeatReporter::new(backend.clone(), Duration::from_secs(30));

        for expected in [1, 2, 0] {
            hb.beat(&device(), tx.clone(), Ev::Result);
            let Some(Ev::Result(result)) = rx.recv().await else {
                panic!("expected a heartbeat result");
            };
            assert_eq!(hb.record(result), expected);
        }
        assert_eq!(backend.heartbeat_count(), 3);
    }
}
