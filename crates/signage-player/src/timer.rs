//! Clock and timer service.
//!
//! Timers never touch player state.  When one elapses it enqueues an event on
//! the core's channel and the core decides what (if anything) it means.
//! Events carry a generation number so a fire that was already queued before
//! `cancel()` is recognised as stale by the state machine that armed it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

/// A single reading of both clocks.  `wall` is used for schedule windows,
/// `mono` for everything that measures elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub wall: DateTime<Utc>,
    pub mono: Instant,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Tick;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Tick {
        Tick {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }
}

/// Wall clock that advances in lockstep with tokio's (possibly paused) clock.
/// Lets tests drive schedule windows with `tokio::time::advance`.
#[derive(Debug, Clone, Copy)]
pub struct AnchoredClock {
    wall_anchor: DateTime<Utc>,
    mono_anchor: Instant,
}

impl AnchoredClock {
    pub fn new(wall_anchor: DateTime<Utc>) -> Self {
        Self {
            wall_anchor,
            mono_anchor: Instant::now(),
        }
    }
}

impl Clock for AnchoredClock {
    fn now(&self) -> Tick {
        let mono = Instant::now();
        let elapsed = mono.saturating_duration_since(self.mono_anchor);
        let wall = self.wall_anchor
            + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        Tick { wall, mono }
    }
}

/// Handle to a scheduled delivery.  Dropping it cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Schedules events onto an `mpsc` queue.
pub struct TimerService<E> {
    tx: mpsc::Sender<E>,
}

impl<E> Clone for TimerService<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Send + 'static> TimerService<E> {
    pub fn new(tx: mpsc::Sender<E>) -> Self {
        Self { tx }
    }

    /// Deliver `event` once after `after`.
    pub fn once(&self, after: Duration, event: E) -> TimerHandle {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if tx.send(event).await.is_err() {
                debug!("timer: event queue closed before delivery");
            }
        });
        TimerHandle {
            abort: task.abort_handle(),
        }
    }

    /// Deliver `make()` every `period`, first delivery one period from now.
    pub fn every<F>(&self, period: Duration, mut make: F) -> TimerHandle
    where
        F: FnMut() -> E + Send + 'static,
    {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(make()).await.is_err() {
                    break;
                }
            }
        });
        TimerHandle {
            abort: task.abort_handle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_once_delivers_after_delay() {
        let (tx, mut rx) = mpsc::channel(8);
        let timers = TimerService::new(tx);
        let _h = timers.once(Duration::from_secs(5), 7u32);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rx.try_recv().ok(), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_delivery() {
        let (tx, mut rx) = mpsc::channel(8);
        let timers = TimerService::new(tx);
        let h = timers.once(Duration::from_secs(1), 1u32);
        drop(h);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_repeats_until_dropped() {
        let (tx, mut rx) = mpsc::channel(8);
        let timers = TimerService::new(tx);
        let mut n = 0u32;
        let h = timers.every(Duration::from_secs(30), move || {
            n += 1;
            n
        });

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));

        drop(h);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_anchored_clock_follows_tokio_time() {
        let anchor = Utc::now();
        let clock = AnchoredClock::new(anchor);
        tokio::time::advance(Duration::from_secs(12)).await;
        let tick = clock.now();
        assert_eq!(tick.wall - anchor, chrono::Duration::seconds(12));
    }
}
