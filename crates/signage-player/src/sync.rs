//! Playlist synchronizer.
//!
//! `Synchronizer` owns the published `PlaylistSnapshot`.  Every change builds
//! a fresh snapshot and swaps the `Arc`, so a reader holding the previous one
//! never observes a half-applied update.
//!
//! The feed task (`spawn_feed`) owns the network side: subscribe, resync,
//! forward frames, report disconnects, back off, repeat.  It never touches the
//! snapshot; everything it learns is enqueued for the core loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use serde::Deserialize;
use signage_proto::protocol::{DeviceIdentity, PlaylistItem, PlaylistRecord, PlaylistSnapshot};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError};

// ── wire messages ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RemovedItem {
    pub id: String,
}

/// One frame of the change feed.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedMessage {
    Added { item: PlaylistRecord },
    Changed { item: PlaylistRecord },
    Removed { item: RemovedItem },
    /// Operator-issued interrupt delivered in-band.
    ForceStop,
}

impl FeedMessage {
    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

#[derive(Debug, Clone)]
pub enum PlaylistChange {
    Upsert(PlaylistRecord),
    Remove(String),
}

// ── synchronizer ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Synchronizer {
    snapshot: Arc<PlaylistSnapshot>,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest published snapshot.  Never blocks.
    pub fn current(&self) -> Arc<PlaylistSnapshot> {
        Arc::clone(&self.snapshot)
    }

    /// Replace the snapshot wholesale.
    pub fn install(&mut self, records: Vec<PlaylistRecord>) -> Arc<PlaylistSnapshot> {
        let mut items: Vec<PlaylistItem> = records.into_iter().map(PlaylistItem::from).collect();
        sort_items(&mut items);
        self.publish(items)
    }

    /// Apply one change.  Returns the new snapshot, or `None` when the change
    /// was a no-op (removal of an unknown item, identical update).
    pub fn apply(&mut self, change: PlaylistChange) -> Option<Arc<PlaylistSnapshot>> {
        let mut items = self.snapshot.items.clone();
        match change {
            PlaylistChange::Upsert(record) => {
                let item = PlaylistItem::from(record);
                match items.iter_mut().find(|i| i.id == item.id) {
                    Some(existing) if *existing == item => return None,
                    Some(existing) => *existing = item,
                    None => items.push(item),
                }
            }
            PlaylistChange::Remove(id) => {
                let before = items.len();
                items.retain(|i| i.id != id);
                if items.len() == before {
                    debug!("sync: removal of unknown item {} ignored", id);
                    return None;
                }
            }
        }
        sort_items(&mut items);
        Some(self.publish(items))
    }

    /// Forget everything (re-pair).
    pub fn clear(&mut self) {
        self.publish(Vec::new());
    }

    fn publish(&mut self, items: Vec<PlaylistItem>) -> Arc<PlaylistSnapshot> {
        let snapshot = Arc::new(PlaylistSnapshot {
            revision: self.snapshot.revision + 1,
            items,
        });
        self.snapshot = Arc::clone(&snapshot);
        snapshot
    }
}

fn sort_items(items: &mut [PlaylistItem]) {
    items.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
    if items.windows(2).any(|w| w[0].position == w[1].position) {
        warn!("sync: playlist has duplicate positions, ordering ties by item id");
    }
}

// ── resync strategy ───────────────────────────────────────────────────────────

/// How the player catches up after (re)subscribing.  The feed cannot replay
/// missed events, so the default is a full reload.
#[async_trait]
pub trait ResyncStrategy: Send + Sync {
    async fn resync(
        &self,
        backend: &dyn Backend,
        device: &DeviceIdentity,
    ) -> Result<Vec<PlaylistRecord>, BackendError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FullReload;

#[async_trait]
impl ResyncStrategy for FullReload {
    async fn resync(
        &self,
        backend: &dyn Backend,
        device: &DeviceIdentity,
    ) -> Result<Vec<PlaylistRecord>, BackendError> {
        backend.fetch_playlist(device).await
    }
}

// ── feed task ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum FeedEvent {
    /// Subscribed and reloaded; every later `Frame` postdates this snapshot.
    Resynced(Vec<PlaylistRecord>),
    Frame(String),
    Disconnected(String),
}

/// Exponential backoff with jitter for resubscription.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .min
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::try_from_secs_f64(base.as_secs_f64() * jitter)
            .unwrap_or(self.max)
            .min(self.max)
            .max(self.min)
    }
}

/// Running feed task.  Dropping the handle stops it.
pub struct FeedHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.join.abort();
    }
}

pub struct FeedSettings {
    pub backend: Arc<dyn Backend>,
    pub resync: Arc<dyn ResyncStrategy>,
    pub device: DeviceIdentity,
    pub backoff: Backoff,
}

/// Spawn the feed task.  `wrap` turns each `FeedEvent` into the core's event
/// type (the core tags it with the session epoch).
pub fn spawn_feed<E, F>(settings: FeedSettings, tx: mpsc::Sender<E>, wrap: F) -> FeedHandle
where
    E: Send + 'static,
    F: Fn(FeedEvent) -> E + Send + Sync + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let join = tokio::spawn(async move {
        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::select! {
                _ = token.cancelled() => return,
                outcome = run_once(&settings, &tx, &wrap) => outcome,
            };
            let reason = match outcome {
                FeedOutcome::Closed { streamed, reason } => {
                    if streamed {
                        attempt = 0;
                    }
                    reason
                }
                FeedOutcome::QueueGone => return,
            };

            warn!("feed: disconnected: {}", reason);
            if tx.send(wrap(FeedEvent::Disconnected(reason))).await.is_err() {
                return;
            }

            let delay = settings.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!("feed: resubscribing in {:?}", delay);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    });
    FeedHandle { cancel, join }
}

enum FeedOutcome {
    Closed { streamed: bool, reason: String },
    QueueGone,
}

async fn run_once<E, F>(settings: &FeedSettings, tx: &mpsc::Sender<E>, wrap: &F) -> FeedOutcome
where
    F: Fn(FeedEvent) -> E,
{
    let device = &settings.device;

    // Subscribe before reloading so nothing that happens during the reload
    // is lost; replays of already-applied rows are harmless upserts.
    let mut frames = match settings.backend.subscribe(device).await {
        Ok(frames) => frames,
        Err(e) => {
            return FeedOutcome::Closed {
                streamed: false,
                reason: format!("subscribe failed: {}", e),
            }
        }
    };

    let records = match settings.resync.resync(settings.backend.as_ref(), device).await {
        Ok(records) => records,
        Err(e) => {
            return FeedOutcome::Closed {
                streamed: false,
                reason: format!("reload failed: {}", e),
            }
        }
    };
    info!(
        "feed: subscribed for {} and reloaded {} items",
        device.device_id,
        records.len()
    );
    if tx.send(wrap(FeedEvent::Resynced(records))).await.is_err() {
        return FeedOutcome::QueueGone;
    }

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(text) => {
                if tx.send(wrap(FeedEvent::Frame(text))).await.is_err() {
                    return FeedOutcome::QueueGone;
                }
            }
            Err(e) => {
                return FeedOutcome::Closed {
                    streamed: true,
                    reason: e.to_string(),
                }
            }
        }
    }
    FeedOutcome::Closed {
        streamed: true,
        reason: "feed closed by backend".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(id: &str, position: i64) -> PlaylistRecord {
        PlaylistRecord {
            id: id.into(),
            content_id: Some(format!("content-{}", id)),
            content_type: Some("image".into()),
            source_url: Some(format!("https://cdn.example.com/{}.png", id)),
            display_name: Some(id.to_uppercase()),
            start_time: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2026, 3, 1, 20, 0, 0).unwrap(),
            order_index: position,
        }
    }

    fn ids(snapshot: &PlaylistSnapshot) -> Vec<&str> {
        snapshot.items.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn test_install_sorts_by_position() {
        let mut sync = Synchronizer::new();
        let snap = sync.install(vec![record("c", 2), record("a", 0), record("b", 1)]);
        assert_eq!(ids(&snap), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_removing_unknown_items_is_a_noop() {
        let mut sync = Synchronizer::new();
        let before = sync.install(vec![record("a", 0), record("b", 1)]);
        for id in ["x", "y", "a-but-not-really"] {
            assert!(sync.apply(PlaylistChange::Remove(id.into())).is_none());
        }
        let after = sync.current();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(*before, *after);
    }

    #[test]
    fn test_changed_for_missing_item_is_added() {
        let mut sync = Synchronizer::new();
        sync.install(vec![record("a", 0), record("c", 5)]);
        let msg = FeedMessage::decode(
            &serde_json::json!({ "kind": "changed", "item": record("b", 3) }).to_string(),
        )
        .unwrap();
        let FeedMessage::Changed { item } = msg else {
            panic!("wrong variant");
        };
        let snap = sync.apply(PlaylistChange::Upsert(item)).unwrap();
        assert_eq!(ids(&snap), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_reorder_resorts_snapshot() {
        let mut sync = Synchronizer::new();
        sync.install(vec![record("a", 0), record("b", 1), record("c", 2)]);
        let snap = sync.apply(PlaylistChange::Upsert(record("a", 9))).unwrap();
        assert_eq!(ids(&snap), vec!["b", "c", "a"]);
        // identical update publishes nothing
        assert!(sync.apply(PlaylistChange::Upsert(record("a", 9))).is_none());
    }

    #[test]
    fn test_old_snapshot_is_unaffected_by_updates() {
        let mut sync = Synchronizer::new();
        let old = sync.install(vec![record("a", 0)]);
        sync.apply(PlaylistChange::Upsert(record("b", 1))).unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(sync.current().len(), 2);
        assert!(sync.current().revision > old.revision);
    }

    #[test]
    fn test_decode_failures_are_reported() {
        assert!(FeedMessage::decode("{").is_err());
        assert!(FeedMessage::decode(r#"{"kind":"exploded"}"#).is_err());
        assert!(FeedMessage::decode(r#"{"kind":"added","item":{"id":"x"}}"#).is_err());
        assert!(matches!(
            FeedMessage::decode(r#"{"kind":"force_stop"}"#).unwrap(),
            FeedMessage::ForceStop
        ));
        assert!(matches!(
            FeedMessage::decode(r#"{"kind":"removed","item":{"id":"x"}}"#).unwrap(),
            FeedMessage::Removed { .. }
        ));
    }

    #[test]
    fn test_backoff_bounds() {
        let backoff = Backoff {
            min: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        for attempt in 0..40 {
            let d = backoff.delay(attempt);
            assert!(d >= Duration::from_secs(1), "{:?}", d);
            assert!(d <= Duration::from_secs(30), "{:?}", d);
        }
        assert!(backoff.delay(10) >= Duration::from_secs(24));
    }

    #[test]
    fn test_backoff_saturates_instead_of_overflowing() {
        let backoff = Backoff {
            min: Duration::MAX / 2,
            max: Duration::MAX,
        };
        for attempt in [0, 1, 5, 40] {
            let d = backoff.delay(attempt);
            assert!(d >= backoff.min && d <= backoff.max, "{:?}", d);
        }
    }
}
