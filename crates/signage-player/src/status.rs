use std::sync::Arc;

use signage_proto::protocol::PlayerStatus;
use tokio::sync::RwLock;
use tracing::debug;

use crate::logging::RecentLog;

/// Shared, read-mostly view of the player for the control API.  Only the core
/// loop publishes; everybody else reads.
#[derive(Clone)]
pub struct StatusManager {
    status: Arc<RwLock<PlayerStatus>>,
    recent: RecentLog,
}

impl StatusManager {
    pub fn new(recent: RecentLog) -> Self {
        Self {
            status: Arc::new(RwLock::new(PlayerStatus {
                rev: 1,
                ..PlayerStatus::default()
            })),
            recent,
        }
    }

    /// Current status with the recent warnings filled in.
    pub async fn get(&self) -> PlayerStatus {
        let mut status = self.status.read().await.clone();
        status.recent_warnings = self.recent.snapshot();
        status
    }

    /// Replace the status.  `rev` is bumped only when something changed.
    pub async fn publish(&self, mut next: PlayerStatus) -> bool {
        let mut current = self.status.write().await;
        next.rev = current.rev;
        next.recent_warnings = Vec::new();
        if *current == next {
            return false;
        }
        next.rev = current.rev + 1;
        debug!(
            "status rev {}: {:?}/{:?}",
            next.rev, next.connection, next.playback
        );
        *current = next;
        true
    }
}
