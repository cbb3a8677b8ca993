//! Rendering surface seam.

use async_trait::async_trait;
use signage_proto::protocol::ContentRef;

/// Something that can put one piece of content on screen at a time.
///
/// `display` returns once the surface has accepted the request; a load that
/// fails later is reported as `SurfaceEvent::Failed` with the same token.
#[async_trait]
pub trait Surface: Send + Sync {
    async fn display(&mut self, content: &ContentRef, token: u64) -> anyhow::Result<()>;
    async fn pause(&mut self) -> anyhow::Result<()>;
    async fn resume(&mut self) -> anyhow::Result<()>;
    /// Pause and rewind whatever is on screen.
    async fn halt(&mut self) -> anyhow::Result<()>;
    async fn clear(&mut self) -> anyhow::Result<()>;
    async fn shutdown(&mut self) -> anyhow::Result<()>;
}

/// Unsolicited signals from the surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// Video reached its natural end.
    Ended { token: u64 },
    Failed { token: u64, reason: String },
    Visibility { hidden: bool },
}
