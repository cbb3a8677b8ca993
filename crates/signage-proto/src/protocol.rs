use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable identity handed out by the backend when a pairing code is
/// activated.  Immutable for the lifetime of the session that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    /// The (normalised) code that was exchanged for this identity.
    pub pairing_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Image,
    Video,
}

impl ContentKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" => Some(ContentKind::Image),
            "video" => Some(ContentKind::Video),
            _ => None,
        }
    }
}

/// A resolved, playable piece of media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    pub content_id: String,
    pub kind: ContentKind,
    pub source_url: String,
    pub display_name: String,
}

/// One playlist row as the backend sends it (fetch and change feed).
///
/// Content columns come from a join and may be missing; a row with missing or
/// unusable content still decodes and simply becomes unplayable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistRecord {
    pub id: String,
    #[serde(default)]
    pub content_id: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub order_index: i64,
}

/// Playlist entry as held by the player.  `content` is `None` when the row
/// could not be resolved to playable media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub id: String,
    pub position: i64,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub content: Option<ContentRef>,
}

impl From<PlaylistRecord> for PlaylistItem {
    fn from(rec: PlaylistRecord) -> Self {
        let content = resolve_content(&rec);
        Self {
            id: rec.id,
            position: rec.order_index,
            starts_at: rec.start_time,
            ends_at: rec.end_time,
            content,
        }
    }
}

fn resolve_content(rec: &PlaylistRecord) -> Option<ContentRef> {
    let content_id = rec.content_id.as_deref()?.trim();
    if content_id.is_empty() {
        return None;
    }
    let kind = ContentKind::parse(rec.content_type.as_deref()?)?;
    let source_url = rec.source_url.as_deref()?.trim();
    let parsed = reqwest::Url::parse(source_url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https" | "file") {
        return None;
    }
    let display_name = rec
        .display_name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| content_id.to_string());

    Some(ContentRef {
        content_id: content_id.to_string(),
        kind,
        source_url: source_url.to_string(),
        display_name,
    })
}

/// Immutable, ordered view of the playlist at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaylistSnapshot {
    /// Incremented every time the synchronizer publishes a new snapshot.
    pub revision: u64,
    pub items: Vec<PlaylistItem>,
}

impl PlaylistSnapshot {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PlaylistItem> {
        self.items.get(index)
    }
}

/// Playback state of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
    Stopped,
}

/// Internal connection state, owned by the session.
///
/// Transitions:
///   Unpaired -> Pairing -> Connected <-> Degraded
///   Pairing -> PairedDisconnected -> Connected
///   Connected | Degraded | PairedDisconnected -> Unpaired   (re-pair only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Unpaired,
    Pairing,
    PairedDisconnected,
    Connected,
    Degraded,
}

/// Externally visible connectivity, a projection of `ConnectionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl From<ConnectionState> for DeviceStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Unpaired | ConnectionState::PairedDisconnected => {
                DeviceStatus::Disconnected
            }
            ConnectionState::Pairing => DeviceStatus::Connecting,
            ConnectionState::Connected => DeviceStatus::Connected,
            ConnectionState::Degraded => DeviceStatus::Degraded,
        }
    }
}

/// What is on screen right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NowShowing {
    pub item_id: String,
    pub display_name: String,
    pub kind: ContentKind,
    pub index: usize,
    pub count: usize,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// Full player status as published to the control API.  `rev` increments on
/// every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerStatus {
    #[serde(default)]
    pub rev: u64,
    pub status: DeviceStatus,
    pub connection: ConnectionState,
    pub device: Option<DeviceIdentity>,
    pub playback: PlaybackState,
    pub now_showing: Option<NowShowing>,
    pub playlist_len: usize,
    pub playlist_revision: u64,
    pub heartbeat_failures: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub recent_warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(content_type: &str, url: &str) -> PlaylistRecord {
        PlaylistRecord {
            id: "row-1".into(),
            content_id: Some("c-1".into()),
            content_type: Some(content_type.into()),
            source_url: Some(url.into()),
            display_name: Some("Lobby loop".into()),
            start_time: Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2026, 1, 1, 17, 0, 0).unwrap(),
            order_index: 3,
        }
    }

    #[test]
    fn test_record_resolves_to_playable_item() {
        let item = PlaylistItem::from(record("VIDEO", "https://cdn.example.com/a.mp4"));
        assert_eq!(item.position, 3);
        let content = item.content.expect("playable");
        assert_eq!(content.kind, ContentKind::Video);
        assert_eq!(content.display_name, "Lobby loop");
    }

    #[test]
    fn test_unknown_kind_or_bad_url_is_unplayable() {
        assert!(PlaylistItem::from(record("pdf", "https://cdn.example.com/a.pdf"))
            .content
            .is_none());
        assert!(PlaylistItem::from(record("image", "not a url")).content.is_none());
        assert!(PlaylistItem::from(record("image", "ftp://host/a.png"))
            .content
            .is_none());
    }

    #[test]
    fn test_record_without_content_columns_decodes() {
        let json = r#"{
            "id": "row-9",
            "start_time": "2026-01-01T09:00:00Z",
            "end_time": "2026-01-01T10:00:00Z",
            "order_index": 0
        }"#;
        let rec: PlaylistRecord = serde_json::from_str(json).unwrap();
        assert!(PlaylistItem::from(rec).content.is_none());
    }

    #[test]
    fn test_status_projection() {
        assert_eq!(
            DeviceStatus::from(ConnectionState::Pairing),
            DeviceStatus::Connecting
        );
        assert_eq!(
            DeviceStatus::from(ConnectionState::PairedDisconnected),
            DeviceStatus::Disconnected
        );
        assert_eq!(
            DeviceStatus::from(ConnectionState::Degraded),
            DeviceStatus::Degraded
        );
    }
}
