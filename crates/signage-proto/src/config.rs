use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;

pub const BACKEND_URL_ENV: &str = "SIGNAGE_BACKEND_URL";
pub const API_KEY_ENV: &str = "SIGNAGE_API_KEY";

/// Ceiling for configured playback durations.
pub const MAX_PLAYBACK_SECS: u64 = 24 * 60 * 60;
/// Ceiling for the change-feed reconnect delays.
pub const MAX_RECONNECT_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Public (anon) key sent with every request.  Empty means no key.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Where the paired device identity is kept between runs.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

/// Local control / status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Fallback durations used when an item is outside its scheduled window, and
/// the floor applied to in-window durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_image_secs")]
    pub image_default_secs: u64,
    #[serde(default = "default_video_secs")]
    pub video_default_secs: u64,
    #[serde(default = "default_min_window_secs")]
    pub min_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_reconnect_min_secs")]
    pub reconnect_min_secs: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    #[serde(default = "default_true")]
    pub fullscreen: bool,
    #[serde(default = "default_true")]
    pub mute: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            image_default_secs: default_image_secs(),
            video_default_secs: default_video_secs(),
            min_window_secs: default_min_window_secs(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_secs(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect_min_secs: default_reconnect_min_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            fullscreen: true,
            mute: true,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl PlaybackConfig {
    pub fn image_default(&self) -> Duration {
        Duration::from_secs(self.image_default_secs.min(MAX_PLAYBACK_SECS))
    }

    pub fn video_default(&self) -> Duration {
        Duration::from_secs(self.video_default_secs.min(MAX_PLAYBACK_SECS))
    }

    pub fn min_window(&self) -> Duration {
        Duration::from_secs(self.min_window_secs.min(MAX_PLAYBACK_SECS))
    }
}

impl FeedConfig {
    pub fn reconnect_min(&self) -> Duration {
        Duration::from_secs(self.reconnect_min_secs.clamp(1, MAX_RECONNECT_SECS))
    }

    pub fn reconnect_max(&self) -> Duration {
        let secs = self.reconnect_max_secs.max(self.reconnect_min_secs);
        Duration::from_secs(secs.clamp(1, MAX_RECONNECT_SECS))
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:54321/signage/v1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_image_secs() -> u64 {
    10
}

fn default_video_secs() -> u64 {
    30
}

fn default_min_window_secs() -> u64 {
    5
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_reconnect_min_secs() -> u64 {
    1
}

fn default_reconnect_max_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load from the default location, creating it with defaults on first run.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> anyhow::Result<Self> {
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            toml::from_str(&content)?
        } else {
            let config = Self::default();
            config.save_to(config_path)?;
            config
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(BACKEND_URL_ENV) {
            if !url.trim().is_empty() {
                self.backend.base_url = url.trim().to_string();
            }
        }
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.backend.api_key = key.trim().to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8990);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.playback.image_default_secs, 10);
        assert_eq!(config.playback.video_default_secs, 30);
        assert_eq!(config.playback.min_window_secs, 5);
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(30));
        assert!(config.player.state_file.ends_with("signage/state.json"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [backend]
            base_url = "https://backend.example.com/v1"

            [playback]
            image_default_secs = 15
            "#,
        )
        .unwrap();
        assert_eq!(config.backend.base_url, "https://backend.example.com/v1");
        assert_eq!(config.playback.image_default_secs, 15);
        assert_eq!(config.playback.video_default_secs, 30);
        assert_eq!(config.feed.reconnect_max(), Duration::from_secs(30));
    }

    #[test]
    fn test_oversized_durations_are_clamped() {
        let config: Config = toml::from_str(
            r#"
            [playback]
            image_default_secs = 9223372036854775807
            video_default_secs = 120

            [feed]
            reconnect_min_secs = 0
            reconnect_max_secs = 9223372036854775807
            "#,
        )
        .unwrap();
        assert_eq!(
            config.playback.image_default(),
            Duration::from_secs(MAX_PLAYBACK_SECS)
        );
        assert_eq!(config.playback.video_default(), Duration::from_secs(120));
        assert_eq!(config.feed.reconnect_min(), Duration::from_secs(1));
        assert_eq!(
            config.feed.reconnect_max(),
            Duration::from_secs(MAX_RECONNECT_SECS)
        );
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert!(config.mpv.fullscreen);
    }
}
