#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use signage_player::backend::memory::MemoryBackend;
use signage_player::core::{ControlCommand, PairCommandError, PlayerCore, PlayerDeps, PlayerEvent};
use signage_player::logging::RecentLog;
use signage_player::status::StatusManager;
use signage_player::surface::Surface;
use signage_player::sync::FullReload;
use signage_player::timer::AnchoredClock;
use signage_proto::config::Config;
use signage_proto::protocol::{ContentRef, DeviceIdentity, PlayerStatus, PlaylistRecord};
use signage_proto::state::IdentityStore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const CODE: &str = "AB12CD";
pub const DEVICE: &str = "dev-1";

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Display { token: u64, name: String },
    Pause,
    Resume,
    Halt,
    Clear,
    Shutdown,
}

#[derive(Clone, Default)]
pub struct RecordingSurface {
    calls: Arc<Mutex<Vec<(Instant, Call)>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl RecordingSurface {
    pub fn fail_url(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    /// (time since `since`, name, token) of every display call.
    pub fn displays(&self, since: Instant) -> Vec<(Duration, String, u64)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(at, c)| match c {
                Call::Display { token, name } => {
                    Some((at.duration_since(since), name.clone(), *token))
                }
                _ => None,
            })
            .collect()
    }

    pub fn display_names(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Display { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push((Instant::now(), call));
    }
}

#[async_trait]
impl Surface for RecordingSurface {
    async fn display(&mut self, content: &ContentRef, token: u64) -> anyhow::Result<()> {
        if self.failing.lock().unwrap().contains(&content.source_url) {
            anyhow::bail!("cannot open {}", content.source_url);
        }
        self.record(Call::Display {
            token,
            name: content.display_name.clone(),
        });
        Ok(())
    }

    async fn pause(&mut self) -> anyhow::Result<()> {
        self.record(Call::Pause);
        Ok(())
    }

    async fn resume(&mut self) -> anyhow::Result<()> {
        self.record(Call::Resume);
        Ok(())
    }

    async fn halt(&mut self) -> anyhow::Result<()> {
        self.record(Call::Halt);
        Ok(())
    }

    async fn clear(&mut self) -> anyhow::Result<()> {
        self.record(Call::Clear);
        Ok(())
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.record(Call::Shutdown);
        Ok(())
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
}

/// A playlist row whose window is `[t0 + start, t0 + end]` seconds.
pub fn record(id: &str, kind: Option<&str>, position: i64, start: i64, end: i64) -> PlaylistRecord {
    PlaylistRecord {
        id: id.into(),
        content_id: Some(format!("content-{}", id)),
        content_type: kind.map(str::to_string),
        source_url: Some(url(id)),
        display_name: Some(id.into()),
        start_time: t0() + chrono::Duration::seconds(start),
        end_time: t0() + chrono::Duration::seconds(end),
        order_index: position,
    }
}

pub fn url(id: &str) -> String {
    format!("https://cdn.example.com/{}.bin", id)
}

pub fn lapsed(id: &str, kind: &str, position: i64) -> PlaylistRecord {
    record(id, Some(kind), position, -7200, -3600)
}

pub fn identity() -> DeviceIdentity {
    DeviceIdentity {
        device_id: DEVICE.into(),
        device_name: "Lobby screen".into(),
        pairing_code: CODE.into(),
    }
}

pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub surface: RecordingSurface,
    pub status: StatusManager,
    pub tx: mpsc::Sender<PlayerEvent>,
    pub started: Instant,
    join: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    pub fn start(backend: Arc<MemoryBackend>, store: Option<IdentityStore>) -> Self {
        Self::start_with(Config::default(), backend, store, RecordingSurface::default())
    }

    pub fn start_with(
        config: Config,
        backend: Arc<MemoryBackend>,
        store: Option<IdentityStore>,
        surface: RecordingSurface,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let status = StatusManager::new(RecentLog::new());
        let core = PlayerCore::new(
            PlayerDeps {
                config,
                backend: backend.clone(),
                surface: Box::new(surface.clone()),
                clock: Arc::new(AnchoredClock::new(t0())),
                resync: Arc::new(FullReload),
                store,
                status: status.clone(),
            },
            tx.clone(),
        );
        let started = Instant::now();
        let join = tokio::spawn(core.run(rx));
        Self {
            backend,
            surface,
            status,
            tx,
            started,
            join,
        }
    }

    pub async fn pair(&self, code: &str) -> Result<DeviceIdentity, PairCommandError> {
        let (reply, rx) = oneshot::channel();
        self.control(ControlCommand::Pair {
            code: code.into(),
            reply,
        })
        .await;
        let result = rx.await.expect("core dropped the pairing reply");
        settle().await;
        result
    }

    pub async fn repair(&self) {
        let (reply, rx) = oneshot::channel();
        self.control(ControlCommand::Repair { reply }).await;
        rx.await.expect("core dropped the repair reply");
        settle().await;
    }

    pub async fn control(&self, cmd: ControlCommand) {
        self.tx.send(PlayerEvent::Control(cmd)).await.unwrap();
        settle().await;
    }

    pub async fn send(&self, event: PlayerEvent) {
        self.tx.send(event).await.unwrap();
        settle().await;
    }

    pub async fn status(&self) -> PlayerStatus {
        self.status.get().await
    }

    pub async fn shutdown(self) {
        self.tx.send(PlayerEvent::Shutdown).await.unwrap();
        self.join.await.unwrap().unwrap();
    }
}

/// Let every runnable task run.  With the clock paused this advances time
/// by at most a millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Sleep `secs` of (paused) time, then settle.
pub async fn wait_secs(secs: f64) {
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    settle().await;
}

pub fn assert_near(actual: Duration, expected_secs: f64) {
    let expected = Duration::from_secs_f64(expected_secs);
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        diff <= Duration::from_millis(100),
        "expected ~{:?}, got {:?}",
        expected,
        actual
    );
}
