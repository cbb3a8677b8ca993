/// mpv-backed rendering surface.
///
/// Architecture:
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event / property-change   → raw event channel
///
///   translate_task  ← raw events → SurfaceEvent (end-file, window-minimized)
/// ```
///
/// mpv runs with `--idle=yes --force-window`, so after `stop` the window stays
/// up and black.  Images are shown with `image-display-duration=inf`; only the
/// scheduler's timer advances them.
///
/// Each `loadfile` reply carries the `playlist_entry_id` mpv assigned; the
/// surface keeps an entry → display-token map so `end-file` events can be
/// attributed to the display request that caused them.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use signage_proto::config::MpvConfig;
use signage_proto::protocol::ContentRef;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::surface::{Surface, SurfaceEvent};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

pub const OBS_WINDOW_MINIMIZED: u64 = 1;

// ── internal channel types ────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An unsolicited mpv event or property change.
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    pub fn playlist_entry_id(&self) -> Option<i64> {
        self.raw.get("playlist_entry_id")?.as_i64()
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Replace whatever is playing with `url`.  Returns the playlist entry id
    /// when mpv reports one.
    pub async fn load_file(&self, url: &str) -> anyhow::Result<Option<i64>> {
        let reply = self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(reply["data"]["playlist_entry_id"].as_i64())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn rewind(&self) -> anyhow::Result<()> {
        self.send(json!(["seek", 0, "absolute"])).await?;
        Ok(())
    }

    /// Must be called after every fresh connection.
    pub async fn observe_properties(&self) {
        match self
            .send(json!(["observe_property", OBS_WINDOW_MINIMIZED, "window-minimized"]))
            .await
        {
            Ok(_) => debug!("mpv: observing window-minimized"),
            Err(e) => warn!("mpv: observe_property window-minimized failed: {}", e),
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    config: MpvConfig,
}

impl MpvDriver {
    pub fn new(config: MpvConfig) -> Self {
        Self {
            socket_name: signage_proto::platform::mpv_socket_name(),
            process: None,
            config,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn spawn_process(&mut self) -> anyhow::Result<()> {
        let mpv_binary = signage_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let mut cmd = tokio::process::Command::new(mpv_binary);
        cmd.arg("--idle=yes")
            .arg("--force-window=yes")
            .arg("--image-display-duration=inf")
            .arg("--keep-open=no")
            .arg("--no-osc")
            .arg("--no-input-default-bindings")
            .arg("--quiet")
            .arg(signage_proto::platform::mpv_socket_arg());
        if self.config.fullscreen {
            cmd.arg("--fullscreen");
        }
        if self.config.mute {
            cmd.arg("--mute=yes");
        }
        let child = cmd
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        info!("mpv: spawning new process");
        self.spawn_process()?;

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        info!("mpv: spawning new process");
        self.spawn_process()?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can always match the reply.
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── entry tracking ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Eof,
    Error,
}

/// playlist_entry_id → display token.
///
/// An `end-file` can be read before the `loadfile` reply has been matched to
/// its token; such events are parked in `unclaimed` until the token arrives.
#[derive(Debug, Default)]
struct EntryMap {
    tokens: HashMap<i64, u64>,
    unclaimed: HashMap<i64, EndReason>,
    /// Token of a `loadfile` whose reply carried no entry id (older mpv);
    /// claimed by the next `start-file`.
    awaiting_start: Option<u64>,
}

const MAX_UNCLAIMED: usize = 16;

impl EntryMap {
    fn bind(&mut self, entry: Option<i64>, token: u64) -> Option<SurfaceEvent> {
        let Some(entry) = entry else {
            self.awaiting_start = Some(token);
            return None;
        };
        self.awaiting_start = None;
        match self.unclaimed.remove(&entry) {
            Some(reason) => Some(reason.into_event(token)),
            None => {
                self.tokens.insert(entry, token);
                None
            }
        }
    }

    fn on_start(&mut self, entry: i64) {
        if let Some(token) = self.awaiting_start.take() {
            self.tokens.insert(entry, token);
        }
    }

    fn on_end(&mut self, entry: i64, reason: EndReason) -> Option<SurfaceEvent> {
        match self.tokens.remove(&entry) {
            Some(token) => Some(reason.into_event(token)),
            None => {
                if self.unclaimed.len() >= MAX_UNCLAIMED {
                    self.unclaimed.clear();
                }
                self.unclaimed.insert(entry, reason);
                None
            }
        }
    }

    fn clear(&mut self) {
        self.tokens.clear();
        self.unclaimed.clear();
        self.awaiting_start = None;
    }
}

impl EndReason {
    fn into_event(self, token: u64) -> SurfaceEvent {
        match self {
            EndReason::Eof => SurfaceEvent::Ended { token },
            EndReason::Error => SurfaceEvent::Failed {
                token,
                reason: "mpv could not play the file".to_string(),
            },
        }
    }
}

fn translate(event: &MpvEvent, entries: &StdMutex<EntryMap>) -> Option<SurfaceEvent> {
    if let Some((OBS_WINDOW_MINIMIZED, data)) = event.as_property_change() {
        return data.as_bool().map(|hidden| SurfaceEvent::Visibility { hidden });
    }
    let mut entries = entries.lock().unwrap_or_else(|p| p.into_inner());
    match event.event_name()? {
        "start-file" => {
            entries.on_start(event.playlist_entry_id()?);
            None
        }
        "end-file" => {
            let reason = match event.raw.get("reason").and_then(|v| v.as_str())? {
                "eof" => EndReason::Eof,
                "error" => EndReason::Error,
                // stop / quit / redirect: replaced or torn down on purpose
                _ => return None,
            };
            entries.on_end(event.playlist_entry_id()?, reason)
        }
        _ => None,
    }
}

async fn translate_task(
    mut raw_rx: mpsc::Receiver<MpvEvent>,
    entries: Arc<StdMutex<EntryMap>>,
    out: mpsc::Sender<SurfaceEvent>,
) {
    while let Some(event) = raw_rx.recv().await {
        if let Some(translated) = translate(&event, &entries) {
            debug!("mpv: {:?}", translated);
            if out.send(translated).await.is_err() {
                break;
            }
        }
    }
}

// ── surface ───────────────────────────────────────────────────────────────────

pub struct MpvSurface {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    raw_tx: mpsc::Sender<MpvEvent>,
    out: mpsc::Sender<SurfaceEvent>,
    entries: Arc<StdMutex<EntryMap>>,
}

impl MpvSurface {
    /// mpv is not started until the first call that needs it.
    pub fn new(config: MpvConfig, out: mpsc::Sender<SurfaceEvent>) -> Self {
        let (raw_tx, raw_rx) = mpsc::channel(64);
        let entries = Arc::new(StdMutex::new(EntryMap::default()));
        tokio::spawn(translate_task(raw_rx, entries.clone(), out.clone()));
        Self {
            driver: MpvDriver::new(config),
            handle: None,
            raw_tx,
            out,
            entries,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, EntryMap> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn ensure_handle(&mut self) -> anyhow::Result<MpvHandle> {
        if self.handle.is_some() && !self.driver.process_alive() {
            warn!("mpv: process died, respawning");
            self.handle = None;
            self.entries().clear();
        }
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }
        let handle = self.driver.spawn_and_connect(self.raw_tx.clone()).await?;
        handle.observe_properties().await;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Run a command only if mpv is already up.
    fn live_handle(&mut self) -> Option<MpvHandle> {
        if !self.driver.process_alive() {
            self.handle = None;
        }
        self.handle.clone()
    }
}

#[async_trait]
impl Surface for MpvSurface {
    async fn display(&mut self, content: &ContentRef, token: u64) -> anyhow::Result<()> {
        let handle = self.ensure_handle().await?;
        let entry = handle.load_file(&content.source_url).await?;
        if let Err(e) = handle.set_pause(false).await {
            debug!("mpv: unpause after load failed: {}", e);
        }
        debug!(
            "mpv: loaded {} as entry {:?} (token {})",
            content.source_url, entry, token
        );
        let early = self.entries().bind(entry, token);
        if let Some(event) = early {
            let _ = self.out.send(event).await;
        }
        Ok(())
    }

    async fn pause(&mut self) -> anyhow::Result<()> {
        match self.live_handle() {
            Some(h) => h.set_pause(true).await,
            None => Ok(()),
        }
    }

    async fn resume(&mut self) -> anyhow::Result<()> {
        match self.live_handle() {
            Some(h) => h.set_pause(false).await,
            None => Ok(()),
        }
    }

    async fn halt(&mut self) -> anyhow::Result<()> {
        let Some(h) = self.live_handle() else {
            return Ok(());
        };
        h.set_pause(true).await?;
        // Images cannot seek; that is fine.
        if let Err(e) = h.rewind().await {
            debug!("mpv: rewind on halt: {}", e);
        }
        Ok(())
    }

    async fn clear(&mut self) -> anyhow::Result<()> {
        self.entries().clear();
        match self.live_handle() {
            Some(h) => h.stop().await,
            None => Ok(()),
        }
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        if let Some(h) = self.handle.take() {
            let _ = h.send(json!(["quit"])).await;
        }
        self.driver.kill().await;
        info!("mpv: shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(raw: Value) -> MpvEvent {
        MpvEvent { raw }
    }

    #[test]
    fn test_end_file_maps_to_token() {
        let entries = StdMutex::new(EntryMap::default());
        assert!(entries.lock().unwrap().bind(Some(7), 41).is_none());
        let ended = translate(
            &event(json!({"event": "end-file", "reason": "eof", "playlist_entry_id": 7})),
            &entries,
        );
        assert_eq!(ended, Some(SurfaceEvent::Ended { token: 41 }));

        // replaced by the next loadfile
        entries.lock().unwrap().bind(Some(8), 42);
        let stopped = translate(
            &event(json!({"event": "end-file", "reason": "stop", "playlist_entry_id": 8})),
            &entries,
        );
        assert_eq!(stopped, None);
    }

    #[test]
    fn test_error_before_reply_is_claimed_later() {
        let entries = StdMutex::new(EntryMap::default());
        let early = translate(
            &event(json!({"event": "end-file", "reason": "error", "playlist_entry_id": 3})),
            &entries,
        );
        assert_eq!(early, None);
        let claimed = entries.lock().unwrap().bind(Some(3), 9);
        assert!(matches!(claimed, Some(SurfaceEvent::Failed { token: 9, .. })));
    }

    #[test]
    fn test_entry_id_from_start_file_without_reply_id() {
        let entries = StdMutex::new(EntryMap::default());
        entries.lock().unwrap().bind(None, 5);
        translate(
            &event(json!({"event": "start-file", "playlist_entry_id": 11})),
            &entries,
        );
        let ended = translate(
            &event(json!({"event": "end-file", "reason": "eof", "playlist_entry_id": 11})),
            &entries,
        );
        assert_eq!(ended, Some(SurfaceEvent::Ended { token: 5 }));
    }

    #[test]
    fn test_window_minimized_is_visibility() {
        let entries = StdMutex::new(EntryMap::default());
        let hidden = translate(
            &event(json!({"event": "property-change", "id": OBS_WINDOW_MINIMIZED, "name": "window-minimized", "data": true})),
            &entries,
        );
        assert_eq!(hidden, Some(SurfaceEvent::Visibility { hidden: true }));
    }
}
