/// PlayerCore: single-owner event loop for all mutable player state.
///
/// Every source of change (control API, pairing replies, change feed, playback
/// timers, surface events, heartbeat ticks) only enqueues a `PlayerEvent`.
/// The loop owns the session, the synchronizer, the scheduler and the
/// surface exclusively and handles one event at a time, so no two
/// transitions ever interleave.
///
/// After every event the derived `PlayerStatus` is published through the
/// `StatusManager`; readers never touch loop state.
use std::collections::VecDeque;
use std::sync::Arc;

use signage_proto::config::Config;
use signage_proto::protocol::{DeviceIdentity, PlayerStatus};
use signage_proto::state::IdentityStore;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::heartbeat::HeartbeatReporter;
use crate::pairing::{PairingClient, PairingCode, PairingError};
use crate::scheduler::{Directive, DurationPolicy, Scheduler};
use crate::session::{Session, SessionError};
use crate::status::StatusManager;
use crate::surface::{Surface, SurfaceEvent};
use crate::sync::{
    spawn_feed, Backoff, FeedEvent, FeedHandle, FeedMessage, FeedSettings, PlaylistChange,
    ResyncStrategy, Synchronizer,
};
use crate::timer::{Clock, TimerHandle, TimerService};

// ── events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PairCommandError {
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("pairing attempt was abandoned")]
    Abandoned,
}

pub type PairReply = oneshot::Sender<Result<DeviceIdentity, PairCommandError>>;

/// Requests from the control API (and `--code` at startup).
#[derive(Debug)]
pub enum ControlCommand {
    Pair { code: String, reply: PairReply },
    Repair { reply: oneshot::Sender<()> },
    ForceStop,
    Resume,
    Visibility { hidden: bool },
}

/// All inputs into the PlayerCore loop.
#[derive(Debug)]
pub enum PlayerEvent {
    Control(ControlCommand),
    PairingFinished {
        epoch: u64,
        result: Result<DeviceIdentity, PairingError>,
        reply: PairReply,
    },
    Feed { epoch: u64, event: FeedEvent },
    PlaybackTimer { generation: u64 },
    Surface(SurfaceEvent),
    HeartbeatTick,
    HeartbeatResult {
        device_id: String,
        result: Result<(), String>,
    },
    Shutdown,
}

/// Forward surface events into the loop.
pub fn forward_surface_events(
    mut rx: mpsc::Receiver<SurfaceEvent>,
    tx: mpsc::Sender<PlayerEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if tx.send(PlayerEvent::Surface(event)).await.is_err() {
                break;
            }
        }
    })
}

// ── core ──────────────────────────────────────────────────────────────────────

pub struct PlayerDeps {
    pub config: Config,
    pub backend: Arc<dyn Backend>,
    pub surface: Box<dyn Surface>,
    pub clock: Arc<dyn Clock>,
    pub resync: Arc<dyn ResyncStrategy>,
    pub store: Option<IdentityStore>,
    pub status: StatusManager,
}

pub struct PlayerCore {
    config: Config,
    backend: Arc<dyn Backend>,
    surface: Box<dyn Surface>,
    clock: Arc<dyn Clock>,
    resync: Arc<dyn ResyncStrategy>,
    store: Option<IdentityStore>,
    status: StatusManager,
    event_tx: mpsc::Sender<PlayerEvent>,
    timers: TimerService<PlayerEvent>,
    pairing: PairingClient,
    session: Session,
    sync: Synchronizer,
    scheduler: Scheduler,
    heartbeat: HeartbeatReporter,
    feed: Option<FeedHandle>,
    playback_timer: Option<TimerHandle>,
    last_error: Option<String>,
}

impl PlayerCore {
    pub fn new(deps: PlayerDeps, event_tx: mpsc::Sender<PlayerEvent>) -> Self {
        let PlayerDeps {
            config,
            backend,
            surface,
            clock,
            resync,
            store,
            status,
        } = deps;
        let policy = DurationPolicy::from(&config.playback);
        let heartbeat = HeartbeatReporter::new(Arc::clone(&backend), config.heartbeat.interval());
        Self {
            pairing: PairingClient::new(Arc::clone(&backend)),
            timers: TimerService::new(event_tx.clone()),
            scheduler: Scheduler::new(policy),
            session: Session::new(),
            sync: Synchronizer::new(),
            feed: None,
            playback_timer: None,
            last_error: None,
            config,
            backend,
            surface,
            clock,
            resync,
            store,
            status,
            event_tx,
            heartbeat,
        }
    }

    /// Run until `Shutdown` arrives or every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<PlayerEvent>) -> anyhow::Result<()> {
        info!("PlayerCore: starting event loop");
        self.restore();
        self.publish_status().await;

        loop {
            match event_rx.recv().await {
                None => {
                    info!("PlayerCore: event channel closed, shutting down");
                    break;
                }
                Some(PlayerEvent::Shutdown) => {
                    info!("PlayerCore: shutdown requested");
                    break;
                }
                Some(event) => self.handle_event(event).await,
            }
            self.publish_status().await;
        }

        self.cleanup().await;
        self.publish_status().await;
        Ok(())
    }

    fn restore(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.load() {
            Some(identity) => {
                info!(
                    "PlayerCore: resuming as {} ({})",
                    identity.device_name, identity.device_id
                );
                self.session = Session::restored(identity.clone());
                self.start_device_tasks(&identity);
            }
            None => info!("PlayerCore: not paired, waiting for a pairing code"),
        }
    }

    async fn handle_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Control(cmd) => self.handle_command(cmd).await,

            PlayerEvent::PairingFinished {
                epoch,
                result,
                reply,
            } => self.finish_pairing(epoch, result, reply).await,

            PlayerEvent::Feed { epoch, event } => {
                if !self.session.is_current(epoch) {
                    debug!("PlayerCore: dropping feed event from epoch {}", epoch);
                    return;
                }
                self.handle_feed(event).await;
            }

            PlayerEvent::PlaybackTimer { generation } => {
                let now = self.clock.now();
                let directives = self.scheduler.on_completion(generation, now);
                self.apply(directives).await;
            }

            PlayerEvent::Surface(event) => self.handle_surface(event).await,

            PlayerEvent::HeartbeatTick => {
                if let Some(identity) = self.session.identity() {
                    let device_id = identity.device_id.clone();
                    self.heartbeat
                        .beat(identity, self.event_tx.clone(), move |result| {
                            PlayerEvent::HeartbeatResult { device_id, result }
                        });
                }
            }

            PlayerEvent::HeartbeatResult { device_id, result } => {
                if self.session.identity().map(|i| i.device_id.as_str()) == Some(device_id.as_str()) {
                    self.heartbeat.record(result);
                }
            }

            PlayerEvent::Shutdown => {}
        }
    }

    // ── control ───────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::Pair { code, reply } => self.begin_pairing(code, reply),

            ControlCommand::Repair { reply } => {
                self.repair().await;
                let _ = reply.send(());
            }

            ControlCommand::ForceStop => {
                let directives = self.scheduler.force_stop();
                self.apply(directives).await;
            }

            ControlCommand::Resume => {
                let now = self.clock.now();
                let directives = self.scheduler.resume(now);
                self.apply(directives).await;
            }

            ControlCommand::Visibility { hidden } => {
                let now = self.clock.now();
                let directives = self.scheduler.on_visibility(hidden, now);
                self.apply(directives).await;
            }
        }
    }

    fn begin_pairing(&mut self, code: String, reply: PairReply) {
        // Malformed codes never reach the backend or the session.
        if let Err(e) = PairingCode::parse(&code) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        let epoch = match self.session.begin_pairing() {
            Ok(epoch) => epoch,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        let client = self.pairing.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = client.pair(&code).await;
            if let Err(returned) = tx
                .send(PlayerEvent::PairingFinished {
                    epoch,
                    result,
                    reply,
                })
                .await
            {
                if let PlayerEvent::PairingFinished { reply, .. } = returned.0 {
                    let _ = reply.send(Err(PairCommandError::Abandoned));
                }
            }
        });
    }

    async fn finish_pairing(
        &mut self,
        epoch: u64,
        result: Result<DeviceIdentity, PairingError>,
        reply: PairReply,
    ) {
        match result {
            Ok(identity) => {
                if !self.session.pairing_succeeded(epoch, identity.clone()) {
                    warn!("PlayerCore: pairing result arrived for an abandoned attempt");
                    self.release_device(identity);
                    let _ = reply.send(Err(PairCommandError::Abandoned));
                    return;
                }
                self.last_error = None;
                if let Some(store) = &self.store {
                    if let Err(e) = store.save(&identity).await {
                        warn!("PlayerCore: could not persist identity: {}", e);
                    }
                }
                self.start_device_tasks(&identity);
                let _ = reply.send(Ok(identity));
            }
            Err(e) => {
                if self.session.pairing_failed(epoch) {
                    self.last_error = Some(format!("pairing failed: {}", e));
                }
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    async fn repair(&mut self) {
        info!("PlayerCore: re-pair requested");
        self.feed = None;
        self.heartbeat.stop();
        if let Some(old) = self.session.repair() {
            self.release_device(old);
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.clear().await {
                warn!("PlayerCore: could not clear stored identity: {}", e);
            }
        }
        self.sync.clear();
        self.last_error = None;
        let directives = self.scheduler.reset();
        self.apply(directives).await;
    }

    /// Best-effort offline notice for a device this player no longer uses.
    fn release_device(&self, device: DeviceIdentity) {
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            if let Err(e) = backend.set_offline(&device).await {
                debug!("PlayerCore: offline notice for {} failed: {}", device.device_id, e);
            }
        });
    }

    fn start_device_tasks(&mut self, identity: &DeviceIdentity) {
        let epoch = self.session.epoch();
        let settings = FeedSettings {
            backend: Arc::clone(&self.backend),
            resync: Arc::clone(&self.resync),
            device: identity.clone(),
            backoff: Backoff {
                min: self.config.feed.reconnect_min(),
                max: self.config.feed.reconnect_max(),
            },
        };
        self.feed = Some(spawn_feed(settings, self.event_tx.clone(), move |event| {
            PlayerEvent::Feed { epoch, event }
        }));

        self.heartbeat
            .start(&self.timers, || PlayerEvent::HeartbeatTick);
        let device_id = identity.device_id.clone();
        self.heartbeat
            .beat(identity, self.event_tx.clone(), move |result| {
                PlayerEvent::HeartbeatResult { device_id, result }
            });
    }

    // ── feed ──────────────────────────────────────────────────────────────────

    async fn handle_feed(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Resynced(records) => {
                let snapshot = self.sync.install(records);
                info!(
                    "PlayerCore: playlist reloaded, {} items (rev {})",
                    snapshot.len(),
                    snapshot.revision
                );
                self.session.load_succeeded();
                self.last_error = None;
                let now = self.clock.now();
                let directives = self.scheduler.on_snapshot(snapshot, now);
                self.apply(directives).await;
            }

            FeedEvent::Frame(text) => {
                let message = match FeedMessage::decode(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("PlayerCore: dropping malformed feed frame: {}", e);
                        return;
                    }
                };
                let change = match message {
                    FeedMessage::Added { item } | FeedMessage::Changed { item } => {
                        PlaylistChange::Upsert(item)
                    }
                    FeedMessage::Removed { item } => PlaylistChange::Remove(item.id),
                    FeedMessage::ForceStop => {
                        info!("PlayerCore: force-stop received from backend");
                        let directives = self.scheduler.force_stop();
                        self.apply(directives).await;
                        return;
                    }
                };
                if let Some(snapshot) = self.sync.apply(change) {
                    let now = self.clock.now();
                    let directives = self.scheduler.on_snapshot(snapshot, now);
                    self.apply(directives).await;
                }
            }

            FeedEvent::Disconnected(reason) => {
                self.session.stream_lost();
                self.last_error = Some(format!("live updates lost: {}", reason));
            }
        }
    }

    // ── surface ───────────────────────────────────────────────────────────────

    async fn handle_surface(&mut self, event: SurfaceEvent) {
        let now = self.clock.now();
        let directives = match event {
            SurfaceEvent::Ended { token } => self.scheduler.on_natural_end(token, now),
            SurfaceEvent::Failed { token, reason } => {
                if token == self.scheduler.cursor().display_token {
                    self.last_error = Some(format!("display failed: {}", reason));
                }
                self.scheduler.on_display_failed(token, now)
            }
            SurfaceEvent::Visibility { hidden } => self.scheduler.on_visibility(hidden, now),
        };
        self.apply(directives).await;
    }

    /// Execute scheduler directives in order.  A display failure replaces the
    /// rest of the batch with whatever the scheduler decides next.
    async fn apply(&mut self, directives: Vec<Directive>) {
        let mut queue: VecDeque<Directive> = directives.into();
        while let Some(directive) = queue.pop_front() {
            match directive {
                Directive::Show { token, content } => {
                    if let Err(e) = self.surface.display(&content, token).await {
                        warn!(
                            "PlayerCore: surface rejected {}: {}",
                            content.display_name, e
                        );
                        self.last_error = Some(format!("display failed: {}", e));
                        let now = self.clock.now();
                        queue = self.scheduler.on_display_failed(token, now).into();
                    }
                }
                Directive::ArmTimer { generation, after } => {
                    self.playback_timer = Some(
                        self.timers
                            .once(after, PlayerEvent::PlaybackTimer { generation }),
                    );
                }
                Directive::CancelTimer => self.playback_timer = None,
                Directive::PauseSurface => {
                    if let Err(e) = self.surface.pause().await {
                        warn!("PlayerCore: surface pause failed: {}", e);
                    }
                }
                Directive::ResumeSurface => {
                    if let Err(e) = self.surface.resume().await {
                        warn!("PlayerCore: surface resume failed: {}", e);
                    }
                }
                Directive::Halt => {
                    if let Err(e) = self.surface.halt().await {
                        warn!("PlayerCore: surface halt failed: {}", e);
                    }
                }
                Directive::Blank => {
                    if let Err(e) = self.surface.clear().await {
                        warn!("PlayerCore: surface clear failed: {}", e);
                    }
                }
                Directive::AllItemsUnplayable => {
                    error!("PlayerCore: no playable items in the playlist");
                    self.last_error = Some("all playlist items are unplayable".to_string());
                }
            }
        }
    }

    // ── status / shutdown ─────────────────────────────────────────────────────

    async fn publish_status(&self) {
        let snapshot = self.sync.current();
        let status = PlayerStatus {
            rev: 0,
            status: self.session.status(),
            connection: self.session.state(),
            device: self.session.identity().cloned(),
            playback: self.scheduler.state(),
            now_showing: self.scheduler.now_showing(),
            playlist_len: snapshot.len(),
            playlist_revision: snapshot.revision,
            heartbeat_failures: self.heartbeat.failures(),
            last_error: self.last_error.clone(),
            recent_warnings: Vec::new(),
        };
        self.status.publish(status).await;
    }

    async fn cleanup(&mut self) {
        self.playback_timer = None;
        self.feed = None;
        self.heartbeat.stop();

        if let Err(e) = self.surface.clear().await {
            debug!("PlayerCore: clear on shutdown: {}", e);
        }
        if let Err(e) = self.surface.shutdown().await {
            warn!("PlayerCore: surface shutdown failed: {}", e);
        }

        if let Some(identity) = self.session.identity() {
            let notice = self.backend.set_offline(identity);
            match tokio::time::timeout(self.config.backend.request_timeout(), notice).await {
                Ok(Ok(())) => info!("PlayerCore: marked {} offline", identity.device_id),
                Ok(Err(e)) => warn!("PlayerCore: offline notice failed: {}", e),
                Err(_) => warn!("PlayerCore: offline notice timed out"),
            }
        }
        info!("PlayerCore: stopped");
    }
}
