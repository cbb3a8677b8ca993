use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use signage_player::backend::memory::MemoryBackend;
use signage_player::backend::{Backend, HttpBackend};
use signage_player::core::{forward_surface_events, ControlCommand, PlayerCore, PlayerDeps, PlayerEvent};
use signage_player::logging::{self, RecentLog};
use signage_player::mpv::MpvSurface;
use signage_player::status::StatusManager;
use signage_player::sync::FullReload;
use signage_player::timer::SystemClock;
use signage_player::{diagnostics, http};
use signage_proto::config::Config;
use signage_proto::platform;
use signage_proto::protocol::PlaylistRecord;
use signage_proto::state::IdentityStore;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

const DEMO_CODE: &str = "DEMO00";
const DEMO_DEVICE_ID: &str = "demo-device";

#[derive(Parser, Debug)]
#[command(name = "signage-player", version, about = "Full-screen signage player")]
struct Args {
    /// Path to config.toml (default: platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pair with this code at startup
    #[arg(long)]
    code: Option<String>,

    /// Use mpv from PATH instead of one shipped beside the binary
    #[arg(long)]
    use_system_deps: bool,

    /// Play a local JSON playlist without a backend
    #[arg(long, value_name = "FILE")]
    demo_playlist: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    platform::set_use_system_deps(args.use_system_deps);

    let recent = RecentLog::new();
    let log_path = logging::init(&platform::data_dir(), recent.clone())?;
    info!("Log file: {:?}", log_path);
    diagnostics::install_panic_hook(platform::crash_dir());

    if let Err(e) = run(args, recent).await {
        diagnostics::report_fatal(&platform::crash_dir(), &format!("{:#}", e), None);
        return Err(e);
    }
    Ok(())
}

async fn run(args: Args, recent: RecentLog) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!(
        "Config loaded from: {:?}",
        args.config.clone().unwrap_or_else(Config::config_path)
    );

    let (backend, store, startup_code): (Arc<dyn Backend>, Option<IdentityStore>, Option<String>) =
        match &args.demo_playlist {
            Some(path) => {
                info!("Demo mode: playing {}", path.display());
                (demo_backend(path)?, None, Some(DEMO_CODE.to_string()))
            }
            None => (
                Arc::new(HttpBackend::new(&config.backend)?),
                Some(IdentityStore::new(config.player.state_file.clone())),
                args.code.clone(),
            ),
        };

    // All external inputs funnel into PlayerCore
    let (event_tx, event_rx) = mpsc::channel::<PlayerEvent>(256);

    let (surface_tx, surface_rx) = mpsc::channel(64);
    let surface = MpvSurface::new(config.mpv.clone(), surface_tx);
    let _surface_forwarder = forward_surface_events(surface_rx, event_tx.clone());

    let status = StatusManager::new(recent);
    let core = PlayerCore::new(
        PlayerDeps {
            config: config.clone(),
            backend,
            surface: Box::new(surface),
            clock: Arc::new(SystemClock),
            resync: Arc::new(FullReload),
            store,
            status: status.clone(),
        },
        event_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            status,
            event_tx.clone(),
        );
    }

    tokio::spawn(wait_for_signal(event_tx.clone()));

    if let Some(code) = startup_code {
        tokio::spawn(pair_at_startup(code, event_tx.clone()));
    }
    drop(event_tx);

    info!("Player initialised, running event loop");
    core.run(event_rx).await
}

fn demo_backend(path: &Path) -> anyhow::Result<Arc<dyn Backend>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading demo playlist {}", path.display()))?;
    let records: Vec<PlaylistRecord> = serde_json::from_str(&text)
        .with_context(|| format!("parsing demo playlist {}", path.display()))?;

    let backend = MemoryBackend::new();
    backend.register_device(DEMO_CODE, DEMO_DEVICE_ID, "Demo player");
    backend.set_playlist(DEMO_DEVICE_ID, records);
    Ok(Arc::new(backend))
}

async fn pair_at_startup(code: String, event_tx: mpsc::Sender<PlayerEvent>) {
    let (reply, rx) = oneshot::channel();
    let cmd = ControlCommand::Pair { code, reply };
    if event_tx.send(PlayerEvent::Control(cmd)).await.is_err() {
        return;
    }
    match rx.await {
        Ok(Ok(identity)) => info!("Paired as {} ({})", identity.device_name, identity.device_id),
        Ok(Err(e)) => warn!("Startup pairing failed: {}", e),
        Err(_) => {}
    }
}

async fn wait_for_signal(event_tx: mpsc::Sender<PlayerEvent>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Signal received, shutting down");
    let _ = event_tx.send(PlayerEvent::Shutdown).await;
}
