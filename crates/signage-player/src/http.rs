use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use signage_proto::protocol::{DeviceIdentity, PlayerStatus};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::core::{ControlCommand, PairCommandError, PlayerEvent};
use crate::pairing::PairingError;
use crate::session::SessionError;
use crate::status::StatusManager;

#[derive(Clone)]
struct HttpState {
    status: StatusManager,
    event_tx: mpsc::Sender<PlayerEvent>,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
    kind: &'static str,
}

#[derive(Serialize)]
struct Paired {
    device_id: String,
    device_name: String,
}

impl From<DeviceIdentity> for Paired {
    fn from(identity: DeviceIdentity) -> Self {
        Self {
            device_id: identity.device_id,
            device_name: identity.device_name,
        }
    }
}

pub fn router(status: StatusManager, event_tx: mpsc::Sender<PlayerEvent>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/pair/:code", post(pair))
        .route("/api/repair", post(repair))
        .route("/api/stop", post(stop))
        .route("/api/resume", post(resume))
        .route("/api/visibility/:state", post(visibility))
        .layer(CorsLayer::permissive())
        .with_state(HttpState { status, event_tx })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    status: StatusManager,
    event_tx: mpsc::Sender<PlayerEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(status, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_status(State(state): State<HttpState>) -> Json<PlayerStatus> {
    Json(state.status.get().await)
}

fn pair_error_response(e: PairCommandError) -> Response {
    let (code, kind) = match &e {
        PairCommandError::Pairing(p) => match p {
            PairingError::InvalidCodeFormat => (StatusCode::BAD_REQUEST, "invalid_code_format"),
            PairingError::CodeNotFound => (StatusCode::NOT_FOUND, "code_not_found"),
            PairingError::AlreadyActive => (StatusCode::CONFLICT, "already_active"),
            PairingError::InProgress => (StatusCode::CONFLICT, "in_progress"),
            PairingError::NetworkFailure(_) => (StatusCode::BAD_GATEWAY, "network_failure"),
            PairingError::Unexpected(_) => (StatusCode::INTERNAL_SERVER_ERROR, "unexpected"),
        },
        PairCommandError::Session(SessionError::AlreadyPaired(_)) => {
            (StatusCode::CONFLICT, "already_paired")
        }
        PairCommandError::Session(SessionError::PairingInProgress) => {
            (StatusCode::CONFLICT, "in_progress")
        }
        PairCommandError::Abandoned => (StatusCode::CONFLICT, "abandoned"),
    };
    (
        code,
        Json(ApiError {
            error: e.to_string(),
            kind,
        }),
    )
        .into_response()
}

async fn pair(State(state): State<HttpState>, Path(code): Path<String>) -> Response {
    info!("HTTP API: pair");
    let (reply, rx) = oneshot::channel();
    let cmd = ControlCommand::Pair { code, reply };
    if state.event_tx.send(PlayerEvent::Control(cmd)).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match rx.await {
        Ok(Ok(identity)) => (StatusCode::OK, Json(Paired::from(identity))).into_response(),
        Ok(Err(e)) => pair_error_response(e),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn repair(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: re-pair");
    let (reply, rx) = oneshot::channel();
    let cmd = ControlCommand::Repair { reply };
    if state.event_tx.send(PlayerEvent::Control(cmd)).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match rx.await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn send_command(state: &HttpState, cmd: ControlCommand) -> StatusCode {
    if state.event_tx.send(PlayerEvent::Control(cmd)).await.is_err() {
        error!("Failed to send control command");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: force-stop");
    send_command(&state, ControlCommand::ForceStop).await
}

async fn resume(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: resume");
    send_command(&state, ControlCommand::Resume).await
}

async fn visibility(State(state): State<HttpState>, Path(value): Path<String>) -> StatusCode {
    let hidden = match value.as_str() {
        "hidden" => true,
        "visible" => false,
        _ => return StatusCode::BAD_REQUEST,
    };
    send_command(&state, ControlCommand::Visibility { hidden }).await
}
