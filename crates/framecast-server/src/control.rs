//! HTTP control surface: `POST /control` and the session queries.
//!
//! These are alternate entry points into the same [`SessionManager`]
//! operations the socket router uses.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use framecast_core::{
    ConnectionId, RelayError, SessionId, SessionMode, SessionSnapshot, SessionState, StartRequest,
};

use crate::server::AppState;

/// Body of `POST /control`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ControlRequest {
    pub action: String,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub mode: Option<SessionMode>,
    #[serde(default)]
    pub video_path: Option<String>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub total_frames: Option<u64>,
    /// Connection to subscribe to a newly played session.
    #[serde(default)]
    pub connection_id: Option<ConnectionId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// `"success"` or `"error"`.
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ControlResponse {
    fn success(message: impl Into<String>, snapshot: &SessionSnapshot) -> Self {
        Self {
            status: "success".into(),
            message: message.into(),
            session_id: Some(snapshot.session_id.clone()),
            state: Some(snapshot.state),
            code: None,
        }
    }

    fn failure(err: &RelayError) -> Self {
        Self {
            status: "error".into(),
            message: err.to_string(),
            session_id: None,
            state: None,
            code: Some(err.error_kind().to_string()),
        }
    }
}

pub fn status_code(err: &RelayError) -> StatusCode {
    match err {
        RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        RelayError::UnknownSession(_) | RelayError::UnknownConnection(_) => StatusCode::NOT_FOUND,
        RelayError::InvalidState { .. } => StatusCode::CONFLICT,
        RelayError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::SourceFailed(_) | RelayError::Transport(_) => StatusCode::BAD_GATEWAY,
    }
}

/// Apply a control action.
pub async fn apply(state: &AppState, request: ControlRequest) -> Result<ControlResponse, RelayError> {
    match request.action.as_str() {
        "play" => play(state, request).await,
        "pause" => {
            let id = target(state, request.session_id)?;
            let snapshot = state.sessions.pause(&id).await?;
            Ok(ControlResponse::success(
                format!("paused at frame {}", snapshot.current_frame),
                &snapshot,
            ))
        }
        "resume" => {
            let id = target(state, request.session_id)?;
            let snapshot = state.sessions.resume(&id).await?;
            Ok(ControlResponse::success(
                format!("resumed at frame {}", snapshot.current_frame),
                &snapshot,
            ))
        }
        "stop" => {
            let id = target(state, request.session_id)?;
            let snapshot = state.sessions.stop(&id).await?;
            Ok(ControlResponse::success("stopped", &snapshot))
        }
        other => Err(RelayError::InvalidRequest(format!("unknown action: {other}"))),
    }
}

async fn play(state: &AppState, request: ControlRequest) -> Result<ControlResponse, RelayError> {
    // A bare `play` continues a paused session, as on the socket.
    if request.mode.is_none() && request.video_path.is_none() {
        if let Some(id) = paused_target(state, request.session_id.clone()) {
            let snapshot = state.sessions.resume(&id).await?;
            return Ok(ControlResponse::success(
                format!("resumed at frame {}", snapshot.current_frame),
                &snapshot,
            ));
        }
    }

    let session_id = SessionId::new();
    let start = StartRequest {
        mode: request.mode,
        video_path: request.video_path,
        fps: request.fps,
        total_frames: request.total_frames,
    };

    // Subscribe before starting so viewers receive the descriptor.
    let (previous, viewers) = match &request.connection_id {
        Some(connection_id) => (Some(state.registry.subscribe(connection_id, session_id.clone())?), 1),
        None => (None, state.registry.subscribe_unattached(&session_id)),
    };

    match state.sessions.start(session_id.clone(), start).await {
        Ok(snapshot) => {
            info!(session_id = %session_id, viewers, "session started over http");
            Ok(ControlResponse::success(
                format!("started {} session for {viewers} viewer(s)", snapshot.mode),
                &snapshot,
            ))
        }
        Err(err) => {
            match (&request.connection_id, previous) {
                (Some(connection_id), Some(Some(previous))) => {
                    let _ = state.registry.subscribe(connection_id, previous);
                }
                _ => {
                    state.registry.release_session(&session_id);
                }
            }
            Err(err)
        }
    }
}

fn paused_target(state: &AppState, explicit: Option<SessionId>) -> Option<SessionId> {
    let id = target(state, explicit).ok()?;
    let snapshot = state.sessions.status(&id).ok()?;
    (snapshot.state == SessionState::Paused).then_some(id)
}

/// Explicit id, or the only live session when exactly one exists.
fn target(state: &AppState, explicit: Option<SessionId>) -> Result<SessionId, RelayError> {
    if let Some(id) = explicit {
        return Ok(id);
    }
    let mut live = state
        .sessions
        .list()
        .into_iter()
        .filter(|s| !s.state.is_terminal());
    match (live.next(), live.next()) {
        (Some(only), None) => Ok(only.session_id),
        (None, _) => Err(RelayError::InvalidRequest("no live session".into())),
        (Some(_), Some(_)) => Err(RelayError::InvalidRequest(
            "several live sessions, session_id required".into(),
        )),
    }
}

/// POST /control
pub async fn control_handler(State(state): State<AppState>, Json(request): Json<ControlRequest>) -> Response {
    debug!(action = %request.action, session_id = ?request.session_id, "control request");
    match apply(&state, request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => (status_code(&err), Json(ControlResponse::failure(&err))).into_response(),
    }
}

/// GET /sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.sessions.list())
}

/// GET /sessions/{id}
pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.sessions.status(&SessionId::from_raw(id)) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => (status_code(&err), Json(ControlResponse::failure(&err))).into_response(),
    }
}
