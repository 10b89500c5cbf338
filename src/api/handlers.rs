use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::broker::{StreamEvent, Subscription};
use crate::history::HistoryEntry;
use crate::job::{JobCommand, JobId, JobSnapshot, JobStatus};
use crate::scheduler::CancelOutcome;
use crate::session::{Session, SessionInfo};

use super::error::ApiError;
use super::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

/// How output bytes are rendered into JSON strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(super) enum Encoding {
    /// Lossy UTF-8.
    #[default]
    Utf8,
    Base64,
}

impl Encoding {
    fn encode(self, data: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(data).into_owned(),
            Encoding::Base64 => base64::engine::general_purpose::STANDARD.encode(data),
        }
    }
}

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.sessions.len(),
    })
}

#[derive(Serialize)]
pub(super) struct TicketResponse {
    ticket: String,
    expires_in_secs: u64,
}

/// Trade the bearer token for a single-use WebSocket ticket.
pub(super) async fn ws_ticket(State(state): State<AppState>) -> Result<Json<TicketResponse>, ApiError> {
    let ticket = state.tickets.issue().ok_or_else(|| {
        ApiError::ResourceExhausted("too many outstanding websocket tickets".into())
    })?;
    Ok(Json(TicketResponse {
        ticket,
        expires_in_secs: super::ticket::TICKET_TTL.as_secs(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct CreateSessionRequest {
    id: Option<String>,
}

/// The body is optional; an empty body gets a generated id.
pub(super) async fn session_create(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    let req: CreateSessionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?
    };
    let session = state.sessions.open_session(req.id).await?;
    Ok((StatusCode::CREATED, Json(session.info())))
}

pub(super) async fn session_list(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list_sessions())
}

pub(super) async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = state.sessions.get_session(&id).await?;
    Ok(Json(session.info()))
}

pub(super) async fn session_close(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.close_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub(super) struct SubmitJobRequest {
    /// Raw shell line.
    command: Option<String>,
    /// Program and arguments, quoted individually.
    argv: Option<Vec<String>>,
    timeout_secs: Option<u64>,
}

#[derive(Serialize)]
pub(super) struct SubmitJobResponse {
    job_id: JobId,
    status: JobStatus,
}

pub(super) async fn job_submit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let command = match (req.command, req.argv) {
        (Some(line), None) => JobCommand::Line(line),
        (None, Some(argv)) => JobCommand::Argv(argv),
        _ => {
            return Err(ApiError::InvalidRequest(
                "exactly one of 'command' or 'argv' is required".to_string(),
            ))
        }
    };
    let timeout = match req.timeout_secs {
        Some(0) => {
            return Err(ApiError::InvalidRequest(
                "timeout_secs must be at least 1".to_string(),
            ))
        }
        Some(secs) => Some(Duration::from_secs(secs)),
        None => None,
    };

    let session = state.sessions.get_session(&id).await?;
    let job_id = session.submit(command, timeout)?;
    let status = session.get_status(job_id, 0)?.status;
    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id, status })))
}

pub(super) async fn job_list(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<JobSnapshot>>, ApiError> {
    let session = state.sessions.get_session(&id).await?;
    Ok(Json(session.list_jobs()))
}

#[derive(Debug, Deserialize)]
pub(super) struct JobStatusQuery {
    #[serde(default)]
    cursor: u64,
    #[serde(default)]
    encoding: Encoding,
}

#[derive(Serialize)]
pub(super) struct JobStatusResponse {
    #[serde(flatten)]
    snapshot: JobSnapshot,
    /// Output from the requested cursor up to `cursor`.
    output: String,
    encoding: Encoding,
}

pub(super) async fn job_status(
    State(state): State<AppState>,
    Path((id, job)): Path<(String, u64)>,
    Query(query): Query<JobStatusQuery>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let session = state.sessions.get_session(&id).await?;
    let snapshot = session.get_status(JobId(job), query.cursor)?;
    let output = query.encoding.encode(&snapshot.output_bytes());
    Ok(Json(JobStatusResponse {
        snapshot,
        output,
        encoding: query.encoding,
    }))
}

pub(super) async fn job_cancel(
    State(state): State<AppState>,
    Path((id, job)): Path<(String, u64)>,
) -> Result<Json<CancelOutcome>, ApiError> {
    let session = state.sessions.get_session(&id).await?;
    let outcome = session.cancel(JobId(job))?;
    if outcome.cancelled {
        tracing::info!(session_id = %id, job_id = job, "job cancelled");
    }
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub(super) struct HistoryQuery {
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

#[derive(Serialize)]
pub(super) struct HistoryResponse {
    entries: Vec<HistoryEntry>,
    count: usize,
}

pub(super) async fn history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 || limit > MAX_HISTORY_LIMIT {
        return Err(ApiError::InvalidRequest(format!(
            "limit must be between 1 and {MAX_HISTORY_LIMIT}"
        )));
    }
    let session = state.sessions.get_session(&id).await?;
    let (entries, count) = session.history(limit, query.offset);
    Ok(Json(HistoryResponse { entries, count }))
}

pub(super) async fn input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let session = state.sessions.get_session(&id).await?;
    session.write_input(&body)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub(super) struct StreamQuery {
    #[serde(default)]
    encoding: Encoding,
}

/// Wire form of a [`StreamEvent`].
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsEvent<'a> {
    Connected {
        session_id: &'a str,
    },
    Output {
        job_id: Option<JobId>,
        seq: Option<u64>,
        data: String,
        encoding: Encoding,
    },
    JobFinished {
        job_id: JobId,
        status: JobStatus,
        exit_code: Option<i32>,
    },
}

impl<'a> WsEvent<'a> {
    fn from_stream(event: StreamEvent, encoding: Encoding) -> WsEvent<'a> {
        match event {
            StreamEvent::Output { job, seq, data } => WsEvent::Output {
                job_id: job,
                seq,
                data: encoding.encode(&data),
                encoding,
            },
            StreamEvent::JobFinished {
                job,
                status,
                exit_code,
            } => WsEvent::JobFinished {
                job_id: job,
                status,
                exit_code,
            },
        }
    }

    fn to_message(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(text) => Some(Message::Text(text.into())),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize stream event");
                None
            }
        }
    }
}

pub(super) async fn ws_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.sessions.get_session(&id).await?;
    // Subscribe before upgrading so limit and state errors reach the client
    // as ordinary HTTP errors.
    let subscription = session.subscribe()?;
    Ok(ws.on_upgrade(move |socket| handle_ws_stream(socket, session, subscription, query.encoding)))
}

async fn handle_ws_stream(
    socket: WebSocket,
    session: Session,
    mut subscription: Subscription,
    encoding: Encoding,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let connected = WsEvent::Connected {
        session_id: session.id(),
    };
    if let Some(msg) = connected.to_message() {
        if ws_tx.send(msg).await.is_err() {
            return;
        }
    }
    tracing::debug!(session_id = %session.id(), "stream client connected");

    loop {
        tokio::select! {
            // Session output -> WebSocket
            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        let Some(msg) = WsEvent::from_stream(event, encoding).to_message() else {
                            continue;
                        };
                        if ws_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Session closed, or this client fell too far behind.
                        let close_frame = CloseFrame {
                            code: axum::extract::ws::close_code::AWAY,
                            reason: "stream closed".into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
                        let _ = ws_tx.flush().await;
                        break;
                    }
                }
            }

            // WebSocket input -> shell
            msg = ws_rx.next() => {
                let data: Bytes = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(_)) => break,
                };
                if let Err(e) = session.write_input(&data) {
                    tracing::debug!(session_id = %session.id(), error = %e, "stream input rejected");
                    break;
                }
            }
        }
    }

    tracing::debug!(session_id = %session.id(), "stream client disconnected");
}
