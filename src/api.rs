use crate::config::Config;
use crate::error::ChatError;
use crate::model::{BackfillPayload, ChatMessage, EventRecord, RealtimePayload, RoomStatus, SendRequest};
use crate::{db, events, housekeeping, policy, store};
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

/// Maximum message length in characters, enforced on the send path.
pub const MAX_TEXT_CHARS: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool<SqliteConnectionManager>,
    /// Every successful append publishes its event id here; parked
    /// long-polls subscribe and re-check the store on each wakeup.
    pub room_tx: broadcast::Sender<String>,
    pub config: Config,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let manager = SqliteConnectionManager::file(config.data_dir.join("chat.db"))
            .with_init(|c| c.busy_timeout(std::time::Duration::from_secs(5)));
        let pool = Pool::new(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch(db::SCHEMA)?;
        }
        let (tx, _rx) = broadcast::channel(256);
        Ok(Self {
            pool,
            room_tx: tx,
            config,
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/events", put(ingest_event))
        .route("/chat/realtime", get(realtime))
        .route("/chat/messages", get(backfill))
        .route("/chat/status", get(room_status))
        .route("/chat/send", post(send_message))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(serde::Serialize)]
struct ErrorResp {
    error: String,
}

fn err(status: StatusCode, msg: &str) -> (StatusCode, Json<ErrorResp>) {
    (status, Json(ErrorResp { error: msg.into() }))
}

type ApiError = (StatusCode, Json<ErrorResp>);

/// Map the chat taxonomy onto wire responses. `Locked` is the user-visible
/// "this chat has ended" condition.
fn chat_err(e: ChatError) -> ApiError {
    let status = match &e {
        ChatError::Locked => StatusCode::GONE,
        ChatError::UnknownEvent => StatusCode::NOT_FOUND,
        ChatError::EmptyMessage | ChatError::MessageTooLong => StatusCode::BAD_REQUEST,
        ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    match e {
        ChatError::Storage(_) => err(status, "db_error"),
        other => err(status, &other.to_string()),
    }
}

fn get_conn(state: &AppState) -> Result<PooledConnection<SqliteConnectionManager>, ApiError> {
    state
        .pool
        .get()
        .map_err(|_| err(StatusCode::INTERNAL_SERVER_ERROR, "db_unavailable"))
}

fn load_event(state: &AppState, id: &str) -> Result<EventRecord, ApiError> {
    let conn = get_conn(state)?;
    match events::get_event(&conn, id) {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(chat_err(ChatError::UnknownEvent)),
        Err(_) => Err(err(StatusCode::INTERNAL_SERVER_ERROR, "db_error")),
    }
}

fn validate_text(text: &str) -> Result<(), ChatError> {
    if text.is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(ChatError::MessageTooLong);
    }
    Ok(())
}

async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<EventRecord>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = get_conn(&state)?;
    events::upsert_event(&conn, &event)
        .map_err(|_| err(StatusCode::INTERNAL_SERVER_ERROR, "db_error"))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeQuery {
    event_id: String,
    user_id: String,
    #[serde(default)]
    last_timestamp: i64,
}

/// Long-poll transport: blocks up to the configured wait window for a
/// message with `timestamp > lastTimestamp`, else answers with a heartbeat
/// so the connection does not appear dead. The client's own timeout must
/// exceed this window.
async fn realtime(
    State(state): State<AppState>,
    Query(q): Query<RealtimeQuery>,
) -> Result<Json<RealtimePayload>, ApiError> {
    let event = load_event(&state, &q.event_id)?;
    debug!(event = %q.event_id, user = %q.user_id, since = q.last_timestamp, "realtime poll");
    // subscribe before the first check so an append between check and park
    // is not missed
    let mut rx = state.room_tx.subscribe();
    let deadline = Instant::now() + Duration::from_secs(state.config.poll_wait_secs);
    loop {
        let now = policy::now_ms();
        if policy::is_locked(&event, now) {
            return Ok(Json(RealtimePayload::Heartbeat));
        }
        let messages = {
            let conn = get_conn(&state)?;
            store::range(&conn, &event, q.last_timestamp, store::MAX_BATCH, now)
                .map_err(|_| err(StatusCode::INTERNAL_SERVER_ERROR, "db_error"))?
        };
        if !messages.is_empty() {
            return Ok(Json(RealtimePayload::Messages { messages }));
        }
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(Json(RealtimePayload::Heartbeat));
            };
            match timeout(remaining, rx.recv()).await {
                Err(_) => return Ok(Json(RealtimePayload::Heartbeat)),
                Ok(Ok(id)) if id == q.event_id => break,
                Ok(Ok(_)) => continue,
                // missed wakeups collapse into one re-check
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => break,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Ok(Json(RealtimePayload::Heartbeat))
                }
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomQuery {
    event_id: String,
}

/// Initial backfill on chat open: full room contents, or empty once locked.
async fn backfill(
    State(state): State<AppState>,
    Query(q): Query<RoomQuery>,
) -> Result<Json<BackfillPayload>, ApiError> {
    let event = load_event(&state, &q.event_id)?;
    let conn = get_conn(&state)?;
    let messages = store::range(&conn, &event, 0, 500, policy::now_ms())
        .map_err(|_| err(StatusCode::INTERNAL_SERVER_ERROR, "db_error"))?;
    Ok(Json(BackfillPayload { messages }))
}

async fn room_status(
    State(state): State<AppState>,
    Query(q): Query<RoomQuery>,
) -> Result<Json<RoomStatus>, ApiError> {
    let event = load_event(&state, &q.event_id)?;
    let now = policy::now_ms();
    let locked = policy::is_locked(&event, now);
    let message_count = if locked {
        0
    } else {
        let conn = get_conn(&state)?;
        store::message_count(&conn, &event.id)
            .map_err(|_| err(StatusCode::INTERNAL_SERVER_ERROR, "db_error"))?
    };
    Ok(Json(RoomStatus {
        locked,
        lock_boundary: policy::lock_boundary(event.starts_at, event.ends_at),
        message_count,
    }))
}

async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> Result<(StatusCode, Json<ChatMessage>), ApiError> {
    let text = req.message.text.trim();
    validate_text(text).map_err(chat_err)?;
    let event = load_event(&state, &req.event_id)?;
    let conn = get_conn(&state)?;
    let input = store::NewMessage {
        user_id: &req.user_id,
        user_name: &req.user_name,
        text,
    };
    let stored = store::append(&conn, &event, &input, policy::now_ms()).map_err(chat_err)?;
    let _ = state.room_tx.send(event.id.clone());
    debug!(event = %event.id, title = %req.event_title, user = %req.user_id, "message appended");
    Ok((StatusCode::OK, Json(stored)))
}

/// Run the HTTP server bound to the configured address.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let state = AppState::new(config).await?;
    housekeeping::spawn_purge_loop(state.clone(), Duration::from_secs(60));
    info!(%addr, "event chat listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}
