use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

use crate::peer::{HttpPeerTransport, OutboxItem};
use stepsync_core::clock::{Clock, SystemClock};
use stepsync_core::config::SyncConfig;
use stepsync_core::db::Database;
use stepsync_core::engine::{EngineDeps, EngineSnapshot, ReconciliationEngine, SyncStats};
use stepsync_core::health_store::SqliteHealthStore;
use stepsync_core::models::{ConnectionStatus, LedgerEntry};
use stepsync_core::progress::{ProgressReport, build_report};
use stepsync_core::protocol::{PayloadError, SyncMessage};
use stepsync_core::transport::{PeerId, TransportEvent};

const BODY_LIMIT: usize = 1024 * 1024; // 1 MB
const MAX_LEDGER_DAYS: i64 = 366;

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    peer: Arc<HttpPeerTransport>,
    events: mpsc::Sender<TransportEvent>,
    monitor: watch::Receiver<EngineSnapshot>,
    clock: Arc<dyn Clock>,
    stall_threshold: TimeDelta,
    api_key: Option<String>,
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct PeerRequest {
    peer_id: String,
}

#[derive(Deserialize)]
struct MessageQuery {
    from: Option<String>,
}

#[derive(Deserialize)]
struct LedgerQuery {
    days: Option<i64>,
}

#[derive(Serialize)]
struct AcceptedResponse {
    accepted: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    status: ConnectionStatus,
    since: DateTime<Utc>,
    stalled: bool,
    peer: Option<PeerId>,
    stats: SyncStats,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<PayloadError> for ApiError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::UnknownPath(path) => {
                Self::NotFound(format!("Unknown payload path '{path}'"))
            }
            malformed @ PayloadError::Malformed { .. } => Self::BadRequest(malformed.to_string()),
        }
    }
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Peer handlers ---

async fn forward(state: &AppState, event: TransportEvent) -> Result<(), ApiError> {
    state
        .events
        .send(event)
        .await
        .map_err(|_| ApiError::Internal(anyhow!("reconciliation engine has stopped")))
}

fn accepted() -> (StatusCode, Json<AcceptedResponse>) {
    (StatusCode::ACCEPTED, Json(AcceptedResponse { accepted: true }))
}

fn validate_peer_id(peer_id: &str) -> Result<String, ApiError> {
    let peer_id = peer_id.trim();
    if peer_id.is_empty() {
        return Err(ApiError::BadRequest("peer_id must not be empty".to_string()));
    }
    Ok(peer_id.to_string())
}

async fn peer_connect(
    State(state): State<AppState>,
    Json(req): Json<PeerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let peer_id = validate_peer_id(&req.peer_id)?;
    state.peer.connect(&peer_id);
    forward(&state, TransportEvent::PeerConnected(peer_id)).await?;
    Ok(accepted())
}

async fn peer_disconnect(
    State(state): State<AppState>,
    Json(req): Json<PeerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let peer_id = validate_peer_id(&req.peer_id)?;
    state.peer.disconnect();
    forward(&state, TransportEvent::PeerDisconnected(peer_id)).await?;
    Ok(accepted())
}

async fn peer_item(
    State(state): State<AppState>,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    SyncMessage::decode(&path, &body)?;
    forward(
        &state,
        TransportEvent::ItemChanged {
            path,
            payload: body.to_vec(),
        },
    )
    .await?;
    Ok(accepted())
}

async fn peer_message(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let from = query
        .from
        .or_else(|| state.peer.connected_peer())
        .ok_or_else(|| {
            ApiError::BadRequest("Unknown sender: connect first or pass ?from=".to_string())
        })?;
    SyncMessage::decode(&path, &body)?;
    forward(
        &state,
        TransportEvent::MessageReceived {
            from,
            path,
            payload: body.to_vec(),
        },
    )
    .await?;
    Ok(accepted())
}

async fn peer_outbox(State(state): State<AppState>) -> Json<Vec<OutboxItem>> {
    Json(state.peer.drain())
}

// --- Read handlers ---

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.monitor.borrow().clone();
    Json(StatusResponse {
        stalled: snapshot.is_stalled(state.clock.now(), state.stall_threshold),
        status: snapshot.status,
        since: snapshot.since,
        peer: state.peer.connected_peer(),
        stats: snapshot.stats,
    })
}

async fn get_today(State(state): State<AppState>) -> Result<Json<ProgressReport>, ApiError> {
    let db = state
        .db
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let report = build_report(&db, state.clock.today(), state.clock.local_now())
        .context("Failed to build progress report")?;
    Ok(Json(report))
}

async fn get_ledger(
    State(state): State<AppState>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<Vec<LedgerEntry>>, ApiError> {
    let days = query.days.unwrap_or(7);
    if !(1..=MAX_LEDGER_DAYS).contains(&days) {
        return Err(ApiError::BadRequest(format!(
            "days must be between 1 and {MAX_LEDGER_DAYS}"
        )));
    }

    let end = state.clock.today();
    let start = end - TimeDelta::days(days - 1);
    let stored = {
        let db = state
            .db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        db.get_ledger_entries(start, end)
            .context("database error")?
    };

    let entries = (0..days)
        .map(|i| {
            let date = end - TimeDelta::days(i);
            stored
                .iter()
                .find(|e| e.date == date)
                .cloned()
                .unwrap_or(LedgerEntry {
                    date,
                    running_total: 0,
                })
        })
        .collect();
    Ok(Json(entries))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/peer/connect", post(peer_connect))
        .route("/api/peer/disconnect", post(peer_disconnect))
        .route("/api/peer/items/{path}", post(peer_item))
        .route("/api/peer/messages/{path}", post(peer_message))
        .route("/api/peer/outbox", get(peer_outbox))
        .route("/api/status", get(get_status))
        .route("/api/today", get(get_today))
        .route("/api/ledger", get(get_ledger))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

/// First and last four characters of the key, or a placeholder when it is too short.
fn mask_api_key(key: &str) -> String {
    let head = key.get(..4);
    let tail = key.len().checked_sub(4).and_then(|start| key.get(start..));
    match (head, tail) {
        (Some(head), Some(tail)) if key.len() > 8 => format!("{head}...{tail}"),
        _ => "****".to_string(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

pub async fn start_server(
    db: Database,
    port: u16,
    bind: &str,
    api_key: Option<String>,
    new_api_key: bool,
) -> anyhow::Result<()> {
    let db = Arc::new(Mutex::new(db));
    let peer = Arc::new(HttpPeerTransport::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let config = SyncConfig::default();

    let (events_tx, events_rx) = mpsc::channel(256);
    let engine = ReconciliationEngine::new(EngineDeps {
        db: db.clone(),
        store: Arc::new(SqliteHealthStore::new(db.clone())),
        transport: peer.clone(),
        clock: clock.clone(),
        config: config.clone(),
    });
    let handle = engine.spawn(events_rx);

    let state = AppState {
        db,
        peer,
        events: events_tx,
        monitor: handle.monitor(),
        clock,
        stall_threshold: config.stall_threshold,
        api_key: api_key.clone(),
    };
    let app = build_router(state);

    if let Some(ref key) = api_key {
        if new_api_key {
            eprintln!("Generated new API key: {key}");
            eprintln!("Include in requests: Authorization: Bearer {key}");
        } else {
            eprintln!(
                "API key: {} (see api_key file in data directory)",
                mask_api_key(key)
            );
        }
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can feed the ledger."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("Failed to bind {bind}:{port}"))?;
    info!(%bind, port, "peer endpoint listening");
    eprintln!("Listening on http://{bind}:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down reconciliation engine");
    handle.shutdown().await;
    Ok(())
}
