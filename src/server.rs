//! HTTP server: chat transports and ingestion endpoints.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/chat?query=` | Long-poll: one terminal payload |
//! | `GET`  | `/chat/stream?query=` | Server-sent events |
//! | `GET`  | `/chat/ws` | WebSocket, one turn at a time |
//! | `POST` | `/chat/upload-jsonl` | Bulk JSONL ingestion (multipart `file`) |
//! | `POST` | `/documents` | Single-document ingestion |
//! | `DELETE` | `/documents` | Delete chunks matching a metadata filter |
//! | `POST` | `/index/query` | Raw similarity search |
//! | `GET`  | `/index/stats` | Vector counts and dimension |
//!
//! All three chat transports consume the same envelope stream from
//! [`ChatEngine::start_turn`], so ordering and termination are identical:
//! chunks in generation order, then exactly one `complete` or `error`.
//! Dropping the envelope receiver (client gone) cancels the turn.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unsupported_media_type` (415),
//! `payload_too_large` (413), `upstream_error` (502), `internal` (500).

use std::convert::Infallible;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Multipart, Query, State,
    },
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use patrika_assist_core::envelope::{StreamEnvelope, TurnPayload};
use patrika_assist_core::models::{Document, IndexMatch, IndexStats, MetadataFilter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::dispatcher::ChatEngine;
use crate::error::{validate_query, ValidationError};
use crate::ingest::{metadata_from_map, validate_upload, BulkReport, Ingestor, UpsertReport};
use crate::progress::NoProgress;
use crate::services::Services;

/// Multipart framing allowance on top of `max_upload_bytes`.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

const MAX_QUERY_TOP_K: usize = 100;

/// WebSocket error for a query sent while a turn is still streaming.
const TURN_IN_PROGRESS: &str = "a turn is already in progress";

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    engine: ChatEngine,
    ingestor: Ingestor,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(services: Services, max_upload_bytes: usize) -> Self {
        Self {
            engine: services.engine,
            ingestor: services.ingestor,
            max_upload_bytes,
        }
    }
}

/// Starts the server on `[server].bind` and runs until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Services::from_config(config)?;
    let listener = TcpListener::bind(&config.server.bind).await?;
    println!("Patrika Assist listening on http://{}", listener.local_addr()?);
    serve(listener, AppState::new(services, config.server.max_upload_bytes)).await
}

/// Serve on an already-bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let upload_limit = state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/health", get(handle_health))
        .route("/chat", post(handle_chat))
        .route("/chat/stream", get(handle_chat_stream))
        .route("/chat/ws", get(handle_chat_ws))
        .route(
            "/chat/upload-jsonl",
            post(handle_upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/documents", post(handle_document).delete(handle_delete_documents))
        .route("/index/query", post(handle_index_query))
        .route("/index/stats", get(handle_index_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        let status = match e {
            ValidationError::UnsupportedFileType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ValidationError::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };
        AppError {
            status,
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn upstream_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "upstream_error".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatParams {
    #[serde(default)]
    query: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatResponse {
    status_code: u16,
    message: &'static str,
    data: TurnPayload,
}

async fn handle_chat(
    State(state): State<AppState>,
    Query(params): Query<ChatParams>,
) -> Result<Json<ChatResponse>, AppError> {
    let query = validate_query(&params.query)?;
    let turn = state
        .engine
        .collect_turn(query)
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(ChatResponse {
        status_code: 200,
        message: "LLM response generated successfully",
        data: turn.payload(),
    }))
}

// ============ GET /chat/stream ============

async fn handle_chat_stream(
    State(state): State<AppState>,
    Query(params): Query<ChatParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let query = validate_query(&params.query)?;
    let handle = state.engine.start_turn(query);
    let events = ReceiverStream::new(handle.events)
        .flat_map(|envelope| futures::stream::iter(sse_events(envelope)))
        .map(Ok::<Event, Infallible>);
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// SSE frames for one envelope. Terminal envelopes are followed by the
/// `done` marker.
fn sse_events(envelope: StreamEnvelope) -> Vec<Event> {
    match envelope {
        StreamEnvelope::Chunk { text, .. } => vec![json_event(&json!({ "chunk": text }))],
        StreamEnvelope::Complete(turn) => vec![json_event(&turn.payload()), done_event()],
        StreamEnvelope::Error { message } => {
            vec![json_event(&json!({ "error": message })), done_event()]
        }
    }
}

fn json_event<T: Serialize>(value: &T) -> Event {
    Event::default().json_data(value).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to encode SSE frame");
        Event::default().data(json!({ "error": e.to_string() }).to_string())
    })
}

fn done_event() -> Event {
    Event::default().event("done").data("[DONE]")
}

// ============ GET /chat/ws ============

#[derive(Deserialize)]
struct WsRequest {
    #[serde(default)]
    query: String,
}

enum Flow {
    Continue,
    Disconnected,
}

async fn handle_chat_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.engine))
}

async fn handle_socket(mut socket: WebSocket, engine: ChatEngine) {
    tracing::info!("WebSocket client connected");

    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => {
                let request = match serde_json::from_str::<WsRequest>(&text) {
                    Ok(r) => r,
                    Err(e) => {
                        send_error(&mut socket, &format!("Invalid JSON: {e}")).await;
                        continue;
                    }
                };
                let query = match validate_query(&request.query) {
                    Ok(q) => q.to_string(),
                    Err(e) => {
                        send_error(&mut socket, &e.to_string()).await;
                        continue;
                    }
                };
                if let Flow::Disconnected = stream_turn(&mut socket, &engine, query).await {
                    return;
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket client disconnected (close frame)");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket receive failed");
                break;
            }
        }
    }
}

/// Relay one turn to the socket. The last `stream` frame is held back
/// until the next envelope arrives so it can carry `is_final: true`.
async fn stream_turn(socket: &mut WebSocket, engine: &ChatEngine, query: String) -> Flow {
    let mut handle = engine.start_turn(query);
    let mut pending: Option<String> = None;

    loop {
        tokio::select! {
            envelope = handle.events.recv() => {
                let Some(envelope) = envelope else {
                    return Flow::Continue;
                };
                let sent = match envelope {
                    StreamEnvelope::Chunk { text, .. } => match pending.replace(text) {
                        Some(prev) => send_stream_frame(socket, &prev, false).await,
                        None => Ok(()),
                    },
                    StreamEnvelope::Complete(turn) => {
                        if let Some(last) = pending.take() {
                            if send_stream_frame(socket, &last, true).await.is_err() {
                                return Flow::Disconnected;
                            }
                        }
                        let frame = json!({ "type": "complete", "data": turn.payload() });
                        return match send_json(socket, &frame).await {
                            Ok(()) => Flow::Continue,
                            Err(()) => Flow::Disconnected,
                        };
                    }
                    StreamEnvelope::Error { message } => {
                        if let Some(last) = pending.take() {
                            if send_stream_frame(socket, &last, true).await.is_err() {
                                return Flow::Disconnected;
                            }
                        }
                        send_error(socket, &message).await;
                        return Flow::Continue;
                    }
                };
                if sent.is_err() {
                    return Flow::Disconnected;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(_))) => {
                    tracing::warn!(turn_id = %handle.id, "query received mid-turn; rejected");
                    send_error(socket, TURN_IN_PROGRESS).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = socket.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(turn_id = %handle.id, "WebSocket closed mid-turn");
                    return Flow::Disconnected;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(turn_id = %handle.id, error = %e, "WebSocket receive failed mid-turn");
                    return Flow::Disconnected;
                }
            },
        }
    }
}

async fn send_stream_frame(socket: &mut WebSocket, chunk: &str, is_final: bool) -> Result<(), ()> {
    let frame = json!({ "type": "stream", "chunk": chunk, "is_final": is_final });
    send_json(socket, &frame).await
}

async fn send_json(socket: &mut WebSocket, value: &Value) -> Result<(), ()> {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "WebSocket send failed");
        })
}

async fn send_error(socket: &mut WebSocket, message: &str) {
    let error = json!({
        "type": "error",
        "message": message,
    });
    let _ = send_json(socket, &error).await;
}

// ============ POST /chat/upload-jsonl ============

#[derive(Serialize)]
struct UploadResponse {
    message: &'static str,
    #[serde(flatten)]
    report: BulkReport,
}

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let content = field.bytes().await.map_err(multipart_error)?;
        validate_upload(filename.as_deref(), &content, state.max_upload_bytes)?;
        let filename = filename.unwrap_or_default();
        let report = state
            .ingestor
            .ingest_jsonl(&content, &filename, &NoProgress)
            .await?;
        return Ok(Json(UploadResponse {
            message: "JSONL file processed successfully",
            report,
        }));
    }
    Err(bad_request("multipart field 'file' is required"))
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> AppError {
    let status = e.status();
    AppError {
        status,
        code: if status == StatusCode::PAYLOAD_TOO_LARGE {
            "payload_too_large".to_string()
        } else {
            "bad_request".to_string()
        },
        message: e.body_text(),
    }
}

// ============ POST /documents ============

#[derive(Deserialize)]
struct DocumentRequest {
    text: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    source_type: String,
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

async fn handle_document(
    State(state): State<AppState>,
    Json(req): Json<DocumentRequest>,
) -> Json<UpsertReport> {
    let doc = Document {
        source_id: req.source_id,
        text: req.text,
        filename: req.filename,
        source_type: req.source_type,
        metadata: req
            .metadata
            .as_ref()
            .map(metadata_from_map)
            .unwrap_or_default(),
    };
    Json(state.ingestor.upsert_document(&doc).await)
}

// ============ DELETE /documents ============

#[derive(Deserialize)]
struct DeleteRequest {
    #[serde(default)]
    filter: MetadataFilter,
}

#[derive(Serialize)]
struct DeleteResponse {
    /// `null` when the index does not report a count.
    deleted: Option<usize>,
}

async fn handle_delete_documents(
    State(state): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> Result<Json<DeleteResponse>, AppError> {
    if req.filter.is_empty() {
        return Err(bad_request("filter must not be empty"));
    }
    let deleted = state
        .ingestor
        .delete_documents(&req.filter)
        .await
        .map_err(|e| upstream_error(format!("{e:#}")))?;
    Ok(Json(DeleteResponse { deleted }))
}

// ============ POST /index/query ============

#[derive(Deserialize)]
struct IndexQueryRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    filter: Option<MetadataFilter>,
}

#[derive(Serialize)]
struct IndexQueryResponse {
    matches: Vec<IndexMatch>,
}

async fn handle_index_query(
    State(state): State<AppState>,
    Json(req): Json<IndexQueryRequest>,
) -> Result<Json<IndexQueryResponse>, AppError> {
    let query = validate_query(&req.query)?;
    let retriever = state.engine.retriever();
    let top_k = req
        .top_k
        .unwrap_or_else(|| retriever.top_k())
        .clamp(1, MAX_QUERY_TOP_K);
    let matches = retriever
        .query_index(query, top_k, req.filter.as_ref())
        .await
        .map_err(|e| upstream_error(format!("{e:#}")))?;
    Ok(Json(IndexQueryResponse { matches }))
}

// ============ GET /index/stats ============

#[derive(Serialize)]
struct StatsResponse {
    stats: IndexStats,
}

async fn handle_index_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, AppError> {
    let stats = state
        .ingestor
        .index_stats()
        .await
        .map_err(|e| upstream_error(format!("{e:#}")))?;
    Ok(Json(StatsResponse { stats }))
}
