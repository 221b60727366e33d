use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use ticker_harvest::{
    canonical::Canonicalizer,
    config::Config,
    csv_codec,
    export::{DirectorySink, EXPORT_FILENAME},
    kv::JsonFileStore,
    ranking::{self, TimeWindow},
    session::ExtractionSession,
    store::AggregateStore,
    types::PageEvent,
    worker::{persistence_sweep, send_best_effort, StoreMessage, StoreWorker, CHANNEL_CAPACITY},
};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

pub struct AppState {
    config: Config,
    store: Arc<AggregateStore>,
    store_tx: mpsc::Sender<StoreMessage>,
    session_resets: broadcast::Sender<()>,
    active_sessions: RwLock<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ticker_harvest=info")))
        .init();

    info!("==================================================");
    info!("  TICKER HARVEST");
    info!("==================================================");

    let config = Config::from_env()?;
    info!("Data dir: {}", config.data_dir.display());
    info!("Export dir: {}", config.export_dir.display());

    let kv = Arc::new(JsonFileStore::open(&config.data_dir)?);
    let store = Arc::new(AggregateStore::load(kv, config.auto_export_threshold).await);
    info!("AggregateStore initialized with {} pairs", store.size().await);

    let (store_tx, store_rx) = mpsc::channel::<StoreMessage>(CHANNEL_CAPACITY);
    let (session_resets, _) = broadcast::channel::<()>(16);

    let worker = StoreWorker::new(Arc::clone(&store), Arc::new(DirectorySink::new(&config.export_dir)));
    tokio::spawn(worker.run(store_rx));
    tokio::spawn(persistence_sweep(Arc::clone(&store), config.persist_interval));
    // Pick up pairs from the last export once per start.
    send_best_effort(&store_tx, StoreMessage::ImportExisting { reply: None }).await;

    let port = config.port;
    let state = Arc::new(AppState {
        config,
        store: Arc::clone(&store),
        store_tx,
        session_resets,
        active_sessions: RwLock::new(0),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/pairs", get(list_pairs).delete(clear_pairs))
        .route("/api/top", get(top_mentions))
        .route("/api/export.csv", get(download_csv))
        .route("/api/export", post(export_now))
        .route("/api/import", post(import_csv))
        .route("/api/import/existing", post(import_existing))
        .route("/api/reload", post(reload))
        .route("/api/session/clear", post(clear_session_cache))
        .route("/ws", get(ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Server running on port {} (WebSocket at /ws)", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    if let Err(e) = store.flush().await {
        warn!("Final save failed: {}", e);
    }
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn worker_unavailable() -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, "Store worker unavailable")
}

/// Send a message carrying a reply channel and wait for the answer.
async fn ask<T>(state: &AppState, build: impl FnOnce(oneshot::Sender<T>) -> StoreMessage) -> Option<T> {
    let (tx, rx) = oneshot::channel();
    state.store_tx.send(build(tx)).await.ok()?;
    rx.await.ok()
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ticker-harvest",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn status(State(s): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "pairs": s.store.size().await,
        "pendingEmissions": s.store.pending_emissions().await,
        "autoExportThreshold": s.config.auto_export_threshold,
        "activeSessions": *s.active_sessions.read().await,
    }))
}

async fn list_pairs(State(s): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!(s.store.snapshot().await))
}

#[derive(Deserialize)]
struct TopParams {
    #[serde(default)]
    days: u32,
}

async fn top_mentions(State(s): State<Arc<AppState>>, Query(params): Query<TopParams>) -> Response {
    let pairs = s.store.snapshot().await;
    if pairs.is_empty() {
        return error_response(StatusCode::NOT_FOUND, "No data to analyze");
    }
    Json(ranking::report(&pairs, TimeWindow::from_days(params.days), Utc::now())).into_response()
}

async fn download_csv(State(s): State<Arc<AppState>>) -> Response {
    let pairs = s.store.snapshot_newest_first().await;
    (
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", EXPORT_FILENAME)),
        ],
        csv_codec::encode(&pairs),
    )
        .into_response()
}

async fn export_now(State(s): State<Arc<AppState>>) -> Response {
    match ask(&s, |reply| StoreMessage::ExportNow { reply: Some(reply) }).await {
        Some(Some(path)) => Json(serde_json::json!({
            "message": "CSV exported",
            "path": path.display().to_string(),
        }))
        .into_response(),
        Some(None) => Json(serde_json::json!({ "message": "Nothing exported" })).into_response(),
        None => worker_unavailable(),
    }
}

#[derive(Deserialize)]
struct ImportParams {
    filename: Option<String>,
}

async fn import_csv(State(s): State<Arc<AppState>>, Query(params): Query<ImportParams>, body: String) -> Response {
    let pairs = match csv_codec::decode_upload(params.filename.as_deref(), &body) {
        Ok(pairs) => pairs,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let parsed = pairs.len();
    match ask(&s, |reply| StoreMessage::Import { pairs, reply }).await {
        Some(report) => {
            info!("CSV import: {} rows parsed, {}", parsed, report.summary());
            Json(serde_json::json!({
                "added": report.added,
                "duplicates": report.duplicates,
                "message": report.summary(),
            }))
            .into_response()
        }
        None => worker_unavailable(),
    }
}

async fn import_existing(State(s): State<Arc<AppState>>) -> Response {
    match ask(&s, |reply| StoreMessage::ImportExisting { reply: Some(reply) }).await {
        Some(Ok(report)) => Json(serde_json::json!({
            "added": report.added,
            "duplicates": report.duplicates,
            "message": report.summary(),
        }))
        .into_response(),
        Some(Err(e)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        None => worker_unavailable(),
    }
}

async fn reload(State(s): State<Arc<AppState>>) -> Response {
    match ask(&s, |reply| StoreMessage::Reload { reply: Some(reply) }).await {
        Some(count) => Json(serde_json::json!({ "loaded": count })).into_response(),
        None => worker_unavailable(),
    }
}

#[derive(Deserialize)]
struct ClearParams {
    #[serde(default)]
    confirm: bool,
}

async fn clear_pairs(State(s): State<Arc<AppState>>, Query(params): Query<ClearParams>) -> Response {
    if !params.confirm {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Clearing all stored ticker pairs requires confirm=true",
        );
    }
    match ask(&s, |reply| StoreMessage::Clear { reply: Some(reply) }).await {
        Some(()) => Json(serde_json::json!({ "message": "All data cleared" })).into_response(),
        None => worker_unavailable(),
    }
}

async fn clear_session_cache(State(s): State<Arc<AppState>>) -> Json<serde_json::Value> {
    // No receivers just means no page is connected.
    let sessions = s.session_resets.send(()).unwrap_or(0);
    info!("Session cache reset sent to {} session(s)", sessions);
    Json(serde_json::json!({ "sessions": sessions }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

fn decode_event(msg: Message) -> Option<Result<PageEvent, String>> {
    match msg {
        Message::Text(text) => Some(serde_json::from_str(&text).map_err(|e| e.to_string())),
        Message::Binary(data) => Some(rmp_serde::from_slice(&data).map_err(|e| e.to_string())),
        _ => None,
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    *state.active_sessions.write().await += 1;
    info!("Page connected");

    let welcome = serde_json::json!({ "type": "welcome" }).to_string();
    let _ = sender.send(Message::Text(welcome.into())).await;

    let (events_tx, events_rx) = mpsc::channel::<PageEvent>(64);
    let session = ExtractionSession::new(
        Canonicalizer::new(&state.config.site_origin),
        state.config.debounce,
        state.store_tx.clone(),
    );
    let session_task = tokio::spawn(session.run(events_rx, state.session_resets.subscribe()));

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) => break,
            Ok(msg) => match decode_event(msg) {
                Some(Ok(event)) => {
                    if events_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => debug!("Ignoring undecodable page event: {}", e),
                None => {}
            },
            Err(e) => {
                warn!("WebSocket error: {}", e);
                break;
            }
        }
    }

    drop(events_tx);
    let _ = session_task.await;
    *state.active_sessions.write().await -= 1;
    info!("Page disconnected");
}
