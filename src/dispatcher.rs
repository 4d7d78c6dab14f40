//! Dispatcher: fronts consumer websocket connections, replays the
//! last-known snapshot on connect, broadcasts tick/event messages, and
//! services the full bidirectional control-command surface.

use crate::config::{DeviceInfo, Thresholds};
use crate::error::PipelineError;
use crate::session::{self, SessionSummary};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

const BROADCAST_CAPACITY: usize = 256;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 200;
const DEFAULT_RAW_LIMIT: usize = 2000;
const MIN_RAW_LIMIT: usize = 100;
const MAX_RAW_LIMIT: usize = 20000;
const DEFAULT_RAW_STRIDE: usize = 5;
const MIN_RAW_STRIDE: usize = 1;
const MAX_RAW_STRIDE: usize = 100;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    RepUpdate(RepUpdate),
    RepEvent(RepEvent),
    Status(StatusMessage),
    Error { r#where: String, error: String },
    Ack(Ack),
    SessionSummary { summary: SessionSummary },
    SessionsList { sessions: Vec<SessionSummary>, total: usize },
    SessionDetail { summary: SessionSummary },
    SessionRaw { session_id: String, points: Vec<Value> },
    ExportResult { ok: bool, path: Option<String>, http_url: Option<String>, error: Option<String> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepUpdate {
    pub t: f64,
    pub reps: u32,
    pub state: String,
    pub recording: bool,
    pub gyro_filt: f64,
    pub tut_sec: f64,
    pub avg_tempo_sec: Option<f64>,
    pub output_loss_pct: Option<f64>,
    pub avg_peak_speed_proxy: Option<f64>,
    pub speed_loss_pct: Option<f64>,
    pub velocity: f64,
    pub displacement: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub avg_velocity_ms: Option<f64>,
    pub velocity_loss_pct: Option<f64>,
    pub avg_rom_m: Option<f64>,
    pub rom_loss_pct: Option<f64>,
    pub detected_lift: Option<String>,
    pub lift_confidence: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepEvent {
    pub rep: u32,
    pub t: f64,
    pub tempo_sec: Option<f64>,
    pub peak_gyro: f64,
    pub peak_speed_proxy: f64,
    pub peak_velocity_ms: f64,
    pub rom_m: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusMessage {
    pub recording: bool,
    pub session_id: Option<String>,
    pub reps: u32,
    pub state: String,
    pub device_info: DeviceInfo,
    pub thresholds: Thresholds,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Ack {
    pub ok: bool,
    pub action: String,
    pub note: Option<String>,
    pub session_id: Option<String>,
    pub dir: Option<String>,
    pub file: Option<String>,
    pub reason: Option<String>,
}

/// Commands that must be serviced by the pipeline loop because it owns the
/// `SessionRecorder` and the filter states (spec.md §9's control channel).
pub enum ControlCommand {
    Start {
        reply: oneshot::Sender<Result<session::StartInfo, PipelineError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<SessionSummary, PipelineError>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct AppState {
    pub broadcast_tx: broadcast::Sender<OutboundMessage>,
    pub last_snapshot: Arc<RwLock<Option<OutboundMessage>>>,
    pub control_tx: mpsc::Sender<ControlCommand>,
    pub sessions_dir: String,
    pub exports_dir: String,
    pub device_info: DeviceInfo,
    pub thresholds: Thresholds,
}

pub fn new_broadcast() -> (broadcast::Sender<OutboundMessage>, Arc<RwLock<Option<OutboundMessage>>>) {
    let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
    (tx, Arc::new(RwLock::new(None)))
}

/// Called by the pipeline loop once per tick/event; publishes to the
/// broadcast set and updates the replay cell. A dropped consumer's send
/// failure is not retried (spec.md §5's no-queueing/no-retry backpressure
/// policy) — `broadcast::Sender::send` already drops lagging/closed
/// receivers for us.
pub async fn publish(state: &AppState, message: OutboundMessage) {
    *state.last_snapshot.write().await = Some(message.clone());
    let _ = state.broadcast_tx.send(message);
}

pub fn router(state: AppState) -> Router {
    let exports_dir = state.exports_dir.clone();
    Router::new()
        .route("/ws", get(ws_handler))
        .nest_service("/exports", ServeDir::new(exports_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Consumer connections carry a 20s ping/pong heartbeat (spec.md §5): we
/// ping on interval and require a pong before the next one falls due, and
/// a consumer that never pings or pongs within the window is dropped —
/// same "no retry, drop the consumer" policy as a failed broadcast send.
async fn handle_socket(socket: WebSocket, state: AppState) {
    log::debug!("consumer connected");
    let (mut sender, mut receiver) = socket.split();
    let mut broadcast_rx = state.broadcast_tx.subscribe();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately; consume it
    let mut awaiting_pong = false;
    let mut last_pong = Instant::now();

    if let Some(snapshot) = state.last_snapshot.read().await.clone() {
        if send_json(&mut sender, &snapshot).await.is_err() {
            log::debug!("consumer disconnected (replay send failed)");
            return;
        }
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(response) = handle_inbound_text(&state, &text).await {
                            if send_json(&mut sender, &response).await.is_err() {
                                break;
                            }
                        }
                        // protocol parse failures are silently dropped per spec.md §7
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // axum answers these automatically; still counts as life signal.
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            published = broadcast_rx.recv() => {
                match published {
                    Ok(message) => {
                        if send_json(&mut sender, &message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = heartbeat.tick() => {
                if awaiting_pong && last_pong.elapsed() >= HEARTBEAT_INTERVAL {
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
        }
    }
    log::debug!("consumer disconnected");
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &OutboundMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).unwrap_or_default();
    sender.send(Message::Text(text)).await
}

#[derive(Deserialize)]
struct InboundFrame {
    action: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    stride: Option<usize>,
    #[serde(default)]
    start_http: Option<bool>,
    #[serde(default)]
    http_port: Option<u16>,
}

async fn handle_inbound_text(state: &AppState, text: &str) -> Option<OutboundMessage> {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => return None,
    };

    match frame.action.as_str() {
        "start" => Some(handle_start(state).await),
        "stop" => Some(handle_stop(state).await),
        "reset" => Some(handle_reset(state).await),
        "list_sessions" => Some(handle_list_sessions(state, frame.limit)),
        "get_session" => Some(handle_get_session(state, frame.session_id)),
        "get_session_raw" => Some(handle_get_session_raw(state, frame.session_id, frame.limit, frame.stride)),
        "export_session" => Some(
            handle_export_session(state, frame.session_id, frame.start_http.unwrap_or(true), frame.http_port.unwrap_or(8000))
                .await,
        ),
        _ => None,
    }
}

async fn handle_start(state: &AppState) -> OutboundMessage {
    let (reply_tx, reply_rx) = oneshot::channel();
    if state.control_tx.send(ControlCommand::Start { reply: reply_tx }).await.is_err() {
        return OutboundMessage::Ack(Ack {
            ok: false,
            action: "start".to_string(),
            reason: Some("pipeline_unreachable".to_string()),
            ..Default::default()
        });
    }
    match reply_rx.await {
        Ok(Ok(info)) => OutboundMessage::Ack(Ack {
            ok: true,
            action: "start".to_string(),
            session_id: Some(info.session_id),
            dir: Some(info.dir),
            file: Some(info.file),
            ..Default::default()
        }),
        Ok(Err(PipelineError::SessionAlreadyActive)) => OutboundMessage::Ack(Ack {
            ok: true,
            action: "start".to_string(),
            note: Some("already_active".to_string()),
            ..Default::default()
        }),
        Ok(Err(e)) => OutboundMessage::Ack(Ack {
            ok: false,
            action: "start".to_string(),
            reason: Some(e.to_string()),
            ..Default::default()
        }),
        Err(_) => OutboundMessage::Ack(Ack {
            ok: false,
            action: "start".to_string(),
            reason: Some("pipeline_unreachable".to_string()),
            ..Default::default()
        }),
    }
}

async fn handle_stop(state: &AppState) -> OutboundMessage {
    let (reply_tx, reply_rx) = oneshot::channel();
    if state.control_tx.send(ControlCommand::Stop { reply: reply_tx }).await.is_err() {
        return OutboundMessage::Ack(Ack {
            ok: false,
            action: "stop".to_string(),
            reason: Some("pipeline_unreachable".to_string()),
            ..Default::default()
        });
    }
    match reply_rx.await {
        Ok(Ok(summary)) => {
            publish(state, OutboundMessage::SessionSummary { summary: summary.clone() }).await;
            OutboundMessage::Ack(Ack {
                ok: true,
                action: "stop".to_string(),
                session_id: Some(summary.session_id),
                ..Default::default()
            })
        }
        Ok(Err(e)) => OutboundMessage::Ack(Ack {
            ok: false,
            action: "stop".to_string(),
            reason: Some(e.to_string()),
            ..Default::default()
        }),
        Err(_) => OutboundMessage::Ack(Ack {
            ok: false,
            action: "stop".to_string(),
            reason: Some("pipeline_unreachable".to_string()),
            ..Default::default()
        }),
    }
}

async fn handle_reset(state: &AppState) -> OutboundMessage {
    let (reply_tx, reply_rx) = oneshot::channel();
    let _ = state.control_tx.send(ControlCommand::Reset { reply: reply_tx }).await;
    let _ = reply_rx.await;
    OutboundMessage::Ack(Ack {
        ok: true,
        action: "reset".to_string(),
        ..Default::default()
    })
}

fn handle_list_sessions(state: &AppState, limit: Option<usize>) -> OutboundMessage {
    let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let mut summaries = Vec::new();

    if let Ok(entries) = fs::read_dir(&state.sessions_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if let Ok(summary) = session::read_summary(&path) {
                    summaries.push(summary);
                }
            }
        }
    }

    summaries.sort_by(|a, b| b.end_time.cmp(&a.end_time));
    let total = summaries.len();
    summaries.truncate(limit);

    OutboundMessage::SessionsList { sessions: summaries, total }
}

fn handle_get_session(state: &AppState, session_id: Option<String>) -> OutboundMessage {
    match session_id.and_then(|id| read_session_summary(state, &id)) {
        Some(summary) => OutboundMessage::SessionDetail { summary },
        None => OutboundMessage::Error {
            r#where: "get_session".to_string(),
            error: "session_not_found".to_string(),
        },
    }
}

fn read_session_summary(state: &AppState, session_id: &str) -> Option<SessionSummary> {
    let dir = Path::new(&state.sessions_dir).join(format!("session_{session_id}"));
    session::read_summary(&dir).ok()
}

fn handle_get_session_raw(
    state: &AppState,
    session_id: Option<String>,
    limit: Option<usize>,
    stride: Option<usize>,
) -> OutboundMessage {
    let limit = limit.unwrap_or(DEFAULT_RAW_LIMIT).clamp(MIN_RAW_LIMIT, MAX_RAW_LIMIT);
    let stride = stride.unwrap_or(DEFAULT_RAW_STRIDE).clamp(MIN_RAW_STRIDE, MAX_RAW_STRIDE);

    let session_id = match session_id {
        Some(id) => id,
        None => {
            return OutboundMessage::Error {
                r#where: "get_session_raw".to_string(),
                error: "missing_session_id".to_string(),
            }
        }
    };

    let raw_path = Path::new(&state.sessions_dir)
        .join(format!("session_{session_id}"))
        .join("raw.jsonl");

    let content = match fs::read_to_string(&raw_path) {
        Ok(c) => c,
        Err(_) => {
            return OutboundMessage::Error {
                r#where: "get_session_raw".to_string(),
                error: "session_not_found".to_string(),
            }
        }
    };

    let points: Vec<Value> = content
        .lines()
        .step_by(stride)
        .take(limit)
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();

    OutboundMessage::SessionRaw { session_id, points }
}

async fn handle_export_session(
    state: &AppState,
    session_id: Option<String>,
    start_http: bool,
    http_port: u16,
) -> OutboundMessage {
    let session_id = match session_id {
        Some(id) => id,
        None => {
            return OutboundMessage::ExportResult {
                ok: false,
                path: None,
                http_url: None,
                error: Some("missing_session_id".to_string()),
            }
        }
    };

    match build_export(state, &session_id) {
        Ok(path) => {
            let http_url = if start_http {
                spawn_export_http_server(&state.exports_dir, http_port);
                Some(format!("http://127.0.0.1:{http_port}/{}", path.file_name().unwrap().to_string_lossy()))
            } else {
                None
            };
            OutboundMessage::ExportResult {
                ok: true,
                path: Some(path.to_string_lossy().to_string()),
                http_url,
                error: None,
            }
        }
        Err(e) => OutboundMessage::ExportResult {
            ok: false,
            path: None,
            http_url: None,
            error: Some(e.to_string()),
        },
    }
}

fn build_export(state: &AppState, session_id: &str) -> Result<std::path::PathBuf, PipelineError> {
    let session_dir = Path::new(&state.sessions_dir).join(format!("session_{session_id}"));
    let summary = session::read_summary(&session_dir)?;
    let raw_path = session_dir.join("raw.jsonl");

    fs::create_dir_all(&state.exports_dir)?;
    let export_path = Path::new(&state.exports_dir).join(format!("export_{session_id}.zip"));
    let file = fs::File::create(&export_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    zip.start_file("summary.json", options)
        .map_err(|e| PipelineError::Export(e.to_string()))?;
    use std::io::Write;
    let summary_json = serde_json::to_vec_pretty(&summary)?;
    zip.write_all(&summary_json)
        .map_err(|e| PipelineError::Export(e.to_string()))?;

    zip.start_file("raw.jsonl", options)
        .map_err(|e| PipelineError::Export(e.to_string()))?;
    let raw_bytes = fs::read(&raw_path).unwrap_or_default();
    zip.write_all(&raw_bytes)
        .map_err(|e| PipelineError::Export(e.to_string()))?;

    let meta = json!({
        "device_info": summary.device_info,
        "thresholds": summary.thresholds,
        "created_at": chrono::Utc::now().to_rfc3339(),
    });
    zip.start_file("meta.json", options)
        .map_err(|e| PipelineError::Export(e.to_string()))?;
    zip.write_all(serde_json::to_string_pretty(&meta)?.as_bytes())
        .map_err(|e| PipelineError::Export(e.to_string()))?;

    zip.finish().map_err(|e| PipelineError::Export(e.to_string()))?;
    Ok(export_path)
}

/// Starts a static file server over the exports directory on a configurable
/// port, satisfying `export_session`'s optional `start_http` contract
/// in-process rather than by shelling out to an external static server.
fn spawn_export_http_server(exports_dir: &str, port: u16) {
    let dir = exports_dir.to_string();
    tokio::spawn(async move {
        let app = Router::new().nest_service("/", ServeDir::new(dir));
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
        if let Ok(listener) = tokio::net::TcpListener::bind(addr).await {
            log::info!("export http server listening on {addr}");
            let _ = axum::serve(listener, app).await;
        } else {
            log::warn!("export http server failed to bind {addr}");
        }
    });
}
