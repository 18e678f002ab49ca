/// Telephony-facing WebSocket endpoint.
///
/// One bridge per accepted connection. The socket is adapted to the
/// channel-pair interface the bridge core expects (one reader task, one
/// writer task — peer writes stay serialized), so the core never touches
/// axum types. A small process-lifecycle object owns the function registry
/// and the set of live bridges.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{self, CleanupFn, ModelConnector};
use crate::config::Config;
use crate::functions::FunctionRegistry;
use crate::model_peer::ModelPeerConfig;
use crate::peer::PeerConnection;
use crate::stats::Stats;

/// Process-lifecycle state: the registry, counters and live bridges.
#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub registry: Arc<FunctionRegistry>,
    pub stats: Arc<Stats>,
    live: Arc<Mutex<HashMap<Uuid, DateTime<Utc>>>>,
}

impl App {
    pub fn new(config: Arc<Config>, registry: Arc<FunctionRegistry>, stats: Arc<Stats>) -> Self {
        App {
            config,
            registry,
            stats,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn active_calls(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

/// `GET /health` — liveness + active call count.
async fn health(State(app): State<App>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_calls": app.active_calls(),
    }))
}

/// `GET /voice` — telephony WebSocket upgrade.
async fn voice_upgrade(ws: WebSocketUpgrade, State(app): State<App>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_call(socket, app))
}

/// Adapt the socket to a channel pair and run a bridge over it.
async fn handle_call(socket: WebSocket, app: App) {
    let conn_id = Uuid::new_v4();
    app.live.lock().unwrap().insert(conn_id, Utc::now());
    info!(conn_id = %conn_id, "☎️ telephony connection accepted");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let capacity = app.config.channel_capacity;
    let (out_tx, mut out_rx) = mpsc::channel::<String>(capacity);
    let (in_tx, in_rx) = mpsc::channel::<String>(capacity);

    // Writer task: the only writer on this socket.
    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = ws_sink.send(Message::Text(text)).await {
                warn!("telephony WS send error: {e}");
                break;
            }
        }
        let _ = ws_sink.send(Message::Close(None)).await;
    });

    // Reader task: socket frames -> bridge inbound channel.
    tokio::spawn(async move {
        while let Some(msg) = ws_stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if in_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(other) => debug!(msg = ?other, "non-text telephony frame ignored"),
            }
        }
        // Dropping in_tx surfaces the disconnect to the bridge.
    });

    let telephony = PeerConnection {
        outbound: out_tx,
        inbound: in_rx,
    };
    let connector = model_connector(&app.config);

    let live = app.live.clone();
    let cleanup: Vec<CleanupFn> = vec![Box::new(move || {
        live.lock().unwrap().remove(&conn_id);
    })];

    // A panicking bridge must not leak the live-registry entry.
    let result = tokio::spawn(bridge::run_bridge(
        app.config.bridge_config(),
        app.registry.clone(),
        telephony,
        connector,
        app.stats.clone(),
        cleanup,
    ))
    .await;

    match result {
        Ok(Ok(())) => info!(conn_id = %conn_id, "call finished"),
        Ok(Err(e)) => warn!(conn_id = %conn_id, error = %e, "call ended with error"),
        Err(e) => {
            warn!(conn_id = %conn_id, error = %e, "bridge task panicked");
            app.live.lock().unwrap().remove(&conn_id);
        }
    }
}

/// Pick the model peer per configuration: real Realtime API, an external
/// substitute speaking the same protocol, or the in-process substitute.
fn model_connector(config: &Config) -> ModelConnector {
    if !config.use_local_model {
        return ModelConnector::Realtime(config.model_peer_config());
    }
    if config.local_model_url.is_empty() {
        ModelConnector::Local(Vec::new())
    } else {
        ModelConnector::Realtime(ModelPeerConfig {
            api_key: "local-dev".into(),
            model_id: config.model_id.clone(),
            url: config.local_model_url.clone(),
            connect_timeout: std::time::Duration::from_secs(config.connect_timeout_secs),
            channel_capacity: config.channel_capacity,
        })
    }
}

/// Build the axum Router with the voice + health routes.
pub fn build_router(app: App) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/voice", get(voice_upgrade))
        .with_state(app)
}

/// Start the server. Returns the `JoinHandle` so the caller can join on it
/// alongside the stats reporter.
pub async fn start_server(app: App) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let addr: SocketAddr = app.config.listen_addr().parse()?;
    let router = build_router(app);

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "🌐 telephony WebSocket endpoint listening");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(handle)
}
