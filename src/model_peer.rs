/// Outbound WebSocket connection to the OpenAI Realtime API.
///
/// The socket is split into independent halves pumped by two tasks:
///
/// ```text
///            ┌──────────────┐  writer task   ┌────────────┐
///  bridge ──▶│ outbound rx  │───────────────▶│            │
///            ├──────────────┤                │  Realtime  │
///  bridge ◀──│ inbound tx   │◀───────────────│    API     │
///            └──────────────┘  reader task   └────────────┘
/// ```
///
/// The writer owns the sink and merges two sources: bridge frames and
/// control messages injected by the reader (Pong replies). The bridge only
/// ever sees the channel pair.
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{debug, error, info};
use url::Url;

use crate::peer::PeerConnection;

#[derive(Debug, Clone)]
pub struct ModelPeerConfig {
    pub api_key: String,
    pub model_id: String,
    /// Base endpoint; the model id is appended as a query parameter.
    pub url: String,
    pub connect_timeout: Duration,
    pub channel_capacity: usize,
}

impl ModelPeerConfig {
    pub fn endpoint(&self) -> anyhow::Result<String> {
        let mut url = Url::parse(&self.url)?;
        url.query_pairs_mut().append_pair("model", &self.model_id);
        Ok(url.to_string())
    }
}

/// Open the Realtime WebSocket and return the bridge-facing channel pair.
pub async fn connect(config: &ModelPeerConfig) -> anyhow::Result<PeerConnection> {
    if config.api_key.is_empty() {
        anyhow::bail!("OpenAI API key not set (use --openai-api-key or OPENAI_API_KEY env var)");
    }

    let ws_url = config.endpoint()?;
    let host = Url::parse(&config.url)?
        .host_str()
        .unwrap_or("api.openai.com")
        .to_string();

    let request = tungstenite::http::Request::builder()
        .uri(&ws_url)
        .header("Authorization", format!("Bearer {}", config.api_key))
        .header("OpenAI-Beta", "realtime=v1")
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .body(())?;

    let (ws_stream, response) = tokio::time::timeout(
        config.connect_timeout,
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Realtime API connect timed out"))?
    .map_err(|e| anyhow::anyhow!("Failed to connect to OpenAI Realtime API: {}", e))?;

    info!(
        model = %config.model_id,
        status = %response.status(),
        "OpenAI Realtime WebSocket connected"
    );

    let (mut ws_sink, mut ws_reader) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<String>(config.channel_capacity);
    let (in_tx, in_rx) = mpsc::channel::<String>(config.channel_capacity);
    let (pong_tx, mut pong_rx) = mpsc::channel::<tungstenite::Message>(16);

    // ── Writer task ────────────────────────────────────────────────────
    tokio::spawn(async move {
        debug!("model peer writer task started");
        let mut frames_sent: u64 = 0;
        loop {
            tokio::select! {
                biased;

                Some(msg) = pong_rx.recv() => {
                    if let Err(e) = ws_sink.send(msg).await {
                        error!("WS control send error: {}", e);
                        break;
                    }
                }

                frame = out_rx.recv() => {
                    match frame {
                        Some(text) => {
                            if let Err(e) = ws_sink
                                .send(tungstenite::Message::Text(text))
                                .await
                            {
                                error!("WS send error: {}", e);
                                break;
                            }
                            frames_sent += 1;
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = ws_sink.send(tungstenite::Message::Close(None)).await;
        info!(frames_sent = frames_sent, "model peer writer task exiting");
    });

    // ── Reader task ────────────────────────────────────────────────────
    tokio::spawn(async move {
        debug!("model peer reader task started");
        let mut frames_received: u64 = 0;

        while let Some(msg_result) = ws_reader.next().await {
            let msg = match msg_result {
                Ok(m) => m,
                Err(e) => {
                    error!("WS read error: {}", e);
                    break;
                }
            };

            match msg {
                tungstenite::Message::Text(text) => {
                    frames_received += 1;
                    if in_tx.send(text).await.is_err() {
                        debug!("bridge dropped model inbound channel");
                        break;
                    }
                }
                tungstenite::Message::Ping(data) => {
                    let _ = pong_tx.send(tungstenite::Message::Pong(data)).await;
                }
                tungstenite::Message::Close(frame) => {
                    info!(frame = ?frame, "Realtime WebSocket closed by server");
                    break;
                }
                tungstenite::Message::Binary(data) => {
                    debug!(len = data.len(), "WS binary frame received (unexpected)");
                }
                other => {
                    debug!(msg_type = ?other, "WS unknown frame type");
                }
            }
        }
        // Dropping in_tx surfaces the disconnect to the bridge loop.
        info!(frames_received = frames_received, "model peer reader task exiting");
    });

    Ok(PeerConnection {
        outbound: out_tx,
        inbound: in_rx,
    })
}
