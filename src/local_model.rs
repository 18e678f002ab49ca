/// In-process substitute for the Realtime model peer.
///
/// Presents the same event vocabulary over the same channel-pair interface
/// as the real WebSocket peer, so a bridge can run without network access:
/// `session.update` / `input_audio_buffer.*` / `response.create` /
/// `response.cancel` / `conversation.item.create` in,
/// `session.created` / `input_audio_buffer.committed` / `response.*` out,
/// with the same ordering guarantees.
///
/// Each `response.create` plays the next scripted response: audio is
/// streamed as silence deltas at the model egress rate so cancellation can
/// land mid-stream, exactly like a real barge-in.
use std::collections::VecDeque;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::audio_stream::MODEL_EGRESS_RATE;
use crate::peer::PeerConnection;

/// Milliseconds of audio per emitted delta.
const DELTA_MS: u64 = 40;
/// Pacing between deltas (faster than real time to keep tests quick).
const DELTA_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Default)]
pub struct ScriptedFunctionCall {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// One model turn: optional transcript + audio, or a tool call.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    pub transcript: Option<String>,
    pub audio_ms: u64,
    pub function_call: Option<ScriptedFunctionCall>,
}

impl ScriptedResponse {
    pub fn speech(transcript: &str, audio_ms: u64) -> Self {
        ScriptedResponse {
            transcript: Some(transcript.to_string()),
            audio_ms,
            ..Default::default()
        }
    }

    pub fn tool_call(call_id: &str, name: &str, arguments: &str) -> Self {
        ScriptedResponse {
            function_call: Some(ScriptedFunctionCall {
                call_id: call_id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }),
            ..Default::default()
        }
    }
}

struct Emitting {
    response_id: String,
    deltas: VecDeque<String>,
    transcript: Option<String>,
}

/// Spawn the substitute and return the bridge-facing channel pair.
pub fn spawn(script: Vec<ScriptedResponse>, capacity: usize) -> PeerConnection {
    let (out_tx, out_rx) = mpsc::channel::<String>(capacity);
    let (in_tx, in_rx) = mpsc::channel::<String>(capacity);

    tokio::spawn(run(out_rx, in_tx, script.into()));

    PeerConnection {
        outbound: out_tx,
        inbound: in_rx,
    }
}

async fn run(
    mut incoming: mpsc::Receiver<String>,
    outgoing: mpsc::Sender<String>,
    mut script: VecDeque<ScriptedResponse>,
) {
    info!(responses = script.len(), "🧪 local model substitute started");
    let mut session_created = false;
    let mut response_counter: u64 = 0;
    let mut emitting: Option<Emitting> = None;

    loop {
        if emitting.is_some() {
            tokio::select! {
                biased;

                frame = incoming.recv() => {
                    let Some(frame) = frame else { break };
                    if !handle_event(
                        &frame,
                        &outgoing,
                        &mut session_created,
                        &mut response_counter,
                        &mut script,
                        &mut emitting,
                    )
                    .await
                    {
                        break;
                    }
                }

                _ = tokio::time::sleep(DELTA_INTERVAL) => {
                    let em = emitting.as_mut().expect("emitting checked above");
                    if let Some(delta) = em.deltas.pop_front() {
                        if !send(&outgoing, json!({
                            "type": "response.audio.delta",
                            "response_id": &em.response_id,
                            "delta": delta,
                        })).await {
                            break;
                        }
                    } else {
                        let em = emitting.take().expect("emitting checked above");
                        if !finish_response(&outgoing, &em).await {
                            break;
                        }
                    }
                }
            }
        } else {
            let Some(frame) = incoming.recv().await else { break };
            if !handle_event(
                &frame,
                &outgoing,
                &mut session_created,
                &mut response_counter,
                &mut script,
                &mut emitting,
            )
            .await
            {
                break;
            }
        }
    }
    info!("local model substitute exiting");
}

/// Returns false when the bridge side is gone.
async fn handle_event(
    frame: &str,
    outgoing: &mpsc::Sender<String>,
    session_created: &mut bool,
    response_counter: &mut u64,
    script: &mut VecDeque<ScriptedResponse>,
    emitting: &mut Option<Emitting>,
) -> bool {
    let event: Value = match serde_json::from_str(frame) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "local model: unparseable client event");
            return true;
        }
    };

    match event["type"].as_str().unwrap_or("") {
        "session.update" => {
            if *session_created {
                send(outgoing, json!({"type": "session.updated", "session": {}})).await
            } else {
                *session_created = true;
                send(
                    outgoing,
                    json!({
                        "type": "session.created",
                        "session": {"id": "local_session_1", "model": "local-substitute"},
                    }),
                )
                .await
            }
        }

        "input_audio_buffer.append" | "input_audio_buffer.clear" => true,

        "input_audio_buffer.commit" => {
            send(
                outgoing,
                json!({"type": "input_audio_buffer.committed", "item_id": "item_local"}),
            )
            .await
        }

        "conversation.item.create" => {
            debug!(
                item_type = event["item"]["type"].as_str().unwrap_or("?"),
                "local model: conversation item recorded"
            );
            true
        }

        "response.create" => {
            *response_counter += 1;
            let response_id = format!("local_resp_{response_counter}");
            if !send(
                outgoing,
                json!({"type": "response.created", "response": {"id": &response_id, "status": "in_progress"}}),
            )
            .await
            {
                return false;
            }

            let scripted = script.pop_front().unwrap_or_default();

            if let Some(call) = scripted.function_call {
                // Tool calls stream their arguments, then finish the turn.
                let (head, tail) = call
                    .arguments
                    .split_at(call.arguments.len() / 2);
                for (i, piece) in [head, tail].iter().enumerate() {
                    if !send(
                        outgoing,
                        json!({
                            "type": "response.function_call_arguments.delta",
                            "call_id": &call.call_id,
                            "name": if i == 0 { Some(&call.name) } else { None },
                            "delta": piece,
                        }),
                    )
                    .await
                    {
                        return false;
                    }
                }
                if !send(
                    outgoing,
                    json!({
                        "type": "response.function_call_arguments.done",
                        "call_id": &call.call_id,
                        "name": &call.name,
                        "arguments": "",
                        "output_item_id": format!("item_{}", call.call_id),
                    }),
                )
                .await
                {
                    return false;
                }
                return send(
                    outgoing,
                    json!({"type": "response.done", "response": {"id": response_id, "status": "completed"}}),
                )
                .await;
            }

            // Speech turn: queue silence deltas, emitted on the pacing timer.
            let delta_bytes = (MODEL_EGRESS_RATE as u64 * DELTA_MS / 1000) as usize * 2;
            let n_deltas = scripted.audio_ms.div_ceil(DELTA_MS);
            let silence = BASE64.encode(vec![0u8; delta_bytes]);
            *emitting = Some(Emitting {
                response_id,
                deltas: (0..n_deltas).map(|_| silence.clone()).collect(),
                transcript: scripted.transcript,
            });
            true
        }

        "response.cancel" => {
            if let Some(em) = emitting.take() {
                send(
                    outgoing,
                    json!({
                        "type": "response.cancelled",
                        "response": {"id": &em.response_id, "status": "cancelled"},
                    }),
                )
                .await
            } else {
                debug!("local model: cancel with no active response");
                true
            }
        }

        other => {
            debug!(event_type = other, "local model: unhandled client event");
            true
        }
    }
}

async fn finish_response(outgoing: &mpsc::Sender<String>, em: &Emitting) -> bool {
    if let Some(transcript) = &em.transcript {
        if !send(
            outgoing,
            json!({"type": "response.audio_transcript.done", "transcript": transcript}),
        )
        .await
        {
            return false;
        }
    }
    if !send(
        outgoing,
        json!({"type": "response.audio.done", "response_id": &em.response_id}),
    )
    .await
    {
        return false;
    }
    send(
        outgoing,
        json!({"type": "response.done", "response": {"id": &em.response_id, "status": "completed"}}),
    )
    .await
}

async fn send(outgoing: &mpsc::Sender<String>, event: Value) -> bool {
    outgoing.send(event.to_string()).await.is_ok()
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
