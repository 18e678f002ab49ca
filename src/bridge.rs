/// The per-call bridge: owns both peer connections and the message pump.
///
/// ```text
///  Telephony peer ──(ingress frames)──▶ AudioStreamHandler ──▶ Model peer
///  Model peer ──(audio.delta)──▶ AudioStreamHandler ──▶ Telephony peer
///  Model peer ──(tool-call fragments)──▶ FunctionDispatcher ──▶ Model peer
///  Telephony peer ──(DTMF / hangup)──▶ session / termination
/// ```
///
/// One cooperative pump selects over both peers, the command channel and a
/// housekeeping tick; worker tasks (function handlers, scheduled hang-ups,
/// status listeners) post back through channels. Peer writes are serialized
/// by the one writer task each transport adapter owns.
///
/// The central invariant: at most one active model response. `response.create`
/// is only sent when the guard is free; violations are suppressed and logged,
/// never queued.
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio_stream::{AudioStreamConfig, AudioStreamHandler};
use crate::functions::{DispatcherConfig, FunctionDispatcher, FunctionRegistry};
use crate::local_model::{self, ScriptedResponse};
use crate::model_peer::{self, ModelPeerConfig};
use crate::peer::{BridgeCommand, BridgeHandle, PeerConnection};
use crate::realtime_protocol::{
    AudioTranscription, ClientEvent, ConversationItem, ServerEvent, SessionConfig, TurnDetection,
};
use crate::recorder::{CallMetadata, CallRecorder, Party, RecorderConfig};
use crate::router::{Event, EventRouter};
use crate::session::{CallStatus, SessionState};
use crate::stats::Stats;
use crate::telephony_protocol::{Activity, MediaFormat, TelephonyInbound, TelephonyOutbound};
use crate::vad::{VadConfig, VadEngine};

/// Consecutive audio failures inside one window that close the bridge.
const AUDIO_FAILURE_LIMIT: u32 = 10;
const AUDIO_FAILURE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TurnDetectionConfig {
    /// `server_vad`, `semantic_vad` or `none`.
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    /// Response-creation policy: true hands creation to the model side,
    /// false keeps it with the bridge. Exclusive, never mixed.
    pub create_response: bool,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        TurnDetectionConfig {
            kind: "server_vad".into(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            create_response: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub voice: String,
    pub instructions: String,
    pub temperature: f32,
    pub max_response_output_tokens: Option<u32>,
    /// Transcription model for caller audio, e.g. `whisper-1`.
    pub transcription_model: Option<String>,
    /// Assumed caller format when session.initiate omits one.
    pub default_media_format: MediaFormat,
    /// Playback rate toward telephony (encoding follows the caller's).
    pub output_rate: u32,
    pub turn_detection: TurnDetectionConfig,
    pub vad: VadConfig,
    pub recording: RecorderConfig,
    pub dispatcher: DispatcherConfig,
    /// Session-creation handshake budget (both directions).
    pub handshake_timeout: Duration,
    pub commit_timeout: Duration,
    pub orphan_close_timeout: Duration,
    pub channel_capacity: usize,
    pub tick_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            voice: "ash".into(),
            instructions: String::new(),
            temperature: 0.8,
            max_response_output_tokens: None,
            transcription_model: Some("whisper-1".into()),
            default_media_format: MediaFormat::pcm16_16k(),
            output_rate: 16_000,
            turn_detection: TurnDetectionConfig::default(),
            vad: VadConfig::default(),
            recording: RecorderConfig::default(),
            dispatcher: DispatcherConfig::default(),
            handshake_timeout: Duration::from_secs(15),
            commit_timeout: Duration::from_millis(2_000),
            orphan_close_timeout: Duration::from_millis(500),
            channel_capacity: 512,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl BridgeConfig {
    fn auto_response(&self) -> bool {
        self.turn_detection.kind != "none" && self.turn_detection.create_response
    }

    fn session_config(&self, registry: &FunctionRegistry) -> SessionConfig {
        let turn_detection = if self.turn_detection.kind == "none" {
            None
        } else {
            Some(TurnDetection {
                kind: self.turn_detection.kind.clone(),
                threshold: self.turn_detection.threshold,
                prefix_padding_ms: self.turn_detection.prefix_padding_ms,
                silence_duration_ms: self.turn_detection.silence_duration_ms,
                create_response: self.turn_detection.create_response,
            })
        };

        SessionConfig {
            modalities: vec!["audio".into(), "text".into()],
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
            input_audio_format: "pcm16".into(),
            output_audio_format: "pcm16".into(),
            input_audio_transcription: self
                .transcription_model
                .as_ref()
                .map(|model| AudioTranscription {
                    model: model.clone(),
                }),
            turn_detection,
            tools: registry.schemas().to_vec(),
            tool_choice: "auto".into(),
            temperature: self.temperature,
            max_response_output_tokens: self.max_response_output_tokens,
        }
    }
}

/// How the bridge reaches its model peer.
pub enum ModelConnector {
    /// Real OpenAI Realtime WebSocket.
    Realtime(ModelPeerConfig),
    /// In-process substitute with a scripted conversation.
    Local(Vec<ScriptedResponse>),
    /// Pre-wired channel pair (tests).
    Preconnected(PeerConnection),
}

/// Cleanup callbacks run LIFO at close.
pub type CleanupFn = Box<dyn FnOnce() + Send>;

/// Run one call to completion. Returns after the bridge reaches Closed (or
/// negotiation failed). The error carries the first fatal fault; orderly
/// hangups return Ok.
pub async fn run_bridge(
    config: BridgeConfig,
    registry: Arc<FunctionRegistry>,
    telephony: PeerConnection,
    connector: ModelConnector,
    stats: Arc<Stats>,
    cleanup: Vec<CleanupFn>,
) -> anyhow::Result<()> {
    stats.record_bridge_opened();
    let mut bridge = match Bridge::negotiate(config, registry, telephony, connector, stats).await {
        Ok(b) => b,
        Err(e) => {
            run_cleanup(cleanup);
            return Err(e);
        }
    };
    let outcome = bridge.pump().await;
    bridge.shutdown(outcome.0, outcome.1, cleanup).await;
    Ok(())
}

struct Bridge {
    config: BridgeConfig,
    session: Arc<SessionState>,
    handle: BridgeHandle,
    router: EventRouter,
    audio: AudioStreamHandler,
    dispatcher: Arc<FunctionDispatcher>,
    recorder: Option<Arc<CallRecorder>>,
    telephony_in: mpsc::Receiver<String>,
    model_in: mpsc::Receiver<String>,
    commands: mpsc::Receiver<BridgeCommand>,
    cancel: CancellationToken,
    stats: Arc<Stats>,
    caller: Option<String>,
    bot_name: Option<String>,
    audio_failures: u32,
    audio_failure_window: Instant,
}

impl Bridge {
    /// Initializing → Active: validate the initiate, accept, bring up the
    /// model peer, configure the session, wait for `session.created`.
    async fn negotiate(
        config: BridgeConfig,
        registry: Arc<FunctionRegistry>,
        mut telephony: PeerConnection,
        connector: ModelConnector,
        stats: Arc<Stats>,
    ) -> anyhow::Result<Self> {
        // ── First telephony frame must be session.initiate ────────────
        let first = tokio::time::timeout(config.handshake_timeout, telephony.inbound.recv())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for session.initiate"))?
            .ok_or_else(|| anyhow::anyhow!("telephony peer closed before session.initiate"))?;

        let (call_id, bot_name, caller, media_format) =
            match serde_json::from_str::<TelephonyInbound>(&first) {
                Ok(TelephonyInbound::SessionInitiate {
                    call_id,
                    bot_name,
                    caller,
                    media_format,
                }) => (
                    call_id,
                    bot_name,
                    caller,
                    media_format.unwrap_or_else(|| config.default_media_format.clone()),
                ),
                Ok(other) => {
                    anyhow::bail!("expected session.initiate, got {}", other.event_type())
                }
                Err(e) => anyhow::bail!("unparseable session.initiate: {e}"),
            };

        if !media_format.is_supported() {
            send_raw(
                &telephony.outbound,
                &TelephonyOutbound::SessionEnd {
                    reason_code: "unsupported_media".into(),
                    reason: format!(
                        "unsupported media format: {:?} @ {} Hz",
                        media_format.encoding, media_format.rate
                    ),
                },
            )
            .await;
            anyhow::bail!("unsupported media format on call {call_id}");
        }

        info!(
            call_id = %call_id,
            caller = caller.as_deref().unwrap_or("unknown"),
            rate = media_format.rate,
            "📞 session.initiate accepted"
        );

        send_raw(
            &telephony.outbound,
            &TelephonyOutbound::SessionAccepted {
                media_format: media_format.clone(),
            },
        )
        .await;

        let session = SessionState::new(&call_id, media_format.clone());
        let recorder = if config.recording.enabled {
            Some(Arc::new(CallRecorder::new(&config.recording, &call_id)))
        } else {
            None
        };
        if let Some(rec) = &recorder {
            rec.log_event(
                "session.initiate",
                json!({"callId": &call_id, "caller": &caller, "mediaFormat": &media_format}),
            );
        }

        // ── Bring up the model peer ───────────────────────────────────
        let model = match connector {
            ModelConnector::Realtime(peer_config) => match model_peer::connect(&peer_config).await
            {
                Ok(conn) => conn,
                Err(e) => {
                    send_raw(
                        &telephony.outbound,
                        &TelephonyOutbound::SessionEnd {
                            reason_code: "model_unavailable".into(),
                            reason: e.to_string(),
                        },
                    )
                    .await;
                    let _ = session.transition(CallStatus::Closed);
                    return Err(e);
                }
            },
            ModelConnector::Local(script) => local_model::spawn(script, config.channel_capacity),
            ModelConnector::Preconnected(conn) => conn,
        };

        let PeerConnection {
            outbound: to_model,
            inbound: mut model_in,
        } = model;

        let cancel = CancellationToken::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let handle = BridgeHandle::new(
            session.clone(),
            to_model,
            telephony.outbound.clone(),
            cmd_tx,
            cancel.clone(),
            stats.clone(),
            config.auto_response(),
        );

        // ── Configure the model session and wait for session.created ──
        if let Err(e) = handle
            .send_to_model(&ClientEvent::SessionUpdate {
                session: config.session_config(&registry),
            })
            .await
        {
            return Self::fail_handshake(&telephony.outbound, &session, e).await;
        }

        let handshake = tokio::time::timeout(config.handshake_timeout, async {
            while let Some(frame) = model_in.recv().await {
                match serde_json::from_str::<ServerEvent>(&frame) {
                    Ok(ServerEvent::SessionCreated { session: info }) => {
                        return Ok(info);
                    }
                    Ok(ServerEvent::Error { error }) if error.is_fatal() => {
                        anyhow::bail!("model session failed: {}", error.message);
                    }
                    Ok(other) => {
                        debug!(event_type = other.event_type(), "pre-session event ignored")
                    }
                    Err(e) => warn!(error = %e, "unparseable pre-session event"),
                }
            }
            anyhow::bail!("model peer closed during handshake")
        })
        .await;

        let created = match handshake {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                return Self::fail_handshake(&telephony.outbound, &session, e).await;
            }
            Err(_) => {
                return Self::fail_handshake(
                    &telephony.outbound,
                    &session,
                    anyhow::anyhow!("session.created handshake timed out"),
                )
                .await;
            }
        };

        if let Some(id) = &created.id {
            session.set_peer_session_id(id);
        }
        session.transition(CallStatus::Active)?;
        info!(
            call_id = %call_id,
            peer_session = created.id.as_deref().unwrap_or("?"),
            "✅ bridge active"
        );

        // ── Assemble the per-call components ──────────────────────────
        let mut stream_config = AudioStreamConfig::new(media_format);
        stream_config.playback_format = MediaFormat {
            encoding: stream_config.telephony_format.encoding,
            // µ-law trunks only play 8 kHz.
            rate: match stream_config.telephony_format.encoding {
                crate::telephony_protocol::AudioEncoding::Mulaw => 8_000,
                crate::telephony_protocol::AudioEncoding::Pcm16 => config.output_rate,
            },
            channels: 1,
        };
        stream_config.commit_timeout = config.commit_timeout;
        stream_config.orphan_close_timeout = config.orphan_close_timeout;
        let audio = AudioStreamHandler::new(
            stream_config,
            VadEngine::new(config.vad.clone()),
            recorder.clone(),
        );

        let dispatcher =
            FunctionDispatcher::new(registry, config.dispatcher.clone(), recorder.clone());

        let router = build_router(recorder.clone());

        Ok(Bridge {
            config,
            session,
            handle,
            router,
            audio,
            dispatcher,
            recorder,
            telephony_in: telephony.inbound,
            model_in,
            commands: cmd_rx,
            cancel,
            stats,
            caller,
            bot_name,
            audio_failures: 0,
            audio_failure_window: Instant::now(),
        })
    }

    /// A failed model handshake surfaces to telephony and goes straight to
    /// Closed.
    async fn fail_handshake(
        telephony_out: &mpsc::Sender<String>,
        session: &Arc<SessionState>,
        error: anyhow::Error,
    ) -> anyhow::Result<Self> {
        send_raw(
            telephony_out,
            &TelephonyOutbound::SessionEnd {
                reason_code: "model_unavailable".into(),
                reason: error.to_string(),
            },
        )
        .await;
        let _ = session.transition(CallStatus::Closed);
        Err(error)
    }

    /// The main pump. Returns the termination reason.
    async fn pump(&mut self) -> (String, String) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    return ("cancelled".into(), "bridge cancelled".into());
                }

                Some(cmd) = self.commands.recv() => {
                    match cmd {
                        BridgeCommand::Hangup { reason_code, reason } => {
                            return (reason_code, reason);
                        }
                    }
                }

                frame = self.telephony_in.recv() => {
                    match frame {
                        None => {
                            warn!("telephony peer disconnected");
                            return ("transport_error".into(), "telephony peer disconnected".into());
                        }
                        Some(text) => {
                            match self.on_telephony_frame(&text).await {
                                Ok(Some(end)) => return end,
                                Ok(None) => {}
                                Err(e) => {
                                    error!(error = %e, "fatal error on telephony frame");
                                    return ("transport_error".into(), e.to_string());
                                }
                            }
                        }
                    }
                }

                frame = self.model_in.recv() => {
                    match frame {
                        None => {
                            warn!("model peer disconnected");
                            return ("transport_error".into(), "model peer disconnected".into());
                        }
                        Some(text) => {
                            match self.on_model_frame(&text).await {
                                Ok(Some(end)) => return end,
                                Ok(None) => {}
                                Err(e) => {
                                    error!(error = %e, "fatal error on model frame");
                                    return ("transport_error".into(), e.to_string());
                                }
                            }
                        }
                    }
                }

                _ = tick.tick() => {
                    if let Err(e) = self.audio.tick(&self.handle).await {
                        if !e.is_audio_kind() {
                            return ("transport_error".into(), e.to_string());
                        }
                    }
                }
            }
        }
    }

    /// Handle one telephony frame. `Ok(Some(_))` ends the call.
    async fn on_telephony_frame(
        &mut self,
        text: &str,
    ) -> anyhow::Result<Option<(String, String)>> {
        let event = match serde_json::from_str::<TelephonyInbound>(text) {
            Ok(e) => e,
            Err(e) => {
                // Protocol errors drop the message and continue.
                self.stats.record_parse_error();
                warn!(error = %e, "malformed telephony event dropped");
                return Ok(None);
            }
        };
        self.session.touch();

        match event {
            TelephonyInbound::SessionInitiate { .. } => {
                warn!("duplicate session.initiate ignored");
            }

            TelephonyInbound::UserStreamStart => {
                self.audio.reset_vad();
                self.handle
                    .send_to_telephony(&TelephonyOutbound::UserStreamStarted)
                    .await?;
                self.route("userStream.start", json!({}));
            }

            TelephonyInbound::UserStreamChunk { audio } => {
                match self.audio.on_ingress_chunk(&self.handle, &audio).await {
                    Ok(outcome) => {
                        self.audio_failures = 0;
                        if outcome.barge_in {
                            // The egress stream is already closed; confirm
                            // the cancellation with the model.
                            self.handle.cancel_response().await?;
                            self.route("barge_in", json!({}));
                        }
                    }
                    Err(e) if e.is_audio_kind() => {
                        if self.note_audio_failure() {
                            return Ok(Some((
                                "audio_error".into(),
                                "repeated audio decode failures".into(),
                            )));
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            TelephonyInbound::UserStreamStop => {
                self.handle
                    .send_to_telephony(&TelephonyOutbound::UserStreamStopped)
                    .await?;
                self.audio.on_stream_stop(&self.handle).await?;
                self.route("userStream.stop", json!({}));
            }

            TelephonyInbound::Activities { activities } => {
                for activity in activities {
                    if activity.is_dtmf() {
                        let key = activity.value.as_deref().unwrap_or("");
                        info!(key = key, "☎️ DTMF received");
                        self.handle
                            .send_to_model(&ClientEvent::ConversationItemCreate {
                                item: ConversationItem::user_text(format!(
                                    "User pressed DTMF key: {key}"
                                )),
                            })
                            .await?;
                        self.route("dtmf", json!({"key": key}));
                    } else {
                        debug!(kind = %activity.kind, "non-DTMF activity ignored");
                    }
                }
            }

            TelephonyInbound::SessionEnd { reason } => {
                let reason = reason.unwrap_or_else(|| "caller hung up".into());
                self.route("session.end", json!({"reason": &reason}));
                return Ok(Some(("normal".into(), reason)));
            }
        }
        Ok(None)
    }

    /// Handle one model frame. `Ok(Some(_))` ends the call.
    async fn on_model_frame(&mut self, text: &str) -> anyhow::Result<Option<(String, String)>> {
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(e) => e,
            Err(e) => {
                self.stats.record_parse_error();
                warn!(error = %e, "malformed model event dropped");
                return Ok(None);
            }
        };
        self.session.touch();

        match event {
            ServerEvent::SessionCreated { session } => {
                if let Some(id) = session.id {
                    self.session.set_peer_session_id(id);
                }
            }

            ServerEvent::SessionUpdated { .. } => {
                debug!("model session config confirmed");
            }

            ServerEvent::InputAudioBufferCommitted { item_id } => {
                debug!(item_id = item_id.as_deref().unwrap_or("?"), "input buffer committed");
            }

            ServerEvent::SpeechStarted => {
                self.route("input_audio_buffer.speech_started", json!({}));
            }
            ServerEvent::SpeechStopped => {
                self.route("input_audio_buffer.speech_stopped", json!({}));
            }

            ServerEvent::ResponseCreated { response } => {
                self.session.mark_response_created();
                self.route(
                    "response.created",
                    json!({"responseId": response.id}),
                );
            }

            ServerEvent::ResponseAudioDelta { response_id, delta } => {
                match self
                    .audio
                    .on_audio_delta(&self.handle, response_id.as_deref(), &delta)
                    .await
                {
                    Ok(()) => self.audio_failures = 0,
                    Err(e) if e.is_audio_kind() => {
                        if self.note_audio_failure() {
                            return Ok(Some((
                                "audio_error".into(),
                                "repeated audio decode failures".into(),
                            )));
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            ServerEvent::ResponseAudioDone { response_id } => {
                self.audio
                    .on_audio_done(&self.handle, response_id.as_deref())
                    .await?;
            }

            ServerEvent::ResponseAudioTranscriptDelta { delta } => {
                debug!(delta = %delta, "bot transcript delta");
            }

            ServerEvent::ResponseAudioTranscriptDone { transcript } => {
                info!(transcript = %transcript, "🤖 bot said");
                if let Some(rec) = &self.recorder {
                    rec.log_transcript(Party::Bot, &transcript);
                }
                self.handle
                    .send_to_telephony(&TelephonyOutbound::Activities {
                        activities: vec![Activity {
                            kind: "transcript".into(),
                            value: Some(transcript),
                        }],
                    })
                    .await?;
            }

            ServerEvent::InputTranscriptionCompleted { transcript } => {
                info!(transcript = %transcript, "🗣️ caller said");
                if let Some(rec) = &self.recorder {
                    rec.log_transcript(Party::Caller, &transcript);
                }
            }

            ServerEvent::FunctionCallArgumentsDelta {
                call_id,
                name,
                delta,
            } => {
                self.dispatcher
                    .on_arguments_delta(&call_id, name.as_deref(), &delta);
            }

            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
                output_item_id,
            } => {
                self.dispatcher.on_arguments_done(
                    self.handle.clone(),
                    &call_id,
                    name.as_deref(),
                    &arguments,
                    output_item_id.as_deref(),
                );
            }

            ServerEvent::ResponseDone { response } => {
                self.session.mark_response_done();
                self.audio.close_egress(&self.handle).await?;
                self.route(
                    "response.done",
                    json!({"responseId": response.id, "status": response.status}),
                );
            }

            ServerEvent::ResponseCancelled { response } => {
                // Cancellation confirmed: release the guard and silence the
                // egress immediately.
                self.session.mark_response_done();
                self.audio.close_egress(&self.handle).await?;
                self.route(
                    "response.cancelled",
                    json!({"responseId": response.id}),
                );
            }

            ServerEvent::Error { error } => {
                error!(
                    code = error.code.as_deref().unwrap_or("unknown"),
                    error_type = error.kind.as_deref().unwrap_or("unknown"),
                    message = %error.message,
                    "❌ model error"
                );
                self.route("error", json!({"message": &error.message}));
                if error.is_fatal() {
                    return Ok(Some(("error".into(), error.message)));
                }
            }

            ServerEvent::Unknown => {
                debug!(raw = %truncate(text, 200), "unhandled model event");
            }
        }
        Ok(None)
    }

    /// Audio-kind failure accounting: drop the frame, close the bridge
    /// after `AUDIO_FAILURE_LIMIT` consecutive failures within the window.
    fn note_audio_failure(&mut self) -> bool {
        if self.audio_failure_window.elapsed() > AUDIO_FAILURE_WINDOW {
            self.audio_failures = 0;
            self.audio_failure_window = Instant::now();
        }
        self.audio_failures += 1;
        warn!(
            consecutive = self.audio_failures,
            "audio frame dropped after decode failure"
        );
        self.audio_failures >= AUDIO_FAILURE_LIMIT
    }

    fn route(&self, name: &str, payload: Value) {
        let _ = self.router.dispatch(Event::new(name, payload));
    }

    /// Closing → Closed: notify telephony, close the model peer, finalize
    /// recording, run cleanup callbacks LIFO. Idempotent.
    async fn shutdown(&mut self, reason_code: String, reason: String, cleanup: Vec<CleanupFn>) {
        if self.session.status() == CallStatus::Closed {
            run_cleanup(cleanup);
            return;
        }
        let _ = self.session.transition(CallStatus::Closing);
        info!(reason_code = %reason_code, reason = %reason, "📴 bridge closing");

        // 1. Tell telephony why the call is over.
        let _ = self
            .handle
            .send_to_telephony(&TelephonyOutbound::SessionEnd {
                reason_code: reason_code.clone(),
                reason: reason.clone(),
            })
            .await;

        // 2. Stop the pumps and worker tasks; writer tasks close their
        //    sockets once every sender is gone.
        self.cancel.cancel();

        // 3. Persist recording artifacts.
        if let Some(rec) = &self.recorder {
            let snapshot = self.session.snapshot();
            let metadata = CallMetadata {
                call_id: snapshot.call_id,
                caller: self.caller.clone(),
                bot_name: self.bot_name.clone(),
                media_format: snapshot.media_format,
                created_at: snapshot.created_at,
                ended_at: Utc::now(),
                end_reason_code: reason_code,
                end_reason: reason,
                caller_audio_ms: 0,
                bot_audio_ms: 0,
                event_count: 0,
                transcript_entries: 0,
            };
            if let Err(e) = rec.finalize(metadata).await {
                warn!(error = %e, "recording finalization failed");
            }
        }

        // 4. Cleanup callbacks, LIFO.
        run_cleanup(cleanup);

        // 5. Terminal state.
        let _ = self.session.transition(CallStatus::Closed);
        self.stats.record_bridge_closed();
        info!("☑️ bridge closed");
    }
}

fn run_cleanup(mut cleanup: Vec<CleanupFn>) {
    while let Some(cb) = cleanup.pop() {
        cb();
    }
}

/// Observational routes: lifecycle events land in the recorder's event log.
fn build_router(recorder: Option<Arc<CallRecorder>>) -> EventRouter {
    let mut router = EventRouter::new();
    if let Some(rec) = recorder {
        for kind in [
            "userStream.start",
            "userStream.stop",
            "dtmf",
            "barge_in",
            "session.end",
            "input_audio_buffer.speech_started",
            "input_audio_buffer.speech_stopped",
            "response.created",
            "response.done",
            "response.cancelled",
            "error",
        ] {
            let rec = rec.clone();
            router.register(
                kind,
                0,
                Arc::new(move |ev: &Event| {
                    rec.log_event(&ev.name, ev.payload.clone());
                    Ok(())
                }),
            );
        }
    }
    router
}

async fn send_raw(outbound: &mpsc::Sender<String>, event: &TelephonyOutbound) {
    if let Ok(text) = serde_json::to_string(event) {
        let _ = outbound.send(text).await;
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests (negotiation paths; full call flows live in tests/)
// ═══════════════════════════════════════════════════════════════════════
