/// Audio stream handling: ingress buffering + commit cadence, egress
/// playback framing.
///
/// ```text
///  telephony ──chunk──▶ decode ─▶ resample 16k ─┬─▶ VAD ─▶ commit cadence
///                                               ├─▶ recorder (caller)
///                                               └─▶ input_audio_buffer.append
///
///  model ──audio.delta──▶ decode 24k ─┬─▶ recorder (bot, 16k)
///                                     └─▶ resample + frame ─▶ playStream.chunk
/// ```
///
/// Ingress appends are flush-through; a commit is emitted exactly once per
/// speech segment, triggered by VAD Stopped, an explicit stream stop, or the
/// inactivity timeout. Egress opens one play stream per response and drops
/// from the head of a bounded queue (~200 ms) when telephony cannot keep up.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::{self, AudioError};
use crate::peer::BridgeHandle;
use crate::realtime_protocol::ClientEvent;
use crate::recorder::{CallRecorder, Party};
use crate::telephony_protocol::{AudioEncoding, MediaFormat, TelephonyOutbound};
use crate::vad::{VadEngine, VadState};

/// Model-side rates are fixed by the Realtime API.
pub const MODEL_INGEST_RATE: u32 = 16_000;
pub const MODEL_EGRESS_RATE: u32 = 24_000;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("peer channel closed")]
    PeerClosed,
}

impl StreamError {
    /// Audio-kind failures drop the frame and continue; transport failures
    /// are fatal to the bridge.
    pub fn is_audio_kind(&self) -> bool {
        !matches!(self, StreamError::PeerClosed)
    }
}

#[derive(Debug, Clone)]
pub struct AudioStreamConfig {
    /// Caller-side format negotiated at session.initiate.
    pub telephony_format: MediaFormat,
    /// Playback format toward telephony (same encoding, possibly a
    /// different configured rate).
    pub playback_format: MediaFormat,
    /// Inactivity window that forces a commit after at least one append.
    pub commit_timeout: Duration,
    /// Close an egress stream this long after its last delta when no
    /// response is active (orphaned delta).
    pub orphan_close_timeout: Duration,
    /// Egress playback frame duration.
    pub frame_ms: u32,
    /// Bounded egress queue depth, in milliseconds of audio.
    pub egress_queue_ms: u64,
}

impl AudioStreamConfig {
    pub fn new(telephony_format: MediaFormat) -> Self {
        AudioStreamConfig {
            playback_format: telephony_format.clone(),
            telephony_format,
            commit_timeout: Duration::from_millis(2_000),
            orphan_close_timeout: Duration::from_millis(500),
            frame_ms: 20,
            egress_queue_ms: 200,
        }
    }

    fn egress_queue_frames(&self) -> usize {
        (self.egress_queue_ms / self.frame_ms as u64).max(1) as usize
    }

    /// Fill level where latency starts winning over audio integrity.
    fn egress_watermark_frames(&self) -> usize {
        (self.egress_queue_frames() / 2).max(1)
    }
}

/// What the bridge must react to after an ingress chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct IngressOutcome {
    /// Speech onset while a play stream was open: the bridge should cancel
    /// the active response (the egress stream is already closed here).
    pub barge_in: bool,
    /// A commit (and response request) happened on this chunk.
    pub committed: bool,
}

struct IngressState {
    vad: VadEngine,
    vad_buf: Vec<f32>,
    appended_since_commit: bool,
    segment_started: Option<Instant>,
    last_speech: Option<Instant>,
}

struct EgressState {
    stream_id: Option<String>,
    response_id: Option<String>,
    /// Deltas for this response id are silently discarded (barge-in).
    cancelled_response_id: Option<String>,
    /// Telephony-format frames awaiting a transport slot.
    queue: VecDeque<Bytes>,
    /// Resampled bytes not yet a whole frame.
    pending: Vec<u8>,
    last_delta: Option<Instant>,
}

pub struct AudioStreamHandler {
    config: AudioStreamConfig,
    recorder: Option<Arc<CallRecorder>>,
    ingress: IngressState,
    egress: EgressState,
}

impl AudioStreamHandler {
    pub fn new(
        config: AudioStreamConfig,
        vad: VadEngine,
        recorder: Option<Arc<CallRecorder>>,
    ) -> Self {
        AudioStreamHandler {
            config,
            recorder,
            ingress: IngressState {
                vad,
                vad_buf: Vec::new(),
                appended_since_commit: false,
                segment_started: None,
                last_speech: None,
            },
            egress: EgressState {
                stream_id: None,
                response_id: None,
                cancelled_response_id: None,
                queue: VecDeque::new(),
                pending: Vec::new(),
                last_delta: None,
            },
        }
    }

    pub fn egress_open(&self) -> bool {
        self.egress.stream_id.is_some()
    }

    /// New user stream: VAD starts from a clean slate.
    pub fn reset_vad(&mut self) {
        self.ingress.vad.reset();
        self.ingress.vad_buf.clear();
        self.ingress.segment_started = None;
        self.ingress.last_speech = None;
    }

    // ══════════════════════════════════════════════════════════════════
    //  Ingress: telephony → model
    // ══════════════════════════════════════════════════════════════════

    pub async fn on_ingress_chunk(
        &mut self,
        handle: &BridgeHandle,
        audio_b64: &str,
    ) -> Result<IngressOutcome, StreamError> {
        let raw = BASE64.decode(audio_b64)?;
        handle.stats().record_frame_in(raw.len());

        let pcm_native = match self.config.telephony_format.encoding {
            AudioEncoding::Mulaw => audio::mulaw_to_pcm16(&raw),
            AudioEncoding::Pcm16 => raw,
        };
        let pcm_16k = audio::resample(
            &pcm_native,
            self.config.telephony_format.rate,
            MODEL_INGEST_RATE,
        )?;

        // Recording and VAD are independent side paths; neither may stop
        // the append.
        if let Some(rec) = &self.recorder {
            rec.append_audio(Party::Caller, &pcm_16k);
        }
        let vad = self.feed_vad(&pcm_16k);

        handle
            .send_to_model(&ClientEvent::InputAudioBufferAppend {
                audio: BASE64.encode(&pcm_16k),
            })
            .await
            .map_err(|_| StreamError::PeerClosed)?;

        let now = Instant::now();
        self.ingress.appended_since_commit = true;
        if self.ingress.segment_started.is_none() {
            self.ingress.segment_started = Some(now);
        }
        if vad.any_speech {
            self.ingress.last_speech = Some(now);
        }

        let mut outcome = IngressOutcome::default();

        if vad.started && self.egress_open() {
            info!("🎤 barge-in: speech onset during playback");
            self.egress.cancelled_response_id = self.egress.response_id.clone();
            self.close_egress(handle).await?;
            outcome.barge_in = true;
        }

        if vad.stopped {
            outcome.committed = self.commit(handle).await?;
        }

        Ok(outcome)
    }

    /// Explicit stream stop from telephony: commit whatever is buffered.
    pub async fn on_stream_stop(&mut self, handle: &BridgeHandle) -> Result<bool, StreamError> {
        self.commit(handle).await
    }

    /// Periodic housekeeping: inactivity commit, orphaned-stream close,
    /// egress queue drain.
    pub async fn tick(&mut self, handle: &BridgeHandle) -> Result<(), StreamError> {
        if self.ingress.appended_since_commit {
            let anchor = self
                .ingress
                .last_speech
                .or(self.ingress.segment_started)
                .unwrap_or_else(Instant::now);
            if anchor.elapsed() >= self.config.commit_timeout {
                debug!("ingress inactivity timeout — committing");
                self.commit(handle).await?;
            }
        }

        if self.egress_open() && !handle.session().response_active() {
            if let Some(last) = self.egress.last_delta {
                if last.elapsed() >= self.config.orphan_close_timeout {
                    warn!("closing orphaned egress stream");
                    self.close_egress(handle).await?;
                }
            }
        }

        self.drain_egress(handle)?;
        Ok(())
    }

    /// Emit `input_audio_buffer.commit` (at most once per segment) and
    /// request a response.
    async fn commit(&mut self, handle: &BridgeHandle) -> Result<bool, StreamError> {
        if !self.ingress.appended_since_commit {
            return Ok(false);
        }
        self.ingress.appended_since_commit = false;
        self.ingress.segment_started = None;
        self.ingress.last_speech = None;

        handle
            .send_to_model(&ClientEvent::InputAudioBufferCommit)
            .await
            .map_err(|_| StreamError::PeerClosed)?;
        info!("📝 input audio buffer committed");

        handle
            .request_response()
            .await
            .map_err(|_| StreamError::PeerClosed)?;
        Ok(true)
    }

    fn feed_vad(&mut self, pcm_16k: &[u8]) -> VadFeedResult {
        let mut result = VadFeedResult::default();

        self.ingress.vad_buf.extend(
            pcm_16k
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32_768.0),
        );

        let chunk = self.ingress.vad.config().chunk_samples();
        while self.ingress.vad_buf.len() >= chunk {
            let frame: Vec<f32> = self.ingress.vad_buf.drain(..chunk).collect();
            let out = self.ingress.vad.process(&frame);
            match out.state {
                VadState::Started => {
                    result.started = true;
                    result.any_speech = true;
                }
                VadState::Active => result.any_speech = true,
                VadState::Stopped => result.stopped = true,
                VadState::Idle => {}
            }
        }
        result
    }

    // ══════════════════════════════════════════════════════════════════
    //  Egress: model → telephony
    // ══════════════════════════════════════════════════════════════════

    /// Handle a `response.audio.delta`: open the play stream on first
    /// delta, resample and frame the audio, queue it out.
    pub async fn on_audio_delta(
        &mut self,
        handle: &BridgeHandle,
        response_id: Option<&str>,
        delta_b64: &str,
    ) -> Result<(), StreamError> {
        if let (Some(rid), Some(cancelled)) =
            (response_id, self.egress.cancelled_response_id.as_deref())
        {
            if rid == cancelled {
                debug!(response_id = rid, "dropping delta for cancelled response");
                return Ok(());
            }
        }

        if self.egress_open() {
            // A second response's delta while a stream is open: close the
            // stale stream and open a fresh one for the new response.
            let mismatch = match (response_id, self.egress.response_id.as_deref()) {
                (Some(new), Some(current)) => new != current,
                _ => false,
            };
            if mismatch {
                warn!(
                    stale = self.egress.response_id.as_deref().unwrap_or("?"),
                    new = response_id.unwrap_or("?"),
                    "egress stream already open for another response — rotating"
                );
                self.close_egress(handle).await?;
                self.open_egress(handle, response_id).await?;
            }
        } else {
            self.open_egress(handle, response_id).await?;
        }

        let pcm_24k = BASE64.decode(delta_b64)?;

        if let Some(rec) = &self.recorder {
            match audio::resample(&pcm_24k, MODEL_EGRESS_RATE, MODEL_INGEST_RATE) {
                Ok(pcm_16k) => rec.append_audio(Party::Bot, &pcm_16k),
                Err(e) => debug!(error = %e, "bot recording resample failed"),
            }
        }

        let fmt = &self.config.playback_format;
        let pcm_native = audio::resample(&pcm_24k, MODEL_EGRESS_RATE, fmt.rate)?;
        let wire = match fmt.encoding {
            AudioEncoding::Mulaw => audio::pcm16_to_mulaw(&pcm_native)?,
            AudioEncoding::Pcm16 => pcm_native,
        };

        self.egress.pending.extend_from_slice(&wire);
        self.egress.last_delta = Some(Instant::now());

        let frame_bytes = self.frame_bytes();
        while self.egress.pending.len() >= frame_bytes {
            let frame: Vec<u8> = self.egress.pending.drain(..frame_bytes).collect();
            self.enqueue_frame(handle, Bytes::from(frame));
        }
        self.drain_egress(handle)?;
        Ok(())
    }

    /// `response.audio.done` (or a matching `response.done`): flush and
    /// close the play stream.
    pub async fn on_audio_done(
        &mut self,
        handle: &BridgeHandle,
        response_id: Option<&str>,
    ) -> Result<(), StreamError> {
        if let (Some(rid), Some(current)) = (response_id, self.egress.response_id.as_deref()) {
            if rid != current {
                debug!(
                    response_id = rid,
                    current = current,
                    "audio.done for a different response — ignoring"
                );
                return Ok(());
            }
        }
        self.close_egress(handle).await
    }

    /// Close the play stream: flush queued frames, pad out the remainder,
    /// emit `playStream.stop`, clear the session's output stream id.
    pub async fn close_egress(&mut self, handle: &BridgeHandle) -> Result<(), StreamError> {
        let Some(stream_id) = self.egress.stream_id.take() else {
            return Ok(());
        };

        // Flush: remaining whole queue entries, then the short tail.
        if !self.egress.pending.is_empty() {
            let tail = std::mem::take(&mut self.egress.pending);
            self.egress.queue.push_back(Bytes::from(tail));
        }
        while let Some(frame) = self.egress.queue.pop_front() {
            let ev = TelephonyOutbound::PlayStreamChunk {
                stream_id: stream_id.clone(),
                audio: BASE64.encode(&frame),
            };
            handle.stats().record_frame_out(frame.len());
            handle
                .send_to_telephony(&ev)
                .await
                .map_err(|_| StreamError::PeerClosed)?;
        }

        handle
            .send_to_telephony(&TelephonyOutbound::PlayStreamStop {
                stream_id: stream_id.clone(),
            })
            .await
            .map_err(|_| StreamError::PeerClosed)?;

        handle.session().take_active_output_stream_id();
        self.egress.response_id = None;
        self.egress.last_delta = None;
        info!(stream_id = %stream_id, "🔇 play stream closed");
        Ok(())
    }

    async fn open_egress(
        &mut self,
        handle: &BridgeHandle,
        response_id: Option<&str>,
    ) -> Result<(), StreamError> {
        let stream_id = Uuid::new_v4().to_string();
        handle.session().set_active_output_stream_id(&stream_id);
        self.egress.stream_id = Some(stream_id.clone());
        self.egress.response_id = response_id.map(String::from);
        self.egress.last_delta = Some(Instant::now());

        handle
            .send_to_telephony(&TelephonyOutbound::PlayStreamStart {
                stream_id: stream_id.clone(),
                media_format: self.config.playback_format.clone(),
            })
            .await
            .map_err(|_| StreamError::PeerClosed)?;
        info!(stream_id = %stream_id, "🔊 play stream opened");
        Ok(())
    }

    fn enqueue_frame(&mut self, handle: &BridgeHandle, frame: Bytes) {
        self.egress.queue.push_back(frame);
        let budget = self.config.egress_queue_frames();
        while self.egress.queue.len() > budget {
            self.egress.queue.pop_front();
            handle.stats().record_frame_drop();
            warn!("egress queue over budget — dropping oldest frame");
        }
    }

    /// Push as many queued frames as the transport will take right now.
    fn drain_egress(&mut self, handle: &BridgeHandle) -> Result<(), StreamError> {
        let Some(stream_id) = self.egress.stream_id.clone() else {
            return Ok(());
        };
        let mut saturated = false;
        while let Some(frame) = self.egress.queue.front() {
            let frame_len = frame.len();
            let ev = TelephonyOutbound::PlayStreamChunk {
                stream_id: stream_id.clone(),
                audio: BASE64.encode(frame),
            };
            match handle.try_send_to_telephony(&ev) {
                Ok(true) => {
                    handle.stats().record_frame_out(frame_len);
                    self.egress.queue.pop_front();
                }
                Ok(false) => {
                    saturated = true;
                    break;
                }
                Err(_) => return Err(StreamError::PeerClosed),
            }
        }

        // Under half full, audio integrity wins and queued frames wait for
        // the transport. At or above the watermark a saturated transport
        // means the backlog is stale: latency wins, shed the oldest frames
        // back to the watermark.
        if saturated {
            let watermark = self.config.egress_watermark_frames();
            while self.egress.queue.len() > watermark {
                self.egress.queue.pop_front();
                handle.stats().record_frame_drop();
                warn!("egress transport saturated — shedding oldest frame to watermark");
            }
        }
        Ok(())
    }

    fn frame_bytes(&self) -> usize {
        let fmt = &self.config.playback_format;
        let samples = (fmt.rate as usize) * (self.config.frame_ms as usize) / 1000;
        match fmt.encoding {
            AudioEncoding::Mulaw => samples,
            AudioEncoding::Pcm16 => samples * 2,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct VadFeedResult {
    started: bool,
    stopped: bool,
    any_speech: bool,
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{BridgeCommand, PeerConnection, PeerEndpoint};
    use crate::session::{CallStatus, SessionState};
    use crate::stats::Stats;
    use crate::vad::VadConfig;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Rig {
        handler: AudioStreamHandler,
        handle: BridgeHandle,
        model: PeerEndpoint,
        telephony: PeerEndpoint,
        _commands: mpsc::Receiver<BridgeCommand>,
    }

    fn rig() -> Rig {
        rig_with_format(MediaFormat::pcm16_16k())
    }

    fn rig_with_format(format: MediaFormat) -> Rig {
        let session = SessionState::new("c1", format.clone());
        session.transition(CallStatus::Active).unwrap();
        let (model_conn, model_far) = PeerConnection::pair(256);
        let (tel_conn, tel_far) = PeerConnection::pair(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let handle = BridgeHandle::new(
            session,
            model_conn.outbound,
            tel_conn.outbound,
            cmd_tx,
            CancellationToken::new(),
            Stats::new(),
            false,
        );
        let vad = VadEngine::new(VadConfig {
            min_speech_duration_ms: 0,
            ..VadConfig::default()
        });
        let handler = AudioStreamHandler::new(AudioStreamConfig::new(format), vad, None);
        Rig {
            handler,
            handle,
            model: model_far,
            telephony: tel_far,
            _commands: cmd_rx,
        }
    }

    /// One 32 ms chunk (512 samples @ 16 kHz) of loud or silent PCM16.
    fn chunk_b64(loud: bool) -> String {
        let mut pcm = Vec::with_capacity(512 * 2);
        for i in 0..512 {
            let s: i16 = if loud {
                (((i as f32) * 0.3).sin() * 16_000.0) as i16
            } else {
                0
            };
            pcm.extend_from_slice(&s.to_le_bytes());
        }
        BASE64.encode(&pcm)
    }

    fn recv_json(ep: &mut PeerEndpoint) -> Option<Value> {
        ep.incoming
            .try_recv()
            .ok()
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    fn drain_types(ep: &mut PeerEndpoint) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(v) = recv_json(ep) {
            out.push(v["type"].as_str().unwrap().to_string());
        }
        out
    }

    #[tokio::test]
    async fn test_ingress_appends_flush_through() {
        let mut rig = rig();
        rig.handler
            .on_ingress_chunk(&rig.handle, &chunk_b64(false))
            .await
            .unwrap();

        let append = recv_json(&mut rig.model).unwrap();
        assert_eq!(append["type"], "input_audio_buffer.append");
        let audio = BASE64
            .decode(append["audio"].as_str().unwrap())
            .unwrap();
        assert_eq!(audio.len(), 512 * 2);
    }

    #[tokio::test]
    async fn test_commit_once_per_segment_on_vad_stop() {
        let mut rig = rig();
        // Speech onset needs 2 frames, release needs 3 silent frames.
        for _ in 0..4 {
            rig.handler
                .on_ingress_chunk(&rig.handle, &chunk_b64(true))
                .await
                .unwrap();
        }
        let mut committed = 0;
        for _ in 0..6 {
            let out = rig
                .handler
                .on_ingress_chunk(&rig.handle, &chunk_b64(false))
                .await
                .unwrap();
            if out.committed {
                committed += 1;
            }
        }
        assert_eq!(committed, 1, "exactly one commit per speech segment");

        let types = drain_types(&mut rig.model);
        assert_eq!(
            types
                .iter()
                .filter(|t| *t == "input_audio_buffer.commit")
                .count(),
            1
        );
        assert_eq!(
            types.iter().filter(|t| *t == "response.create").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_explicit_stop_commits_once() {
        let mut rig = rig();
        rig.handler
            .on_ingress_chunk(&rig.handle, &chunk_b64(false))
            .await
            .unwrap();

        assert!(rig.handler.on_stream_stop(&rig.handle).await.unwrap());
        // Nothing more buffered: a second stop is a no-op.
        assert!(!rig.handler.on_stream_stop(&rig.handle).await.unwrap());

        let types = drain_types(&mut rig.model);
        assert_eq!(
            types
                .iter()
                .filter(|t| *t == "input_audio_buffer.commit")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_inactivity_commit_via_tick() {
        let mut rig = rig();
        rig.handler.config.commit_timeout = Duration::from_millis(20);
        rig.handler
            .on_ingress_chunk(&rig.handle, &chunk_b64(false))
            .await
            .unwrap();

        rig.handler.tick(&rig.handle).await.unwrap();
        assert!(drain_types(&mut rig.model)
            .iter()
            .all(|t| t != "input_audio_buffer.commit"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        rig.handler.tick(&rig.handle).await.unwrap();
        assert!(drain_types(&mut rig.model)
            .iter()
            .any(|t| t == "input_audio_buffer.commit"));
    }

    #[tokio::test]
    async fn test_egress_opens_streams_and_closes() {
        let mut rig = rig();
        // 24 kHz delta: 480 samples = 20 ms.
        let delta = BASE64.encode(&vec![0u8; 480 * 2]);
        rig.handler
            .on_audio_delta(&rig.handle, Some("resp_1"), &delta)
            .await
            .unwrap();

        assert!(rig.handler.egress_open());
        assert!(rig.handle.session().active_output_stream_id().is_some());

        rig.handler
            .on_audio_done(&rig.handle, Some("resp_1"))
            .await
            .unwrap();
        assert!(!rig.handler.egress_open());
        assert!(rig.handle.session().active_output_stream_id().is_none());

        let types = drain_types(&mut rig.telephony);
        assert_eq!(types.first().map(String::as_str), Some("playStream.start"));
        assert_eq!(types.last().map(String::as_str), Some("playStream.stop"));
        assert!(types.iter().any(|t| t == "playStream.chunk"));
    }

    #[tokio::test]
    async fn test_egress_resamples_to_telephony_rate() {
        let mut rig = rig();
        // 480 samples @ 24 kHz = 20 ms -> 320 samples @ 16 kHz = 640 bytes.
        let delta = BASE64.encode(&vec![0u8; 480 * 2]);
        rig.handler
            .on_audio_delta(&rig.handle, Some("r"), &delta)
            .await
            .unwrap();

        let mut chunk_len = None;
        while let Some(v) = recv_json(&mut rig.telephony) {
            if v["type"] == "playStream.chunk" {
                chunk_len =
                    Some(BASE64.decode(v["audio"].as_str().unwrap()).unwrap().len());
            }
        }
        assert_eq!(chunk_len, Some(640));
    }

    #[tokio::test]
    async fn test_egress_mulaw_encoding() {
        let mut rig = rig_with_format(MediaFormat {
            encoding: AudioEncoding::Mulaw,
            rate: 8_000,
            channels: 1,
        });
        // 480 samples @ 24 kHz -> 160 samples @ 8 kHz -> 160 µ-law bytes.
        let delta = BASE64.encode(&vec![0u8; 480 * 2]);
        rig.handler
            .on_audio_delta(&rig.handle, Some("r"), &delta)
            .await
            .unwrap();

        let mut chunk_len = None;
        while let Some(v) = recv_json(&mut rig.telephony) {
            if v["type"] == "playStream.chunk" {
                chunk_len =
                    Some(BASE64.decode(v["audio"].as_str().unwrap()).unwrap().len());
            }
        }
        assert_eq!(chunk_len, Some(160));
    }

    #[tokio::test]
    async fn test_mismatched_response_rotates_stream() {
        let mut rig = rig();
        let delta = BASE64.encode(&vec![0u8; 480 * 2]);
        rig.handler
            .on_audio_delta(&rig.handle, Some("resp_1"), &delta)
            .await
            .unwrap();
        let first_stream = rig.handle.session().active_output_stream_id().unwrap();

        rig.handler
            .on_audio_delta(&rig.handle, Some("resp_2"), &delta)
            .await
            .unwrap();
        let second_stream = rig.handle.session().active_output_stream_id().unwrap();
        assert_ne!(first_stream, second_stream);

        let types = drain_types(&mut rig.telephony);
        // start(1) ... stop(1) start(2): stale stream closed before rotation.
        let starts = types.iter().filter(|t| *t == "playStream.start").count();
        let stops = types.iter().filter(|t| *t == "playStream.stop").count();
        assert_eq!((starts, stops), (2, 1));
    }

    #[tokio::test]
    async fn test_barge_in_closes_egress_and_drops_cancelled_deltas() {
        let mut rig = rig();
        let delta = BASE64.encode(&vec![0u8; 480 * 2]);
        rig.handler
            .on_audio_delta(&rig.handle, Some("resp_1"), &delta)
            .await
            .unwrap();
        assert!(rig.handler.egress_open());

        // Two loud chunks trigger VAD Started -> barge-in.
        let mut barge = false;
        for _ in 0..2 {
            let out = rig
                .handler
                .on_ingress_chunk(&rig.handle, &chunk_b64(true))
                .await
                .unwrap();
            barge |= out.barge_in;
        }
        assert!(barge);
        assert!(!rig.handler.egress_open());

        // Late deltas for the cancelled response are discarded.
        rig.handler
            .on_audio_delta(&rig.handle, Some("resp_1"), &delta)
            .await
            .unwrap();
        assert!(!rig.handler.egress_open());

        // A new response opens a fresh stream again.
        rig.handler
            .on_audio_delta(&rig.handle, Some("resp_2"), &delta)
            .await
            .unwrap();
        assert!(rig.handler.egress_open());
    }

    #[tokio::test]
    async fn test_egress_queue_drops_from_head_over_budget() {
        let mut rig = rig();
        // Tiny budget: 2 frames.
        rig.handler.config.egress_queue_ms = 40;

        // Open the stream while the transport still has room.
        let small = BASE64.encode(&vec![0u8; 480 * 2]);
        rig.handler
            .on_audio_delta(&rig.handle, Some("r"), &small)
            .await
            .unwrap();

        // Saturate the outbound channel so nothing drains.
        while rig
            .handle
            .try_send_to_telephony(&TelephonyOutbound::UserStreamStarted)
            .unwrap()
        {}

        // 10 frames' worth of audio in one delta (200 ms @ 24 kHz).
        let delta = BASE64.encode(&vec![0u8; 4800 * 2]);
        rig.handler
            .on_audio_delta(&rig.handle, Some("r"), &delta)
            .await
            .unwrap();

        // Hard-bounded to the budget on enqueue, then shed to the 50%
        // watermark (1 frame) once the saturated drain gives up.
        assert_eq!(rig.handler.egress.queue.len(), 1);
        assert!(
            rig.handle
                .stats()
                .frame_drops
                .load(std::sync::atomic::Ordering::Relaxed)
                > 0
        );
    }

    #[tokio::test]
    async fn test_egress_below_watermark_never_drops() {
        let mut rig = rig();
        // Default budget: 200 ms / 20 ms = 10 frames, watermark 5.

        // Open the stream while the transport still has room.
        let small = BASE64.encode(&vec![0u8; 480 * 2]);
        rig.handler
            .on_audio_delta(&rig.handle, Some("r"), &small)
            .await
            .unwrap();

        // Saturate the outbound channel so nothing drains.
        while rig
            .handle
            .try_send_to_telephony(&TelephonyOutbound::UserStreamStarted)
            .unwrap()
        {}

        // 4 frames (80 ms @ 24 kHz): under the watermark, integrity wins.
        let delta = BASE64.encode(&vec![0u8; 1920 * 2]);
        rig.handler
            .on_audio_delta(&rig.handle, Some("r"), &delta)
            .await
            .unwrap();

        assert_eq!(rig.handler.egress.queue.len(), 4);
        assert_eq!(
            rig.handle
                .stats()
                .frame_drops
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[tokio::test]
    async fn test_orphan_stream_closed_by_tick() {
        let mut rig = rig();
        rig.handler.config.orphan_close_timeout = Duration::from_millis(10);
        let delta = BASE64.encode(&vec![0u8; 480 * 2]);
        rig.handler
            .on_audio_delta(&rig.handle, Some("r"), &delta)
            .await
            .unwrap();
        assert!(rig.handler.egress_open());

        tokio::time::sleep(Duration::from_millis(30)).await;
        rig.handler.tick(&rig.handle).await.unwrap();
        assert!(!rig.handler.egress_open());
    }

    #[tokio::test]
    async fn test_bad_base64_is_audio_kind_error() {
        let mut rig = rig();
        let err = rig
            .handler
            .on_ingress_chunk(&rig.handle, "not!!base64")
            .await
            .unwrap_err();
        assert!(err.is_audio_kind());
    }
}
