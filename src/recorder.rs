/// Per-call recording: synchronized audio tracks plus a structured event log.
///
/// Caller and bot audio accumulate as append-only PCM16 mono buffers at
/// 16 kHz (bot audio is resampled from the model's 24 kHz by the egress
/// path before it lands here). At call close everything is finalized into a
/// per-call directory:
///
/// ```text
/// {call_id}_{YYYYMMDD_HHMMSS}/
///   caller_audio.wav            PCM16 16 kHz mono
///   bot_audio.wav               PCM16 16 kHz mono
///   stereo_recording.wav        L=caller, R=bot
///   final_stereo_recording.wav  post-call rebuild from the mono files
///   transcript.json
///   session_events.json
///   call_metadata.json
/// ```
///
/// All JSON timestamps are RFC 3339 UTC. The shorter track is padded with
/// silence in the stereo artifacts; the longer one is never truncated.
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::audio;
use crate::telephony_protocol::MediaFormat;

const RECORDING_RATE: u32 = 16_000;
const WAV_HEADER_LEN: usize = 44;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub enabled: bool,
    pub output_dir: PathBuf,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        RecorderConfig {
            enabled: false,
            output_dir: PathBuf::from("./recordings"),
        }
    }
}

/// Which party produced a piece of audio or transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Caller,
    Bot,
}

impl Party {
    fn label(self) -> &'static str {
        match self {
            Party::Caller => "caller",
            Party::Bot => "bot",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub channel: &'static str,
    pub text: String,
}

/// Closing metadata written to `call_metadata.json`.
#[derive(Debug, Clone, Serialize)]
pub struct CallMetadata {
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
    pub media_format: MediaFormat,
    pub created_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_reason_code: String,
    pub end_reason: String,
    pub caller_audio_ms: u64,
    pub bot_audio_ms: u64,
    pub event_count: usize,
    pub transcript_entries: usize,
}

struct RecorderInner {
    caller_pcm: Vec<u8>,
    bot_pcm: Vec<u8>,
    events: Vec<RecordedEvent>,
    transcript: Vec<TranscriptEntry>,
    finalized: bool,
}

pub struct CallRecorder {
    dir: PathBuf,
    inner: Mutex<RecorderInner>,
}

impl CallRecorder {
    pub fn new(config: &RecorderConfig, call_id: &str) -> Self {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let dir = config.output_dir.join(format!("{call_id}_{stamp}"));
        CallRecorder {
            dir,
            inner: Mutex::new(RecorderInner {
                caller_pcm: Vec::with_capacity(RECORDING_RATE as usize * 2 * 30),
                bot_pcm: Vec::with_capacity(RECORDING_RATE as usize * 2 * 30),
                events: Vec::new(),
                transcript: Vec::new(),
                finalized: false,
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append 16 kHz PCM16 to one party's track.
    pub fn append_audio(&self, party: Party, pcm: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        if inner.finalized {
            return;
        }
        match party {
            Party::Caller => inner.caller_pcm.extend_from_slice(pcm),
            Party::Bot => inner.bot_pcm.extend_from_slice(pcm),
        }
    }

    /// Record a session event (lifecycle, function call, error).
    pub fn log_event(&self, kind: &str, payload: Value) {
        let mut inner = self.inner.lock().unwrap();
        if inner.finalized {
            return;
        }
        inner.events.push(RecordedEvent {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            payload,
        });
    }

    /// Record a completed transcript line for one party.
    pub fn log_transcript(&self, party: Party, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.finalized {
            return;
        }
        inner.transcript.push(TranscriptEntry {
            timestamp: Utc::now(),
            channel: party.label(),
            text: text.to_string(),
        });
    }

    /// Write all artifacts to disk. Idempotent: the second call is a no-op.
    pub async fn finalize(&self, mut metadata: CallMetadata) -> anyhow::Result<()> {
        let (caller_pcm, bot_pcm, events, transcript) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.finalized {
                return Ok(());
            }
            inner.finalized = true;
            (
                std::mem::take(&mut inner.caller_pcm),
                std::mem::take(&mut inner.bot_pcm),
                std::mem::take(&mut inner.events),
                std::mem::take(&mut inner.transcript),
            )
        };

        tokio::fs::create_dir_all(&self.dir).await?;

        metadata.caller_audio_ms = audio::duration_ms(caller_pcm.len(), RECORDING_RATE);
        metadata.bot_audio_ms = audio::duration_ms(bot_pcm.len(), RECORDING_RATE);
        metadata.event_count = events.len();
        metadata.transcript_entries = transcript.len();

        let caller_path = self.dir.join("caller_audio.wav");
        let bot_path = self.dir.join("bot_audio.wav");
        tokio::fs::write(&caller_path, wav_bytes(&caller_pcm, RECORDING_RATE, 1)).await?;
        tokio::fs::write(&bot_path, wav_bytes(&bot_pcm, RECORDING_RATE, 1)).await?;

        let stereo = interleave_stereo(&caller_pcm, &bot_pcm);
        tokio::fs::write(
            self.dir.join("stereo_recording.wav"),
            wav_bytes(&stereo, RECORDING_RATE, 2),
        )
        .await?;

        // Rebuild the stereo mix from the mono files on disk, so the final
        // artifact reflects exactly what was persisted.
        match rebuild_stereo(&caller_path, &bot_path).await {
            Ok(rebuilt) => {
                tokio::fs::write(
                    self.dir.join("final_stereo_recording.wav"),
                    wav_bytes(&rebuilt, RECORDING_RATE, 2),
                )
                .await?;
            }
            Err(e) => warn!(error = %e, "final stereo rebuild failed"),
        }

        tokio::fs::write(
            self.dir.join("transcript.json"),
            serde_json::to_vec_pretty(&transcript)?,
        )
        .await?;
        tokio::fs::write(
            self.dir.join("session_events.json"),
            serde_json::to_vec_pretty(&events)?,
        )
        .await?;
        tokio::fs::write(
            self.dir.join("call_metadata.json"),
            serde_json::to_vec_pretty(&metadata)?,
        )
        .await?;

        info!(
            dir = %self.dir.display(),
            caller_ms = metadata.caller_audio_ms,
            bot_ms = metadata.bot_audio_ms,
            events = metadata.event_count,
            "💾 call recording finalized"
        );
        Ok(())
    }
}

/// Build a complete WAV file (RIFF header + PCM16 data).
fn wav_bytes(pcm_data: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = pcm_data.len() as u32;
    let bits_per_sample: u16 = 16;
    let byte_rate = sample_rate * ((bits_per_sample as u32) / 8) * (channels as u32);
    let block_align = channels * (bits_per_sample / 8);

    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + pcm_data.len());
    // RIFF header
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    // fmt sub-chunk
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&(16u32).to_le_bytes());
    wav.extend_from_slice(&(1u16).to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    // data sub-chunk
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm_data);
    wav
}

/// Interleave two mono PCM16 tracks into L/R stereo, padding the shorter
/// track with silence.
fn interleave_stereo(left: &[u8], right: &[u8]) -> Vec<u8> {
    let n_samples = (left.len() / 2).max(right.len() / 2);
    let mut out = Vec::with_capacity(n_samples * 4);
    for i in 0..n_samples {
        let l = left
            .get(i * 2..i * 2 + 2)
            .map(|c| [c[0], c[1]])
            .unwrap_or([0, 0]);
        let r = right
            .get(i * 2..i * 2 + 2)
            .map(|c| [c[0], c[1]])
            .unwrap_or([0, 0]);
        out.extend_from_slice(&l);
        out.extend_from_slice(&r);
    }
    out
}

/// Read the two persisted mono WAVs back and re-interleave their data
/// chunks.
async fn rebuild_stereo(caller: &Path, bot: &Path) -> anyhow::Result<Vec<u8>> {
    let caller_wav = tokio::fs::read(caller).await?;
    let bot_wav = tokio::fs::read(bot).await?;
    if caller_wav.len() < WAV_HEADER_LEN || bot_wav.len() < WAV_HEADER_LEN {
        anyhow::bail!("mono recording shorter than a WAV header");
    }
    Ok(interleave_stereo(
        &caller_wav[WAV_HEADER_LEN..],
        &bot_wav[WAV_HEADER_LEN..],
    ))
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
