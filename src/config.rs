use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::bridge::{BridgeConfig, TurnDetectionConfig};
use crate::functions::DispatcherConfig;
use crate::model_peer::ModelPeerConfig;
use crate::recorder::RecorderConfig;
use crate::telephony_protocol::{AudioEncoding, MediaFormat};
use crate::vad::{VadConfig, VadDevice};

const DEFAULT_INSTRUCTIONS: &str = "\
You are a friendly, efficient phone assistant for a retail bank.\n\
Help the caller with card services: replacing lost or damaged cards, \
checking replacement status, and general account questions.\n\
Keep answers to one or two short sentences — this is a phone call, not a chat.\n\
Use the available tools to act on the caller's behalf; never invent account data.\n\
When every task is finished, confirm with the caller and call wrap_up.\n\
If the caller asks for a person, call transfer_to_human.";

/// Realtime voice bridge between a telephony WebSocket and the OpenAI
/// Realtime API.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Telephony WebSocket + health port
    #[arg(long, default_value_t = 9000)]
    pub port: u16,

    /// Size of the per-peer message channels
    #[arg(long, default_value_t = 512)]
    pub channel_capacity: usize,

    /// Stats logging interval in seconds (0 = disabled)
    #[arg(long, default_value_t = 5)]
    pub stats_interval_secs: u64,

    // ── OpenAI Realtime API ────────────────────────────────────────────
    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long, env = "OPENAI_API_KEY", default_value = "")]
    pub openai_api_key: String,

    /// OpenAI Realtime model name
    #[arg(long, default_value = "gpt-realtime-mini-2025-10-06")]
    pub model_id: String,

    /// Realtime API endpoint
    #[arg(long, default_value = "wss://api.openai.com/v1/realtime")]
    pub realtime_url: String,

    /// OpenAI Realtime voice
    #[arg(long, default_value = "ash")]
    pub voice: String,

    /// Sampling temperature, 0..=2
    #[arg(long, default_value_t = 0.8)]
    pub temperature: f32,

    /// Cap on model output tokens per response
    #[arg(long)]
    pub max_response_output_tokens: Option<u32>,

    /// System instructions for the Realtime session
    #[arg(long, default_value = DEFAULT_INSTRUCTIONS)]
    pub instructions: String,

    /// Caller-audio transcription model (empty string disables)
    #[arg(long, default_value = "whisper-1")]
    pub transcription_model: String,

    // ── Audio ──────────────────────────────────────────────────────────
    /// Assumed caller sample rate when session.initiate omits a format
    #[arg(long, default_value_t = 16_000)]
    pub input_rate: u32,

    /// Playback sample rate toward telephony
    #[arg(long, default_value_t = 16_000)]
    pub output_rate: u32,

    /// Assumed caller encoding when session.initiate omits a format
    /// (pcm16 | mulaw)
    #[arg(long, default_value = "pcm16")]
    pub encoding: String,

    // ── Local VAD ──────────────────────────────────────────────────────
    /// Speech onset probability threshold
    #[arg(long, default_value_t = 0.5)]
    pub vad_speech_threshold: f32,

    /// Silence release probability threshold (compared with <=)
    #[arg(long, default_value_t = 0.6)]
    pub vad_silence_threshold: f32,

    /// Minimum speech duration before a silence release, in ms
    #[arg(long, default_value_t = 500)]
    pub vad_min_speech_duration_ms: u64,

    /// Force-stop a speech segment after this many ms
    #[arg(long, default_value_t = 2_000)]
    pub vad_force_stop_timeout_ms: u64,

    /// VAD inference device (cpu | gpu)
    #[arg(long, default_value = "cpu")]
    pub vad_device: String,

    /// VAD frame rate (8000 | 16000)
    #[arg(long, default_value_t = 16_000)]
    pub vad_sample_rate: u32,

    // ── Server-side turn detection ─────────────────────────────────────
    /// Turn detection type (server_vad | semantic_vad | none)
    #[arg(long, default_value = "server_vad")]
    pub turn_detection_type: String,

    #[arg(long, default_value_t = 0.5)]
    pub turn_detection_threshold: f32,

    #[arg(long, default_value_t = 300)]
    pub turn_detection_prefix_padding_ms: u32,

    #[arg(long, default_value_t = 500)]
    pub turn_detection_silence_duration_ms: u32,

    /// Let the model auto-create responses on commit. When false the bridge
    /// sends response.create itself; the two policies never mix.
    #[arg(long, default_value_t = false)]
    pub turn_detection_create_response: bool,

    // ── Recording ──────────────────────────────────────────────────────
    /// Record per-call audio + event artifacts (pass `false` to disable)
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub record_calls: bool,

    /// Directory for per-call recording folders
    #[arg(long, default_value = "./recordings")]
    pub recording_dir: PathBuf,

    // ── Timeouts ───────────────────────────────────────────────────────
    /// Realtime API connect timeout, seconds
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Session-creation handshake timeout, seconds
    #[arg(long, default_value_t = 15)]
    pub handshake_timeout_secs: u64,

    /// Function handler timeout, seconds
    #[arg(long, default_value_t = 30)]
    pub function_timeout_secs: u64,

    /// Ingress inactivity commit timeout, ms
    #[arg(long, default_value_t = 2_000)]
    pub commit_timeout_ms: u64,

    /// Close an orphaned play stream after this many ms without deltas
    #[arg(long, default_value_t = 500)]
    pub orphan_close_ms: u64,

    /// Delay between a hang-up trigger and session close, seconds
    #[arg(long, default_value_t = 8)]
    pub hangup_delay_secs: u64,

    // ── Local model substitute ─────────────────────────────────────────
    /// Use a model substitute instead of the OpenAI Realtime API
    #[arg(long, default_value_t = false)]
    pub use_local_model: bool,

    /// WebSocket URL of an external model substitute; empty runs the
    /// in-process substitute
    #[arg(long, default_value = "")]
    pub local_model_url: String,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Fail fast on bad configuration before any peer contact.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.use_local_model && self.openai_api_key.is_empty() {
            anyhow::bail!(
                "OpenAI API key not set (use --openai-api-key or OPENAI_API_KEY env var)"
            );
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            anyhow::bail!("temperature {} outside [0, 2]", self.temperature);
        }
        if !matches!(self.input_rate, 8_000 | 16_000) {
            anyhow::bail!("input_rate {} not in {{8000, 16000}}", self.input_rate);
        }
        if !matches!(self.output_rate, 8_000 | 16_000 | 24_000) {
            anyhow::bail!(
                "output_rate {} not in {{8000, 16000, 24000}}",
                self.output_rate
            );
        }
        if self.default_encoding().is_none() {
            anyhow::bail!("encoding '{}' not in {{pcm16, mulaw}}", self.encoding);
        }
        if !matches!(self.vad_sample_rate, 8_000 | 16_000) {
            anyhow::bail!(
                "vad_sample_rate {} not in {{8000, 16000}}",
                self.vad_sample_rate
            );
        }
        if !matches!(self.vad_device.as_str(), "cpu" | "gpu") {
            anyhow::bail!("vad_device '{}' not in {{cpu, gpu}}", self.vad_device);
        }
        for (name, v) in [
            ("vad_speech_threshold", self.vad_speech_threshold),
            ("vad_silence_threshold", self.vad_silence_threshold),
            ("turn_detection_threshold", self.turn_detection_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                anyhow::bail!("{name} {v} outside [0, 1]");
            }
        }
        if !matches!(
            self.turn_detection_type.as_str(),
            "server_vad" | "semantic_vad" | "none"
        ) {
            anyhow::bail!(
                "turn_detection_type '{}' not in {{server_vad, semantic_vad, none}}",
                self.turn_detection_type
            );
        }
        Ok(())
    }

    fn default_encoding(&self) -> Option<AudioEncoding> {
        match self.encoding.as_str() {
            "pcm16" => Some(AudioEncoding::Pcm16),
            "mulaw" => Some(AudioEncoding::Mulaw),
            _ => None,
        }
    }

    pub fn model_peer_config(&self) -> ModelPeerConfig {
        ModelPeerConfig {
            api_key: self.openai_api_key.clone(),
            model_id: self.model_id.clone(),
            url: self.realtime_url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            channel_capacity: self.channel_capacity,
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            voice: self.voice.clone(),
            instructions: self.instructions.clone(),
            temperature: self.temperature,
            max_response_output_tokens: self.max_response_output_tokens,
            transcription_model: if self.transcription_model.is_empty() {
                None
            } else {
                Some(self.transcription_model.clone())
            },
            default_media_format: MediaFormat {
                encoding: self.default_encoding().unwrap_or(AudioEncoding::Pcm16),
                rate: self.input_rate,
                channels: 1,
            },
            output_rate: self.output_rate,
            turn_detection: TurnDetectionConfig {
                kind: self.turn_detection_type.clone(),
                threshold: self.turn_detection_threshold,
                prefix_padding_ms: self.turn_detection_prefix_padding_ms,
                silence_duration_ms: self.turn_detection_silence_duration_ms,
                create_response: self.turn_detection_create_response,
            },
            vad: VadConfig {
                speech_threshold: self.vad_speech_threshold,
                silence_threshold: self.vad_silence_threshold,
                min_speech_duration_ms: self.vad_min_speech_duration_ms,
                force_stop_timeout_ms: self.vad_force_stop_timeout_ms,
                device: if self.vad_device == "gpu" {
                    VadDevice::Gpu
                } else {
                    VadDevice::Cpu
                },
                sample_rate: self.vad_sample_rate,
            },
            recording: RecorderConfig {
                enabled: self.record_calls,
                output_dir: self.recording_dir.clone(),
            },
            dispatcher: DispatcherConfig {
                handler_timeout: Duration::from_secs(self.function_timeout_secs),
                hangup_delay: Duration::from_secs(self.hangup_delay_secs),
            },
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            commit_timeout: Duration::from_millis(self.commit_timeout_ms),
            orphan_close_timeout: Duration::from_millis(self.orphan_close_ms),
            channel_capacity: self.channel_capacity,
            tick_interval: Duration::from_millis(100),
        }
    }
}
