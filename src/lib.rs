//! Realtime voice bridge core.
//!
//! Mediates bidirectional, low-latency voice sessions between a telephony
//! platform (WebSocket) and the OpenAI Realtime API (WebSocket). Per call, a
//! [`bridge`] owns both peers, converts between the two protocols, reframes
//! audio, enforces the session state machine, dispatches model tool calls
//! through a pluggable [`functions::FunctionRegistry`], and records
//! synchronized per-party audio plus a structured event log.

pub mod audio;
pub mod audio_stream;
pub mod bridge;
pub mod config;
pub mod functions;
pub mod local_model;
pub mod model_peer;
pub mod peer;
pub mod realtime_protocol;
pub mod recorder;
pub mod router;
pub mod server;
pub mod session;
pub mod stats;
pub mod telephony_protocol;
pub mod vad;
