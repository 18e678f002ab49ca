/// Normalized telephony event vocabulary (JSON over WebSocket).
///
/// Platform adapters translate AudioCodes / Twilio wire schemas into this
/// vocabulary at the edge; the bridge only ever sees these shapes. Audio
/// payloads are base64 PCM16 (or µ-law when negotiated).
use serde::{Deserialize, Serialize};

/// Negotiated audio format for a call. Captured at `session.initiate` and
/// invariant afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub encoding: AudioEncoding,
    pub rate: u32,
    pub channels: u8,
}

impl MediaFormat {
    pub fn pcm16_16k() -> Self {
        MediaFormat {
            encoding: AudioEncoding::Pcm16,
            rate: 16_000,
            channels: 1,
        }
    }

    /// Formats the bridge can carry: mono PCM16 at 8/16/24 kHz or mono µ-law
    /// at 8 kHz.
    pub fn is_supported(&self) -> bool {
        if self.channels != 1 {
            return false;
        }
        match self.encoding {
            AudioEncoding::Pcm16 => matches!(self.rate, 8_000 | 16_000 | 24_000),
            AudioEncoding::Mulaw => self.rate == 8_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    Pcm16,
    Mulaw,
}

/// An activity item — out-of-band signals like DTMF key presses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Activity {
    pub fn dtmf(value: impl Into<String>) -> Self {
        Activity {
            kind: "dtmf".into(),
            value: Some(value.into()),
        }
    }

    pub fn is_dtmf(&self) -> bool {
        self.kind == "dtmf"
    }
}

// ─────────────────────────────────────────────────────────────────────
//  Ingress: telephony platform → bridge
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum TelephonyInbound {
    #[serde(rename = "session.initiate")]
    SessionInitiate {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "botName", default)]
        bot_name: Option<String>,
        #[serde(default)]
        caller: Option<String>,
        /// Absent when the platform leaves format selection to the server.
        #[serde(rename = "mediaFormat", default)]
        media_format: Option<MediaFormat>,
    },

    #[serde(rename = "userStream.start")]
    UserStreamStart,

    #[serde(rename = "userStream.chunk")]
    UserStreamChunk { audio: String },

    #[serde(rename = "userStream.stop")]
    UserStreamStop,

    #[serde(rename = "activities")]
    Activities { activities: Vec<Activity> },

    #[serde(rename = "session.end")]
    SessionEnd {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl TelephonyInbound {
    pub fn event_type(&self) -> &'static str {
        match self {
            TelephonyInbound::SessionInitiate { .. } => "session.initiate",
            TelephonyInbound::UserStreamStart => "userStream.start",
            TelephonyInbound::UserStreamChunk { .. } => "userStream.chunk",
            TelephonyInbound::UserStreamStop => "userStream.stop",
            TelephonyInbound::Activities { .. } => "activities",
            TelephonyInbound::SessionEnd { .. } => "session.end",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
//  Egress: bridge → telephony platform
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TelephonyOutbound {
    #[serde(rename = "session.accepted")]
    SessionAccepted {
        #[serde(rename = "mediaFormat")]
        media_format: MediaFormat,
    },

    #[serde(rename = "userStream.started")]
    UserStreamStarted,

    #[serde(rename = "userStream.stopped")]
    UserStreamStopped,

    #[serde(rename = "playStream.start")]
    PlayStreamStart {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(rename = "mediaFormat")]
        media_format: MediaFormat,
    },

    #[serde(rename = "playStream.chunk")]
    PlayStreamChunk {
        #[serde(rename = "streamId")]
        stream_id: String,
        audio: String,
    },

    #[serde(rename = "playStream.stop")]
    PlayStreamStop {
        #[serde(rename = "streamId")]
        stream_id: String,
    },

    #[serde(rename = "activities")]
    Activities { activities: Vec<Activity> },

    #[serde(rename = "session.end")]
    SessionEnd {
        #[serde(rename = "reasonCode")]
        reason_code: String,
        reason: String,
    },
}

impl TelephonyOutbound {
    pub fn event_type(&self) -> &'static str {
        match self {
            TelephonyOutbound::SessionAccepted { .. } => "session.accepted",
            TelephonyOutbound::UserStreamStarted => "userStream.started",
            TelephonyOutbound::UserStreamStopped => "userStream.stopped",
            TelephonyOutbound::PlayStreamStart { .. } => "playStream.start",
            TelephonyOutbound::PlayStreamChunk { .. } => "playStream.chunk",
            TelephonyOutbound::PlayStreamStop { .. } => "playStream.stop",
            TelephonyOutbound::Activities { .. } => "activities",
            TelephonyOutbound::SessionEnd { .. } => "session.end",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_initiate() {
        let raw = r#"{
            "type": "session.initiate",
            "callId": "c1",
            "caller": "+15551234567",
            "mediaFormat": {"encoding": "pcm16", "rate": 16000, "channels": 1}
        }"#;
        let ev: TelephonyInbound = serde_json::from_str(raw).unwrap();
        match ev {
            TelephonyInbound::SessionInitiate {
                call_id,
                caller,
                media_format,
                ..
            } => {
                assert_eq!(call_id, "c1");
                assert_eq!(caller.as_deref(), Some("+15551234567"));
                assert!(media_format.unwrap().is_supported());
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_parse_session_initiate_without_format() {
        let raw = r#"{"type": "session.initiate", "callId": "c2"}"#;
        let ev: TelephonyInbound = serde_json::from_str(raw).unwrap();
        match ev {
            TelephonyInbound::SessionInitiate { media_format, .. } => {
                assert!(media_format.is_none());
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unit_events() {
        let ev: TelephonyInbound =
            serde_json::from_str(r#"{"type": "userStream.stop"}"#).unwrap();
        assert_eq!(ev.event_type(), "userStream.stop");
    }

    #[test]
    fn test_parse_dtmf_activity() {
        let raw = r#"{"type": "activities", "activities": [{"type": "dtmf", "value": "5"}]}"#;
        let ev: TelephonyInbound = serde_json::from_str(raw).unwrap();
        match ev {
            TelephonyInbound::Activities { activities } => {
                assert!(activities[0].is_dtmf());
                assert_eq!(activities[0].value.as_deref(), Some("5"));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_serialize_play_stream() {
        let ev = TelephonyOutbound::PlayStreamChunk {
            stream_id: "s1".into(),
            audio: "AAAA".into(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&ev).unwrap()).unwrap();
        assert_eq!(json["type"], "playStream.chunk");
        assert_eq!(json["streamId"], "s1");
        assert_eq!(json["audio"], "AAAA");
    }

    #[test]
    fn test_media_format_support_matrix() {
        assert!(MediaFormat::pcm16_16k().is_supported());
        assert!(MediaFormat {
            encoding: AudioEncoding::Mulaw,
            rate: 8_000,
            channels: 1
        }
        .is_supported());
        assert!(!MediaFormat {
            encoding: AudioEncoding::Mulaw,
            rate: 16_000,
            channels: 1
        }
        .is_supported());
        assert!(!MediaFormat {
            encoding: AudioEncoding::Pcm16,
            rate: 44_100,
            channels: 1
        }
        .is_supported());
        assert!(!MediaFormat {
            encoding: AudioEncoding::Pcm16,
            rate: 16_000,
            channels: 2
        }
        .is_supported());
    }
}
