/// Per-call session state.
///
/// One `SessionState` exists per bridge. The `Call` record is mutated only
/// behind a short-lived mutex; readers take consistent snapshots. Nothing
/// awaits while the lock is held.
///
/// ```text
/// Initializing ──▶ Active ──▶ Closing ──▶ Closed
/// ```
///
/// Status is monotonic: forward jumps are allowed (a failed negotiation goes
/// straight to Closed), back-transitions never are.
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::telephony_protocol::MediaFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallStatus {
    Initializing,
    Active,
    Closing,
    Closed,
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallStatus::Initializing => write!(f, "initializing"),
            CallStatus::Active => write!(f, "active"),
            CallStatus::Closing => write!(f, "closing"),
            CallStatus::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition { from: CallStatus, to: CallStatus },
}

/// The per-call record. Audio buffering state lives in the stream handler,
/// pending tool calls in the dispatcher.
#[derive(Debug, Clone)]
pub struct Call {
    pub call_id: String,
    /// Assigned by the model peer on `session.created`.
    pub peer_session_id: Option<String>,
    pub status: CallStatus,
    pub media_format: MediaFormat,
    pub telephony_stream_id: Option<String>,
    pub telephony_media_stream_id: Option<String>,
    /// True iff a model response is currently being produced.
    pub response_active: bool,
    /// True between sending `response.create` and seeing `response.created`.
    pub response_pending: bool,
    /// The in-flight playback stream toward telephony, if any.
    pub active_output_stream_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

type StatusListener = Arc<dyn Fn(CallStatus, CallStatus) + Send + Sync>;

pub struct SessionState {
    inner: Mutex<Call>,
    listeners: Mutex<Vec<StatusListener>>,
}

impl SessionState {
    pub fn new(call_id: impl Into<String>, media_format: MediaFormat) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(SessionState {
            inner: Mutex::new(Call {
                call_id: call_id.into(),
                peer_session_id: None,
                status: CallStatus::Initializing,
                media_format,
                telephony_stream_id: None,
                telephony_media_stream_id: None,
                response_active: false,
                response_pending: false,
                active_output_stream_id: None,
                created_at: now,
                last_activity_at: now,
            }),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn status(&self) -> CallStatus {
        self.inner.lock().unwrap().status
    }

    /// Consistent copy of the whole record.
    pub fn snapshot(&self) -> Call {
        self.inner.lock().unwrap().clone()
    }

    pub fn call_id(&self) -> String {
        self.inner.lock().unwrap().call_id.clone()
    }

    pub fn media_format(&self) -> MediaFormat {
        self.inner.lock().unwrap().media_format.clone()
    }

    /// Status-change callbacks run on their own task so they can never block
    /// the pump loops.
    pub fn on_status_change(&self, listener: StatusListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Move to `to`. Only forward transitions are legal; an attempt to stay
    /// in place or move backwards is rejected (callers suppress-and-log).
    pub fn transition(&self, to: CallStatus) -> Result<(), StateError> {
        let from = {
            let mut call = self.inner.lock().unwrap();
            if to <= call.status {
                return Err(StateError::IllegalTransition {
                    from: call.status,
                    to,
                });
            }
            let from = call.status;
            call.status = to;
            call.last_activity_at = Utc::now();
            from
        };

        debug!(from = %from, to = %to, "call status transition");

        let listeners: Vec<StatusListener> = self.listeners.lock().unwrap().clone();
        for l in listeners {
            tokio::spawn(async move { l(from, to) });
        }
        Ok(())
    }

    pub fn touch(&self) {
        self.inner.lock().unwrap().last_activity_at = Utc::now();
    }

    pub fn set_peer_session_id(&self, id: impl Into<String>) {
        self.inner.lock().unwrap().peer_session_id = Some(id.into());
    }

    pub fn set_telephony_stream_id(&self, id: impl Into<String>) {
        self.inner.lock().unwrap().telephony_stream_id = Some(id.into());
    }

    pub fn set_telephony_media_stream_id(&self, id: impl Into<String>) {
        self.inner.lock().unwrap().telephony_media_stream_id = Some(id.into());
    }

    // ── Response-generation guard ─────────────────────────────────────

    pub fn response_active(&self) -> bool {
        self.inner.lock().unwrap().response_active
    }

    /// Claim the right to send `response.create`. Fails when a response is
    /// already active or one was requested and not yet confirmed.
    pub fn begin_response_attempt(&self) -> bool {
        let mut call = self.inner.lock().unwrap();
        if call.response_active || call.response_pending {
            return false;
        }
        call.response_pending = true;
        true
    }

    /// A `response.created` arrived.
    pub fn mark_response_created(&self) {
        let mut call = self.inner.lock().unwrap();
        call.response_active = true;
        call.response_pending = false;
        call.last_activity_at = Utc::now();
    }

    /// A terminal response event arrived (`response.done`, cancellation).
    pub fn mark_response_done(&self) {
        let mut call = self.inner.lock().unwrap();
        call.response_active = false;
        call.response_pending = false;
        call.last_activity_at = Utc::now();
    }

    // ── Output stream tracking ────────────────────────────────────────

    pub fn active_output_stream_id(&self) -> Option<String> {
        self.inner.lock().unwrap().active_output_stream_id.clone()
    }

    pub fn set_active_output_stream_id(&self, id: impl Into<String>) {
        self.inner.lock().unwrap().active_output_stream_id = Some(id.into());
    }

    /// Clear and return the current output stream id, if any.
    pub fn take_active_output_stream_id(&self) -> Option<String> {
        self.inner.lock().unwrap().active_output_stream_id.take()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state() -> Arc<SessionState> {
        SessionState::new("c1", MediaFormat::pcm16_16k())
    }

    #[tokio::test]
    async fn test_forward_transitions_only() {
        let s = state();
        assert_eq!(s.status(), CallStatus::Initializing);
        s.transition(CallStatus::Active).unwrap();
        s.transition(CallStatus::Closing).unwrap();
        s.transition(CallStatus::Closed).unwrap();

        assert_eq!(
            s.transition(CallStatus::Active),
            Err(StateError::IllegalTransition {
                from: CallStatus::Closed,
                to: CallStatus::Active
            })
        );
    }

    #[tokio::test]
    async fn test_skip_transition_allowed() {
        // Failed negotiation goes straight to Closed.
        let s = state();
        s.transition(CallStatus::Closed).unwrap();
        assert_eq!(s.status(), CallStatus::Closed);
    }

    #[tokio::test]
    async fn test_self_transition_rejected() {
        let s = state();
        s.transition(CallStatus::Active).unwrap();
        assert!(s.transition(CallStatus::Active).is_err());
    }

    #[tokio::test]
    async fn test_response_guard_single_claim() {
        let s = state();
        assert!(s.begin_response_attempt());
        // Second attempt while pending is refused.
        assert!(!s.begin_response_attempt());

        s.mark_response_created();
        assert!(s.response_active());
        assert!(!s.begin_response_attempt());

        s.mark_response_done();
        assert!(!s.response_active());
        assert!(s.begin_response_attempt());
    }

    #[tokio::test]
    async fn test_output_stream_take() {
        let s = state();
        assert!(s.active_output_stream_id().is_none());
        s.set_active_output_stream_id("ps-1");
        assert_eq!(s.take_active_output_stream_id().as_deref(), Some("ps-1"));
        assert!(s.take_active_output_stream_id().is_none());
    }

    #[tokio::test]
    async fn test_status_listener_fires() {
        let s = state();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        s.on_status_change(Arc::new(move |from, to| {
            assert_eq!(from, CallStatus::Initializing);
            assert_eq!(to, CallStatus::Active);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));
        s.transition(CallStatus::Active).unwrap();
        // Listener runs on a spawned task.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_consistent_copy() {
        let s = state();
        s.set_peer_session_id("sess_1");
        s.set_telephony_stream_id("ts_1");
        let snap = s.snapshot();
        assert_eq!(snap.call_id, "c1");
        assert_eq!(snap.peer_session_id.as_deref(), Some("sess_1"));
        assert_eq!(snap.telephony_stream_id.as_deref(), Some("ts_1"));
        assert!(!snap.response_active);
    }
}
