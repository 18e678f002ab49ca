/// Peer channel abstraction and the bridge capability handle.
///
/// A peer (telephony platform or Realtime model) is a bidirectional
/// message channel carrying JSON text frames. Transport adapters (axum
/// WebSocket, tungstenite client, local substitute) pump the actual socket
/// on their own reader/writer tasks and expose only channel ends here, so
/// the bridge core never touches a socket and tests can drive it entirely
/// in memory.
///
/// `BridgeHandle` is the narrow capability object handed to the audio
/// stream handler and the function dispatcher instead of a back-pointer to
/// the bridge: send to either peer, claim the response guard, schedule a
/// hang-up. Nothing else.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::realtime_protocol::ClientEvent;
use crate::session::{CallStatus, SessionState};
use crate::stats::Stats;
use crate::telephony_protocol::TelephonyOutbound;

/// The bridge-facing side of a peer: send on `outbound`, read on `inbound`.
#[derive(Debug)]
pub struct PeerConnection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// The far side of an in-memory peer — held by tests and the local model
/// substitute.
pub struct PeerEndpoint {
    /// Frames the bridge sent to this peer.
    pub incoming: mpsc::Receiver<String>,
    /// Inject frames toward the bridge.
    pub outgoing: mpsc::Sender<String>,
}

impl PeerConnection {
    /// Cross-wired in-memory pair.
    pub fn pair(capacity: usize) -> (PeerConnection, PeerEndpoint) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        (
            PeerConnection {
                outbound: out_tx,
                inbound: in_rx,
            },
            PeerEndpoint {
                incoming: out_rx,
                outgoing: in_tx,
            },
        )
    }
}

/// Commands posted back into the bridge pump from worker tasks.
#[derive(Debug, Clone)]
pub enum BridgeCommand {
    /// Orderly termination with a reason, e.g. from a scheduled hang-up.
    Hangup { reason_code: String, reason: String },
}

#[derive(Clone)]
pub struct BridgeHandle {
    session: Arc<SessionState>,
    to_model: mpsc::Sender<String>,
    to_telephony: mpsc::Sender<String>,
    commands: mpsc::Sender<BridgeCommand>,
    cancel: CancellationToken,
    stats: Arc<Stats>,
    /// `turn_detection.create_response`: when true, the model auto-creates
    /// responses and `request_response` never sends `response.create`.
    auto_response: bool,
    hangup_scheduled: Arc<AtomicBool>,
}

impl BridgeHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<SessionState>,
        to_model: mpsc::Sender<String>,
        to_telephony: mpsc::Sender<String>,
        commands: mpsc::Sender<BridgeCommand>,
        cancel: CancellationToken,
        stats: Arc<Stats>,
        auto_response: bool,
    ) -> Self {
        BridgeHandle {
            session,
            to_model,
            to_telephony,
            commands,
            cancel,
            stats,
            auto_response,
            hangup_scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn send_to_model(&self, event: &ClientEvent) -> anyhow::Result<()> {
        let text = serde_json::to_string(event)?;
        self.to_model
            .send(text)
            .await
            .map_err(|_| anyhow::anyhow!("model peer channel closed"))
    }

    pub async fn send_to_telephony(&self, event: &TelephonyOutbound) -> anyhow::Result<()> {
        let text = serde_json::to_string(event)?;
        self.to_telephony
            .send(text)
            .await
            .map_err(|_| anyhow::anyhow!("telephony peer channel closed"))
    }

    /// Non-blocking telephony send for the egress audio path. Returns
    /// `Ok(false)` when the transport is saturated (caller keeps the frame
    /// queued), `Err` when the peer is gone.
    pub fn try_send_to_telephony(&self, event: &TelephonyOutbound) -> anyhow::Result<bool> {
        let text = serde_json::to_string(event)?;
        match self.to_telephony.try_send(text) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(anyhow::anyhow!("telephony peer channel closed"))
            }
        }
    }

    /// Request a model response, honoring the single-active-response guard
    /// and the response-creation policy. Returns whether `response.create`
    /// was actually sent.
    pub async fn request_response(&self) -> anyhow::Result<bool> {
        if self.auto_response {
            debug!("response creation left to server-side turn detection");
            return Ok(false);
        }
        if !self.session.begin_response_attempt() {
            info!("response already active — skipping response.create");
            return Ok(false);
        }
        self.send_to_model(&ClientEvent::ResponseCreate).await?;
        Ok(true)
    }

    /// Cancel the in-flight response (barge-in). The guard is released when
    /// the cancellation is confirmed by a terminal response event.
    pub async fn cancel_response(&self) -> anyhow::Result<()> {
        self.stats.record_barge_in();
        self.send_to_model(&ClientEvent::ResponseCancel).await
    }

    /// Schedule orderly termination after `delay` (lets farewell audio
    /// play out). Marks the call Closing now; if the call is already
    /// Closing or Closed this is a no-op, as is the delayed firing when the
    /// bridge closed in the meantime.
    pub fn schedule_hangup(&self, reason_code: &str, reason: &str, delay: Duration) {
        if self.hangup_scheduled.swap(true, Ordering::SeqCst) {
            debug!("hang-up already scheduled");
            return;
        }
        if self.session.transition(CallStatus::Closing).is_err() {
            debug!(status = %self.session.status(), "hang-up trigger after Closing — no-op");
            return;
        }

        info!(
            reason_code = reason_code,
            reason = reason,
            delay_ms = delay.as_millis() as u64,
            "📞 hang-up scheduled"
        );

        let commands = self.commands.clone();
        let cancel = self.cancel.clone();
        let reason_code = reason_code.to_string();
        let reason = reason.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("scheduled hang-up superseded by shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    if commands
                        .send(BridgeCommand::Hangup {
                            reason_code,
                            reason,
                        })
                        .await
                        .is_err()
                    {
                        warn!("bridge gone before scheduled hang-up fired");
                    }
                }
            }
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telephony_protocol::MediaFormat;
    use serde_json::Value;

    fn handle_with_peers(
        auto_response: bool,
    ) -> (BridgeHandle, PeerEndpoint, PeerEndpoint, mpsc::Receiver<BridgeCommand>) {
        let session = SessionState::new("c1", MediaFormat::pcm16_16k());
        let (model_conn, model_far) = PeerConnection::pair(16);
        let (tel_conn, tel_far) = PeerConnection::pair(16);
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let handle = BridgeHandle::new(
            session,
            model_conn.outbound,
            tel_conn.outbound,
            cmd_tx,
            CancellationToken::new(),
            Stats::new(),
            auto_response,
        );
        (handle, model_far, tel_far, cmd_rx)
    }

    #[tokio::test]
    async fn test_request_response_guard() {
        let (handle, mut model, _tel, _cmd) = handle_with_peers(false);

        assert!(handle.request_response().await.unwrap());
        let raw = model.incoming.recv().await.unwrap();
        let v: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["type"], "response.create");

        // Second attempt while the first is pending is suppressed.
        assert!(!handle.request_response().await.unwrap());

        handle.session().mark_response_created();
        assert!(!handle.request_response().await.unwrap());

        handle.session().mark_response_done();
        assert!(handle.request_response().await.unwrap());
    }

    #[tokio::test]
    async fn test_auto_response_policy_never_creates() {
        let (handle, mut model, _tel, _cmd) = handle_with_peers(true);
        assert!(!handle.request_response().await.unwrap());
        assert!(model.incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_schedule_hangup_fires_command() {
        let (handle, _model, _tel, mut cmd_rx) = handle_with_peers(false);
        handle.session().transition(CallStatus::Active).unwrap();

        handle.schedule_hangup("normal", "all tasks finished", Duration::from_millis(20));
        assert_eq!(handle.session().status(), CallStatus::Closing);

        let cmd = tokio::time::timeout(Duration::from_millis(500), cmd_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match cmd {
            BridgeCommand::Hangup { reason_code, .. } => assert_eq!(reason_code, "normal"),
        }
    }

    #[tokio::test]
    async fn test_schedule_hangup_idempotent_after_closing() {
        let (handle, _model, _tel, mut cmd_rx) = handle_with_peers(false);
        handle.session().transition(CallStatus::Closing).unwrap();

        handle.schedule_hangup("normal", "done", Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_schedule_hangup_cancelled_by_shutdown() {
        let (handle, _model, _tel, mut cmd_rx) = handle_with_peers(false);
        handle.session().transition(CallStatus::Active).unwrap();

        handle.schedule_hangup("normal", "done", Duration::from_millis(60));
        handle.cancel_token().cancel();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cmd_rx.try_recv().is_err());
    }
}
