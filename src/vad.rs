/// Voice-activity detection with hysteresis.
///
/// The probability source is a pluggable scorer (the default maps RMS energy
/// to [0, 1]); only the state machine below is contractual:
///
/// ```text
/// Idle ──2 frames ≥ speech_threshold──▶ Started ──next frame──▶ Active
///   ▲                                                             │
///   │                3 silent frames + min duration,              │
///   └── Stopped ◀────or force-stop timeout───────────────────────┘
/// ```
///
/// Frames are f32 mono: 512 samples at 16 kHz, 256 at 8 kHz (32 ms each).
use tracing::debug;

/// Onset hysteresis: consecutive speech frames required to leave Idle.
const ONSET_FRAMES: u32 = 2;
/// Release hysteresis: consecutive silent frames required to leave Active.
const RELEASE_FRAMES: u32 = 3;

/// Where scorer inference runs. The energy scorer ignores this; a neural
/// scorer would use it to pick an execution provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VadDevice {
    #[default]
    Cpu,
    Gpu,
}

#[derive(Debug, Clone)]
pub struct VadConfig {
    pub speech_threshold: f32,
    /// Compared with `≤`, so it may sit above `speech_threshold` for
    /// asymmetric tuning.
    pub silence_threshold: f32,
    pub min_speech_duration_ms: u64,
    pub force_stop_timeout_ms: u64,
    pub device: VadDevice,
    pub sample_rate: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        VadConfig {
            speech_threshold: 0.5,
            silence_threshold: 0.6,
            min_speech_duration_ms: 500,
            force_stop_timeout_ms: 2_000,
            device: VadDevice::Cpu,
            sample_rate: 16_000,
        }
    }
}

impl VadConfig {
    /// Expected frame length in samples for the configured rate.
    pub fn chunk_samples(&self) -> usize {
        match self.sample_rate {
            8_000 => 256,
            _ => 512,
        }
    }

    /// Frame duration in milliseconds (32 ms at both supported rates).
    pub fn frame_ms(&self) -> u64 {
        (self.chunk_samples() as u64) * 1000 / (self.sample_rate as u64)
    }
}

/// Detector phase after a processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Idle,
    /// Onset confirmed this frame.
    Started,
    Active,
    /// Speech segment ended this frame.
    Stopped,
}

/// Per-frame detector output.
#[derive(Debug, Clone)]
pub struct VadFrame {
    pub speech_prob: f32,
    pub is_speech: bool,
    pub state: VadState,
    /// Set when `Stopped` was forced by the segment-length timeout rather
    /// than by detected silence.
    pub force_stop: bool,
    pub speech_duration_ms: u64,
}

// ─────────────────────────────────────────────────────────────────────
//  Scorers — black-box speech probability per frame
// ─────────────────────────────────────────────────────────────────────

/// Maps an audio frame to a speech probability in [0, 1].
///
/// Implementors may be stateful (hidden states, smoothing). Swap in a neural
/// scorer without touching the state machine.
pub trait SpeechScorer: Send {
    fn score(&mut self, frame: &[f32]) -> f32;

    fn reset(&mut self) {}
}

/// RMS energy scorer. Normalizes frame RMS against a reference level so that
/// conversational speech lands near 1.0 and line noise near 0.
pub struct EnergyScorer {
    reference_rms: f32,
}

impl EnergyScorer {
    pub fn new() -> Self {
        EnergyScorer {
            reference_rms: 0.04,
        }
    }
}

impl Default for EnergyScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechScorer for EnergyScorer {
    fn score(&mut self, frame: &[f32]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = frame.iter().map(|s| s * s).sum();
        let rms = (sum_sq / (frame.len() as f32)).sqrt();
        (rms / self.reference_rms).min(1.0)
    }
}

// ─────────────────────────────────────────────────────────────────────
//  Engine — hysteresis state machine over scorer output
// ─────────────────────────────────────────────────────────────────────

pub struct VadEngine {
    config: VadConfig,
    scorer: Box<dyn SpeechScorer>,
    state: VadState,
    onset_frames: u32,
    silence_frames: u32,
    speech_frames: u64,
}

impl VadEngine {
    pub fn new(config: VadConfig) -> Self {
        Self::with_scorer(config, Box::new(EnergyScorer::new()))
    }

    pub fn with_scorer(config: VadConfig, scorer: Box<dyn SpeechScorer>) -> Self {
        VadEngine {
            config,
            scorer,
            state: VadState::Idle,
            onset_frames: 0,
            silence_frames: 0,
            speech_frames: 0,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Return to Idle and clear all counters and scorer state.
    pub fn reset(&mut self) {
        self.state = VadState::Idle;
        self.onset_frames = 0;
        self.silence_frames = 0;
        self.speech_frames = 0;
        self.scorer.reset();
    }

    /// Process one frame and advance the state machine.
    pub fn process(&mut self, frame: &[f32]) -> VadFrame {
        if frame.len() != self.config.chunk_samples() {
            debug!(
                got = frame.len(),
                expected = self.config.chunk_samples(),
                "VAD frame size mismatch"
            );
        }

        let prob = self.scorer.score(frame).clamp(0.0, 1.0);
        let is_speech = prob >= self.config.speech_threshold;
        let frame_ms = self.config.frame_ms();

        // Stopped drains back to Idle before this frame is evaluated.
        if self.state == VadState::Stopped {
            self.state = VadState::Idle;
            self.onset_frames = 0;
            self.silence_frames = 0;
            self.speech_frames = 0;
        }

        let mut force_stop = false;

        match self.state {
            VadState::Idle => {
                if is_speech {
                    self.onset_frames += 1;
                    if self.onset_frames >= ONSET_FRAMES {
                        self.state = VadState::Started;
                        self.speech_frames = ONSET_FRAMES as u64;
                        self.silence_frames = 0;
                    }
                } else {
                    self.onset_frames = 0;
                }
            }
            VadState::Started | VadState::Active => {
                self.state = VadState::Active;
                self.speech_frames += 1;

                if prob <= self.config.silence_threshold {
                    self.silence_frames += 1;
                } else {
                    self.silence_frames = 0;
                }

                let duration = self.speech_frames * frame_ms;
                if duration >= self.config.force_stop_timeout_ms {
                    self.state = VadState::Stopped;
                    force_stop = true;
                } else if self.silence_frames >= RELEASE_FRAMES
                    && duration >= self.config.min_speech_duration_ms
                {
                    self.state = VadState::Stopped;
                }
            }
            VadState::Stopped => unreachable!("drained to Idle above"),
        }

        VadFrame {
            speech_prob: prob,
            is_speech,
            state: self.state,
            force_stop,
            speech_duration_ms: self.speech_frames * frame_ms,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    /// Scorer that replays a fixed probability sequence.
    struct ScriptedScorer {
        probs: Vec<f32>,
        pos: usize,
    }

    impl ScriptedScorer {
        fn new(probs: &[f32]) -> Box<Self> {
            Box::new(ScriptedScorer {
                probs: probs.to_vec(),
                pos: 0,
            })
        }
    }

    impl SpeechScorer for ScriptedScorer {
        fn score(&mut self, _frame: &[f32]) -> f32 {
            let p = self.probs[self.pos % self.probs.len()];
            self.pos += 1;
            p
        }
    }

    fn run_sequence(config: VadConfig, probs: &[f32]) -> Vec<VadFrame> {
        let mut engine = VadEngine::with_scorer(config.clone(), ScriptedScorer::new(probs));
        let frame = vec![0.0f32; config.chunk_samples()];
        probs.iter().map(|_| engine.process(&frame)).collect()
    }

    #[test]
    fn test_onset_requires_two_frames() {
        let frames = run_sequence(VadConfig::default(), &[0.9, 0.9, 0.1, 0.1, 0.1]);
        let states: Vec<VadState> = frames.iter().map(|f| f.state).collect();
        // Default min duration (500 ms) is longer than 5 × 32 ms, so the
        // silence run cannot close the segment yet.
        assert_eq!(
            states,
            vec![
                VadState::Idle,
                VadState::Started,
                VadState::Active,
                VadState::Active,
                VadState::Active,
            ]
        );
        assert!(frames.iter().all(|f| !f.force_stop));
    }

    #[test]
    fn test_silence_release_with_min_duration_met() {
        let config = VadConfig {
            min_speech_duration_ms: 0,
            ..VadConfig::default()
        };
        let frames = run_sequence(config, &[0.9, 0.9, 0.1, 0.1, 0.1]);
        let states: Vec<VadState> = frames.iter().map(|f| f.state).collect();
        assert_eq!(
            states,
            vec![
                VadState::Idle,
                VadState::Started,
                VadState::Active,
                VadState::Active,
                VadState::Stopped,
            ]
        );
        assert!(!frames[4].force_stop);
    }

    #[test]
    fn test_single_spike_does_not_start() {
        let frames = run_sequence(VadConfig::default(), &[0.9, 0.1, 0.9, 0.1]);
        assert!(frames.iter().all(|f| f.state == VadState::Idle));
    }

    #[test]
    fn test_force_stop_on_long_speech() {
        // 2000 ms / 32 ms = 62.5 frames of continuous speech.
        let probs = vec![0.9f32; 70];
        let frames = run_sequence(VadConfig::default(), &probs);

        let stop_idx = frames
            .iter()
            .position(|f| f.state == VadState::Stopped)
            .expect("expected a forced stop");
        assert!(frames[stop_idx].force_stop);
        assert!(frames[stop_idx].speech_duration_ms >= 2_000);
        // Drains to Idle, then re-arms on the continuing speech.
        assert_eq!(frames[stop_idx + 1].state, VadState::Idle);
        assert_eq!(frames[stop_idx + 2].state, VadState::Started);
    }

    #[test]
    fn test_stopped_drains_to_idle() {
        let config = VadConfig {
            min_speech_duration_ms: 0,
            ..VadConfig::default()
        };
        let frames = run_sequence(config, &[0.9, 0.9, 0.1, 0.1, 0.1, 0.1]);
        assert_eq!(frames[4].state, VadState::Stopped);
        assert_eq!(frames[5].state, VadState::Idle);
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut engine = VadEngine::with_scorer(
            VadConfig::default(),
            ScriptedScorer::new(&[0.9, 0.9, 0.9]),
        );
        let frame = vec![0.0f32; 512];
        engine.process(&frame);
        engine.process(&frame);
        assert_eq!(engine.state(), VadState::Started);
        engine.reset();
        assert_eq!(engine.state(), VadState::Idle);
    }

    #[test]
    fn test_energy_scorer_silence_and_speech() {
        let mut scorer = EnergyScorer::new();
        assert_eq!(scorer.score(&vec![0.0f32; 512]), 0.0);
        let loud: Vec<f32> = (0..512).map(|i| ((i as f32) * 0.3).sin() * 0.5).collect();
        assert!(scorer.score(&loud) > 0.9);
    }

    #[test]
    fn test_frame_geometry() {
        let cfg16 = VadConfig::default();
        assert_eq!(cfg16.chunk_samples(), 512);
        assert_eq!(cfg16.frame_ms(), 32);
        let cfg8 = VadConfig {
            sample_rate: 8_000,
            ..VadConfig::default()
        };
        assert_eq!(cfg8.chunk_samples(), 256);
        assert_eq!(cfg8.frame_ms(), 32);
    }
}
