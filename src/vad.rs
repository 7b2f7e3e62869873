//! Client-side speech activity detection.
//!
//! Tracks per-frame RMS energy against an adaptive baseline and raises
//! "suspected speech" flags. The detector deliberately never makes a final
//! call on its own: energy cannot tell a caller's voice apart from our own
//! reply leaking back down the line, so the turn state machine must confirm
//! every suspicion against a transcript before acting on it.

use crate::codec::frame_rms;
use std::collections::VecDeque;

/// Tuning knobs for the energy detector. Values are on the 16-bit RMS scale.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Threshold used while the assistant is quiet.
    pub base_threshold: f64,
    /// Energy no plausible echo reaches; one frame at this level is enough.
    pub certain_speech_threshold: f64,
    /// Lower bound for the echo-adjusted threshold while responding.
    pub min_echo_floor: f64,
    /// Frames averaged for smoothing.
    pub smoothing_frames: usize,
    /// Frames kept for the idle-time ambient baseline median.
    pub baseline_frames: usize,
    /// Consecutive hot frames needed before raising suspicion.
    pub confirm_frames: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            base_threshold: 500.0,
            certain_speech_threshold: 4_000.0,
            min_echo_floor: 1_000.0,
            smoothing_frames: 5,
            baseline_frames: 20,
            confirm_frames: 2,
        }
    }
}

/// Energy-based detector with an echo-aware threshold.
///
/// While the assistant is responding, the threshold rises to twice the
/// ambient baseline measured during idle periods, so the caller has to be
/// meaningfully louder than the echo to register. Unmistakably loud frames
/// bypass the multi-frame confirmation so real interruptions are caught
/// within one frame.
pub struct SpeechActivityDetector {
    cfg: VadConfig,
    recent: VecDeque<f64>,
    baseline_window: VecDeque<f64>,
    consecutive_hot: usize,
}

impl SpeechActivityDetector {
    pub fn new(cfg: VadConfig) -> Self {
        Self {
            recent: VecDeque::with_capacity(cfg.smoothing_frames),
            baseline_window: VecDeque::with_capacity(cfg.baseline_frames),
            cfg,
            consecutive_hot: 0,
        }
    }

    /// Feed one frame and learn whether it looks like caller speech.
    ///
    /// `assistant_speaking` selects the echo-adjusted threshold and freezes
    /// baseline learning; the baseline must only ever describe ambient
    /// energy, not our own playback.
    pub fn assess(&mut self, samples: &[i16], assistant_speaking: bool) -> bool {
        let rms = frame_rms(samples);

        self.recent.push_back(rms);
        if self.recent.len() > self.cfg.smoothing_frames {
            self.recent.pop_front();
        }

        if !assistant_speaking {
            self.baseline_window.push_back(rms);
            if self.baseline_window.len() > self.cfg.baseline_frames {
                self.baseline_window.pop_front();
            }
        }

        let smoothed = self.recent.iter().sum::<f64>() / self.recent.len() as f64;

        let threshold = if assistant_speaking {
            (self.baseline() * 2.0).max(self.cfg.min_echo_floor)
        } else {
            self.cfg.base_threshold
        };

        if smoothed >= threshold {
            self.consecutive_hot += 1;
        } else {
            self.consecutive_hot = 0;
        }

        let needed = if assistant_speaking && smoothed >= self.cfg.certain_speech_threshold {
            1
        } else {
            self.cfg.confirm_frames
        };

        self.consecutive_hot >= needed
    }

    /// Median ambient energy from idle periods. Falls back to the base
    /// threshold until enough frames have been seen.
    pub fn baseline(&self) -> f64 {
        if self.baseline_window.is_empty() {
            return self.cfg.base_threshold;
        }
        let mut sorted: Vec<f64> = self.baseline_window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }
}
