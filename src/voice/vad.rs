//! Energy-based voice activity detection
//!
//! Decides where an utterance starts and ends. An utterance opens after
//! `onset_frames` consecutive frames above the energy threshold and closes
//! after `trailing_silence` of quiet, or when it hits `max_utterance`.

use std::time::Duration;

use super::frame::AudioFrame;
use crate::config::VadConfig;

/// State of the voice activity detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// Waiting for speech
    Idle,
    /// Energy seen, waiting for enough consecutive frames
    Onset,
    /// Inside an utterance
    Speaking,
}

/// What a frame meant for the current utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Nothing of interest
    Silence,
    /// An utterance just opened; the onset frames belong to it
    SpeechStart,
    /// Frame belongs to the open utterance
    Speech,
    /// Utterance closed by trailing silence or the length cap
    SpeechEnd,
}

/// Detects utterance boundaries in a frame stream
pub struct VoiceActivityDetector {
    config: VadConfig,
    state: VadState,
    onset_count: usize,
    silence: Duration,
    utterance: Duration,
}

impl VoiceActivityDetector {
    /// Create a detector with the given tuning
    #[must_use]
    pub fn new(config: VadConfig) -> Self {
        tracing::debug!(
            threshold = config.energy_threshold,
            onset_frames = config.onset_frames,
            trailing_silence_ms = config.trailing_silence.as_millis(),
            "voice activity detector initialized"
        );

        Self {
            config,
            state: VadState::Idle,
            onset_count: 0,
            silence: Duration::ZERO,
            utterance: Duration::ZERO,
        }
    }

    /// Feed one frame
    pub fn process(&mut self, frame: &AudioFrame) -> VadEvent {
        let energy = frame.energy();
        let is_speech = energy > self.config.energy_threshold;
        let duration = frame.duration();

        match self.state {
            VadState::Idle | VadState::Onset => {
                if !is_speech {
                    self.reset();
                    return VadEvent::Silence;
                }

                self.onset_count += 1;
                self.utterance += duration;
                if self.onset_count >= self.config.onset_frames {
                    self.state = VadState::Speaking;
                    self.silence = Duration::ZERO;
                    tracing::trace!(energy, "speech detected");
                    VadEvent::SpeechStart
                } else {
                    self.state = VadState::Onset;
                    VadEvent::Silence
                }
            }
            VadState::Speaking => {
                self.utterance += duration;
                if is_speech {
                    self.silence = Duration::ZERO;
                } else {
                    self.silence += duration;
                }

                if self.silence >= self.config.trailing_silence {
                    tracing::debug!(
                        utterance_ms = self.utterance.as_millis(),
                        "utterance complete"
                    );
                    self.reset();
                    return VadEvent::SpeechEnd;
                }

                if self.utterance >= self.config.max_utterance {
                    tracing::debug!(
                        utterance_ms = self.utterance.as_millis(),
                        "utterance hit length cap"
                    );
                    self.reset();
                    return VadEvent::SpeechEnd;
                }

                VadEvent::Speech
            }
        }
    }

    /// Whether the onset run has started (frames may belong to an utterance)
    #[must_use]
    pub fn in_onset(&self) -> bool {
        self.state == VadState::Onset
    }

    /// Reset to idle
    pub fn reset(&mut self) {
        self.state = VadState::Idle;
        self.onset_count = 0;
        self.silence = Duration::ZERO;
        self.utterance = Duration::ZERO;
    }

    /// Get current state
    #[must_use]
    pub const fn state(&self) -> VadState {
        self.state
    }
}
