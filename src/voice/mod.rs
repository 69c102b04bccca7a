//! Voice processing module
//!
//! Capture → STT session → turn coordinator → TTS backend → playback.
//! Hardware sits behind the [`InputDevice`] and [`OutputDevice`] traits and
//! recognition behind [`Recognizer`].

mod capture;
mod coordinator;
mod frame;
mod playback;
mod queue;
mod state;
mod stt;
pub mod tts;
mod vad;
#[cfg(feature = "whisper")]
mod whisper;

pub use capture::{
    ActiveStream, AudioCapture, CaptureEvent, CaptureLinks, CpalInput, ErrorCallback, InputDevice,
    MAX_REOPEN_ATTEMPTS, SampleCallback,
};
pub use coordinator::{EchoResponder, Responder, Response, SessionEnd, TurnCoordinator};
pub use frame::{
    AudioFrame, FRAME_DURATION, FRAME_SAMPLES, FrameAssembler, SAMPLE_RATE, StreamResampler, rms,
    samples_duration, split_into_frames,
};
pub use playback::{CpalOutput, OutputDevice, OutputStream, PlaybackOutcome, PlaybackSink};
pub use queue::{FrameReceiver, FrameSender, frame_queue};
pub use state::{SessionState, SessionStateMachine, StateHandle};
pub use stt::{
    MAX_RECOGNIZER_RESTARTS, Recognizer, RecognizerFactory, SttSession, Transcript,
    TranscriptEvent, recognizer_factory,
};
pub use tts::{
    PLAYBACK_SAMPLE_RATE, SpeechRequest, SpeechResult, SpeechStream, Speaker, SystemVoice,
    TtsBackend,
};
pub use vad::{VadEvent, VadState, VoiceActivityDetector};
#[cfg(feature = "whisper")]
pub use whisper::{WhisperRecognizer, load_model};
