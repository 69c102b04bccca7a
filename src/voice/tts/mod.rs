//! Text-to-speech (TTS) backends
//!
//! A closed set of backends sits behind [`TtsBackend::synthesize`]. The
//! [`Speaker`] picks the active backend and falls back to the local system
//! voice when a network provider rejects its credential.

mod chunking;
pub mod codec;
mod elevenlabs;
mod openai;
pub mod retry;
mod system;

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use chunking::{OPENAI_MAX_CHARS, chunk_text};
pub use elevenlabs::{DEFAULT_ELEVENLABS_VOICE, ElevenLabsTts, elevenlabs_voice_id};
pub use openai::{DEFAULT_OPENAI_VOICE, OpenAiTts};
pub use retry::RetryPolicy;
pub use system::SystemVoice;

use super::frame::{AudioFrame, FrameAssembler, split_into_frames};
use crate::config::{OutputFormat, TtsEngine, TtsEngineConfig};
use crate::error::SynthesisErrorKind;
use crate::{Error, Result};

/// Sample rate of all synthesized audio handed to playback
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Samples per playback frame (20ms at 24kHz)
pub const PLAYBACK_FRAME_SAMPLES: usize = 480;

/// Frames buffered between a streaming provider and playback
const STREAM_CHANNEL_FRAMES: usize = 64;

/// Text to synthesize plus optional voice parameters
///
/// Immutable once submitted; backends only borrow it.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    text: String,
    backend: TtsEngine,
    voice: Option<String>,
    speed: Option<f64>,
    output_format: OutputFormat,
}

impl SpeechRequest {
    /// Create a request for `backend` with provider defaults
    #[must_use]
    pub fn new(text: impl Into<String>, backend: TtsEngine) -> Self {
        Self {
            text: text.into(),
            backend,
            voice: None,
            speed: None,
            output_format: OutputFormat::default(),
        }
    }

    /// Set the voice name or id
    #[must_use]
    pub fn with_voice(mut self, voice: Option<String>) -> Self {
        self.voice = voice;
        self
    }

    /// Set the speaking rate (1.0 is normal)
    #[must_use]
    pub const fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Set the provider output format
    #[must_use]
    pub const fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub const fn backend(&self) -> TtsEngine {
        self.backend
    }

    #[must_use]
    pub fn voice(&self) -> Option<&str> {
        self.voice.as_deref()
    }

    /// Speaking rate, 1.0 when unset
    #[must_use]
    pub fn speed(&self) -> f64 {
        self.speed.unwrap_or(1.0)
    }

    #[must_use]
    pub const fn output_format(&self) -> OutputFormat {
        self.output_format
    }

    /// Whether there is nothing to say
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Same request retargeted at another backend with its default voice
    #[must_use]
    pub fn retarget(&self, backend: TtsEngine) -> Self {
        Self {
            backend,
            voice: None,
            ..self.clone()
        }
    }
}

/// Outcome of a synthesis call: audio ready for playback, or why not
pub type SpeechResult = Result<SpeechStream>;

/// Ordered audio frames at [`PLAYBACK_SAMPLE_RATE`]
///
/// Buffered backends hold every frame up front. Streaming backends fill the
/// stream from a background task while playback drains it.
pub struct SpeechStream {
    head: VecDeque<AudioFrame>,
    rx: Option<mpsc::Receiver<Result<AudioFrame>>>,
}

impl SpeechStream {
    /// Stream over a fully buffered clip
    #[must_use]
    pub fn buffered(samples: &[f32]) -> Self {
        Self {
            head: split_into_frames(samples, PLAYBACK_SAMPLE_RATE, PLAYBACK_FRAME_SAMPLES).into(),
            rx: None,
        }
    }

    /// Stream with no audio
    #[must_use]
    pub fn silent() -> Self {
        Self {
            head: VecDeque::new(),
            rx: None,
        }
    }

    /// Stream fed incrementally through the returned sink
    pub(crate) fn channel() -> (SpeechSink, Self) {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_FRAMES);
        (
            SpeechSink {
                tx,
                assembler: FrameAssembler::new(PLAYBACK_FRAME_SAMPLES, PLAYBACK_SAMPLE_RATE),
            },
            Self {
                head: VecDeque::new(),
                rx: Some(rx),
            },
        )
    }

    /// Wait for the first frame so that early failures surface here
    pub(crate) async fn prime(mut self) -> SpeechResult {
        match self.recv().await {
            Some(Ok(frame)) => {
                self.head.push_front(frame);
                Ok(self)
            }
            Some(Err(e)) => Err(e),
            None => Err(Error::synthesis(
                SynthesisErrorKind::Protocol,
                "provider returned no audio",
            )),
        }
    }

    async fn recv(&mut self) -> Option<Result<AudioFrame>> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Next frame in order; `None` once the audio is complete
    pub async fn next_frame(&mut self) -> Option<Result<AudioFrame>> {
        if let Some(frame) = self.head.pop_front() {
            return Some(Ok(frame));
        }
        self.recv().await
    }

    /// Drain the whole stream into one buffer
    ///
    /// # Errors
    ///
    /// Returns the first mid-stream failure
    pub async fn collect_samples(mut self) -> Result<Vec<f32>> {
        let mut samples = Vec::new();
        while let Some(frame) = self.next_frame().await {
            samples.extend_from_slice(&frame?.samples);
        }
        Ok(samples)
    }
}

/// Producer half of a streaming [`SpeechStream`]
pub(crate) struct SpeechSink {
    tx: mpsc::Sender<Result<AudioFrame>>,
    assembler: FrameAssembler,
}

impl SpeechSink {
    /// Queue samples; `false` once the consumer has gone away
    pub(crate) async fn push(&mut self, samples: &[f32]) -> bool {
        for frame in self.assembler.push(samples) {
            if self.tx.send(Ok(frame)).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Flush the tail frame and close the stream
    pub(crate) async fn finish(mut self) {
        if let Some(frame) = self.assembler.flush() {
            let _ = self.tx.send(Ok(frame)).await;
        }
    }

    /// End the stream with a failure
    pub(crate) async fn fail(self, err: Error) {
        let _ = self.tx.send(Err(err)).await;
    }
}

/// The closed set of synthesis backends
pub enum TtsBackend {
    /// Local OS speech engine
    System(SystemVoice),
    /// ElevenLabs streaming HTTP API
    ElevenLabs(ElevenLabsTts),
    /// `OpenAI` speech endpoint
    OpenAi(OpenAiTts),
}

impl TtsBackend {
    /// Build the configured backend
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a network backend has no credential
    pub fn from_config(config: &TtsEngineConfig) -> Result<Self> {
        let credential = || {
            config.credential.clone().ok_or_else(|| {
                Error::Config(format!("no API key for the {} TTS engine", config.engine))
            })
        };

        Ok(match config.engine {
            TtsEngine::System => Self::System(SystemVoice::detect()),
            TtsEngine::ElevenLabs => Self::ElevenLabs(ElevenLabsTts::new(credential()?)),
            TtsEngine::OpenAi => Self::OpenAi(OpenAiTts::new(credential()?)),
        })
    }

    /// Which engine this is
    #[must_use]
    pub const fn engine(&self) -> TtsEngine {
        match self {
            Self::System(_) => TtsEngine::System,
            Self::ElevenLabs(_) => TtsEngine::ElevenLabs,
            Self::OpenAi(_) => TtsEngine::OpenAi,
        }
    }

    /// Synthesize `request`
    ///
    /// Returns once the first audio frame is ready or failure is certain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Synthesis`] classified by [`SynthesisErrorKind`], or
    /// [`Error::Cancelled`]
    pub async fn synthesize(
        &self,
        request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> SpeechResult {
        let span = tracing::debug_span!("synthesize", engine = %self.engine());

        async move {
            match self {
                Self::System(voice) => voice.synthesize(request, cancel).await,
                Self::ElevenLabs(client) => client.synthesize(request, cancel).await,
                Self::OpenAi(client) => client.synthesize(request, cancel).await,
            }
        }
        .instrument(span)
        .await
    }
}

/// Picks the active backend and handles runtime fallback
pub struct Speaker {
    backend: TtsBackend,
    fallback: Option<SystemVoice>,
    voice: Option<String>,
    speed: f64,
    output_format: OutputFormat,
}

impl Speaker {
    /// Speaker over `backend` with provider defaults and no fallback
    #[must_use]
    pub const fn new(backend: TtsBackend) -> Self {
        Self {
            backend,
            fallback: None,
            voice: None,
            speed: 1.0,
            output_format: OutputFormat::Pcm,
        }
    }

    /// Build from resolved engine config
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the backend cannot be built
    pub fn from_config(config: &TtsEngineConfig) -> Result<Self> {
        let backend = TtsBackend::from_config(config)?;
        // Kept even for the system engine; a runtime switch may need it
        let fallback = config.fallback_to_system.then(SystemVoice::detect);

        Ok(Self {
            backend,
            fallback,
            voice: config.voice.clone(),
            speed: config.speed,
            output_format: config.output_format,
        })
    }

    /// Fall back to `voice` when a network backend rejects its credential
    #[must_use]
    pub fn with_fallback(mut self, voice: SystemVoice) -> Self {
        self.fallback = Some(voice);
        self
    }

    /// Default voice parameters for new requests
    #[must_use]
    pub fn with_voice_params(
        mut self,
        voice: Option<String>,
        speed: f64,
        format: OutputFormat,
    ) -> Self {
        self.voice = voice;
        self.speed = speed;
        self.output_format = format;
        self
    }

    /// Active engine
    #[must_use]
    pub const fn engine(&self) -> TtsEngine {
        self.backend.engine()
    }

    /// Replace the active backend without restarting the session
    ///
    /// A configured system-voice fallback still applies to the new backend.
    pub fn set_backend(&mut self, backend: TtsBackend) {
        tracing::info!(from = %self.engine(), to = %backend.engine(), "switching TTS engine");
        // A configured voice belongs to the old provider
        if backend.engine() != self.engine() {
            self.voice = None;
        }
        self.backend = backend;
    }

    /// Build a request for the active backend
    #[must_use]
    pub fn request(&self, text: impl Into<String>) -> SpeechRequest {
        SpeechRequest::new(text, self.engine())
            .with_voice(self.voice.clone())
            .with_speed(self.speed)
            .with_output_format(self.output_format)
    }

    /// Synthesize `request`, falling back to the system voice on auth or
    /// quota failures
    ///
    /// Empty text never reaches a backend. After a fallback the system voice
    /// stays active for the rest of the session.
    ///
    /// # Errors
    ///
    /// Returns the synthesis error when no backend could produce audio
    pub async fn synthesize(
        &mut self,
        request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> SpeechResult {
        if request.is_empty() {
            tracing::debug!("empty speech request, nothing to synthesize");
            return Ok(SpeechStream::silent());
        }

        let err = match self.backend.synthesize(request, cancel).await {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };

        if err.synthesis_kind() != Some(SynthesisErrorKind::AuthOrQuota) {
            return Err(err);
        }

        // Stays configured so a later switch back to a provider is covered
        let Some(fallback) = self.fallback.clone() else {
            return Err(err);
        };

        tracing::warn!(
            engine = %self.engine(),
            error = %err,
            "TTS provider rejected request, falling back to system voice"
        );
        self.backend = TtsBackend::System(fallback);
        self.voice = None;

        let retry = request.retarget(TtsEngine::System);
        self.backend.synthesize(&retry, cancel).await
    }
}
