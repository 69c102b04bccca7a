//! Speech-to-text (STT) session
//!
//! Consumes capture frames in order, finds utterance boundaries with the
//! VAD and runs the local recognizer on each utterance. Results leave as an
//! ordered stream of [`TranscriptEvent`]s.

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::frame::AudioFrame;
use super::queue::FrameReceiver;
use super::vad::{VadEvent, VoiceActivityDetector};
use crate::config::{SttEngineConfig, VadConfig};
use crate::{Error, Result};

/// Recognizer rebuilds allowed before a decode failure becomes fatal
pub const MAX_RECOGNIZER_RESTARTS: u32 = 1;

/// Transcript produced by the STT session
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    /// Running hypothesis for the open utterance; may be superseded
    Partial(String),
    /// Settled text for a closed utterance, emitted once per utterance
    Final { text: String, confidence: f32 },
}

/// One decode result
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// Mean token probability in `[0.0, 1.0]`
    pub confidence: f32,
}

/// Local recognition engine
///
/// Decoding is blocking and runs off the async runtime.
pub trait Recognizer: Send + 'static {
    /// Decode 16kHz mono samples
    ///
    /// # Errors
    ///
    /// Returns [`Error::Recognition`] if the engine fails
    fn decode(&mut self, samples: &[f32]) -> Result<Transcript>;
}

/// Builds a fresh recognizer; called at startup and on restart
pub type RecognizerFactory = Box<dyn Fn() -> Result<Box<dyn Recognizer>> + Send + Sync>;

/// Factory for the local recognition engine named by `config`
///
/// The model is loaded here, once; restarts reuse it.
///
/// # Errors
///
/// Returns [`Error::Config`] if the model cannot be loaded or no
/// recognition engine was compiled in
#[cfg(feature = "whisper")]
pub fn recognizer_factory(config: &SttEngineConfig) -> Result<RecognizerFactory> {
    use super::whisper::{WhisperRecognizer, load_model};

    if let Some(scorer) = &config.scorer_path {
        tracing::debug!(scorer = %scorer.display(), "Whisper has no external scorer, ignoring");
    }

    let ctx = load_model(&config.model_path)?;
    Ok(Box::new(move || {
        Ok(Box::new(WhisperRecognizer::new(std::sync::Arc::clone(&ctx))) as Box<dyn Recognizer>)
    }))
}

/// Factory for the local recognition engine named by `config`
///
/// # Errors
///
/// Always returns [`Error::Config`]: this build has no recognition engine
#[cfg(not(feature = "whisper"))]
pub fn recognizer_factory(config: &SttEngineConfig) -> Result<RecognizerFactory> {
    Err(Error::Config(format!(
        "cannot load {}: built without a recognition engine (rebuild with --features whisper)",
        config.model_path.display()
    )))
}

/// Feeds frames to a recognizer and emits transcript events
pub struct SttSession {
    factory: RecognizerFactory,
    recognizer: Option<Box<dyn Recognizer>>,
    vad: VoiceActivityDetector,
    partial_interval: usize,
    listen_while_speaking: bool,
    restarts: u32,
    /// Whether an utterance is open; the coordinator holds replies while set
    activity: watch::Sender<bool>,
}

/// Audio gathered for the open utterance
#[derive(Default)]
struct Utterance {
    samples: Vec<f32>,
    open: bool,
    since_partial: usize,
    last_partial: String,
}

impl Utterance {
    fn clear(&mut self) {
        self.samples.clear();
        self.open = false;
        self.since_partial = 0;
        self.last_partial.clear();
    }
}

impl SttSession {
    /// Build the session and load the recognizer
    ///
    /// # Errors
    ///
    /// Returns the factory's error; a model that cannot be loaded is a
    /// configuration error raised before capture starts
    pub fn new(factory: RecognizerFactory, vad: VadConfig) -> Result<Self> {
        let recognizer = factory()?;
        let partial_interval = vad.partial_interval_frames.max(1);

        Ok(Self {
            factory,
            recognizer: Some(recognizer),
            vad: VoiceActivityDetector::new(vad),
            partial_interval,
            listen_while_speaking: false,
            restarts: 0,
            activity: watch::channel(false).0,
        })
    }

    /// Keep transcribing frames captured while the assistant speaks
    #[must_use]
    pub const fn listen_while_speaking(mut self, enabled: bool) -> Self {
        self.listen_while_speaking = enabled;
        self
    }

    /// Follows whether the user is mid-utterance
    #[must_use]
    pub fn user_activity(&self) -> watch::Receiver<bool> {
        self.activity.subscribe()
    }

    fn set_active(&self, open: bool) {
        self.activity.send_if_modified(|active| {
            let changed = *active != open;
            *active = open;
            changed
        });
    }

    /// Run until the frame queue closes or `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns [`Error::Recognition`] once the recognizer has failed again
    /// after its restart
    pub async fn run(
        mut self,
        frames: FrameReceiver,
        events: mpsc::UnboundedSender<TranscriptEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let result = self.process(frames, &events, &cancel).await;
        self.set_active(false);
        result
    }

    async fn process(
        &mut self,
        mut frames: FrameReceiver,
        events: &mpsc::UnboundedSender<TranscriptEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut utterance = Utterance::default();

        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("STT session cancelled");
                    return Ok(());
                }
                frame = frames.recv() => frame,
            };

            let Some(frame) = frame else {
                // End of input; close any open utterance
                if utterance.open {
                    self.finalize(&mut utterance, events, cancel).await?;
                }
                tracing::debug!("frame queue closed, STT session ending");
                return Ok(());
            };

            if frame.muted && !self.listen_while_speaking {
                if utterance.open || !utterance.samples.is_empty() {
                    tracing::debug!("discarding utterance overlapped by playback");
                    utterance.clear();
                    self.vad.reset();
                    self.set_active(false);
                }
                continue;
            }

            let backlog = frames.len() > frames.capacity() / 2;
            match self
                .on_frame(frame, &mut utterance, backlog, events, cancel)
                .await
            {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(Error::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Handle one frame; `Ok(false)` means the event consumer is gone
    async fn on_frame(
        &mut self,
        frame: AudioFrame,
        utterance: &mut Utterance,
        backlog: bool,
        events: &mpsc::UnboundedSender<TranscriptEvent>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        match self.vad.process(&frame) {
            VadEvent::Silence => {
                if self.vad.in_onset() {
                    utterance.samples.extend_from_slice(&frame.samples);
                } else {
                    utterance.samples.clear();
                }
                Ok(true)
            }
            VadEvent::SpeechStart => {
                utterance.samples.extend_from_slice(&frame.samples);
                utterance.open = true;
                utterance.since_partial = 0;
                self.set_active(true);
                tracing::debug!(at_ms = frame.timestamp.as_millis(), "utterance started");
                Ok(true)
            }
            VadEvent::Speech => {
                utterance.samples.extend_from_slice(&frame.samples);
                utterance.since_partial += 1;

                if utterance.since_partial < self.partial_interval {
                    return Ok(true);
                }
                utterance.since_partial = 0;

                if backlog {
                    tracing::debug!("decoder behind, skipping partial");
                    return Ok(true);
                }

                let samples = utterance.samples.clone();
                match self.decode(samples, cancel).await {
                    Ok(t) => {
                        let text = t.text.trim();
                        if !text.is_empty() && text != utterance.last_partial {
                            utterance.last_partial = text.to_string();
                            if events.send(TranscriptEvent::Partial(text.to_string())).is_err() {
                                return Ok(false);
                            }
                        }
                        Ok(true)
                    }
                    Err(Error::Cancelled) => Err(Error::Cancelled),
                    Err(e) => {
                        // The utterance stays open; its final decode runs on
                        // the rebuilt engine
                        self.restart(&e)?;
                        Ok(true)
                    }
                }
            }
            VadEvent::SpeechEnd => {
                utterance.samples.extend_from_slice(&frame.samples);
                self.finalize(utterance, events, cancel).await
            }
        }
    }

    /// Decode the closed utterance and emit its single Final event
    async fn finalize(
        &mut self,
        utterance: &mut Utterance,
        events: &mpsc::UnboundedSender<TranscriptEvent>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let samples = std::mem::take(&mut utterance.samples);
        utterance.clear();

        let event = match self.decode(samples, cancel).await {
            Ok(t) => {
                tracing::info!(
                    transcript = %t.text.trim(),
                    confidence = t.confidence,
                    "utterance transcribed"
                );
                TranscriptEvent::Final {
                    text: t.text.trim().to_string(),
                    confidence: t.confidence,
                }
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                self.restart(&e)?;
                self.vad.reset();
                TranscriptEvent::Final {
                    text: String::new(),
                    confidence: 0.0,
                }
            }
        };

        let delivered = events.send(event).is_ok();
        self.set_active(false);
        Ok(delivered)
    }

    /// Run the recognizer on the blocking pool
    async fn decode(
        &mut self,
        samples: Vec<f32>,
        cancel: &CancellationToken,
    ) -> Result<Transcript> {
        let mut recognizer = self
            .recognizer
            .take()
            .ok_or_else(|| Error::Recognition("recognizer unavailable".to_string()))?;

        let task = tokio::task::spawn_blocking(move || {
            let result = recognizer.decode(&samples);
            (recognizer, result)
        });

        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            joined = task => match joined {
                Ok((recognizer, result)) => {
                    self.recognizer = Some(recognizer);
                    if result.is_ok() {
                        self.restarts = 0;
                    }
                    result
                }
                Err(e) => Err(Error::Recognition(format!("decoder crashed: {e}"))),
            },
        }
    }

    /// Rebuild the recognizer after `cause`, or escalate
    fn restart(&mut self, cause: &Error) -> Result<()> {
        if self.restarts >= MAX_RECOGNIZER_RESTARTS {
            tracing::error!(error = %cause, "recognizer failed after restart");
            return Err(Error::Recognition(cause.to_string()));
        }

        self.restarts += 1;
        tracing::warn!(error = %cause, restart = self.restarts, "restarting recognizer");
        self.recognizer = Some((self.factory)()?);
        Ok(())
    }
}
