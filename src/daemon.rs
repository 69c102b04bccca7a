//! Speech daemon - wires the speech pipeline together
//!
//! Capture → STT session → turn coordinator → speaker → playback, all sharing
//! one cancellation token. Configuration and the recognition model are
//! validated before any audio device is opened.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::voice::{
    AudioCapture, CaptureLinks, CpalInput, CpalOutput, EchoResponder, InputDevice, OutputDevice,
    PlaybackSink, RecognizerFactory, Responder, SessionEnd, Speaker, SttSession, TurnCoordinator,
    frame_queue, recognizer_factory,
};
use crate::{Config, Error, Result};

/// The Parley daemon - runs one speech session on the default devices
pub struct SpeechDaemon {
    engines: EngineConfig,
}

impl SpeechDaemon {
    /// Validate configuration without touching audio hardware
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a missing model or credential
    pub fn new(config: &Config) -> Result<Self> {
        let engines = EngineConfig::resolve(config)?;
        Ok(Self { engines })
    }

    /// Resolved engine configuration
    #[must_use]
    pub const fn engines(&self) -> &EngineConfig {
        &self.engines
    }

    /// Run a session on the default devices until Ctrl-C or the session ends
    ///
    /// # Errors
    ///
    /// Returns error if the model cannot be loaded, a device cannot be
    /// opened, or the session fails
    pub async fn run(self) -> Result<SessionEnd> {
        // Model first, so a bad model never opens the microphone
        let factory = recognizer_factory(&self.engines.stt)?;
        let speaker = Speaker::from_config(&self.engines.tts)?;

        let input = CpalInput::new()?;
        let output = CpalOutput::new()?;

        let cancel = CancellationToken::new();
        let ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                ctrl_c.cancel();
            }
        });

        tracing::info!(
            tts_engine = %self.engines.tts.engine,
            barge_in = self.engines.barge_in,
            "parley ready - start speaking"
        );

        run_session(
            &self.engines,
            factory,
            input,
            output,
            speaker,
            EchoResponder,
            cancel,
        )
        .await
    }
}

/// Run one speech session over the given devices
///
/// Returns once the coordinator ends the session, after capture has been
/// stopped and the STT task has exited. A recognizer that failed for good is
/// reported even if the coordinator ended cleanly.
///
/// # Errors
///
/// Returns error if the recognizer cannot be built, capture cannot start,
/// the microphone is lost, or recognition fails permanently
pub async fn run_session<R>(
    engines: &EngineConfig,
    factory: RecognizerFactory,
    input: impl InputDevice,
    output: impl OutputDevice,
    speaker: Speaker,
    responder: R,
    cancel: CancellationToken,
) -> Result<SessionEnd>
where
    R: Responder,
{
    let stt = SttSession::new(factory, engines.stt.vad.clone())?
        .listen_while_speaking(engines.barge_in);

    let coordinator = TurnCoordinator::new(speaker, PlaybackSink::new(output), responder)
        .with_barge_in(engines.barge_in)
        .with_user_activity(stt.user_activity())
        .with_cancel(cancel.clone());

    let (frames_tx, frames_rx) = frame_queue(engines.capture_queue_frames);
    let (transcripts_tx, transcripts_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let mut capture = AudioCapture::new(input);
    capture.start(CaptureLinks {
        frames: frames_tx,
        state: coordinator.state_handle(),
        cancel: cancel.clone(),
        events: events_tx,
    })?;

    let stt_task = tokio::spawn(stt.run(frames_rx, transcripts_tx, cancel.clone()));

    let result = coordinator.run(transcripts_rx, events_rx).await;

    cancel.cancel();
    capture.stop();

    let stt_result = match stt_task.await {
        Ok(result) => result,
        Err(e) => Err(Error::Recognition(format!("STT task failed: {e}"))),
    };

    match (result, stt_result) {
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) if !matches!(e, Error::Cancelled) => Err(e),
        (Ok(end), _) => Ok(end),
    }
}
