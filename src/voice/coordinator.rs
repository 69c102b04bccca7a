//! Turn coordinator
//!
//! Sole writer of [`SessionState`]. Takes final transcripts from the STT
//! session, asks the [`Responder`] for a reply, and drives synthesis and
//! playback for it. Every turn runs in its own span tagged with a turn id.

use std::pin::pin;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::capture::CaptureEvent;
use super::playback::{PlaybackOutcome, PlaybackSink};
use super::state::{SessionState, SessionStateMachine, StateHandle};
use super::stt::TranscriptEvent;
use super::tts::Speaker;
use crate::{Error, Result};

/// What to say back for one utterance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Reply text; empty means stay silent
    pub text: String,
    /// End the session once the reply has been spoken
    pub end_session: bool,
}

impl Response {
    /// Speak `text` and keep listening
    pub fn say(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            end_session: false,
        }
    }

    /// Speak `text`, then end the session
    pub fn farewell(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            end_session: true,
        }
    }
}

/// Produces replies to finalized transcripts
#[async_trait]
pub trait Responder: Send {
    /// Reply to one utterance
    ///
    /// # Errors
    ///
    /// A failure is logged and the turn goes back to listening
    async fn respond(&mut self, transcript: &str) -> Result<Response>;
}

/// Repeats what it heard; "stop" or "goodbye" ends the session
#[derive(Debug, Default)]
pub struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(&mut self, transcript: &str) -> Result<Response> {
        let normalized = transcript
            .trim()
            .trim_end_matches(|c: char| c.is_ascii_punctuation())
            .to_lowercase();

        if matches!(normalized.as_str(), "stop" | "goodbye") {
            return Ok(Response::farewell("Goodbye."));
        }
        Ok(Response::say(format!("You said: {}", transcript.trim())))
    }
}

/// Why the session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Stop requested through the cancellation token
    Stopped,
    /// The responder ended the conversation
    Finished,
    /// The transcript stream closed
    InputClosed,
}

/// Outcome of one turn
enum TurnResult {
    /// Keep listening; a final heard during barge-in starts the next turn
    Continue(Option<String>),
    End(SessionEnd),
}

/// Owns the session state and runs the listen/respond/speak cycle
pub struct TurnCoordinator<R> {
    state: SessionStateMachine,
    speaker: Speaker,
    playback: PlaybackSink,
    responder: R,
    barge_in: bool,
    cancel: CancellationToken,
    capture_open: bool,
    user_activity: Option<watch::Receiver<bool>>,
}

impl<R: Responder> TurnCoordinator<R> {
    /// Create a coordinator in [`SessionState::Idle`]
    pub fn new(speaker: Speaker, playback: PlaybackSink, responder: R) -> Self {
        Self {
            state: SessionStateMachine::new(),
            speaker,
            playback,
            responder,
            barge_in: false,
            cancel: CancellationToken::new(),
            capture_open: true,
            user_activity: None,
        }
    }

    /// Let speech interrupt playback
    #[must_use]
    pub const fn with_barge_in(mut self, enabled: bool) -> Self {
        self.barge_in = enabled;
        self
    }

    /// Use `cancel` as the session stop signal
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Hold replies while `activity` reports the user mid-utterance
    #[must_use]
    pub fn with_user_activity(mut self, activity: watch::Receiver<bool>) -> Self {
        self.user_activity = Some(activity);
        self
    }

    /// Read-only view of the session state
    #[must_use]
    pub fn state_handle(&self) -> StateHandle {
        self.state.handle()
    }

    /// Token that stops the session when cancelled
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Active speaker, for runtime engine switches
    pub const fn speaker_mut(&mut self) -> &mut Speaker {
        &mut self.speaker
    }

    /// Move from Idle to Listening
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the session already started
    pub fn start(&self) -> Result<()> {
        if self.state.current() != SessionState::Idle {
            return Err(Error::InvalidTransition {
                from: self.state.current(),
                to: SessionState::Listening,
            });
        }
        self.state.transition(SessionState::Listening)?;
        tracing::info!("listening");
        Ok(())
    }

    /// Run turns until stopped, finished, or the input closes
    ///
    /// Starts the session if [`start`](Self::start) was not called. The state
    /// is Idle when this returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if capture reports the microphone lost
    pub async fn run(
        mut self,
        mut transcripts: mpsc::UnboundedReceiver<TranscriptEvent>,
        mut capture_events: mpsc::UnboundedReceiver<CaptureEvent>,
    ) -> Result<SessionEnd> {
        if self.state.current() == SessionState::Idle {
            self.start()?;
        }

        let result = self.run_turns(&mut transcripts, &mut capture_events).await;

        self.state.transition(SessionState::Idle)?;
        match &result {
            Ok(end) => tracing::info!(reason = ?end, "session ended"),
            Err(e) => tracing::error!(error = %e, "session failed"),
        }
        result
    }

    async fn run_turns(
        &mut self,
        transcripts: &mut mpsc::UnboundedReceiver<TranscriptEvent>,
        capture_events: &mut mpsc::UnboundedReceiver<CaptureEvent>,
    ) -> Result<SessionEnd> {
        let mut pending: Option<String> = None;

        loop {
            if let Some(text) = pending.take() {
                let turn_id = uuid::Uuid::new_v4();
                let span = tracing::info_span!("turn", id = %turn_id);
                match self
                    .handle_turn(text, transcripts, capture_events)
                    .instrument(span)
                    .await?
                {
                    TurnResult::Continue(next) => pending = next,
                    TurnResult::End(end) => return Ok(end),
                }
                continue;
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(SessionEnd::Stopped),
                event = capture_events.recv(), if self.capture_open => match event {
                    Some(CaptureEvent::DeviceLost(reason)) => return Err(Error::Device(reason)),
                    None => self.capture_open = false,
                },
                event = transcripts.recv() => match event {
                    None => return Ok(SessionEnd::InputClosed),
                    Some(TranscriptEvent::Partial(text)) => {
                        tracing::debug!(partial = %text, "hearing");
                    }
                    Some(TranscriptEvent::Final { text, confidence }) => {
                        if text.trim().is_empty() {
                            tracing::debug!("empty transcript, still listening");
                        } else {
                            tracing::info!(transcript = %text, confidence, "heard");
                            pending = Some(text);
                        }
                    }
                },
            }
        }
    }

    /// Listening → Processing → (Speaking) → Listening for one transcript
    async fn handle_turn(
        &mut self,
        transcript: String,
        transcripts: &mut mpsc::UnboundedReceiver<TranscriptEvent>,
        capture_events: &mut mpsc::UnboundedReceiver<CaptureEvent>,
    ) -> Result<TurnResult> {
        self.state.transition(SessionState::Processing)?;

        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(TurnResult::End(SessionEnd::Stopped)),
            response = self.responder.respond(&transcript) => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "responder failed");
                self.state.transition(SessionState::Listening)?;
                return Ok(TurnResult::Continue(None));
            }
        };

        let text = response.text.trim().to_string();
        if text.is_empty() {
            tracing::debug!("empty response, nothing to say");
            if response.end_session {
                return Ok(TurnResult::End(SessionEnd::Finished));
            }
            self.state.transition(SessionState::Listening)?;
            return Ok(TurnResult::Continue(None));
        }

        if !self.wait_for_quiet(capture_events).await? {
            return Ok(TurnResult::End(SessionEnd::Stopped));
        }

        let request = self.speaker.request(text.as_str());
        self.state.transition(SessionState::Speaking)?;
        tracing::info!(reply = %text, engine = %self.speaker.engine(), "speaking");

        let turn_cancel = self.cancel.child_token();
        let speaker = &mut self.speaker;
        let playback = &self.playback;
        let speak_cancel = turn_cancel.clone();
        let mut speak = pin!(async move {
            let stream = speaker.synthesize(&request, &speak_cancel).await?;
            playback.play(stream, &speak_cancel).await
        });

        let mut next_turn = None;
        let mut lost_device = None;
        let mut input_closed = false;

        let outcome = loop {
            tokio::select! {
                biased;
                outcome = &mut speak => break outcome,
                event = capture_events.recv(), if self.capture_open && lost_device.is_none() => {
                    match event {
                        Some(CaptureEvent::DeviceLost(reason)) => {
                            lost_device = Some(reason);
                            turn_cancel.cancel();
                        }
                        None => self.capture_open = false,
                    }
                }
                event = transcripts.recv(), if self.barge_in && !input_closed => match event {
                    Some(TranscriptEvent::Partial(heard)) if !heard.trim().is_empty() => {
                        if !turn_cancel.is_cancelled() {
                            tracing::info!(partial = %heard, "barge-in, stopping playback");
                            turn_cancel.cancel();
                        }
                    }
                    Some(TranscriptEvent::Final { text, .. }) if !text.trim().is_empty() => {
                        turn_cancel.cancel();
                        next_turn = Some(text);
                    }
                    Some(_) => {}
                    None => input_closed = true,
                },
            }
        };

        match outcome {
            Ok(PlaybackOutcome::Completed { frames, .. }) => {
                tracing::debug!(frames, "reply spoken");
            }
            Ok(PlaybackOutcome::Cancelled { frames }) => {
                tracing::debug!(frames, "reply interrupted");
            }
            Err(Error::Cancelled) => tracing::debug!("reply cancelled"),
            Err(e) => {
                // Text fallback so the reply is not lost
                tracing::warn!(error = %e, reply = %text, "could not speak reply");
            }
        }

        if self.cancel.is_cancelled() {
            return Ok(TurnResult::End(SessionEnd::Stopped));
        }
        if let Some(reason) = lost_device {
            return Err(Error::Device(reason));
        }
        if response.end_session {
            return Ok(TurnResult::End(SessionEnd::Finished));
        }

        self.state.transition(SessionState::Listening)?;
        if input_closed {
            return Ok(TurnResult::End(SessionEnd::InputClosed));
        }
        Ok(TurnResult::Continue(next_turn))
    }

    /// Wait until the user is not mid-utterance; `Ok(false)` on stop
    async fn wait_for_quiet(
        &mut self,
        capture_events: &mut mpsc::UnboundedReceiver<CaptureEvent>,
    ) -> Result<bool> {
        let Some(activity) = self.user_activity.as_mut() else {
            return Ok(true);
        };

        let mut held = false;
        loop {
            let speaking = *activity.borrow_and_update();
            if !speaking {
                if held {
                    tracing::debug!("user finished, releasing reply");
                }
                return Ok(true);
            }
            if !held {
                tracing::debug!("user is speaking, holding reply");
                held = true;
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(false),
                event = capture_events.recv(), if self.capture_open => match event {
                    Some(CaptureEvent::DeviceLost(reason)) => return Err(Error::Device(reason)),
                    None => self.capture_open = false,
                },
                changed = activity.changed() => {
                    // Recognizer gone; nobody left to wait for
                    if changed.is_err() {
                        return Ok(true);
                    }
                }
            }
        }
    }
}
