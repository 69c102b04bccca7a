//! Local system voice (espeak-ng on Linux, `say` on macOS)

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::codec::{decode_wav, resample};
use super::{PLAYBACK_SAMPLE_RATE, SpeechRequest, SpeechResult, SpeechStream};
use crate::error::SynthesisErrorKind;
use crate::{Error, Result};

/// Upper bound on one synthesis run
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Words per minute at speed 1.0 (both engines default to this)
const BASE_WORDS_PER_MINUTE: f64 = 175.0;

/// Command-line dialect of the local engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    /// `espeak-ng -w <out> -s <wpm> --stdin`
    Espeak,
    /// `say -o <out> --data-format=LEI16@22050 -r <wpm> -f -`
    Say,
}

/// Synthesizes speech with the operating system's speech engine
///
/// Fully local. Fails only when no engine is installed or it crashes.
#[derive(Debug, Clone)]
pub struct SystemVoice {
    engine: Option<(PathBuf, Dialect)>,
    timeout: Duration,
}

impl SystemVoice {
    /// Find the platform speech engine on `PATH`
    ///
    /// A missing engine is not an error here; synthesis reports it.
    #[must_use]
    pub fn detect() -> Self {
        let candidates: &[(&str, Dialect)] = if cfg!(target_os = "macos") {
            &[("say", Dialect::Say)]
        } else {
            &[("espeak-ng", Dialect::Espeak), ("espeak", Dialect::Espeak)]
        };

        let engine = candidates
            .iter()
            .find_map(|(name, dialect)| which::which(name).ok().map(|path| (path, *dialect)));

        match &engine {
            Some((path, _)) => tracing::debug!(engine = %path.display(), "system voice found"),
            None => tracing::warn!("no system speech engine found on PATH"),
        }

        Self {
            engine,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Use an espeak-compatible program at `program`
    #[must_use]
    pub fn espeak(program: impl Into<PathBuf>) -> Self {
        Self {
            engine: Some((program.into(), Dialect::Espeak)),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// A system voice with no engine behind it
    #[must_use]
    pub const fn unavailable() -> Self {
        Self {
            engine: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Whether an engine was found
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.engine.is_some()
    }

    /// Synthesize `request` into a buffered stream
    ///
    /// # Errors
    ///
    /// Returns an `Unavailable` synthesis error if the engine is missing,
    /// fails or times out; [`Error::Cancelled`] if `cancel` fires
    pub async fn synthesize(
        &self,
        request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> SpeechResult {
        let Some((program, dialect)) = &self.engine else {
            return Err(Error::synthesis(
                SynthesisErrorKind::Unavailable,
                "no system speech engine installed",
            ));
        };

        let out_dir = tempfile::tempdir()?;
        let out_path = out_dir.path().join("speech.wav");

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let wpm = (BASE_WORDS_PER_MINUTE * request.speed().clamp(0.25, 4.0)).round() as u32;
        let out = out_path.display().to_string();
        let wpm = wpm.to_string();

        let args: Vec<&str> = match dialect {
            Dialect::Espeak => vec!["-w", &out, "-s", &wpm, "--stdin"],
            Dialect::Say => vec!["-o", &out, "--data-format=LEI16@22050", "-r", &wpm, "-f", "-"],
        };

        tracing::debug!(
            engine = %program.display(),
            chars = request.text().len(),
            wpm = %wpm,
            "running system voice"
        );

        let run = Self::run(program, &args, request.text());
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(self.timeout, run) => {
                result.map_err(|_| {
                    Error::synthesis(
                        SynthesisErrorKind::Unavailable,
                        format!("system voice timed out after {:?}", self.timeout),
                    )
                })??;
            }
        }

        let wav = tokio::fs::read(&out_path).await.map_err(|e| {
            Error::synthesis(
                SynthesisErrorKind::Unavailable,
                format!("system voice produced no output: {e}"),
            )
        })?;

        let (samples, rate) = decode_wav(&wav).map_err(|e| {
            Error::synthesis(
                SynthesisErrorKind::Protocol,
                format!("system voice output unreadable: {e}"),
            )
        })?;
        let samples = resample(&samples, rate, PLAYBACK_SAMPLE_RATE)?;

        if samples.is_empty() {
            return Err(Error::synthesis(
                SynthesisErrorKind::Unavailable,
                "system voice produced empty audio",
            ));
        }

        tracing::debug!(samples = samples.len(), source_rate = rate, "system voice done");
        Ok(SpeechStream::buffered(&samples))
    }

    /// Spawn the engine, feed `text` on stdin and wait for it
    async fn run(program: &Path, args: &[&str], text: &str) -> Result<()> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::synthesis(
                    SynthesisErrorKind::Unavailable,
                    format!("failed to start system voice: {e}"),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // An engine that exits early closes the pipe; its exit status
            // is the better error
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                tracing::debug!(error = %e, "system voice stdin closed early");
            }
            drop(stdin);
        }

        let output = child.wait_with_output().await.map_err(|e| {
            Error::synthesis(
                SynthesisErrorKind::Unavailable,
                format!("system voice failed: {e}"),
            )
        })?;

        if !output.stderr.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(stderr = %stderr.trim(), "system voice stderr");
        }

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            return Err(Error::synthesis(
                SynthesisErrorKind::Unavailable,
                format!("system voice exited with code {code}"),
            ));
        }

        Ok(())
    }
}
