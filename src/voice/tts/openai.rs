//! `OpenAI` speech endpoint

use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;

use super::chunking::{OPENAI_MAX_CHARS, chunk_text};
use super::codec::{decode_mp3, decode_pcm16, resample};
use super::retry::{RetryPolicy, classify_status, classify_transport, with_retry};
use super::{PLAYBACK_SAMPLE_RATE, SpeechRequest, SpeechResult, SpeechStream};
use crate::config::OutputFormat;
use crate::{Error, Result};

/// Voice used when the request names none
pub const DEFAULT_OPENAI_VOICE: &str = "alloy";

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "tts-1";
const PROVIDER: &str = "OpenAI";

#[derive(serde::Serialize)]
struct TtsRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    speed: f64,
}

/// Synthesizes speech with the `OpenAI` audio API
///
/// Text longer than the per-request limit is split into sub-requests that
/// run one after another, so their audio stays in text order.
#[derive(Clone)]
pub struct OpenAiTts {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    retry: RetryPolicy,
    max_chars: usize,
}

impl OpenAiTts {
    /// Create a client with the default model and endpoint
    #[must_use]
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            retry: RetryPolicy::default(),
            max_chars: OPENAI_MAX_CHARS,
        }
    }

    /// Override the API base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the per-request text limit
    #[must_use]
    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars.max(1);
        self
    }

    /// Synthesize `request`, returning once the first sub-request's audio
    /// is ready
    ///
    /// # Errors
    ///
    /// Returns the first sub-request's failure, or [`Error::Cancelled`].
    /// Later failures end the stream early.
    pub async fn synthesize(
        &self,
        request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> SpeechResult {
        let chunks = chunk_text(request.text(), self.max_chars);
        if chunks.is_empty() {
            return Ok(SpeechStream::silent());
        }

        tracing::debug!(
            chunks = chunks.len(),
            chars = request.text().len(),
            "OpenAI request"
        );

        let (mut sink, stream) = SpeechStream::channel();
        let client = self.clone();
        let voice = request.voice().unwrap_or(DEFAULT_OPENAI_VOICE).to_string();
        let speed = request.speed().clamp(0.25, 4.0);
        let format = request.output_format();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            for (index, chunk) in chunks.iter().enumerate() {
                let samples = match client.fetch(chunk, &voice, speed, format, &cancel).await {
                    Ok(samples) => samples,
                    Err(e) => {
                        if index > 0 {
                            tracing::warn!(index, error = %e, "OpenAI sub-request failed");
                        }
                        sink.fail(e).await;
                        return;
                    }
                };

                tracing::trace!(index, samples = samples.len(), "OpenAI sub-request done");
                if !sink.push(&samples).await {
                    tracing::debug!("speech consumer gone, dropping remaining sub-requests");
                    return;
                }
            }
            sink.finish().await;
        });

        stream.prime().await
    }

    /// One sub-request, decoded to playback-rate samples
    async fn fetch(
        &self,
        text: &str,
        voice: &str,
        speed: f64,
        format: OutputFormat,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>> {
        let response_format = match format {
            OutputFormat::Pcm => "pcm",
            OutputFormat::Mp3 => "mp3",
        };
        let body = TtsRequest {
            model: &self.model,
            input: text,
            voice,
            response_format,
            speed,
        };
        let url = format!("{}/v1/audio/speech", self.base_url);

        let audio = with_retry(&self.retry, cancel, PROVIDER, || self.send(&url, &body)).await?;

        match format {
            // Raw 24kHz 16-bit mono
            OutputFormat::Pcm => Ok(decode_pcm16(&audio)),
            OutputFormat::Mp3 => {
                let (samples, rate) = decode_mp3(&audio)?;
                resample(&samples, rate, PLAYBACK_SAMPLE_RATE)
            }
        }
    }

    async fn send(&self, url: &str, body: &TtsRequest<'_>) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(PROVIDER, status.as_u16(), &body));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;

        if audio.is_empty() {
            return Err(Error::synthesis(
                crate::error::SynthesisErrorKind::Protocol,
                "OpenAI returned an empty body",
            ));
        }
        Ok(audio.to_vec())
    }
}
