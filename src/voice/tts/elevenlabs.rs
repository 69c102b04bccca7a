//! ElevenLabs streaming TTS

use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;

use super::codec::{PcmDecoder, decode_mp3, resample};
use super::retry::{RetryPolicy, classify_status, classify_transport, with_retry};
use super::{PLAYBACK_SAMPLE_RATE, SpeechRequest, SpeechResult, SpeechStream};
use crate::config::OutputFormat;
use crate::error::SynthesisErrorKind;
use crate::{Error, Result};

/// Voice used when the request names none
pub const DEFAULT_ELEVENLABS_VOICE: &str = "Rachel";

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";
const DEFAULT_MODEL: &str = "eleven_monolingual_v1";
const PROVIDER: &str = "ElevenLabs";

/// Public premade voices by display name
const PREMADE_VOICES: &[(&str, &str)] = &[
    ("rachel", "21m00Tcm4TlvDq8ikWAM"),
    ("domi", "AZnzlk1XvdvUeBnXmlld"),
    ("bella", "EXAVITQu4vr4xnSDxMaL"),
    ("antoni", "ErXwobaYiN019PkySvjV"),
    ("josh", "TxGEqnHWrfWFTfGW9XjX"),
    ("arnold", "VR6AewLTigWG4xSOukaG"),
    ("adam", "pNInz6obpgDQGcFmaJgB"),
    ("sam", "yoZ06aMxZJJ28mfd3POQ"),
];

/// Resolve a premade voice name to its id; anything else is taken as an id
#[must_use]
pub fn elevenlabs_voice_id(voice: &str) -> &str {
    PREMADE_VOICES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(voice))
        .map_or(voice, |&(_, id)| id)
}

#[derive(serde::Serialize)]
struct ElevenLabsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(serde::Serialize)]
struct VoiceSettings {
    stability: f64,
    similarity_boost: f64,
    speed: f64,
}

/// Response body, already past its first non-empty chunk
struct OpenStream {
    first: Vec<u8>,
    rest: BoxStream<'static, reqwest::Result<Vec<u8>>>,
}

/// Streams speech from the ElevenLabs API
#[derive(Clone)]
pub struct ElevenLabsTts {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    retry: RetryPolicy,
}

impl ElevenLabsTts {
    /// Create a client with the default model and endpoint
    #[must_use]
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the API base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the model id
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

    /// Synthesize `request`, returning once the first audio arrives
    ///
    /// # Errors
    ///
    /// Returns `AuthOrQuota` on any 4xx without retrying, `Transient` once
    /// retries are exhausted, or [`Error::Cancelled`]
    pub async fn synthesize(
        &self,
        request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> SpeechResult {
        let voice = elevenlabs_voice_id(request.voice().unwrap_or(DEFAULT_ELEVENLABS_VOICE));
        let format = request.output_format();
        let output_format = match format {
            OutputFormat::Pcm => "pcm_24000",
            OutputFormat::Mp3 => "mp3_44100_128",
        };

        let url = format!(
            "{}/v1/text-to-speech/{voice}/stream?output_format={output_format}",
            self.base_url
        );
        let body = ElevenLabsRequest {
            text: request.text(),
            model_id: &self.model,
            voice_settings: VoiceSettings {
                stability: 0.5,
                similarity_boost: 0.75,
                speed: request.speed().clamp(0.7, 1.2),
            },
        };

        tracing::debug!(
            voice,
            output_format,
            chars = request.text().len(),
            "ElevenLabs request"
        );

        let opened = with_retry(&self.retry, cancel, PROVIDER, || self.open(&url, &body)).await?;

        match format {
            OutputFormat::Pcm => Self::stream_pcm(opened, cancel.clone()).await,
            OutputFormat::Mp3 => Self::buffer_mp3(opened, cancel).await,
        }
    }

    /// Send the request and wait for the first body bytes
    async fn open(&self, url: &str, body: &ElevenLabsRequest<'_>) -> Result<OpenStream> {
        let response = self
            .client
            .post(url)
            .header("xi-api-key", self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(PROVIDER, status.as_u16(), &body));
        }

        let mut rest = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        loop {
            match rest.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => {}
                Some(Ok(first)) => return Ok(OpenStream { first, rest }),
                Some(Err(e)) => return Err(classify_transport(PROVIDER, &e)),
                None => {
                    return Err(Error::synthesis(
                        SynthesisErrorKind::Protocol,
                        "ElevenLabs returned an empty body",
                    ));
                }
            }
        }
    }

    /// Decode PCM as it arrives
    async fn stream_pcm(opened: OpenStream, cancel: CancellationToken) -> SpeechResult {
        let (mut sink, stream) = SpeechStream::channel();
        let OpenStream { first, mut rest } = opened;

        tokio::spawn(async move {
            let mut decoder = PcmDecoder::default();
            if !sink.push(&decoder.push(&first)).await {
                return;
            }

            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => {
                        sink.fail(Error::Cancelled).await;
                        return;
                    }
                    next = rest.next() => next,
                };

                match next {
                    Some(Ok(bytes)) => {
                        if !sink.push(&decoder.push(&bytes)).await {
                            tracing::debug!("speech consumer gone, dropping ElevenLabs stream");
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "ElevenLabs stream broke");
                        sink.fail(classify_transport(PROVIDER, &e)).await;
                        return;
                    }
                    None => {
                        sink.finish().await;
                        return;
                    }
                }
            }
        });

        stream.prime().await
    }

    /// MP3 frames cannot be decoded piecemeal here; buffer the body
    async fn buffer_mp3(opened: OpenStream, cancel: &CancellationToken) -> SpeechResult {
        let OpenStream { first, mut rest } = opened;
        let mut data = first;

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                next = rest.next() => next,
            };
            match next {
                Some(Ok(bytes)) => data.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(classify_transport(PROVIDER, &e)),
                None => break,
            }
        }

        let (samples, rate) = decode_mp3(&data)?;
        let samples = resample(&samples, rate, PLAYBACK_SAMPLE_RATE)?;
        Ok(SpeechStream::buffered(&samples))
    }
}
