//! Configuration management for Parley
//!
//! Layers, lowest priority first: built-in defaults, the TOML file,
//! environment variables, then CLI overrides. [`EngineConfig::resolve`]
//! validates the result once at startup.

pub mod file;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::{Error, Result};
use file::ParleyConfigFile;

/// Default capacity of the capture→STT frame queue (~3s at 30ms frames)
pub const DEFAULT_CAPTURE_QUEUE_FRAMES: usize = 100;

/// Default recognition model file name inside the data directory
const DEFAULT_MODEL_FILE: &str = "ggml-base.en.bin";

/// Text-to-speech engine selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TtsEngine {
    /// Local system voice (espeak-ng / say)
    #[default]
    System,
    /// ElevenLabs streaming API
    #[value(name = "elevenlabs")]
    ElevenLabs,
    /// `OpenAI` speech API
    #[value(name = "openai")]
    OpenAi,
}

impl TtsEngine {
    /// Whether this engine talks to a remote API
    #[must_use]
    pub const fn is_network(self) -> bool {
        !matches!(self, Self::System)
    }

    /// Stable name used in logs and config
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::ElevenLabs => "elevenlabs",
            Self::OpenAi => "openai",
        }
    }
}

impl FromStr for TtsEngine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "system" => Ok(Self::System),
            "elevenlabs" => Ok(Self::ElevenLabs),
            "openai" => Ok(Self::OpenAi),
            other => Err(Error::Config(format!(
                "unknown TTS engine: {other} (expected system, elevenlabs or openai)"
            ))),
        }
    }
}

impl std::fmt::Display for TtsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audio encoding requested from a TTS provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Raw 16-bit little-endian PCM
    #[default]
    Pcm,
    /// MP3, decoded locally before playback
    Mp3,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pcm" => Ok(Self::Pcm),
            "mp3" => Ok(Self::Mp3),
            other => Err(Error::Config(format!("unknown output format: {other}"))),
        }
    }
}

/// Voice activity detection tuning
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// RMS energy above which a frame counts as speech
    pub energy_threshold: f32,

    /// Consecutive speech frames required to open an utterance
    pub onset_frames: usize,

    /// Silence that closes an utterance
    pub trailing_silence: Duration,

    /// Utterances longer than this are force-finalized
    pub max_utterance: Duration,

    /// Frames between partial decodes
    pub partial_interval_frames: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.03,
            onset_frames: 3,
            trailing_silence: Duration::from_millis(700),
            max_utterance: Duration::from_secs(15),
            partial_interval_frames: 33,
        }
    }
}

/// Speech session configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Run the speech core at all
    pub enabled: bool,

    /// Keep listening while speaking
    pub barge_in: bool,

    /// Capacity of the capture→STT frame queue
    pub capture_queue_frames: usize,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            barge_in: false,
            capture_queue_frames: DEFAULT_CAPTURE_QUEUE_FRAMES,
        }
    }
}

/// TTS configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Selected engine
    pub tts_engine: TtsEngine,

    /// Voice identifier; engine default when unset
    pub tts_voice: Option<String>,

    /// Speaking rate multiplier (0.25 to 4.0)
    pub tts_speed: f64,

    /// Output format requested from network engines
    pub output_format: OutputFormat,

    /// Fall back to the system voice on auth/quota failures
    pub fallback_to_system: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            tts_engine: TtsEngine::System,
            tts_voice: None,
            tts_speed: 1.0,
            output_format: OutputFormat::Pcm,
            fallback_to_system: true,
        }
    }
}

/// Local STT configuration
#[derive(Debug, Clone, Default)]
pub struct SttConfig {
    /// Model file; the data-directory default when unset
    pub model_path: Option<PathBuf>,

    /// Optional external scorer file
    pub scorer_path: Option<PathBuf>,

    /// VAD tuning
    pub vad: VadConfig,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key
    pub openai: Option<SecretString>,

    /// `ElevenLabs` API key
    pub elevenlabs: Option<SecretString>,
}

/// Values taken from the command line
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub speech: bool,
    pub tts_engine: Option<TtsEngine>,
    pub tts_voice: Option<String>,
    pub stt_model: Option<PathBuf>,
    pub stt_scorer: Option<PathBuf>,
}

/// Parley configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub speech: SpeechConfig,
    pub voice: VoiceConfig,
    pub stt: SttConfig,
    pub api_keys: ApiKeys,
}

impl Config {
    /// Load configuration from the config file, environment and CLI
    ///
    /// # Errors
    ///
    /// Returns error if a configured value cannot be parsed
    pub fn load(overrides: &CliOverrides) -> Result<Self> {
        let file = file::load_config_file();
        Self::from_sources(file, |key| std::env::var(key).ok(), overrides)
    }

    /// Build configuration from explicit sources
    ///
    /// # Errors
    ///
    /// Returns error if a configured value cannot be parsed
    pub fn from_sources(
        fc: ParleyConfigFile,
        env: impl Fn(&str) -> Option<String>,
        overrides: &CliOverrides,
    ) -> Result<Self> {
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let api_keys = ApiKeys {
            openai: non_empty("OPENAI_API_KEY")
                .or(fc.api_keys.openai)
                .map(SecretString::from),
            elevenlabs: non_empty("ELEVENLABS_API_KEY")
                .or(fc.api_keys.elevenlabs)
                .map(SecretString::from),
        };

        let tts_engine = match overrides.tts_engine {
            Some(engine) => engine,
            None => non_empty("PARLEY_TTS_ENGINE")
                .or(fc.voice.tts_engine)
                .map(|s| s.parse())
                .transpose()?
                .unwrap_or_default(),
        };

        let output_format = fc
            .voice
            .output_format
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or_default();

        let voice = VoiceConfig {
            tts_engine,
            tts_voice: overrides
                .tts_voice
                .clone()
                .or_else(|| non_empty("PARLEY_TTS_VOICE"))
                .or(fc.voice.tts_voice),
            tts_speed: fc.voice.tts_speed.unwrap_or(1.0).clamp(0.25, 4.0),
            output_format,
            fallback_to_system: fc.voice.fallback_to_system.unwrap_or(true),
        };

        let defaults = VadConfig::default();
        let vad = VadConfig {
            energy_threshold: fc.vad.energy_threshold.unwrap_or(defaults.energy_threshold),
            onset_frames: fc.vad.onset_frames.unwrap_or(defaults.onset_frames).max(1),
            trailing_silence: fc
                .vad
                .trailing_silence_ms
                .map_or(defaults.trailing_silence, Duration::from_millis),
            max_utterance: fc
                .vad
                .max_utterance_ms
                .map_or(defaults.max_utterance, Duration::from_millis),
            partial_interval_frames: fc
                .vad
                .partial_interval_frames
                .unwrap_or(defaults.partial_interval_frames)
                .max(1),
        };

        let stt = SttConfig {
            model_path: overrides
                .stt_model
                .clone()
                .or_else(|| non_empty("PARLEY_STT_MODEL").map(PathBuf::from))
                .or(fc.stt.model),
            scorer_path: overrides
                .stt_scorer
                .clone()
                .or_else(|| non_empty("PARLEY_STT_SCORER").map(PathBuf::from))
                .or(fc.stt.scorer),
            vad,
        };

        let speech = SpeechConfig {
            enabled: overrides.speech,
            barge_in: non_empty("PARLEY_BARGE_IN")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .or(fc.speech.barge_in)
                .unwrap_or(false),
            capture_queue_frames: fc
                .speech
                .capture_queue_frames
                .unwrap_or(DEFAULT_CAPTURE_QUEUE_FRAMES)
                .max(1),
        };

        Ok(Self {
            speech,
            voice,
            stt,
            api_keys,
        })
    }
}

/// Resolved STT engine settings
#[derive(Debug, Clone)]
pub struct SttEngineConfig {
    pub model_path: PathBuf,
    pub scorer_path: Option<PathBuf>,
    pub vad: VadConfig,
}

/// Resolved TTS engine settings
#[derive(Debug, Clone)]
pub struct TtsEngineConfig {
    pub engine: TtsEngine,
    /// Opaque credential for network engines
    pub credential: Option<SecretString>,
    pub voice: Option<String>,
    pub speed: f64,
    pub output_format: OutputFormat,
    pub fallback_to_system: bool,
}

impl TtsEngineConfig {
    /// Resolve the TTS engine and its credential
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a network engine without a credential
    pub fn resolve(config: &Config) -> Result<Self> {
        let engine = config.voice.tts_engine;
        let credential = match engine {
            TtsEngine::System => None,
            TtsEngine::ElevenLabs => Some(require_key(
                config.api_keys.elevenlabs.as_ref(),
                "ELEVENLABS_API_KEY",
                engine,
            )?),
            TtsEngine::OpenAi => Some(require_key(
                config.api_keys.openai.as_ref(),
                "OPENAI_API_KEY",
                engine,
            )?),
        };

        Ok(Self {
            engine,
            credential,
            voice: config.voice.tts_voice.clone(),
            speed: config.voice.tts_speed,
            output_format: config.voice.output_format,
            fallback_to_system: config.voice.fallback_to_system,
        })
    }
}

/// Resolved, validated engine configuration
///
/// Built once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub stt: SttEngineConfig,
    pub tts: TtsEngineConfig,
    pub barge_in: bool,
    pub capture_queue_frames: usize,
}

impl EngineConfig {
    /// Validate `config` and resolve file paths and credentials
    ///
    /// Nothing here touches an audio device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for missing or empty model/scorer files and
    /// for a network engine without a credential
    pub fn resolve(config: &Config) -> Result<Self> {
        let model_path = match &config.stt.model_path {
            Some(path) => path.clone(),
            None => default_model_path().ok_or_else(|| {
                Error::Config("could not determine default STT model location".to_string())
            })?,
        };
        check_model_file("STT model", &model_path)?;

        if let Some(scorer) = &config.stt.scorer_path {
            check_model_file("STT scorer", scorer)?;
        }

        let tts = TtsEngineConfig::resolve(config)?;

        tracing::debug!(
            model = %model_path.display(),
            scorer = ?config.stt.scorer_path,
            tts_engine = %tts.engine,
            "resolved engine configuration"
        );

        Ok(Self {
            stt: SttEngineConfig {
                model_path,
                scorer_path: config.stt.scorer_path.clone(),
                vad: config.stt.vad.clone(),
            },
            tts,
            barge_in: config.speech.barge_in,
            capture_queue_frames: config.speech.capture_queue_frames,
        })
    }
}

/// Default model location: `<data dir>/parley/models/ggml-base.en.bin`
#[must_use]
pub fn default_model_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.data_dir()
            .join("parley")
            .join("models")
            .join(DEFAULT_MODEL_FILE)
    })
}

fn check_model_file(what: &str, path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)
        .map_err(|_| Error::Config(format!("{what} not found: {}", path.display())))?;

    if !meta.is_file() {
        return Err(Error::Config(format!(
            "{what} is not a file: {}",
            path.display()
        )));
    }
    if meta.len() == 0 {
        return Err(Error::Config(format!("{what} is empty: {}", path.display())));
    }

    Ok(())
}

fn require_key(key: Option<&SecretString>, var: &str, engine: TtsEngine) -> Result<SecretString> {
    key.filter(|k| !k.expose_secret().trim().is_empty())
        .cloned()
        .ok_or_else(|| Error::Config(format!("{var} required for the {engine} TTS engine")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn model_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"model bytes").unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(
            ParleyConfigFile::default(),
            env_from(&[]),
            &CliOverrides::default(),
        )
        .unwrap();

        assert_eq!(config.voice.tts_engine, TtsEngine::System);
        assert!(config.voice.fallback_to_system);
        assert!(!config.speech.barge_in);
        assert_eq!(config.speech.capture_queue_frames, DEFAULT_CAPTURE_QUEUE_FRAMES);
        assert!(config.api_keys.openai.is_none());
    }

    #[test]
    fn test_cli_overrides_env_and_file() {
        let fc: ParleyConfigFile = toml::from_str("[voice]\ntts_engine = \"openai\"").unwrap();
        let overrides = CliOverrides {
            tts_engine: Some(TtsEngine::ElevenLabs),
            ..CliOverrides::default()
        };

        let config = Config::from_sources(
            fc,
            env_from(&[("PARLEY_TTS_ENGINE", "system")]),
            &overrides,
        )
        .unwrap();
        assert_eq!(config.voice.tts_engine, TtsEngine::ElevenLabs);
    }

    #[test]
    fn test_env_overrides_file() {
        let fc: ParleyConfigFile = toml::from_str("[api_keys]\nopenai = \"from-file\"").unwrap();
        let config = Config::from_sources(
            fc,
            env_from(&[("OPENAI_API_KEY", "from-env"), ("PARLEY_TTS_ENGINE", "openai")]),
            &CliOverrides::default(),
        )
        .unwrap();

        assert_eq!(config.voice.tts_engine, TtsEngine::OpenAi);
        assert_eq!(
            config.api_keys.openai.as_ref().unwrap().expose_secret(),
            "from-env"
        );
    }

    #[test]
    fn test_unknown_engine_rejected() {
        let result = Config::from_sources(
            ParleyConfigFile::default(),
            env_from(&[("PARLEY_TTS_ENGINE", "festival")]),
            &CliOverrides::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_speed_is_clamped() {
        let fc: ParleyConfigFile = toml::from_str("[voice]\ntts_speed = 9.0").unwrap();
        let config =
            Config::from_sources(fc, env_from(&[]), &CliOverrides::default()).unwrap();
        assert!((config.voice.tts_speed - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_resolve_missing_model_is_config_error() {
        let mut config = Config::default();
        config.stt.model_path = Some(PathBuf::from("missing.pbmm"));

        let err = EngineConfig::resolve(&config).unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("missing.pbmm")));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_resolve_missing_scorer_is_config_error() {
        let model = model_file();
        let mut config = Config::default();
        config.stt.model_path = Some(model.path().to_path_buf());
        config.stt.scorer_path = Some(PathBuf::from("/nonexistent/kenlm.scorer"));

        assert!(matches!(
            EngineConfig::resolve(&config),
            Err(Error::Config(msg)) if msg.contains("scorer")
        ));
    }

    #[test]
    fn test_resolve_empty_model_rejected() {
        let empty = tempfile::NamedTempFile::new().unwrap();
        let mut config = Config::default();
        config.stt.model_path = Some(empty.path().to_path_buf());

        assert!(matches!(
            EngineConfig::resolve(&config),
            Err(Error::Config(msg)) if msg.contains("empty")
        ));
    }

    #[test]
    fn test_resolve_requires_network_credential() {
        let model = model_file();
        let mut config = Config::default();
        config.stt.model_path = Some(model.path().to_path_buf());
        config.voice.tts_engine = TtsEngine::ElevenLabs;

        assert!(matches!(
            EngineConfig::resolve(&config),
            Err(Error::Config(msg)) if msg.contains("ELEVENLABS_API_KEY")
        ));

        config.api_keys.elevenlabs = Some(SecretString::from("xi-key".to_string()));
        let resolved = EngineConfig::resolve(&config).unwrap();
        assert_eq!(resolved.tts.engine, TtsEngine::ElevenLabs);
        assert!(resolved.tts.credential.is_some());
    }

    #[test]
    fn test_resolve_system_needs_no_credential() {
        let model = model_file();
        let mut config = Config::default();
        config.stt.model_path = Some(model.path().to_path_buf());

        let resolved = EngineConfig::resolve(&config).unwrap();
        assert_eq!(resolved.tts.engine, TtsEngine::System);
        assert!(resolved.tts.credential.is_none());
        assert!(resolved.stt.scorer_path.is_none());
    }
}
