//! TOML configuration file loading
//!
//! Supports `~/.config/parley/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ParleyConfigFile {
    /// Speech session configuration
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// TTS configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Local STT configuration
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Voice activity detection tuning
    #[serde(default)]
    pub vad: VadFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Speech session configuration
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    /// Keep listening while speaking so the user can interrupt
    pub barge_in: Option<bool>,

    /// Capacity of the capture→STT frame queue
    pub capture_queue_frames: Option<usize>,
}

/// TTS configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// TTS engine ("system", "elevenlabs", "openai")
    pub tts_engine: Option<String>,

    /// Voice identifier (e.g. "alloy", "Rachel")
    pub tts_voice: Option<String>,

    /// Speaking rate multiplier
    pub tts_speed: Option<f64>,

    /// Output format ("pcm" or "mp3")
    pub output_format: Option<String>,

    /// Fall back to the system voice when a network engine rejects the key
    pub fallback_to_system: Option<bool>,
}

/// Local STT configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// Path to the recognition model
    pub model: Option<PathBuf>,

    /// Path to the external scorer
    pub scorer: Option<PathBuf>,
}

/// Voice activity detection tuning
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub energy_threshold: Option<f32>,
    pub onset_frames: Option<usize>,
    pub trailing_silence_ms: Option<u64>,
    pub max_utterance_ms: Option<u64>,
    pub partial_interval_frames: Option<usize>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ParleyConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file() -> ParleyConfigFile {
    config_file_path().map_or_else(ParleyConfigFile::default, |path| load_config_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
#[must_use]
pub fn load_config_from(path: &Path) -> ParleyConfigFile {
    if !path.exists() {
        return ParleyConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ParleyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ParleyConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/parley/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("parley").join("config.toml"))
}
