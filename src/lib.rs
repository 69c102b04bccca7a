//! Parley - speech input/output orchestration for voice assistants
//!
//! This library provides the core of a local voice loop:
//! - Microphone capture and energy-based voice activity detection
//! - Speech-to-text sessions over a pluggable recognizer
//! - A turn coordinator that owns the session state
//! - Text-to-speech through the system voice, `ElevenLabs` or `OpenAI`
//! - Interruptible playback
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  frames  ┌─────────────┐  transcripts  ┌──────────────────┐
//! │ Capture  ├─────────►│ STT session ├──────────────►│ Turn coordinator │
//! └────▲─────┘          └─────────────┘               └────────┬─────────┘
//!      │ session state (watch)                                 │ reply
//!      └───────────────────────────────────────────┐           ▼
//!                                          ┌───────┴──┐  ┌──────────┐
//!                                          │ Playback │◄─┤ Speaker  │
//!                                          └──────────┘  └──────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod voice;

pub use config::{Config, EngineConfig};
pub use daemon::{SpeechDaemon, run_session};
pub use error::{Error, Result};
