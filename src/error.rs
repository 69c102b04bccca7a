//! Error types for Parley

use thiserror::Error;

/// Result type alias for Parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a synthesis attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisErrorKind {
    /// Timeout, connection failure or 5xx; worth retrying
    Transient,
    /// Rejected credential or exhausted quota (4xx); never retried
    AuthOrQuota,
    /// Local engine missing or crashed
    Unavailable,
    /// Cancelled by a stop request
    Cancelled,
    /// Provider returned something we could not decode
    Protocol,
}

/// Errors that can occur in the speech core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (bad paths, missing credentials)
    #[error("configuration error: {0}")]
    Config(String),

    /// Capture or playback device unavailable or lost
    #[error("device error: {0}")]
    Device(String),

    /// Recognition engine failure
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Text-to-speech failure
    #[error("synthesis error ({kind:?}): {message}")]
    Synthesis {
        kind: SynthesisErrorKind,
        message: String,
    },

    /// Playback failed or underran
    #[error("playback error: {0}")]
    Playback(String),

    /// Operation cancelled by a stop request
    #[error("cancelled")]
    Cancelled,

    /// Session state change not allowed by the turn state machine
    #[error("invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::voice::SessionState,
        to: crate::voice::SessionState,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// WAV decoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl Error {
    /// Shorthand for a synthesis error
    #[must_use]
    pub fn synthesis(kind: SynthesisErrorKind, message: impl Into<String>) -> Self {
        Self::Synthesis {
            kind,
            message: message.into(),
        }
    }

    /// Synthesis error kind, if this is a synthesis error
    #[must_use]
    pub const fn synthesis_kind(&self) -> Option<SynthesisErrorKind> {
        match self {
            Self::Synthesis { kind, .. } => Some(*kind),
            Self::Cancelled => Some(SynthesisErrorKind::Cancelled),
            _ => None,
        }
    }

    /// Whether this error must end the session
    ///
    /// Synthesis and playback failures are recovered inside a turn
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Device(_) | Self::Recognition(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Config("missing model".into()).is_fatal());
        assert!(Error::Device("mic gone".into()).is_fatal());
        assert!(!Error::Playback("underrun".into()).is_fatal());
        assert!(!Error::synthesis(SynthesisErrorKind::AuthOrQuota, "401").is_fatal());
    }

    #[test]
    fn test_synthesis_kind() {
        let err = Error::synthesis(SynthesisErrorKind::Transient, "503");
        assert_eq!(err.synthesis_kind(), Some(SynthesisErrorKind::Transient));
        assert_eq!(
            Error::Cancelled.synthesis_kind(),
            Some(SynthesisErrorKind::Cancelled)
        );
        assert_eq!(Error::Playback("x".into()).synthesis_kind(), None);
    }
}
