//! Whisper recognizer (enabled with the `whisper` feature)

use std::path::Path;
use std::sync::Arc;

use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::stt::{Recognizer, Transcript};
use crate::{Error, Result};

/// Decoder threads per utterance
const DEFAULT_THREADS: i32 = 4;

/// Load a ggml Whisper model
///
/// # Errors
///
/// Returns [`Error::Config`] if the model cannot be loaded
pub fn load_model(path: &Path) -> Result<Arc<WhisperContext>> {
    let path_str = path
        .to_str()
        .ok_or_else(|| Error::Config(format!("model path is not UTF-8: {}", path.display())))?;

    tracing::info!(model = %path.display(), "loading Whisper model");

    let ctx = WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
        .map_err(|e| Error::Config(format!("failed to load model {}: {e}", path.display())))?;

    tracing::info!("Whisper model loaded");
    Ok(Arc::new(ctx))
}

/// Recognizer over a shared Whisper context
///
/// Each decode gets a fresh state, so a restart only needs a new recognizer
/// around the same context.
pub struct WhisperRecognizer {
    ctx: Arc<WhisperContext>,
    threads: i32,
}

impl WhisperRecognizer {
    #[must_use]
    pub const fn new(ctx: Arc<WhisperContext>) -> Self {
        Self {
            ctx,
            threads: DEFAULT_THREADS,
        }
    }
}

impl Recognizer for WhisperRecognizer {
    #[allow(clippy::cast_precision_loss)]
    fn decode(&mut self, samples: &[f32]) -> Result<Transcript> {
        if samples.is_empty() {
            return Ok(Transcript {
                text: String::new(),
                confidence: 0.0,
            });
        }

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_n_threads(self.threads);
        params.set_language(Some("en"));
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_no_context(true);
        params.set_single_segment(true);

        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| Error::Recognition(e.to_string()))?;

        state
            .full(params, samples)
            .map_err(|e| Error::Recognition(e.to_string()))?;

        let num_segments = state
            .full_n_segments()
            .map_err(|e| Error::Recognition(e.to_string()))?;

        let mut text = String::new();
        let mut prob_sum = 0.0f32;
        let mut tokens = 0usize;

        for i in 0..num_segments {
            let segment = state
                .full_get_segment_text(i)
                .map_err(|e| Error::Recognition(e.to_string()))?;
            text.push_str(&segment);

            let n_tokens = state
                .full_n_tokens(i)
                .map_err(|e| Error::Recognition(e.to_string()))?;
            for j in 0..n_tokens {
                if let Ok(p) = state.full_get_token_prob(i, j) {
                    prob_sum += p;
                    tokens += 1;
                }
            }
        }

        let confidence = if tokens == 0 {
            0.0
        } else {
            prob_sum / tokens as f32
        };

        tracing::trace!(segments = num_segments, tokens, "whisper decode done");

        Ok(Transcript {
            text: text.trim().to_string(),
            confidence: confidence.clamp(0.0, 1.0),
        })
    }
}
