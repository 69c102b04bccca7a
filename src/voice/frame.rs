//! Audio frames and sample helpers

use std::time::Duration;

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per capture frame (30ms at 16kHz)
pub const FRAME_SAMPLES: usize = 480;

/// Duration of one capture frame
pub const FRAME_DURATION: Duration = Duration::from_millis(30);

/// Fixed-size chunk of mono PCM samples
///
/// Produced by the capture source and handed to the STT session by value.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Mono samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Offset from the start of capture
    pub timestamp: Duration,
    /// Captured while the assistant was speaking
    pub muted: bool,
}

impl AudioFrame {
    /// Create a frame
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32, timestamp: Duration) -> Self {
        Self {
            samples,
            sample_rate,
            timestamp,
            muted: false,
        }
    }

    /// RMS energy of the frame
    #[must_use]
    pub fn energy(&self) -> f32 {
        rms(&self.samples)
    }

    /// Playback duration of the frame
    #[must_use]
    pub fn duration(&self) -> Duration {
        samples_duration(self.samples.len(), self.sample_rate)
    }
}

/// Splits an arbitrary sample stream into fixed-size frames
///
/// Device callbacks deliver buffers of whatever size the driver picks.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_len: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    emitted: u64,
}

impl FrameAssembler {
    /// Create an assembler producing frames of `frame_len` samples
    #[must_use]
    pub fn new(frame_len: usize, sample_rate: u32) -> Self {
        Self {
            frame_len: frame_len.max(1),
            sample_rate,
            pending: Vec::with_capacity(frame_len * 2),
            emitted: 0,
        }
    }

    /// Push samples and return every frame that is now complete
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let rest = self.pending.split_off(self.frame_len);
            let chunk = std::mem::replace(&mut self.pending, rest);
            let timestamp = samples_duration(
                usize::try_from(self.emitted).unwrap_or(usize::MAX) * self.frame_len,
                self.sample_rate,
            );
            frames.push(AudioFrame::new(chunk, self.sample_rate, timestamp));
            self.emitted += 1;
        }
        frames
    }

    /// Emit the leftover samples as a short final frame
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.pending.is_empty() {
            return None;
        }

        let timestamp = samples_duration(
            usize::try_from(self.emitted).unwrap_or(usize::MAX) * self.frame_len,
            self.sample_rate,
        );
        self.emitted += 1;
        Some(AudioFrame::new(
            std::mem::take(&mut self.pending),
            self.sample_rate,
            timestamp,
        ))
    }

    /// Frames emitted so far
    #[must_use]
    pub const fn emitted(&self) -> u64 {
        self.emitted
    }
}

/// Converts a mono stream at the device rate to [`SAMPLE_RATE`]
///
/// Input is buffered until the resampler has a full chunk, so output lags
/// by at most one chunk.
pub struct StreamResampler {
    resampler: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// Resampler from `from_rate`; a passthrough when it already matches
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if rubato rejects the rate
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(from_rate: u32) -> Result<Self> {
        let resampler = if from_rate == SAMPLE_RATE {
            None
        } else {
            let resampler =
                FftFixedIn::<f32>::new(from_rate as usize, SAMPLE_RATE as usize, 1024, 2, 1)
                    .map_err(|e| {
                        Error::Device(format!("cannot resample {from_rate}Hz input: {e}"))
                    })?;
            tracing::debug!(from_rate, to_rate = SAMPLE_RATE, "resampling capture");
            Some(resampler)
        };

        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    /// Push device samples and return whatever is ready at [`SAMPLE_RATE`]
    pub fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);

        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }

            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(channels) => {
                    if let Some(mono) = channels.first() {
                        out.extend_from_slice(mono);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "capture resample failed, dropping chunk");
                }
            }
        }
        out
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Duration of `count` samples at `sample_rate`
#[must_use]
pub fn samples_duration(count: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let micros = (count as u128 * 1_000_000) / u128::from(sample_rate);
    Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
}

/// Split a buffered clip into frames of `frame_len` samples
///
/// The final frame may be shorter.
#[must_use]
pub fn split_into_frames(samples: &[f32], sample_rate: u32, frame_len: usize) -> Vec<AudioFrame> {
    samples
        .chunks(frame_len.max(1))
        .enumerate()
        .map(|(i, chunk)| {
            AudioFrame::new(
                chunk.to_vec(),
                sample_rate,
                samples_duration(i * frame_len, sample_rate),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_calculation() {
        let silence = vec![0.0f32; 100];
        assert!(rms(&silence) < 0.001);

        let loud = vec![0.5f32; 100];
        assert!(rms(&loud) > 0.4);

        assert!(rms(&[]) < f32::EPSILON);
    }

    #[test]
    fn test_assembler_fixed_frames() {
        let mut assembler = FrameAssembler::new(4, SAMPLE_RATE);

        assert!(assembler.push(&[0.1, 0.2, 0.3]).is_empty());

        let frames = assembler.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(frames[1].samples, vec![0.5, 0.6, 0.7, 0.8]);
        assert_eq!(frames[0].timestamp, Duration::ZERO);
        assert_eq!(frames[1].timestamp, samples_duration(4, SAMPLE_RATE));
        assert_eq!(assembler.emitted(), 2);

        let tail = assembler.flush().unwrap();
        assert_eq!(tail.samples, vec![0.9]);
        assert!(assembler.flush().is_none());
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(vec![0.0; FRAME_SAMPLES], SAMPLE_RATE, Duration::ZERO);
        assert_eq!(frame.duration(), FRAME_DURATION);
        assert!(!frame.muted);
    }

    #[test]
    fn test_resampler_passthrough_at_capture_rate() {
        let mut resampler = StreamResampler::new(SAMPLE_RATE).unwrap();
        assert_eq!(resampler.push(&[0.1, 0.2, 0.3]), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_resampler_converts_48k_stream() {
        let mut resampler = StreamResampler::new(48_000).unwrap();

        // 1s of DC at 48kHz in device-sized buffers
        let mut out = Vec::new();
        for _ in 0..100 {
            out.extend(resampler.push(&[0.5; 480]));
        }

        // Everything but the last partial chunk comes out at a third the rate
        assert!(out.len() > 15_000, "got {}", out.len());
        assert!(out.len() <= 16_000, "got {}", out.len());
        assert!((out[out.len() / 2] - 0.5).abs() < 0.05);
    }

    #[test]
    fn test_split_into_frames_keeps_tail() {
        let samples = vec![0.0f32; 10];
        let frames = split_into_frames(&samples, 24000, 4);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].samples.len(), 2);
    }
}
