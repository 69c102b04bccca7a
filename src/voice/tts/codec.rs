//! Decoding provider audio into mono f32 samples

use std::io::Cursor;

use crate::error::SynthesisErrorKind;
use crate::{Error, Result};

/// Incremental decoder for signed 16-bit little-endian PCM
///
/// Network chunks can split a sample in half; the odd byte is carried over
/// to the next push.
#[derive(Debug, Default)]
pub struct PcmDecoder {
    leftover: Option<u8>,
}

impl PcmDecoder {
    /// Decode as many whole samples as `bytes` completes
    pub fn push(&mut self, bytes: &[u8]) -> Vec<f32> {
        let mut samples = Vec::with_capacity(bytes.len() / 2 + 1);
        let mut rest = bytes;

        if let Some(low) = self.leftover.take() {
            let Some((&high, tail)) = rest.split_first() else {
                self.leftover = Some(low);
                return samples;
            };
            samples.push(pcm16_to_f32(low, high));
            rest = tail;
        }

        let mut pairs = rest.chunks_exact(2);
        samples.extend(pairs.by_ref().map(|p| pcm16_to_f32(p[0], p[1])));
        self.leftover = pairs.remainder().first().copied();
        samples
    }

    /// Whether a half sample is still pending
    #[must_use]
    pub const fn has_leftover(&self) -> bool {
        self.leftover.is_some()
    }
}

fn pcm16_to_f32(low: u8, high: u8) -> f32 {
    f32::from(i16::from_le_bytes([low, high])) / 32768.0
}

/// Decode a complete PCM16 buffer
#[must_use]
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    PcmDecoder::default().push(bytes)
}

/// Decode MP3 bytes to mono samples and their sample rate
///
/// # Errors
///
/// Returns a protocol error if the data is not valid MP3
#[allow(clippy::cast_precision_loss)]
pub fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                let channels = frame.channels.max(1);
                samples.extend(frame.data.chunks(channels).map(|chunk| {
                    chunk.iter().map(|&s| f32::from(s) / 32768.0).sum::<f32>() / chunk.len() as f32
                }));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => {
                return Err(Error::synthesis(
                    SynthesisErrorKind::Protocol,
                    format!("MP3 decode error: {e}"),
                ));
            }
        }
    }

    if sample_rate == 0 {
        return Err(Error::synthesis(
            SynthesisErrorKind::Protocol,
            "MP3 stream contained no frames",
        ));
    }

    Ok((samples, sample_rate))
}

/// Decode a WAV file to mono samples and its sample rate
///
/// # Errors
///
/// Returns error if the data is not a readable WAV file
#[allow(clippy::cast_precision_loss)]
pub fn decode_wav(wav_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let reader = hound::WavReader::new(Cursor::new(wav_data))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok((mono, spec.sample_rate))
}

/// Resample mono audio with rubato
///
/// The final partial chunk is zero-padded and the output trimmed to the
/// expected length, so no audio is lost at the tail.
///
/// # Errors
///
/// Returns a protocol error if the resampler cannot be built
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, 1024, 2, 1)
            .map_err(|e| {
                Error::synthesis(
                    SynthesisErrorKind::Protocol,
                    format!("resampler init failed: {e}"),
                )
            })?;

    // The resampler may round the requested chunk size
    let chunk_size = resampler.input_frames_next();
    let expected =
        (samples.len() as f64 * f64::from(to_rate) / f64::from(from_rate)).round() as usize;
    let delay = resampler.output_delay();

    let mut input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
    // Pad so the tail and the resampler delay both get flushed
    let padded_len = (input.len() + delay * from_rate as usize / to_rate as usize + chunk_size)
        .div_ceil(chunk_size)
        * chunk_size;
    input.resize(padded_len, 0.0);

    let mut output = Vec::with_capacity(expected + delay);
    for chunk in input.chunks(chunk_size) {
        let result = resampler
            .process(&[chunk], None)
            .map_err(|e| {
                Error::synthesis(SynthesisErrorKind::Protocol, format!("resample failed: {e}"))
            })?;
        output.extend_from_slice(&result[0]);
    }

    Ok(output
        .into_iter()
        .skip(delay)
        .take(expected)
        .map(|s| s as f32)
        .collect())
}
