//! Audio playback to speakers
//!
//! The [`PlaybackSink`] owns the output device. Frames are written from a
//! blocking worker, one frame at a time, so a stop request is honored at the
//! next frame boundary and the device is released as soon as the worker
//! returns.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, StreamConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{AudioFrame, samples_duration};
use super::tts::{PLAYBACK_SAMPLE_RATE, SpeechStream};
use crate::{Error, Result};

/// Frames queued between the async feeder and the device writer
const PLAYBACK_QUEUE_FRAMES: usize = 8;

/// How often blocking waits re-check for stop
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Speaker abstraction
pub trait OutputDevice: Send + 'static {
    /// Human-readable device name
    fn name(&self) -> String;

    /// Open the device for mono audio at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Playback`] if the device cannot be opened
    fn open(&mut self, sample_rate: u32) -> Result<Box<dyn OutputStream>>;
}

/// An open output stream; dropping it releases the device
pub trait OutputStream: Send {
    /// Queue samples, blocking while the device buffer is full
    ///
    /// # Errors
    ///
    /// Returns [`Error::Playback`] if the device failed
    fn write(&mut self, samples: &[f32]) -> Result<()>;

    /// Block until everything written has been played or `stop` fires
    ///
    /// # Errors
    ///
    /// Returns [`Error::Playback`] if the device failed
    fn drain(&mut self, stop: &CancellationToken) -> Result<()>;

    /// Times the device ran dry mid-clip
    fn underruns(&self) -> u64 {
        0
    }
}

/// How a clip ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Every frame was played
    Completed { frames: usize, underruns: u64 },
    /// Stopped early; `frames` were written before the stop
    Cancelled { frames: usize },
}

/// Renders synthesized speech on the output device
#[derive(Clone)]
pub struct PlaybackSink {
    device: Arc<Mutex<Box<dyn OutputDevice>>>,
}

impl PlaybackSink {
    /// Sink owning `device`
    #[must_use]
    pub fn new(device: impl OutputDevice) -> Self {
        Self {
            device: Arc::new(Mutex::new(Box::new(device))),
        }
    }

    /// Play `stream` until it ends, fails, or `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns [`Error::Playback`] if the device fails, or the stream's own
    /// error if synthesis broke mid-clip
    pub async fn play(
        &self,
        mut stream: SpeechStream,
        cancel: &CancellationToken,
    ) -> Result<PlaybackOutcome> {
        let (tx, rx) = mpsc::channel::<AudioFrame>(PLAYBACK_QUEUE_FRAMES);
        let stop = cancel.child_token();

        let device = Arc::clone(&self.device);
        let writer_stop = stop.clone();
        let writer = tokio::task::spawn_blocking(move || write_frames(&device, rx, &writer_stop));

        let mut feed_error = None;
        loop {
            let next = tokio::select! {
                () = stop.cancelled() => break,
                next = stream.next_frame() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    let sent = tokio::select! {
                        () = stop.cancelled() => break,
                        sent = tx.send(frame) => sent,
                    };
                    // The writer only hangs up after a device failure
                    if sent.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "speech stream failed mid-clip");
                    feed_error = Some(e);
                    stop.cancel();
                    break;
                }
                None => break,
            }
        }
        drop(tx);

        let outcome = writer
            .await
            .map_err(|e| Error::Playback(format!("playback worker crashed: {e}")))??;

        if let Some(e) = feed_error {
            return Err(e);
        }

        match outcome {
            PlaybackOutcome::Completed { frames, underruns } => {
                if underruns > 0 {
                    tracing::warn!(underruns, "playback underran");
                }
                tracing::debug!(frames, "playback complete");
            }
            PlaybackOutcome::Cancelled { frames } => {
                tracing::debug!(frames, "playback cancelled");
            }
        }
        Ok(outcome)
    }
}

/// Blocking writer; the output stream is dropped on every return path
fn write_frames(
    device: &Mutex<Box<dyn OutputDevice>>,
    mut rx: mpsc::Receiver<AudioFrame>,
    stop: &CancellationToken,
) -> Result<PlaybackOutcome> {
    let mut device = device
        .lock()
        .map_err(|_| Error::Playback("output device lock poisoned".to_string()))?;

    let mut output: Option<Box<dyn OutputStream>> = None;
    let mut frames = 0;

    while let Some(frame) = rx.blocking_recv() {
        if stop.is_cancelled() {
            return Ok(PlaybackOutcome::Cancelled { frames });
        }

        if output.is_none() {
            tracing::debug!(device = %device.name(), rate = frame.sample_rate, "opening output");
            output = Some(device.open(frame.sample_rate)?);
        }
        if let Some(out) = output.as_mut() {
            out.write(&frame.samples)?;
        }
        frames += 1;
    }

    if stop.is_cancelled() {
        return Ok(PlaybackOutcome::Cancelled { frames });
    }

    let underruns = match output.as_mut() {
        Some(out) => {
            out.drain(stop)?;
            if stop.is_cancelled() {
                return Ok(PlaybackOutcome::Cancelled { frames });
            }
            out.underruns()
        }
        None => 0,
    };

    Ok(PlaybackOutcome::Completed { frames, underruns })
}

/// Default output device through cpal
pub struct CpalOutput {
    device: Device,
    channels: u16,
}

impl CpalOutput {
    /// Find the default output device
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if there is no output device that plays
    /// 24kHz audio
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Device("no output device available".to_string()))?;

        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        };

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Device(e.to_string()))?
            .find(|c| c.channels() == 1 && supports_rate(c))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| c.channels() == 2 && supports_rate(c))
            })
            .ok_or_else(|| Error::Device("no suitable output config found".to_string()))?;

        let channels = supported_config.channels();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels,
            "audio playback initialized"
        );

        Ok(Self { device, channels })
    }
}

impl OutputDevice for CpalOutput {
    fn name(&self) -> String {
        self.device.name().unwrap_or_default()
    }

    fn open(&mut self, sample_rate: u32) -> Result<Box<dyn OutputStream>> {
        CpalOutputStream::open(self.device.clone(), self.channels, sample_rate)
            .map(|s| Box::new(s) as Box<dyn OutputStream>)
    }
}

/// State shared with the device callback
struct Shared {
    buffer: Mutex<VecDeque<f32>>,
    underruns: AtomicU64,
    failure: Mutex<Option<String>>,
}

/// cpal streams are not `Send`; this one lives on its own thread
struct CpalOutputStream {
    shared: Arc<Shared>,
    sample_rate: u32,
    started: bool,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutputStream {
    fn open(device: Device, channels: u16, sample_rate: u32) -> Result<Self> {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(VecDeque::new()),
            underruns: AtomicU64::new(0),
            failure: Mutex::new(None),
        });

        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let thread_shared = Arc::clone(&shared);

        let thread = std::thread::Builder::new()
            .name("parley-playback".to_string())
            .spawn(move || {
                let stream = match build_stream(&device, channels, sample_rate, thread_shared) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Hold the stream until the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("output stream closed");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shared,
                sample_rate,
                started: false,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Playback("playback thread exited during startup".to_string()))
            }
        }
    }

    fn check_failure(&self) -> Result<()> {
        let failure = self
            .shared
            .failure
            .lock()
            .map_err(|_| Error::Playback("playback state poisoned".to_string()))?;
        match failure.as_ref() {
            Some(reason) => Err(Error::Playback(reason.clone())),
            None => Ok(()),
        }
    }

    fn buffered(&self) -> usize {
        self.shared.buffer.lock().map_or(0, |b| b.len())
    }
}

fn build_stream(
    device: &Device,
    channels: u16,
    sample_rate: u32,
    shared: Arc<Shared>,
) -> Result<cpal::Stream> {
    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let channels = usize::from(channels);
    let error_shared = Arc::clone(&shared);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut buffer) = shared.buffer.lock() else {
                    data.fill(0.0);
                    return;
                };

                for frame in data.chunks_mut(channels) {
                    frame.fill(buffer.pop_front().unwrap_or(0.0));
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio playback error");
                if let Ok(mut failure) = error_shared.failure.lock() {
                    *failure = Some(err.to_string());
                }
            },
            None,
        )
        .map_err(|e| Error::Playback(e.to_string()))?;

    stream.play().map_err(|e| Error::Playback(e.to_string()))?;
    Ok(stream)
}

impl OutputStream for CpalOutputStream {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        // Keep at most ~100ms queued so a stop takes effect quickly
        let high_water = usize::try_from(self.sample_rate / 10).unwrap_or(usize::MAX);

        // The device played everything before the next frame arrived
        if self.started && self.buffered() == 0 {
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
        }
        self.started = true;

        while self.buffered() > high_water {
            self.check_failure()?;
            std::thread::sleep(POLL_INTERVAL);
        }
        self.check_failure()?;

        let mut buffer = self
            .shared
            .buffer
            .lock()
            .map_err(|_| Error::Playback("playback buffer poisoned".to_string()))?;
        buffer.extend(samples.iter().copied());
        Ok(())
    }

    fn drain(&mut self, stop: &CancellationToken) -> Result<()> {
        let pending = samples_duration(self.buffered(), self.sample_rate);
        let deadline = Instant::now() + pending + Duration::from_millis(500);

        while self.buffered() > 0 && Instant::now() < deadline {
            if stop.is_cancelled() {
                return Ok(());
            }
            self.check_failure()?;
            std::thread::sleep(POLL_INTERVAL);
        }

        // The device still holds its own buffer
        std::thread::sleep(Duration::from_millis(100));
        Ok(())
    }

    fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }
}

impl Drop for CpalOutputStream {
    fn drop(&mut self) {
        if let Ok(mut buffer) = self.shared.buffer.lock() {
            buffer.clear();
        }
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("playback thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    /// Records writes and whether the stream is still open
    #[derive(Clone, Default)]
    struct Recorder {
        written: Arc<Mutex<Vec<f32>>>,
        open: Arc<AtomicBool>,
    }

    struct RecorderStream(Recorder);

    impl OutputDevice for Recorder {
        fn name(&self) -> String {
            "recorder".to_string()
        }

        fn open(&mut self, _sample_rate: u32) -> Result<Box<dyn OutputStream>> {
            self.open.store(true, Ordering::SeqCst);
            Ok(Box::new(RecorderStream(self.clone())))
        }
    }

    impl OutputStream for RecorderStream {
        fn write(&mut self, samples: &[f32]) -> Result<()> {
            self.0.written.lock().unwrap().extend_from_slice(samples);
            Ok(())
        }

        fn drain(&mut self, _stop: &CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    impl Drop for RecorderStream {
        fn drop(&mut self) {
            self.0.open.store(false, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_plays_whole_clip_and_releases_device() {
        let recorder = Recorder::default();
        let sink = PlaybackSink::new(recorder.clone());

        let samples = vec![0.25f32; 2000];
        let outcome = sink
            .play(SpeechStream::buffered(&samples), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, PlaybackOutcome::Completed { frames: 5, .. }));
        assert_eq!(recorder.written.lock().unwrap().len(), 2000);
        assert!(!recorder.open.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_writes_nothing() {
        let recorder = Recorder::default();
        let sink = PlaybackSink::new(recorder.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = sink
            .play(SpeechStream::buffered(&[0.1; 4800]), &cancel)
            .await
            .unwrap();

        assert!(matches!(outcome, PlaybackOutcome::Cancelled { .. }));
        assert!(recorder.written.lock().unwrap().is_empty());
        assert!(!recorder.open.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_empty_stream_never_opens_device() {
        let recorder = Recorder::default();
        let sink = PlaybackSink::new(recorder.clone());

        let outcome = sink
            .play(SpeechStream::silent(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PlaybackOutcome::Completed {
                frames: 0,
                underruns: 0
            }
        );
    }
}
