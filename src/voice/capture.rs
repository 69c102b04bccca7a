//! Audio capture from microphone
//!
//! The capture thread owns the input stream for the whole session. It cuts
//! device buffers into fixed frames, tags them `muted` while the assistant
//! speaks, and pushes them into the drop-oldest frame queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{FRAME_SAMPLES, FrameAssembler, SAMPLE_RATE, StreamResampler};
use super::queue::FrameSender;
use super::state::StateHandle;
use crate::{Error, Result};

/// Reopen attempts after the device is lost mid-stream
pub const MAX_REOPEN_ATTEMPTS: u32 = 3;

/// Base delay between reopen attempts (doubles each attempt)
const DEFAULT_REOPEN_BACKOFF: Duration = Duration::from_millis(200);

/// How often the capture thread checks for stop and stream errors
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Receives mono samples at [`SAMPLE_RATE`]
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Receives stream failures
pub type ErrorCallback = Box<dyn FnMut(String) + Send + 'static>;

/// A running input stream; dropping it stops the stream
pub trait ActiveStream {}

/// Microphone abstraction
pub trait InputDevice: Send + 'static {
    /// Human-readable device name
    fn name(&self) -> String;

    /// Open the device and start delivering samples
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if the device cannot be opened
    fn open(
        &mut self,
        on_samples: SampleCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn ActiveStream>>;
}

/// Reported by the capture thread to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Device lost and every reopen attempt failed
    DeviceLost(String),
}

/// Default input device through cpal
pub struct CpalInput {
    device: Device,
    config: StreamConfig,
}

struct CpalStream(#[allow(dead_code)] Stream);

impl ActiveStream for CpalStream {}

impl CpalInput {
    /// Open the default input device
    ///
    /// Uses 16kHz directly when the device offers it, otherwise its default
    /// rate, resampled in the callback.
    ///
    /// # Errors
    ///
    /// Returns error if there is no input device or it reports no config
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Device("no input device available".to_string()))?;

        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        };

        let native = device
            .supported_input_configs()
            .map_err(|e| Error::Device(e.to_string()))?
            .find(|c| c.channels() == 1 && supports_rate(c))
            .or_else(|| {
                // Any channel count, downmixed in the callback
                device
                    .supported_input_configs()
                    .ok()?
                    .find(|c| supports_rate(c))
            });

        let config = match native {
            Some(supported) => supported.with_sample_rate(SampleRate(SAMPLE_RATE)).config(),
            None => device
                .default_input_config()
                .map_err(|e| Error::Device(format!("no usable input config: {e}")))?
                .config(),
        };

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self { device, config })
    }
}

impl InputDevice for CpalInput {
    fn name(&self) -> String {
        self.device.name().unwrap_or_default()
    }

    fn open(
        &mut self,
        mut on_samples: SampleCallback,
        mut on_error: ErrorCallback,
    ) -> Result<Box<dyn ActiveStream>> {
        let channels = usize::from(self.config.channels);
        let mut resampler = StreamResampler::new(self.config.sample_rate.0)?;

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let resampled = if channels > 1 {
                        #[allow(clippy::cast_precision_loss)]
                        let mono: Vec<f32> = data
                            .chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                            .collect();
                        resampler.push(&mono)
                    } else {
                        resampler.push(data)
                    };
                    if !resampled.is_empty() {
                        on_samples(&resampled);
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio capture error");
                    on_error(err.to_string());
                },
                None,
            )
            .map_err(|e| Error::Device(e.to_string()))?;

        stream.play().map_err(|e| Error::Device(e.to_string()))?;
        Ok(Box::new(CpalStream(stream)))
    }
}

/// Wiring handed to the capture thread
pub struct CaptureLinks {
    /// Destination for assembled frames
    pub frames: FrameSender,
    /// Used to tag frames captured while speaking
    pub state: StateHandle,
    /// Session cancellation
    pub cancel: CancellationToken,
    /// Fatal capture events
    pub events: mpsc::UnboundedSender<CaptureEvent>,
}

/// Captures audio on a dedicated thread
pub struct AudioCapture {
    device: Option<Box<dyn InputDevice>>,
    reopen_backoff: Duration,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AudioCapture {
    /// Create a capture source over `device`
    #[must_use]
    pub fn new(device: impl InputDevice) -> Self {
        Self {
            device: Some(Box::new(device)),
            reopen_backoff: DEFAULT_REOPEN_BACKOFF,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Override the base reopen backoff
    #[must_use]
    pub fn with_reopen_backoff(mut self, backoff: Duration) -> Self {
        self.reopen_backoff = backoff;
        self
    }

    /// Open the device and start producing frames
    ///
    /// The capture source cannot be restarted once stopped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if the device cannot be opened or capture
    /// was already started
    pub fn start(&mut self, links: CaptureLinks) -> Result<()> {
        let device = self
            .device
            .take()
            .ok_or_else(|| Error::Device("audio capture already started".to_string()))?;

        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let stop = Arc::clone(&self.stop);
        let backoff = self.reopen_backoff;

        let thread = std::thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || capture_thread(device, links, &stop, backoff, &ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.thread = Some(thread);
                tracing::debug!("audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Device("capture thread exited during startup".to_string()))
            }
        }
    }

    /// Stop capturing and release the device
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("capture thread panicked");
            }
            tracing::debug!("audio capture stopped");
        }
    }

    /// Check if currently capturing
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    mut device: Box<dyn InputDevice>,
    links: CaptureLinks,
    stop: &AtomicBool,
    backoff: Duration,
    ready: &std_mpsc::SyncSender<Result<()>>,
) {
    let CaptureLinks {
        frames,
        state,
        cancel,
        events,
    } = links;

    let assembler = Arc::new(Mutex::new(FrameAssembler::new(FRAME_SAMPLES, SAMPLE_RATE)));
    let (err_tx, err_rx) = std_mpsc::channel::<String>();

    let open = |device: &mut Box<dyn InputDevice>| {
        let assembler = Arc::clone(&assembler);
        let frames = frames.clone();
        let state = state.clone();
        let err_tx = err_tx.clone();

        device.open(
            Box::new(move |samples: &[f32]| {
                let Ok(mut assembler) = assembler.lock() else {
                    return;
                };
                let muted = state.is_speaking();
                for mut frame in assembler.push(samples) {
                    frame.muted = muted;
                    frames.push(frame);
                }
            }),
            Box::new(move |err| {
                let _ = err_tx.send(err);
            }),
        )
    };

    let mut stream = match open(&mut device) {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            frames.close();
            return;
        }
    };

    tracing::info!(device = %device.name(), "microphone open");

    let should_stop = || stop.load(Ordering::Acquire) || cancel.is_cancelled();

    'capture: while !should_stop() {
        let reason = match err_rx.recv_timeout(POLL_INTERVAL) {
            Ok(reason) => reason,
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        };

        tracing::warn!(error = %reason, "input device lost, reopening");
        drop(stream);

        for attempt in 0..MAX_REOPEN_ATTEMPTS {
            let delay = backoff.saturating_mul(2u32.saturating_pow(attempt));
            if sleep_unless(delay, &should_stop) {
                break 'capture;
            }

            // Errors from the dead stream are stale now
            while err_rx.try_recv().is_ok() {}

            match open(&mut device) {
                Ok(reopened) => {
                    tracing::info!(attempt = attempt + 1, "input device reopened");
                    stream = reopened;
                    continue 'capture;
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "reopen failed");
                }
            }
        }

        tracing::error!(attempts = MAX_REOPEN_ATTEMPTS, "input device lost for good");
        let _ = events.send(CaptureEvent::DeviceLost(reason));
        frames.close();
        return;
    }

    frames.close();
    tracing::debug!("capture thread exiting");
}

/// Sleep for `delay` in short steps; returns `true` if `stop` fired
fn sleep_unless(delay: Duration, stop: &impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + delay;
    while std::time::Instant::now() < deadline {
        if stop() {
            return true;
        }
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        std::thread::sleep(POLL_INTERVAL.min(remaining));
    }
    stop()
}
