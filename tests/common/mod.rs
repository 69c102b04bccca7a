//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::routing::post;
use tokio_util::sync::CancellationToken;

use parley::voice::{
    ActiveStream, ErrorCallback, FRAME_SAMPLES, InputDevice, OutputDevice, OutputStream,
    Recognizer, RecognizerFactory, Responder, Response, SAMPLE_RATE, SampleCallback, Transcript,
};
use parley::{Error, Result};

/// Generate sine wave audio samples at the capture rate
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn sine(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence at the capture rate
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn silence(duration_secs: f32) -> Vec<f32> {
    vec![0.0; (SAMPLE_RATE as f32 * duration_secs) as usize]
}

/// One open of a [`SyntheticInput`]
#[derive(Clone)]
pub enum OpenScript {
    /// Deliver `samples` (looping if asked), then report a device error
    /// if `then_fail` is set
    Play {
        samples: Vec<f32>,
        looped: bool,
        then_fail: bool,
    },
    /// Refuse to open
    Refuse,
}

/// Microphone fake driven by a script of opens
///
/// Samples are delivered in frame-sized callbacks from a feeder thread,
/// faster than real time.
pub struct SyntheticInput {
    script: VecDeque<OpenScript>,
    opens: Arc<AtomicUsize>,
    pace: Duration,
}

impl SyntheticInput {
    pub fn new(script: impl IntoIterator<Item = OpenScript>) -> Self {
        Self {
            script: script.into_iter().collect(),
            opens: Arc::new(AtomicUsize::new(0)),
            pace: Duration::from_millis(2),
        }
    }

    /// Plays `samples` once and then stays quiet
    pub fn once(samples: Vec<f32>) -> Self {
        Self::new([OpenScript::Play {
            samples,
            looped: false,
            then_fail: false,
        }])
    }

    /// Repeats `samples` until stopped
    pub fn looping(samples: Vec<f32>) -> Self {
        Self::new([OpenScript::Play {
            samples,
            looped: true,
            then_fail: false,
        }])
    }

    /// Delay between callbacks
    #[must_use]
    pub const fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    /// Shared counter of successful and failed opens
    pub fn opens(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opens)
    }
}

struct SyntheticStream {
    stop: Arc<AtomicBool>,
    feeder: Option<JoinHandle<()>>,
}

impl ActiveStream for SyntheticStream {}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
    }
}

impl InputDevice for SyntheticInput {
    fn name(&self) -> String {
        "synthetic".to_string()
    }

    fn open(
        &mut self,
        mut on_samples: SampleCallback,
        mut on_error: ErrorCallback,
    ) -> Result<Box<dyn ActiveStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let Some(OpenScript::Play {
            samples,
            looped,
            then_fail,
        }) = self.script.pop_front()
        else {
            return Err(Error::Device("synthetic device unavailable".to_string()));
        };

        let stop = Arc::new(AtomicBool::new(false));
        let feeder_stop = Arc::clone(&stop);
        let pace = self.pace;

        let feeder = std::thread::spawn(move || {
            loop {
                for chunk in samples.chunks(FRAME_SAMPLES) {
                    if feeder_stop.load(Ordering::Acquire) {
                        return;
                    }
                    on_samples(chunk);
                    std::thread::sleep(pace);
                }
                if !looped {
                    break;
                }
            }
            if then_fail {
                on_error("synthetic device unplugged".to_string());
            }
        });

        Ok(Box::new(SyntheticStream {
            stop,
            feeder: Some(feeder),
        }))
    }
}

/// What a [`RecordingOutput`] has seen
#[derive(Debug, Default)]
pub struct Recording {
    pub opens: usize,
    pub open_streams: usize,
    pub writes: usize,
    pub samples: Vec<f32>,
}

/// Speaker fake that records every write
#[derive(Clone, Default)]
pub struct RecordingOutput {
    pub recording: Arc<Mutex<Recording>>,
    write_delay: Duration,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long per write, as a real device would
    #[must_use]
    pub const fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn writes(&self) -> usize {
        self.recording.lock().unwrap().writes
    }

    pub fn samples(&self) -> Vec<f32> {
        self.recording.lock().unwrap().samples.clone()
    }

    pub fn opens(&self) -> usize {
        self.recording.lock().unwrap().opens
    }

    pub fn open_streams(&self) -> usize {
        self.recording.lock().unwrap().open_streams
    }
}

struct RecordingStream {
    recording: Arc<Mutex<Recording>>,
    write_delay: Duration,
}

impl OutputDevice for RecordingOutput {
    fn name(&self) -> String {
        "recording".to_string()
    }

    fn open(&mut self, _sample_rate: u32) -> Result<Box<dyn OutputStream>> {
        {
            let mut rec = self.recording.lock().unwrap();
            rec.opens += 1;
            rec.open_streams += 1;
        }
        Ok(Box::new(RecordingStream {
            recording: Arc::clone(&self.recording),
            write_delay: self.write_delay,
        }))
    }
}

impl OutputStream for RecordingStream {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        std::thread::sleep(self.write_delay);
        let mut rec = self.recording.lock().unwrap();
        rec.writes += 1;
        rec.samples.extend_from_slice(samples);
        Ok(())
    }

    fn drain(&mut self, _stop: &CancellationToken) -> Result<()> {
        Ok(())
    }
}

impl Drop for RecordingStream {
    fn drop(&mut self) {
        if let Ok(mut rec) = self.recording.lock() {
            rec.open_streams -= 1;
        }
    }
}

/// Recognizer that replays scripted results, then repeats `fallback`
pub struct ScriptedRecognizer {
    script: Arc<Mutex<VecDeque<Result<String>>>>,
    fallback: String,
}

impl Recognizer for ScriptedRecognizer {
    fn decode(&mut self, _samples: &[f32]) -> Result<Transcript> {
        let next = self.script.lock().unwrap().pop_front();
        let text = match next {
            Some(result) => result?,
            None => self.fallback.clone(),
        };
        Ok(Transcript {
            text,
            confidence: 0.9,
        })
    }
}

/// Factory for [`ScriptedRecognizer`]s sharing one script
///
/// The returned counter tracks how many recognizers were built.
pub fn scripted_factory(
    script: impl IntoIterator<Item = Result<String>>,
    fallback: &str,
) -> (RecognizerFactory, Arc<AtomicUsize>) {
    let script = Arc::new(Mutex::new(script.into_iter().collect::<VecDeque<_>>()));
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&builds);
    let fallback = fallback.to_string();

    let factory: RecognizerFactory = Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedRecognizer {
            script: Arc::clone(&script),
            fallback: fallback.clone(),
        }) as Box<dyn Recognizer>)
    });
    (factory, builds)
}

/// Responder that replays scripted replies and records what it heard
#[derive(Clone, Default)]
pub struct ScriptedResponder {
    replies: Arc<Mutex<VecDeque<Response>>>,
    pub heard: Arc<Mutex<Vec<String>>>,
}

impl ScriptedResponder {
    pub fn new(replies: impl IntoIterator<Item = Response>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into_iter().collect())),
            heard: Arc::default(),
        }
    }

    pub fn heard(&self) -> Vec<String> {
        self.heard.lock().unwrap().clone()
    }
}

#[async_trait]
impl Responder for ScriptedResponder {
    async fn respond(&mut self, transcript: &str) -> Result<Response> {
        self.heard.lock().unwrap().push(transcript.to_string());
        Ok(self.replies.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// Raw 16-bit little-endian PCM
#[allow(clippy::cast_possible_truncation)]
pub fn pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|s| ((s.clamp(-1.0, 1.0) * 32767.0) as i16).to_le_bytes())
        .collect()
}

/// Speech endpoint mock state
#[derive(Clone)]
pub struct SpeechServer {
    /// Request bodies in arrival order
    pub requests: Arc<Mutex<Vec<serde_json::Value>>>,
    /// Samples per response
    pub samples: usize,
}

impl SpeechServer {
    pub fn requests(&self) -> Vec<serde_json::Value> {
        self.requests.lock().unwrap().clone()
    }
}

/// Serve an `OpenAI`-style speech endpoint on a random port
///
/// Response `n` carries `samples` PCM samples at level `0.1 * (n + 1)`, so
/// callers can tell sub-requests apart in the output.
pub async fn spawn_speech_server(samples: usize) -> (String, SpeechServer) {
    let server = SpeechServer {
        requests: Arc::default(),
        samples,
    };

    async fn speech(
        State(server): State<SpeechServer>,
        axum::Json(body): axum::Json<serde_json::Value>,
    ) -> Vec<u8> {
        let index = {
            let mut requests = server.requests.lock().unwrap();
            requests.push(body);
            requests.len()
        };
        #[allow(clippy::cast_precision_loss)]
        let level = 0.1 * index as f32;
        pcm16(&vec![level; server.samples])
    }

    let app = Router::new()
        .route("/v1/audio/speech", post(speech))
        .with_state(server.clone());

    (serve(app).await, server)
}

/// Bind `app` to a random local port and return its base URL
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Fake `espeak` that copies a 1s 22.05kHz WAV to its `-w` path and writes
/// the text it was given to `spoken.txt`
#[cfg(unix)]
pub fn fake_espeak(dir: &std::path::Path) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let fixture = dir.join("fixture.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 22050,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&fixture, spec).unwrap();
    for _ in 0..22050 {
        writer.write_sample(8000_i16).unwrap();
    }
    writer.finalize().unwrap();

    let script = dir.join("fake-espeak");
    let body = format!(
        "#!/bin/sh\ncp '{}' \"$2\"\ncat > '{}'\n",
        fixture.display(),
        dir.join("spoken.txt").display()
    );
    std::fs::write(&script, body).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

/// Poll `cond` every 5ms for up to 5s
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 5s");
}
