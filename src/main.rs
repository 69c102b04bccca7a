use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use parley::config::{CliOverrides, TtsEngine, TtsEngineConfig};
use parley::voice::{
    AudioCapture, CaptureLinks, CpalInput, CpalOutput, PLAYBACK_SAMPLE_RATE, PlaybackOutcome,
    PlaybackSink, SessionStateMachine, Speaker, SpeechStream, frame_queue, rms,
};
use parley::{Config, SpeechDaemon};

/// Parley - speech input/output for voice assistants
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Enable the speech session (microphone in, speaker out)
    #[arg(long, env = "PARLEY_SPEECH")]
    speech: bool,

    /// Text-to-speech engine
    #[arg(long, value_enum)]
    tts_engine: Option<TtsEngine>,

    /// Voice identifier for the TTS engine
    #[arg(long)]
    voice: Option<String>,

    /// Path to the speech recognition model
    #[arg(long)]
    stt_model: Option<PathBuf>,

    /// Path to the external scorer for the recognition model
    #[arg(long)]
    stt_scorer: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            speech: self.speech,
            tts_engine: self.tts_engine,
            tts_voice: self.voice.clone(),
            stt_model: self.stt_model.clone(),
            stt_scorer: self.stt_scorer.clone(),
        }
    }
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = match cli.verbose {
        0 => "info,parley=info",
        1 => "info,parley=debug",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = cli.overrides();

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::TestTts { text } => test_tts(&overrides, &text).await,
        };
    }

    if !overrides.speech {
        println!("Speech is disabled. Run with --speech to start a voice session.");
        return Ok(());
    }

    let config = Config::load(&overrides)?;
    tracing::debug!(?config, "loaded configuration");

    let daemon = SpeechDaemon::new(&config)?;
    let end = daemon.run().await?;
    tracing::info!(reason = ?end, "parley stopped");

    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let state = SessionStateMachine::new();
    let cancel = CancellationToken::new();
    let (frames_tx, mut frames_rx) = frame_queue(200);
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();

    let mut capture = AudioCapture::new(CpalInput::new()?);
    capture.start(CaptureLinks {
        frames: frames_tx,
        state: state.handle(),
        cancel: cancel.clone(),
        events: events_tx,
    })?;
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        if let Ok(event) = events_rx.try_recv() {
            capture.stop();
            anyhow::bail!("capture failed: {event:?}");
        }

        let mut samples = Vec::new();
        while let Some(frame) = frames_rx.try_recv() {
            samples.extend_from_slice(&frame.samples);
        }
        let energy = rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    cancel.cancel();
    capture.stop();

    let dropped = frames_rx.dropped();
    if dropped > 0 {
        println!("({dropped} frames dropped)");
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");
    println!("  4. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let frequency = 440.0_f32;
    let num_samples = PLAYBACK_SAMPLE_RATE as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!(
        "Playing {} samples at {} Hz...",
        samples.len(),
        PLAYBACK_SAMPLE_RATE
    );

    let playback = PlaybackSink::new(CpalOutput::new()?);
    let outcome = playback
        .play(SpeechStream::buffered(&samples), &CancellationToken::new())
        .await?;
    report_playback(&outcome);

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Test TTS output with the configured engine
async fn test_tts(overrides: &CliOverrides, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load(overrides)?;
    let tts = TtsEngineConfig::resolve(&config)?;
    let mut speaker = Speaker::from_config(&tts)?;
    println!("Engine: {}", speaker.engine());

    let cancel = CancellationToken::new();
    let request = speaker.request(text);

    println!("Synthesizing speech...");
    let stream = speaker.synthesize(&request, &cancel).await?;

    println!("Playing audio...");
    let playback = PlaybackSink::new(CpalOutput::new()?);
    let outcome = playback.play(stream, &cancel).await?;
    report_playback(&outcome);

    if speaker.engine() != tts.engine {
        println!("Note: fell back to the {} engine", speaker.engine());
    }

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

fn report_playback(outcome: &PlaybackOutcome) {
    match outcome {
        PlaybackOutcome::Completed { frames, underruns } => {
            println!("Played {frames} frames ({underruns} underruns)");
        }
        PlaybackOutcome::Cancelled { frames } => {
            println!("Playback cancelled after {frames} frames");
        }
    }
}
