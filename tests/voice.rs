//! Voice pipeline integration tests
//!
//! Tests capture, detection and recognition without requiring audio hardware

use std::sync::atomic::Ordering;
use std::time::Duration;

use parley::config::VadConfig;
use parley::voice::{
    AudioCapture, AudioFrame, CaptureEvent, CaptureLinks, FRAME_SAMPLES, MAX_REOPEN_ATTEMPTS,
    SAMPLE_RATE, SessionState, SessionStateMachine, SttSession, TranscriptEvent, VadEvent,
    VadState, VoiceActivityDetector, frame_queue, rms, split_into_frames,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod common;

use common::{OpenScript, SyntheticInput, scripted_factory, silence, sine, wait_until};

fn vad_events(config: VadConfig, samples: &[f32]) -> Vec<VadEvent> {
    let mut vad = VoiceActivityDetector::new(config);
    split_into_frames(samples, SAMPLE_RATE, FRAME_SAMPLES)
        .iter()
        .map(|f| vad.process(f))
        .collect()
}

fn count(events: &[VadEvent], wanted: VadEvent) -> usize {
    events.iter().filter(|e| **e == wanted).count()
}

fn quick_vad() -> VadConfig {
    VadConfig {
        onset_frames: 2,
        trailing_silence: Duration::from_millis(150),
        partial_interval_frames: 1000,
        ..VadConfig::default()
    }
}

#[test]
fn test_sine_energy_above_threshold() {
    let speech = sine(440.0, 0.1, 0.3);
    let quiet = silence(0.1);

    assert!(rms(&speech) > VadConfig::default().energy_threshold);
    assert!(rms(&quiet) < f32::EPSILON);
}

#[test]
fn test_speech_activity_detection() {
    let mut samples = silence(0.3);
    samples.extend(sine(440.0, 0.5, 0.3));
    samples.extend(silence(0.8));

    let events = vad_events(VadConfig::default(), &samples);

    assert_eq!(count(&events, VadEvent::SpeechStart), 1);
    assert_eq!(count(&events, VadEvent::SpeechEnd), 1);

    // Start comes after the onset run, end after the trailing silence
    let start = events.iter().position(|e| *e == VadEvent::SpeechStart).unwrap();
    let end = events.iter().position(|e| *e == VadEvent::SpeechEnd).unwrap();
    assert_eq!(start, 10 + 2);
    assert!(end > start);
}

#[test]
fn test_short_blip_is_not_speech() {
    let mut samples = silence(0.3);
    samples.extend(sine(440.0, 0.06, 0.3)); // two frames, onset needs three
    samples.extend(silence(0.3));

    let events = vad_events(VadConfig::default(), &samples);
    assert_eq!(count(&events, VadEvent::SpeechStart), 0);
}

#[test]
fn test_long_utterance_hits_cap() {
    let config = VadConfig {
        max_utterance: Duration::from_millis(300),
        ..VadConfig::default()
    };

    let events = vad_events(config, &sine(440.0, 1.0, 0.3));

    let end = events.iter().position(|e| *e == VadEvent::SpeechEnd).unwrap();
    assert!(end < 12, "cap ignored, ended at frame {end}");
    assert!(count(&events, VadEvent::SpeechEnd) >= 2);
}

#[test]
fn test_detector_reset() {
    let mut vad = VoiceActivityDetector::new(VadConfig::default());
    for frame in split_into_frames(&sine(440.0, 0.2, 0.3), SAMPLE_RATE, FRAME_SAMPLES) {
        vad.process(&frame);
    }
    assert_eq!(vad.state(), VadState::Speaking);

    vad.reset();
    assert_eq!(vad.state(), VadState::Idle);
}

#[tokio::test]
async fn test_stt_session_one_final_per_utterance() {
    let (factory, _) = scripted_factory([Ok("first".into()), Ok("second".into())], "");
    let session = SttSession::new(factory, quick_vad()).unwrap();

    let mut samples = silence(0.2);
    samples.extend(sine(440.0, 0.4, 0.3));
    samples.extend(silence(0.5));
    samples.extend(sine(440.0, 0.4, 0.3));
    samples.extend(silence(0.5));

    let frames = split_into_frames(&samples, SAMPLE_RATE, FRAME_SAMPLES);
    let (tx, rx) = frame_queue(frames.len());
    for frame in frames {
        tx.push(frame);
    }
    drop(tx);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    session
        .run(rx, events_tx, CancellationToken::new())
        .await
        .unwrap();

    let mut finals = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        if let TranscriptEvent::Final { text, .. } = event {
            finals.push(text);
        }
    }
    assert_eq!(finals, vec!["first", "second"]);
}

#[tokio::test]
async fn test_stt_session_skips_frames_captured_while_speaking() {
    let (factory, _) = scripted_factory([], "should not appear");
    let session = SttSession::new(factory, quick_vad()).unwrap();

    let mut samples = sine(440.0, 0.4, 0.3);
    samples.extend(silence(0.5));

    let (tx, rx) = frame_queue(64);
    for mut frame in split_into_frames(&samples, SAMPLE_RATE, FRAME_SAMPLES) {
        frame.muted = true;
        tx.push(frame);
    }
    drop(tx);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    session
        .run(rx, events_tx, CancellationToken::new())
        .await
        .unwrap();

    assert!(events_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_stt_session_restarts_failed_recognizer() {
    let (factory, builds) = scripted_factory(
        [
            Err(parley::Error::Recognition("engine crashed".into())),
            Ok("recovered".into()),
        ],
        "",
    );
    let session = SttSession::new(factory, quick_vad()).unwrap();

    let mut samples = sine(440.0, 0.3, 0.3);
    samples.extend(silence(0.5));
    samples.extend(sine(440.0, 0.3, 0.3));
    samples.extend(silence(0.5));

    let (tx, rx) = frame_queue(128);
    for frame in split_into_frames(&samples, SAMPLE_RATE, FRAME_SAMPLES) {
        tx.push(frame);
    }
    drop(tx);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    session
        .run(rx, events_tx, CancellationToken::new())
        .await
        .unwrap();

    let mut finals = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        if let TranscriptEvent::Final { text, .. } = event {
            finals.push(text);
        }
    }

    // The failed utterance closes with an empty final
    assert_eq!(finals, vec!["", "recovered"]);
    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_capture_frames_are_ordered() {
    let input = SyntheticInput::once(sine(440.0, 0.5, 0.3));
    let state = SessionStateMachine::new();
    let (frames_tx, mut frames_rx) = frame_queue(64);
    let (events_tx, _events_rx) = mpsc::unbounded_channel();

    let mut capture = AudioCapture::new(input);
    capture
        .start(CaptureLinks {
            frames: frames_tx,
            state: state.handle(),
            cancel: CancellationToken::new(),
            events: events_tx,
        })
        .unwrap();
    assert!(capture.is_capturing());

    let mut frames: Vec<AudioFrame> = Vec::new();
    while frames.len() < 16 {
        let frame = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
            .await
            .unwrap()
            .unwrap();
        frames.push(frame);
    }
    capture.stop();

    assert!(frames.iter().all(|f| f.samples.len() == FRAME_SAMPLES));
    assert!(frames.iter().all(|f| f.sample_rate == SAMPLE_RATE));
    assert!(frames.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert!(frames.iter().all(|f| !f.muted));
}

#[tokio::test]
async fn test_capture_tags_frames_while_speaking() {
    let input = SyntheticInput::looping(sine(440.0, 0.3, 0.3));
    let state = SessionStateMachine::new();
    state.transition(SessionState::Listening).unwrap();
    state.transition(SessionState::Processing).unwrap();
    state.transition(SessionState::Speaking).unwrap();

    let (frames_tx, mut frames_rx) = frame_queue(64);
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let mut capture = AudioCapture::new(input);
    capture
        .start(CaptureLinks {
            frames: frames_tx,
            state: state.handle(),
            cancel: CancellationToken::new(),
            events: events_tx,
        })
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
        .await
        .unwrap()
        .unwrap();
    capture.stop();

    assert!(frame.muted);
}

#[tokio::test]
async fn test_capture_drops_oldest_under_backpressure() {
    let input = SyntheticInput::once(silence(1.0)).with_pace(Duration::ZERO);
    let state = SessionStateMachine::new();
    let (frames_tx, frames_rx) = frame_queue(4);
    let (events_tx, _events_rx) = mpsc::unbounded_channel();

    let mut capture = AudioCapture::new(input);
    capture
        .start(CaptureLinks {
            frames: frames_tx,
            state: state.handle(),
            cancel: CancellationToken::new(),
            events: events_tx,
        })
        .unwrap();

    // 1s of audio is 33 frames; nobody is reading
    wait_until(|| frames_rx.dropped() >= 29).await;
    capture.stop();

    assert_eq!(frames_rx.len(), 4);
    assert_eq!(frames_rx.capacity(), 4);
}

#[tokio::test]
async fn test_capture_reopens_lost_device() {
    let input = SyntheticInput::new([
        OpenScript::Play {
            samples: sine(440.0, 0.1, 0.3),
            looped: false,
            then_fail: true,
        },
        OpenScript::Refuse,
        OpenScript::Play {
            samples: sine(440.0, 0.3, 0.3),
            looped: true,
            then_fail: false,
        },
    ]);
    let opens = input.opens();

    let state = SessionStateMachine::new();
    let (frames_tx, mut frames_rx) = frame_queue(256);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut capture = AudioCapture::new(input).with_reopen_backoff(Duration::from_millis(1));
    capture
        .start(CaptureLinks {
            frames: frames_tx,
            state: state.handle(),
            cancel: CancellationToken::new(),
            events: events_tx,
        })
        .unwrap();

    wait_until(|| opens.load(Ordering::SeqCst) == 3).await;

    // Frames keep flowing from the reopened device
    let mut seen = 0;
    while seen < 20 {
        tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
            .await
            .unwrap()
            .unwrap();
        seen += 1;
    }
    capture.stop();

    assert!(events_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_capture_reports_device_lost() {
    let mut script = vec![OpenScript::Play {
        samples: sine(440.0, 0.1, 0.3),
        looped: false,
        then_fail: true,
    }];
    script.extend((0..MAX_REOPEN_ATTEMPTS).map(|_| OpenScript::Refuse));
    let input = SyntheticInput::new(script);
    let opens = input.opens();

    let state = SessionStateMachine::new();
    let (frames_tx, mut frames_rx) = frame_queue(64);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut capture = AudioCapture::new(input).with_reopen_backoff(Duration::from_millis(1));
    capture
        .start(CaptureLinks {
            frames: frames_tx,
            state: state.handle(),
            cancel: CancellationToken::new(),
            events: events_tx,
        })
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, CaptureEvent::DeviceLost(_)));
    assert_eq!(opens.load(Ordering::SeqCst), 1 + MAX_REOPEN_ATTEMPTS as usize);

    // The frame queue closes with the capture source
    while frames_rx.try_recv().is_some() {}
    let closed = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
        .await
        .unwrap();
    assert!(closed.is_none());

    capture.stop();
}

#[tokio::test]
async fn test_capture_open_failure_is_reported_at_start() {
    let input = SyntheticInput::new([OpenScript::Refuse]);
    let state = SessionStateMachine::new();
    let (frames_tx, _frames_rx) = frame_queue(4);
    let (events_tx, _events_rx) = mpsc::unbounded_channel();

    let mut capture = AudioCapture::new(input);
    let err = capture
        .start(CaptureLinks {
            frames: frames_tx,
            state: state.handle(),
            cancel: CancellationToken::new(),
            events: events_tx,
        })
        .unwrap_err();

    assert!(matches!(err, parley::Error::Device(_)));
    assert!(!capture.is_capturing());
}
