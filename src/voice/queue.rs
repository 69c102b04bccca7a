//! Bounded capture→STT frame queue
//!
//! Capture must stay real-time, so a full queue drops its oldest frame
//! instead of blocking the producer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::frame::AudioFrame;

struct Shared {
    frames: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

/// Producer half of the frame queue
#[derive(Clone)]
pub struct FrameSender {
    shared: Arc<Shared>,
}

/// Consumer half of the frame queue
pub struct FrameReceiver {
    shared: Arc<Shared>,
}

/// Create a drop-oldest frame queue holding at most `capacity` frames
#[must_use]
pub fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        frames: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity,
        dropped: AtomicU64::new(0),
        closed: AtomicBool::new(false),
        notify: Notify::new(),
    });

    (
        FrameSender {
            shared: Arc::clone(&shared),
        },
        FrameReceiver { shared },
    )
}

impl FrameSender {
    /// Enqueue a frame without blocking
    ///
    /// Returns `true` if an older frame was evicted to make room.
    pub fn push(&self, frame: AudioFrame) -> bool {
        let evicted = {
            let Ok(mut frames) = self.shared.frames.lock() else {
                return false;
            };
            let evicted = if frames.len() >= self.shared.capacity {
                frames.pop_front();
                true
            } else {
                false
            };
            frames.push_back(frame);
            evicted
        };

        if evicted {
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                tracing::warn!(dropped, "STT falling behind, dropping oldest audio frames");
            }
        }

        self.shared.notify.notify_one();
        evicted
    }

    /// Total frames dropped so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue; the receiver drains what is left, then sees `None`
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

impl FrameReceiver {
    /// Wait for the next frame; `None` once closed and drained
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        loop {
            if let Some(frame) = self.try_recv() {
                return Some(frame);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return self.try_recv();
            }
            self.shared.notify.notified().await;
        }
    }

    /// Take the next frame if one is queued
    pub fn try_recv(&mut self) -> Option<AudioFrame> {
        self.shared
            .frames
            .lock()
            .ok()
            .and_then(|mut frames| frames.pop_front())
    }

    /// Frames currently queued
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.frames.lock().map(|f| f.len()).unwrap_or(0)
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Total frames dropped so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        // Last producer gone (the receiver holds the other reference)
        if Arc::strong_count(&self.shared) == 2 {
            self.close();
        }
    }
}
