//! Bounded sample queue between the queued backend's decode thread and the render callback.
//!
//! The producer blocks when the queue is full; the callback drains it without ever waiting
//! (a contended lock reads as an underrun). Seeking reuses the same queue: the control
//! thread [`interrupt`](SharedAudio::interrupt)s a blocked producer, and the producer
//! [`reopen`](SharedAudio::reopen)s it once the decoder has moved.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

/// Thread-safe bounded queue for interleaved `f32` audio samples.
///
/// ## Design
/// - Bounded by `max_buffered_samples` to cap memory and latency.
/// - A single [`Condvar`] signals "state changed" to producers and waiters.
/// - The `done` flag lives under the same mutex as the samples so a consumer can tell
///   "drained at end of stream" from "producer is behind" atomically.
pub struct SharedAudio {
    channels: usize,
    inner: Mutex<SharedInner>,
    cv: Condvar,
    max_buffered_samples: usize,
    interrupted: AtomicBool,
}

struct SharedInner {
    queue: VecDeque<f32>,
    done: bool,
}

/// Result of a non-blocking pop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Popped {
    /// Whole frames written to the front of the output buffer.
    pub frames: usize,
    /// The producer closed the queue and nothing is left in it.
    pub drained: bool,
}

/// Compute a conservative queue capacity in **samples** for a `(rate, channels, seconds)` target.
///
/// - If `buffer_seconds` is non-finite or `<= 0.0`, a safe fallback is used.
/// - The returned value is `ceil(rate_hz * buffer_seconds) * channels` (saturating).
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };

    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl SharedAudio {
    /// Create a new bounded queue.
    ///
    /// `max_buffered_samples` is a cap in **samples** (not frames), rounded down to whole
    /// frames and never below one frame.
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        let max_buffered_samples = (max_buffered_samples / channels).max(1) * channels;
        Self {
            channels,
            inner: Mutex::new(SharedInner {
                queue: VecDeque::with_capacity(max_buffered_samples),
                done: false,
            }),
            cv: Condvar::new(),
            max_buffered_samples,
            interrupted: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Maximum buffered frames (capacity) for this queue.
    pub fn max_frames(&self) -> usize {
        self.max_buffered_samples / self.channels
    }

    /// Current buffered frames (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        self.lock().queue.len() / self.channels
    }

    /// Mark the queue as finished and wake all waiters. Idempotent.
    pub fn close(&self) {
        self.lock().done = true;
        self.cv.notify_all();
    }

    /// Make a blocked (or the next) push return early, until [`reopen`](Self::reopen).
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        // Taking the lock orders the flag against a producer about to wait.
        drop(self.lock());
        self.cv.notify_all();
    }

    /// Empty the queue and accept data again (after a seek).
    pub fn reopen(&self) {
        {
            let mut g = self.lock();
            g.queue.clear();
            g.done = false;
        }
        self.interrupted.store(false, Ordering::Release);
        self.cv.notify_all();
    }

    /// Push interleaved samples, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was closed or interrupted before every sample was
    /// accepted; the rest are dropped.
    pub fn push_interleaved_blocking(&self, samples: &[f32]) -> bool {
        let mut offset = 0;

        while offset < samples.len() {
            let mut g = self.lock();
            while g.queue.len() >= self.max_buffered_samples
                && !g.done
                && !self.interrupted.load(Ordering::Acquire)
            {
                g = self.cv.wait(g).unwrap_or_else(|e| e.into_inner());
            }
            if g.done || self.interrupted.load(Ordering::Acquire) {
                return false;
            }

            let room = self.max_buffered_samples - g.queue.len();
            let take = room.min(samples.len() - offset);
            g.queue.extend(&samples[offset..offset + take]);
            offset += take;

            drop(g);
            self.cv.notify_all();
        }
        true
    }

    /// Copy up to `out.len()` samples (whole frames) into `out` without waiting.
    ///
    /// A lock held by the producer counts as "nothing available".
    pub fn pop_into(&self, out: &mut [f32]) -> Popped {
        let mut g = match self.inner.try_lock() {
            Ok(g) => g,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Popped {
                    frames: 0,
                    drained: false,
                };
            }
        };

        let frames = (g.queue.len() / self.channels).min(out.len() / self.channels);
        let take = frames * self.channels;
        for (dst, src) in out[..take].iter_mut().zip(g.queue.drain(..take)) {
            *dst = src;
        }
        let drained = g.done && g.queue.is_empty();
        drop(g);
        if take > 0 {
            self.cv.notify_all();
        }
        Popped { frames, drained }
    }

    /// Wait briefly for any buffered audio (or end of stream) to appear.
    ///
    /// Returns `true` if data or end of stream is observed before `timeout`.
    pub fn wait_for_any(&self, timeout: Duration) -> bool {
        let g = self.lock();
        let (g, _) = self
            .cv
            .wait_timeout_while(g, timeout, |g| g.queue.is_empty() && !g.done)
            .unwrap_or_else(|e| e.into_inner());
        !g.queue.is_empty() || g.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn calc_max_buffered_samples_fallbacks() {
        assert_eq!(calc_max_buffered_samples(48_000, 2, 2.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, -1.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, f32::NAN), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, f32::INFINITY), 192_000);
    }

    #[test]
    fn capacity_rounds_to_whole_frames() {
        let q = SharedAudio::new(2, 7);
        assert_eq!(q.max_frames(), 3);
        let q = SharedAudio::new(2, 0);
        assert_eq!(q.max_frames(), 1);
    }

    #[test]
    fn pop_into_empty_reports_nothing() {
        let q = SharedAudio::new(2, 16);
        let mut out = [0.0f32; 8];
        assert_eq!(
            q.pop_into(&mut out),
            Popped {
                frames: 0,
                drained: false
            }
        );
    }

    #[test]
    fn pop_into_returns_available_whole_frames() {
        let q = SharedAudio::new(2, 64);
        assert!(q.push_interleaved_blocking(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));

        let mut out = [0.0f32; 4];
        let popped = q.pop_into(&mut out);
        assert_eq!(popped.frames, 2);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(q.len_frames(), 1);
    }

    #[test]
    fn drained_only_after_close_and_empty() {
        let q = SharedAudio::new(1, 8);
        q.push_interleaved_blocking(&[1.0, 2.0]);
        q.close();
        let mut out = [0.0f32; 1];
        assert!(!q.pop_into(&mut out).drained);
        let last = q.pop_into(&mut out);
        assert_eq!(last.frames, 1);
        assert!(last.drained);
    }

    #[test]
    fn push_blocks_until_consumer_makes_room() {
        let q = Arc::new(SharedAudio::new(1, 4));
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push_interleaved_blocking(&[1.0; 10]))
        };
        let mut got = 0;
        let mut out = [0.0f32; 3];
        while got < 10 {
            got += q.pop_into(&mut out).frames;
            thread::yield_now();
        }
        assert!(producer.join().unwrap());
    }

    #[test]
    fn interrupt_releases_blocked_producer_until_reopen() {
        let q = Arc::new(SharedAudio::new(1, 2));
        q.push_interleaved_blocking(&[1.0, 2.0]);
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push_interleaved_blocking(&[3.0, 4.0]))
        };
        thread::sleep(Duration::from_millis(20));
        q.interrupt();
        assert!(!producer.join().unwrap());
        assert!(!q.push_interleaved_blocking(&[5.0]));

        q.reopen();
        assert_eq!(q.len_frames(), 0);
        assert!(q.push_interleaved_blocking(&[6.0]));
    }

    #[test]
    fn close_rejects_pushes_but_keeps_buffered_samples() {
        let q = SharedAudio::new(1, 8);
        q.push_interleaved_blocking(&[1.0]);
        q.close();
        assert!(!q.push_interleaved_blocking(&[2.0]));
        let mut out = [0.0f32; 4];
        let popped = q.pop_into(&mut out);
        assert_eq!(popped.frames, 1);
        assert!(popped.drained);
        assert_eq!(out[0], 1.0);
    }

    #[test]
    fn wait_for_any_returns_true_when_data_arrives() {
        let q = Arc::new(SharedAudio::new(2, 64));
        let q_push = q.clone();
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);

        let handle = thread::spawn(move || {
            let _ = rx.recv();
            q_push.push_interleaved_blocking(&[1.0, 2.0]);
        });

        let _ = tx.send(());
        assert!(q.wait_for_any(Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn wait_for_any_returns_false_on_timeout() {
        let q = SharedAudio::new(2, 64);
        assert!(!q.wait_for_any(Duration::from_millis(10)));
    }
}
