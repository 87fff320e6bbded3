//! Playback engine core.
//!
//! [`EngineShared`] is the state the control thread and the render callback both touch. Every
//! field is an atomic; the callback never takes a lock. The decoder itself is not shared:
//! it is owned by the [`Renderer`], which lives inside the output stream's callback, so
//! closing the stream is what releases the decoder.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use audio_engine_types::{PlaybackData, PlaybackEvent, ProcessingState};

use crate::decode::{FrameSource, PcmFormat};
use crate::device::RenderFn;
use crate::notify::{Notifier, PlayerEvent, ProgressSource};

const NO_SEEK: u64 = u64::MAX;

/// Playback phase of one player.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    Idle = 0,
    Loading = 1,
    Playing = 2,
    Paused = 3,
    Stopped = 4,
    Completed = 5,
}

impl PlaybackState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Loading,
            2 => Self::Playing,
            3 => Self::Paused,
            4 => Self::Stopped,
            5 => Self::Completed,
            _ => Self::Idle,
        }
    }

    /// Processing state reported to listeners.
    pub fn to_wire(self) -> ProcessingState {
        match self {
            Self::Idle | Self::Stopped => ProcessingState::Idle,
            Self::Loading => ProcessingState::Loading,
            Self::Playing | Self::Paused => ProcessingState::Ready,
            Self::Completed => ProcessingState::Completed,
        }
    }
}

/// State shared between the control thread and the render callback.
#[derive(Debug)]
pub struct EngineShared {
    state: AtomicU8,
    current_frame: AtomicU64,
    /// Target frame, or `NO_SEEK`. Stored by control, swapped out by the callback.
    pending_seek: AtomicU64,
    /// Like `pending_seek`, but applied before the callback reads (rewind after stop).
    pending_rewind: AtomicU64,
    /// `f32` bits.
    volume: AtomicU32,
    /// Play was requested (survives a load).
    playing: AtomicBool,
    sample_rate: AtomicU32,
    channels: AtomicU32,
    total_frames: AtomicU64,
}

impl Default for EngineShared {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineShared {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(PlaybackState::Idle as u8),
            current_frame: AtomicU64::new(0),
            pending_seek: AtomicU64::new(NO_SEEK),
            pending_rewind: AtomicU64::new(NO_SEEK),
            volume: AtomicU32::new(1.0f32.to_bits()),
            playing: AtomicBool::new(false),
            sample_rate: AtomicU32::new(0),
            channels: AtomicU32::new(0),
            total_frames: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PlaybackState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move `from` → `to` only if the state is still `from`.
    pub fn transition(&self, from: PlaybackState, to: PlaybackState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame.load(Ordering::Acquire)
    }

    pub fn set_current_frame(&self, frame: u64) {
        self.current_frame.store(frame, Ordering::Release);
    }

    pub(crate) fn advance(&self, frames: u64) {
        self.current_frame.fetch_add(frames, Ordering::AcqRel);
    }

    /// Ask the callback to seek before it produces more audio. A newer request replaces an
    /// unconsumed one.
    pub fn request_seek(&self, frame: u64) {
        self.pending_seek.store(frame.min(NO_SEEK - 1), Ordering::Release);
    }

    /// Consume the pending seek, if any. Exactly one caller gets each request.
    pub fn take_seek(&self) -> Option<u64> {
        match self.pending_seek.swap(NO_SEEK, Ordering::AcqRel) {
            NO_SEEK => None,
            frame => Some(frame),
        }
    }

    pub fn pending_seek(&self) -> Option<u64> {
        match self.pending_seek.load(Ordering::Acquire) {
            NO_SEEK => None,
            frame => Some(frame),
        }
    }

    /// Reposition before the next callback produces any audio. Only valid while the
    /// stream is stopped.
    pub fn request_rewind(&self, frame: u64) {
        self.pending_rewind
            .store(frame.min(NO_SEEK - 1), Ordering::Release);
    }

    pub fn take_rewind(&self) -> Option<u64> {
        match self.pending_rewind.swap(NO_SEEK, Ordering::AcqRel) {
            NO_SEEK => None,
            frame => Some(frame),
        }
    }

    pub fn pending_rewind(&self) -> Option<u64> {
        match self.pending_rewind.load(Ordering::Acquire) {
            NO_SEEK => None,
            frame => Some(frame),
        }
    }

    /// Drop any unconsumed seek or rewind.
    pub fn clear_seeks(&self) {
        self.take_seek();
        self.take_rewind();
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    /// Store a gain; negative and non-finite values are clamped to `0.0`.
    pub fn set_volume(&self, volume: f32) {
        let v = if volume.is_finite() { volume.max(0.0) } else { 0.0 };
        self.volume.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }

    /// Publish the format of a freshly loaded source.
    pub fn set_format(&self, format: PcmFormat, total_frames: u64) {
        self.sample_rate.store(format.sample_rate, Ordering::Release);
        self.channels.store(format.channels as u32, Ordering::Release);
        self.total_frames.store(total_frames, Ordering::Release);
    }

    pub fn clear_format(&self) {
        self.set_format(PcmFormat::new(0, 0), 0);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    pub fn channels(&self) -> u16 {
        self.channels.load(Ordering::Acquire) as u16
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Acquire)
    }

    /// Position in microseconds. An unconsumed seek or rewind reports its target.
    pub fn position_micros(&self) -> u64 {
        let frame = self
            .pending_seek()
            .or_else(|| self.pending_rewind())
            .unwrap_or_else(|| self.current_frame());
        frames_to_micros(frame, self.sample_rate())
    }

    pub fn duration_micros(&self) -> u64 {
        frames_to_micros(self.total_frames(), self.sample_rate())
    }

    pub fn progress_snapshot(&self) -> PlaybackEvent {
        let duration = clamp_i64(self.duration_micros());
        PlaybackEvent {
            processing_state: self.state().to_wire(),
            update_position: clamp_i64(self.position_micros()),
            buffered_position: duration,
            duration,
            update_time: now_millis(),
            current_index: 0,
        }
    }

    pub fn settings_snapshot(&self) -> PlaybackData {
        PlaybackData::new(self.playing(), self.volume() as f64)
    }
}

/// `frames * 1_000_000 / rate`, truncating; `0` for an unknown rate.
pub fn frames_to_micros(frames: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    let v = frames as u128 * 1_000_000 / sample_rate as u128;
    u64::try_from(v).unwrap_or(u64::MAX)
}

/// `micros * rate / 1_000_000`, truncating.
pub fn micros_to_frames(micros: u64, sample_rate: u32) -> u64 {
    let v = micros as u128 * sample_rate as u128 / 1_000_000;
    u64::try_from(v).unwrap_or(u64::MAX)
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl ProgressSource for EngineShared {
    fn progress(&self) -> PlaybackEvent {
        self.progress_snapshot()
    }

    fn advancing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The render callback of the decode-in-callback engine.
pub struct Renderer {
    source: Box<dyn FrameSource>,
    shared: Arc<EngineShared>,
    notifier: Notifier,
    channels: usize,
}

impl Renderer {
    pub fn new(source: Box<dyn FrameSource>, shared: Arc<EngineShared>, notifier: Notifier) -> Self {
        let channels = source.format().channels.max(1) as usize;
        Self {
            source,
            shared,
            notifier,
            channels,
        }
    }

    /// Fill `out` (interleaved) completely.
    pub fn render(&mut self, out: &mut [f32]) {
        let ch = self.channels;
        let frames = out.len() / ch;

        if let Some(target) = self.shared.take_rewind() {
            self.apply_seek(target);
        }

        if self.shared.state() == PlaybackState::Completed {
            out.fill(0.0);
            if let Some(target) = self.shared.take_seek() {
                self.apply_seek(target);
                if self.shared.transition(PlaybackState::Completed, PlaybackState::Playing) {
                    self.emit_progress();
                }
            }
            return;
        }

        let read = self.source.read_frames(&mut out[..frames * ch]).min(frames);

        let gain = self.shared.volume();
        if gain != 1.0 {
            for s in &mut out[..read * ch] {
                *s *= gain;
            }
        }

        self.shared.advance(read as u64);

        if let Some(target) = self.shared.take_seek() {
            out[read * ch..].fill(0.0);
            self.apply_seek(target);
            return;
        }

        if read < frames {
            out[read * ch..].fill(0.0);
            if self.shared.transition(PlaybackState::Playing, PlaybackState::Completed) {
                self.emit_progress();
            }
        }
    }

    fn apply_seek(&mut self, target: u64) {
        // A failed seek leaves the position where it was.
        if self.source.seek_to_frame(target).is_ok() {
            self.shared.set_current_frame(target);
        }
    }

    fn emit_progress(&self) {
        self.notifier
            .notify(PlayerEvent::Progress(self.shared.progress_snapshot()));
    }

    pub fn into_render_fn(mut self) -> RenderFn {
        Box::new(move |out: &mut [f32]| self.render(out))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::notify::{ChannelListener, EventListener, EventPump, spawn_event_pump};
    use std::time::Duration;
    use anyhow::{Result, anyhow};

    /// In-memory source: a ramp `1, 2, 3, ...` per frame, duplicated on each channel.
    pub(crate) struct RampSource {
        pub format: PcmFormat,
        pub total: u64,
        pub pos: u64,
        pub fail_seeks: bool,
    }

    impl RampSource {
        pub(crate) fn new(rate: u32, channels: u16, total: u64) -> Self {
            Self {
                format: PcmFormat::new(rate, channels),
                total,
                pos: 0,
                fail_seeks: false,
            }
        }
    }

    impl FrameSource for RampSource {
        fn format(&self) -> PcmFormat {
            self.format
        }

        fn total_frames(&self) -> u64 {
            self.total
        }

        fn read_frames(&mut self, out: &mut [f32]) -> usize {
            let ch = self.format.channels as usize;
            let want = (out.len() / ch) as u64;
            let n = want.min(self.total.saturating_sub(self.pos));
            for i in 0..n as usize {
                let v = (self.pos + i as u64 + 1) as f32;
                out[i * ch..(i + 1) * ch].fill(v);
            }
            self.pos += n;
            n as usize
        }

        fn seek_to_frame(&mut self, frame: u64) -> Result<()> {
            if self.fail_seeks {
                return Err(anyhow!("seek refused"));
            }
            self.pos = frame.min(self.total);
            Ok(())
        }
    }

    fn renderer(
        source: RampSource,
    ) -> (
        Renderer,
        Arc<EngineShared>,
        crossbeam_channel::Receiver<(String, PlayerEvent)>,
        EventPump,
    ) {
        let shared = Arc::new(EngineShared::new());
        shared.set_format(source.format, source.total);
        shared.set_state(PlaybackState::Playing);
        let (listener, rx) = ChannelListener::unbounded();
        let (notifier, pump) =
            spawn_event_pump("t".to_string(), 16, listener, None, shared.clone()).unwrap();
        let r = Renderer::new(Box::new(source), shared.clone(), notifier);
        (r, shared, rx, pump)
    }

    #[test]
    fn state_maps_to_wire_codes() {
        assert_eq!(PlaybackState::Idle.to_wire(), ProcessingState::Idle);
        assert_eq!(PlaybackState::Stopped.to_wire(), ProcessingState::Idle);
        assert_eq!(PlaybackState::Loading.to_wire(), ProcessingState::Loading);
        assert_eq!(PlaybackState::Playing.to_wire(), ProcessingState::Ready);
        assert_eq!(PlaybackState::Paused.to_wire(), ProcessingState::Ready);
        assert_eq!(PlaybackState::Completed.to_wire(), ProcessingState::Completed);
    }

    #[test]
    fn time_math_truncates() {
        assert_eq!(frames_to_micros(44_100, 44_100), 1_000_000);
        assert_eq!(frames_to_micros(1, 44_100), 22);
        assert_eq!(frames_to_micros(10, 0), 0);
        assert_eq!(micros_to_frames(500_000, 44_100), 22_050);
        assert_eq!(micros_to_frames(22, 44_100), 0);
    }

    #[test]
    fn position_after_n_frames_is_truncated_micros() {
        let (mut r, shared, _rx, _pump) = renderer(RampSource::new(44_100, 1, 1_000_000));
        let mut buf = vec![0.0f32; 441];
        let mut last = 0;
        for n in 1..=20u64 {
            r.render(&mut buf);
            let pos = shared.position_micros();
            assert_eq!(pos, n * 441 * 1_000_000 / 44_100);
            assert!(pos >= last);
            last = pos;
        }
    }

    #[test]
    fn short_read_zero_fills_and_completes() {
        let mut src = RampSource::new(8_000, 2, 100);
        src.pos = 95;
        let (mut r, shared, rx, pump) = renderer(src);
        shared.set_current_frame(95);
        let mut buf = vec![9.0f32; 20];
        r.render(&mut buf);
        assert_eq!(&buf[..10], &[96.0, 96.0, 97.0, 97.0, 98.0, 98.0, 99.0, 99.0, 100.0, 100.0]);
        assert!(buf[10..].iter().all(|s| *s == 0.0));
        assert_eq!(shared.state(), PlaybackState::Completed);
        assert_eq!(shared.current_frame(), 100);

        drop(r);
        drop(pump);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        match events[0].1 {
            PlayerEvent::Progress(ev) => {
                assert_eq!(ev.processing_state, ProcessingState::Completed)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn completed_renders_silence_without_reading() {
        let (mut r, shared, _rx, _pump) = renderer(RampSource::new(8_000, 1, 4));
        shared.set_state(PlaybackState::Completed);
        let mut buf = vec![3.0f32; 8];
        r.render(&mut buf);
        assert!(buf.iter().all(|s| *s == 0.0));
        assert_eq!(shared.current_frame(), 0);
    }

    #[test]
    fn seek_pending_at_end_of_stream_wins_over_completion() {
        let mut src = RampSource::new(8_000, 1, 10);
        src.pos = 8;
        let (mut r, shared, _rx, _pump) = renderer(src);
        shared.request_seek(2);
        let mut buf = vec![0.0f32; 5];
        r.render(&mut buf);
        assert_eq!(&buf[..2], &[9.0, 10.0]);
        assert!(buf[2..].iter().all(|s| *s == 0.0));
        assert_eq!(shared.state(), PlaybackState::Playing);
        assert_eq!(shared.current_frame(), 2);
        assert!(shared.pending_seek().is_none());

        r.render(&mut buf);
        assert_eq!(buf, vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn seek_while_completed_reopens_playback() {
        let (mut r, shared, _rx, _pump) = renderer(RampSource::new(8_000, 1, 4));
        let mut buf = vec![0.0f32; 8];
        r.render(&mut buf);
        assert_eq!(shared.state(), PlaybackState::Completed);
        shared.request_seek(1);
        r.render(&mut buf);
        assert!(buf.iter().all(|s| *s == 0.0));
        assert_eq!(shared.state(), PlaybackState::Playing);
        assert_eq!(shared.current_frame(), 1);
        let mut small = vec![0.0f32; 2];
        r.render(&mut small);
        assert_eq!(small, vec![2.0, 3.0]);
    }

    #[test]
    fn failed_seek_leaves_position_unchanged() {
        let mut src = RampSource::new(8_000, 1, 100);
        src.fail_seeks = true;
        let (mut r, shared, _rx, _pump) = renderer(src);
        let mut buf = vec![0.0f32; 10];
        r.render(&mut buf);
        shared.request_seek(50);
        r.render(&mut buf);
        assert_eq!(shared.current_frame(), 20);
        assert!(shared.pending_seek().is_none());
    }

    #[test]
    fn rewind_applies_before_the_read() {
        let mut src = RampSource::new(8_000, 1, 100);
        src.pos = 40;
        let (mut r, shared, _rx, _pump) = renderer(src);
        shared.set_current_frame(0);
        shared.request_rewind(0);
        assert_eq!(shared.position_micros(), 0);
        let mut buf = vec![0.0f32; 4];
        r.render(&mut buf);
        assert_eq!(buf, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(shared.current_frame(), 4);
        assert!(shared.pending_rewind().is_none());
    }

    /// Blocks inside the first delivery until released.
    struct StallingListener {
        entered: crossbeam_channel::Sender<()>,
        release: crossbeam_channel::Receiver<()>,
        seen: crossbeam_channel::Sender<PlayerEvent>,
        stalled: AtomicBool,
    }

    impl EventListener for StallingListener {
        fn on_event(&self, _player_id: &str, event: &PlayerEvent) {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                let _ = self.entered.send(());
                let _ = self.release.recv();
            }
            let _ = self.seen.send(*event);
        }
    }

    #[test]
    fn completion_reaches_listener_when_queue_is_full() {
        let shared = Arc::new(EngineShared::new());
        shared.set_format(PcmFormat::new(8_000, 1), 4);
        shared.set_state(PlaybackState::Playing);
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded(1);
        let (seen_tx, seen_rx) = crossbeam_channel::unbounded();
        let listener = Arc::new(StallingListener {
            entered: entered_tx,
            release: release_rx,
            seen: seen_tx,
            stalled: AtomicBool::new(false),
        });
        let (notifier, pump) =
            spawn_event_pump("t".to_string(), 1, listener, None, shared.clone()).unwrap();

        let settings = PlayerEvent::Settings(shared.settings_snapshot());
        notifier.notify_blocking(settings);
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        notifier.notify_blocking(settings);

        let mut r = Renderer::new(
            Box::new(RampSource::new(8_000, 1, 4)),
            shared.clone(),
            notifier.clone(),
        );
        let mut buf = vec![0.0f32; 8];
        r.render(&mut buf);
        assert_eq!(shared.state(), PlaybackState::Completed);
        assert_eq!(notifier.dropped(), 0);

        release_tx.send(()).unwrap();
        let completed = (0..3).any(|_| {
            matches!(
                seen_rx.recv_timeout(Duration::from_secs(2)),
                Ok(PlayerEvent::Progress(ev)) if ev.processing_state == ProcessingState::Completed
            )
        });
        assert!(completed);
        drop(r);
        drop(notifier);
        drop(pump);
    }

    #[test]
    fn volume_zero_silences_and_unity_is_identity() {
        let (mut r, shared, _rx, _pump) = renderer(RampSource::new(8_000, 2, 1_000));
        let mut buf = vec![0.0f32; 16];
        shared.set_volume(0.0);
        r.render(&mut buf);
        assert!(buf.iter().all(|s| *s == 0.0));

        shared.set_volume(1.0);
        r.render(&mut buf);
        let expected: Vec<f32> = (9..=16).flat_map(|v| [v as f32, v as f32]).collect();
        assert_eq!(buf, expected);

        shared.set_volume(0.5);
        r.render(&mut buf);
        assert_eq!(buf[0], 8.5);
    }

    #[test]
    fn volume_rejects_negative_and_nan() {
        let shared = EngineShared::new();
        shared.set_volume(-1.0);
        assert_eq!(shared.volume(), 0.0);
        shared.set_volume(f32::NAN);
        assert_eq!(shared.volume(), 0.0);
        shared.set_volume(2.5);
        assert_eq!(shared.volume(), 2.5);
    }

    #[test]
    fn pending_seek_is_consumed_once_and_reported_as_position() {
        let shared = EngineShared::new();
        shared.set_format(PcmFormat::new(1_000, 1), 10_000);
        shared.set_current_frame(100);
        shared.request_seek(2_000);
        assert_eq!(shared.position_micros(), 2_000_000);
        assert_eq!(shared.take_seek(), Some(2_000));
        assert_eq!(shared.take_seek(), None);
        assert_eq!(shared.position_micros(), 100_000);
    }

    #[test]
    fn snapshots_report_duration_as_buffered_position() {
        let shared = EngineShared::new();
        shared.set_format(PcmFormat::new(44_100, 1), 88_200);
        shared.set_state(PlaybackState::Paused);
        shared.set_playing(false);
        shared.set_volume(0.25);
        let ev = shared.progress_snapshot();
        assert_eq!(ev.duration, 2_000_000);
        assert_eq!(ev.buffered_position, 2_000_000);
        assert_eq!(ev.processing_state, ProcessingState::Ready);
        assert_eq!(ev.current_index, 0);
        assert!(ev.update_time > 0);
        let data = shared.settings_snapshot();
        assert!(!data.playing);
        assert_eq!(data.volume, 0.25);
    }
}
