//! Headless output backend.
//!
//! Behaves like a device (same start/stop/close contract, same render callback) but
//! discards the audio. Two pacing modes:
//! - [`NullOutput::paced`]: a thread invokes the callback at sample-rate cadence
//! - [`NullOutput::manual`]: nothing runs until a [`NullPump`] pulls a buffer
//!
//! `stop` and close take the same lock the callback runs under, so they return only after
//! an in-flight callback has finished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::decode::PcmFormat;
use crate::device::{OutputBackend, OutputStream, RenderFn};

const DEFAULT_BUFFER_FRAMES: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pacing {
    Realtime,
    Manual,
}

type CoreSlot = Arc<Mutex<Weak<Mutex<NullCore>>>>;

/// Output backend that never touches audio hardware.
pub struct NullOutput {
    pacing: Pacing,
    buffer_frames: usize,
    forced_format: Option<PcmFormat>,
    current: CoreSlot,
}

/// Pulls buffers from whichever stream a manual [`NullOutput`] opened last.
#[derive(Clone)]
pub struct NullPump {
    current: CoreSlot,
}

struct NullCore {
    render: Option<RenderFn>,
    running: bool,
    buffer: Vec<f32>,
    callbacks: u64,
}

impl NullOutput {
    /// Output driven by its own thread at real-time pace.
    pub fn paced(buffer_frames: Option<u32>) -> Self {
        Self::with_pacing(Pacing::Realtime, buffer_frames)
    }

    /// Output driven explicitly through the returned pump.
    pub fn manual(buffer_frames: usize) -> (Self, NullPump) {
        let output = Self::with_pacing(Pacing::Manual, Some(buffer_frames as u32));
        let pump = NullPump {
            current: output.current.clone(),
        };
        (output, pump)
    }

    fn with_pacing(pacing: Pacing, buffer_frames: Option<u32>) -> Self {
        Self {
            pacing,
            buffer_frames: buffer_frames
                .map(|n| n as usize)
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_BUFFER_FRAMES),
            forced_format: None,
            current: Arc::new(Mutex::new(Weak::new())),
        }
    }

    /// Negotiate `format` regardless of the source, as a device with a fixed format would.
    pub fn with_format(mut self, format: PcmFormat) -> Self {
        self.forced_format = Some(format);
        self
    }
}

impl OutputBackend for NullOutput {
    fn negotiate(&mut self, native: PcmFormat) -> Result<PcmFormat> {
        Ok(self.forced_format.unwrap_or(native))
    }

    fn open(&mut self, format: PcmFormat, render: RenderFn) -> Result<Box<dyn OutputStream>> {
        if format.channels == 0 || format.sample_rate == 0 {
            return Err(anyhow!("invalid null output format {format:?}"));
        }
        let core = Arc::new(Mutex::new(NullCore {
            render: Some(render),
            running: false,
            buffer: vec![0.0; self.buffer_frames * format.channels as usize],
            callbacks: 0,
        }));
        if let Ok(mut slot) = self.current.lock() {
            *slot = Arc::downgrade(&core);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = match self.pacing {
            Pacing::Manual => None,
            Pacing::Realtime => {
                let period = Duration::from_secs_f64(
                    self.buffer_frames as f64 / format.sample_rate as f64,
                );
                let core = core.clone();
                let shutdown = shutdown.clone();
                Some(
                    thread::Builder::new()
                        .name("null-output".to_string())
                        .spawn(move || {
                            while !shutdown.load(Ordering::Acquire) {
                                if let Ok(mut core) = core.lock() {
                                    core.tick();
                                }
                                thread::sleep(period);
                            }
                        })?,
                )
            }
        };

        Ok(Box::new(NullStream {
            core,
            format,
            shutdown,
            thread,
        }))
    }
}

impl NullCore {
    fn tick(&mut self) -> bool {
        if !self.running {
            return false;
        }
        let Some(render) = self.render.as_mut() else {
            return false;
        };
        render(&mut self.buffer);
        self.callbacks += 1;
        true
    }
}

impl NullPump {
    /// Run one callback on the current stream and return what it rendered.
    ///
    /// Returns `None` when no stream is open or the stream is stopped.
    pub fn pump(&self) -> Option<Vec<f32>> {
        let core = self.current.lock().ok()?.upgrade()?;
        let mut core = core.lock().ok()?;
        if core.tick() {
            Some(core.buffer.clone())
        } else {
            None
        }
    }

    /// Run up to `n` callbacks; returns how many actually ran.
    pub fn pump_n(&self, n: usize) -> usize {
        (0..n).take_while(|_| self.pump().is_some()).count()
    }

    /// Whether a stream is open and started.
    pub fn is_running(&self) -> bool {
        self.with_core(|c| c.running).unwrap_or(false)
    }

    /// Callbacks run on the current stream.
    pub fn callbacks(&self) -> u64 {
        self.with_core(|c| c.callbacks).unwrap_or(0)
    }

    fn with_core<T>(&self, f: impl FnOnce(&NullCore) -> T) -> Option<T> {
        let core = self.current.lock().ok()?.upgrade()?;
        let core = core.lock().ok()?;
        Some(f(&core))
    }
}

struct NullStream {
    core: Arc<Mutex<NullCore>>,
    format: PcmFormat,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl OutputStream for NullStream {
    fn start(&mut self) -> Result<()> {
        let mut core = self.core.lock().map_err(|_| anyhow!("null output poisoned"))?;
        core.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut core = self.core.lock().map_err(|_| anyhow!("null output poisoned"))?;
        core.running = false;
        Ok(())
    }

    fn format(&self) -> PcmFormat {
        self.format
    }
}

impl Drop for NullStream {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if let Ok(mut core) = self.core.lock() {
            core.running = false;
            core.render = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn counting_render(counter: Arc<AtomicU64>) -> RenderFn {
        Box::new(move |buf: &mut [f32]| {
            counter.fetch_add(1, Ordering::Relaxed);
            buf.fill(0.25);
        })
    }

    #[test]
    fn manual_pump_runs_only_while_started() {
        let (mut out, pump) = NullOutput::manual(64);
        let counter = Arc::new(AtomicU64::new(0));
        let mut stream = out
            .open(PcmFormat::new(48_000, 2), counting_render(counter.clone()))
            .unwrap();

        assert!(pump.pump().is_none());
        stream.start().unwrap();
        let buf = pump.pump().unwrap();
        assert_eq!(buf.len(), 128);
        assert!(buf.iter().all(|s| *s == 0.25));
        stream.stop().unwrap();
        stream.stop().unwrap();
        assert!(pump.pump().is_none());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dropping_stream_releases_render_callback() {
        let (mut out, pump) = NullOutput::manual(16);
        let witness = Arc::new(());
        let held = witness.clone();
        let mut stream = out
            .open(
                PcmFormat::new(8_000, 1),
                Box::new(move |buf: &mut [f32]| {
                    let _ = &held;
                    buf.fill(0.0);
                }),
            )
            .unwrap();
        stream.start().unwrap();
        assert_eq!(Arc::strong_count(&witness), 2);
        drop(stream);
        assert_eq!(Arc::strong_count(&witness), 1);
        assert!(pump.pump().is_none());
    }

    #[test]
    fn paced_output_invokes_callback_until_closed() {
        let mut out = NullOutput::paced(Some(64));
        let counter = Arc::new(AtomicU64::new(0));
        let mut stream = out
            .open(PcmFormat::new(8_000, 1), counting_render(counter.clone()))
            .unwrap();
        stream.start().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::Relaxed) < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        drop(stream);
        let after_close = counter.load(Ordering::Relaxed);
        assert!(after_close >= 3);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::Relaxed), after_close);
    }

    #[test]
    fn forced_format_overrides_negotiation() {
        let mut out = NullOutput::paced(None).with_format(PcmFormat::new(48_000, 2));
        let fmt = out.negotiate(PcmFormat::new(44_100, 1)).unwrap();
        assert_eq!(fmt, PcmFormat::new(48_000, 2));
    }
}
