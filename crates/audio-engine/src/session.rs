//! Playback backends.
//!
//! A [`PlayerBackend`] is one open decoder+device pair. Two strategies sit behind it:
//! - [`DirectSession`]: the decoder is pulled inside the render callback; a seek is a
//!   request the callback honours before producing more audio
//! - [`QueuedSession`]: a decode thread fills a [`SharedAudio`] queue that the callback
//!   drains without blocking; a seek stops the device and repositions the decode thread
//!
//! Either way, dropping the session closes the device before the decoder is released.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender};

use crate::config::{Backend, EngineConfig};
use crate::decode::FrameSource;
use crate::device::{OutputBackend, OutputStream};
use crate::engine::{EngineShared, PlaybackState, Renderer};
use crate::notify::{Notifier, PlayerEvent};
use crate::queue::{SharedAudio, calc_max_buffered_samples};

const PREFILL_WAIT: Duration = Duration::from_millis(250);

/// One open decoder+device pair behind the transport controller.
pub trait PlayerBackend {
    /// Start (or resume) the output device.
    fn start(&mut self) -> Result<()>;

    /// Stop the output device. Returns once no render callback is in flight.
    fn stop(&mut self) -> Result<()>;

    /// Move playback to `frame` (already clamped to the stream length).
    ///
    /// On a stopped session the next `start` renders from `frame`; nothing queued before
    /// the seek is played.
    fn seek(&mut self, frame: u64) -> Result<()>;

    fn backend(&self) -> Backend;
}

/// Open a session of the configured kind over `source`.
///
/// `source` must already emit the format the output was negotiated at.
pub fn open_session(
    config: &EngineConfig,
    output: &mut dyn OutputBackend,
    source: Box<dyn FrameSource>,
    shared: Arc<EngineShared>,
    notifier: Notifier,
) -> Result<Box<dyn PlayerBackend>> {
    match config.backend {
        Backend::Direct => Ok(Box::new(DirectSession::open(output, source, shared, notifier)?)),
        Backend::Queued => Ok(Box::new(QueuedSession::open(
            config, output, source, shared, notifier,
        )?)),
    }
}

/// Decode-in-callback session.
pub struct DirectSession {
    stream: Box<dyn OutputStream>,
    shared: Arc<EngineShared>,
    running: bool,
}

impl DirectSession {
    pub fn open(
        output: &mut dyn OutputBackend,
        source: Box<dyn FrameSource>,
        shared: Arc<EngineShared>,
        notifier: Notifier,
    ) -> Result<Self> {
        let format = source.format();
        let renderer = Renderer::new(source, shared.clone(), notifier);
        let stream = output
            .open(format, renderer.into_render_fn())
            .context("open output stream")?;
        Ok(Self {
            stream,
            shared,
            running: false,
        })
    }
}

impl PlayerBackend for DirectSession {
    fn start(&mut self) -> Result<()> {
        self.stream.start()?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stream.stop()?;
        self.running = false;
        Ok(())
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        if self.running {
            self.shared.request_seek(frame);
            return Ok(());
        }
        // No callback in flight: reposition before the next read.
        self.shared.take_seek();
        self.shared.request_rewind(frame);
        self.shared
            .transition(PlaybackState::Completed, PlaybackState::Paused);
        Ok(())
    }

    fn backend(&self) -> Backend {
        Backend::Direct
    }
}

enum DecodeCommand {
    Seek { frame: u64, ack: Sender<Result<()>> },
    Shutdown,
}

/// Session with a background decode thread feeding a bounded queue.
pub struct QueuedSession {
    // Declared first: dropped (device closed) before the decode thread is joined.
    stream: Option<Box<dyn OutputStream>>,
    queue: Arc<SharedAudio>,
    shared: Arc<EngineShared>,
    cmd_tx: Sender<DecodeCommand>,
    decode_thread: Option<JoinHandle<()>>,
    running: bool,
}

impl QueuedSession {
    pub fn open(
        config: &EngineConfig,
        output: &mut dyn OutputBackend,
        source: Box<dyn FrameSource>,
        shared: Arc<EngineShared>,
        notifier: Notifier,
    ) -> Result<Self> {
        let format = source.format();
        let channels = format.channels.max(1) as usize;
        let queue = Arc::new(SharedAudio::new(
            channels,
            calc_max_buffered_samples(format.sample_rate, channels, config.buffer_seconds),
        ));

        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let refill = config.refill_max_frames.max(1);
        let decode_thread = {
            let queue = queue.clone();
            std::thread::Builder::new()
                .name("engine-decode".to_string())
                .spawn(move || decode_loop(source, queue, cmd_rx, refill))
                .context("spawn decode thread")?
        };

        let mut session = Self {
            stream: None,
            queue: queue.clone(),
            shared: shared.clone(),
            cmd_tx,
            decode_thread: Some(decode_thread),
            running: false,
        };

        let mut render = QueueRenderer {
            queue,
            shared,
            notifier,
            channels,
        };
        let stream = output
            .open(format, Box::new(move |out: &mut [f32]| render.render(out)))
            .context("open output stream")?;
        session.stream = Some(stream);
        session.queue.wait_for_any(PREFILL_WAIT);
        tracing::debug!(
            buffered_frames = session.queue.len_frames(),
            capacity_frames = session.queue.max_frames(),
            "decode queue primed"
        );
        Ok(session)
    }

    fn stream(&mut self) -> Result<&mut Box<dyn OutputStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| anyhow!("output stream closed"))
    }
}

impl PlayerBackend for QueuedSession {
    fn start(&mut self) -> Result<()> {
        self.stream()?.start()?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stream()?.stop()?;
        self.running = false;
        Ok(())
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        let resume = self.running;
        if resume {
            self.stream()?.stop()?;
        }
        self.queue.interrupt();
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        self.cmd_tx
            .send(DecodeCommand::Seek { frame, ack: ack_tx })
            .map_err(|_| anyhow!("decode thread exited"))?;
        let result = ack_rx
            .recv()
            .map_err(|_| anyhow!("decode thread exited"))
            .and_then(|r| r);
        if result.is_ok() {
            self.shared.set_current_frame(frame);
            let reopened = if resume {
                PlaybackState::Playing
            } else {
                PlaybackState::Paused
            };
            if self.shared.transition(PlaybackState::Completed, reopened) {
                tracing::debug!(frame, "seek reopened a completed stream");
            }
        }
        self.queue.wait_for_any(PREFILL_WAIT);
        if resume {
            self.stream()?.start()?;
        }
        result
    }

    fn backend(&self) -> Backend {
        Backend::Queued
    }
}

impl Drop for QueuedSession {
    fn drop(&mut self) {
        drop(self.stream.take());
        self.queue.close();
        self.queue.interrupt();
        let _ = self.cmd_tx.send(DecodeCommand::Shutdown);
        if let Some(join) = self.decode_thread.take() {
            let _ = join.join();
        }
    }
}

fn decode_loop(
    mut source: Box<dyn FrameSource>,
    queue: Arc<SharedAudio>,
    cmd_rx: Receiver<DecodeCommand>,
    refill_frames: usize,
) {
    let channels = queue.channels();
    let mut buf = vec![0.0f32; refill_frames * channels];
    let mut at_end = false;

    loop {
        let cmd = if at_end {
            match cmd_rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            }
        } else {
            cmd_rx.try_recv().ok()
        };

        match cmd {
            Some(DecodeCommand::Shutdown) => break,
            Some(DecodeCommand::Seek { frame, ack }) => {
                let result = source.seek_to_frame(frame);
                if let Err(e) = &result {
                    tracing::warn!(frame, "decoder seek failed: {e:#}");
                }
                queue.reopen();
                at_end = false;
                let _ = ack.send(result);
                continue;
            }
            None => {}
        }

        let read = source.read_frames(&mut buf);
        if read > 0 {
            // `false` means a seek or shutdown is waiting; the chunk is stale anyway.
            queue.push_interleaved_blocking(&buf[..read * channels]);
        }
        if read < refill_frames {
            queue.close();
            at_end = true;
        }
    }
    tracing::debug!("decode thread exiting");
}

struct QueueRenderer {
    queue: Arc<SharedAudio>,
    shared: Arc<EngineShared>,
    notifier: Notifier,
    channels: usize,
}

impl QueueRenderer {
    fn render(&mut self, out: &mut [f32]) {
        if self.shared.state() == PlaybackState::Completed {
            out.fill(0.0);
            return;
        }

        let popped = self.queue.pop_into(out);
        let filled = popped.frames * self.channels;

        let gain = self.shared.volume();
        if gain != 1.0 {
            for s in &mut out[..filled] {
                *s *= gain;
            }
        }
        out[filled..].fill(0.0);
        self.shared.advance(popped.frames as u64);

        if popped.drained
            && self
                .shared
                .transition(PlaybackState::Playing, PlaybackState::Completed)
        {
            self.notifier
                .notify(PlayerEvent::Progress(self.shared.progress_snapshot()));
        }
    }
}
