//! Transport controller.
//!
//! The control-thread face of one player: `load`/`play`/`pause`/`stop`/`seek`/`set_volume`
//! plus position and duration queries. Every state-changing call emits a progress snapshot
//! before it returns; play/pause/stop/volume also emit a settings snapshot.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::config::EngineConfig;
use crate::decode::{FrameSource, SymphoniaSource};
use crate::device::OutputBackend;
use crate::engine::{EngineShared, PlaybackState, micros_to_frames};
use crate::error::PlayerError;
use crate::notify::{EventListener, EventPump, Notifier, PlayerEvent, spawn_event_pump};
use crate::session::{PlayerBackend, open_session};
use crate::uri;

/// One player: an output backend, at most one open session, and its notification pump.
pub struct Transport {
    id: String,
    config: EngineConfig,
    session: Option<Box<dyn PlayerBackend>>,
    output: Box<dyn OutputBackend>,
    shared: Arc<EngineShared>,
    notifier: Notifier,
    _pump: EventPump,
}

impl Transport {
    pub fn new(
        id: impl Into<String>,
        config: EngineConfig,
        output: Box<dyn OutputBackend>,
        listener: Arc<dyn EventListener>,
    ) -> Result<Self, PlayerError> {
        let id = id.into();
        let shared = Arc::new(EngineShared::new());
        let interval = (config.progress_interval_ms > 0)
            .then(|| Duration::from_millis(config.progress_interval_ms));
        let (notifier, pump) = spawn_event_pump(
            id.clone(),
            config.notification_capacity,
            listener,
            interval,
            shared.clone(),
        )
        .map_err(|e| PlayerError::Open(format!("{e:#}")))?;

        Ok(Self {
            id,
            config,
            session: None,
            output,
            shared,
            notifier,
            _pump: pump,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    /// Shared engine state (read-only use outside the engine).
    pub fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    pub fn is_loaded(&self) -> bool {
        self.session.is_some()
    }

    pub fn position_micros(&self) -> u64 {
        self.shared.position_micros()
    }

    pub fn duration_micros(&self) -> u64 {
        self.shared.duration_micros()
    }

    /// Open `uri` and make it the current source. Returns its duration in microseconds.
    ///
    /// On failure the player is left idle with nothing open.
    pub fn load(&mut self, uri: &str) -> Result<u64, PlayerError> {
        let chunk_frames = self.config.chunk_frames;
        self.load_with(uri, move |output| {
            let locator = uri::resolve(uri)?;
            let mut source = SymphoniaSource::open(&locator)?;
            let native = source.native_format();
            let format = output.negotiate(native).context("negotiate output format")?;
            source.configure_output(format, chunk_frames)?;
            tracing::info!(
                source = %locator.describe(),
                codec = source.info().codec.as_deref().unwrap_or("unknown"),
                bit_depth = ?source.info().bit_depth,
                native_hz = native.sample_rate,
                native_channels = native.channels,
                output_hz = format.sample_rate,
                output_channels = format.channels,
                "source opened"
            );
            Ok(Box::new(source) as Box<dyn FrameSource>)
        })
    }

    /// Make an already decoded source current. Its format must be one the output accepts
    /// unchanged.
    pub fn load_source(
        &mut self,
        label: &str,
        source: Box<dyn FrameSource>,
    ) -> Result<u64, PlayerError> {
        self.load_with(label, move |output| {
            let format = source.format();
            let negotiated = output.negotiate(format)?;
            if negotiated != format {
                return Err(anyhow!(
                    "output negotiated {negotiated:?} for a fixed {format:?} source"
                ));
            }
            Ok(source)
        })
    }

    fn load_with<F>(&mut self, label: &str, open: F) -> Result<u64, PlayerError>
    where
        F: FnOnce(&mut dyn OutputBackend) -> Result<Box<dyn FrameSource>>,
    {
        tracing::info!(player = %self.id, source = label, "load");
        self.shared.set_state(PlaybackState::Loading);
        // The old callback may still advance the frame counter until the device is closed.
        self.teardown();
        self.shared.set_current_frame(0);
        self.shared.clear_seeks();
        self.emit_progress();

        match self.open_pair(open) {
            Ok(session) => {
                self.session = Some(session);
                let next = if self.shared.playing() {
                    PlaybackState::Playing
                } else {
                    PlaybackState::Paused
                };
                self.shared.set_state(next);
                if next == PlaybackState::Playing {
                    if let Err(e) = self.start_session() {
                        self.teardown();
                        self.shared.set_state(PlaybackState::Idle);
                        self.emit_progress();
                        return Err(PlayerError::Open(format!("{e:#}")));
                    }
                }
                tracing::info!(
                    player = %self.id,
                    duration_us = self.shared.duration_micros(),
                    state = ?next,
                    "loaded"
                );
                self.emit_progress();
                Ok(self.shared.duration_micros())
            }
            Err(e) => {
                tracing::warn!(player = %self.id, source = label, "load failed: {e:#}");
                self.shared.clear_format();
                self.shared.set_state(PlaybackState::Idle);
                self.emit_progress();
                Err(PlayerError::from_open(e))
            }
        }
    }

    fn open_pair<F>(&mut self, open: F) -> Result<Box<dyn PlayerBackend>>
    where
        F: FnOnce(&mut dyn OutputBackend) -> Result<Box<dyn FrameSource>>,
    {
        let source = open(self.output.as_mut())?;
        self.shared.set_format(source.format(), source.total_frames());
        open_session(
            &self.config,
            self.output.as_mut(),
            source,
            self.shared.clone(),
            self.notifier.clone(),
        )
    }

    fn start_session(&mut self) -> Result<()> {
        match self.session.as_mut() {
            Some(session) => session.start(),
            None => Ok(()),
        }
    }

    /// Start playback, or record the intent when nothing is loaded yet.
    pub fn play(&mut self) -> Result<(), PlayerError> {
        let Some(session) = self.session.as_mut() else {
            self.shared.set_playing(true);
            self.emit_settings();
            return Ok(());
        };

        let was_playing = self.shared.playing();
        self.shared.set_playing(true);
        let prev = self.shared.state();
        let seek_pending =
            self.shared.pending_seek().is_some() || self.shared.pending_rewind().is_some();
        if prev == PlaybackState::Completed && !seek_pending {
            if let Err(e) = session.seek(0) {
                self.shared.set_playing(was_playing);
                return Err(PlayerError::Seek(format!("{e:#}")));
            }
        }
        let resumed_from = self.shared.state();
        self.shared.set_state(PlaybackState::Playing);
        if let Err(e) = session.start() {
            self.shared.set_state(resumed_from);
            self.shared.set_playing(was_playing);
            tracing::warn!(player = %self.id, "play failed: {e:#}");
            return Err(PlayerError::device(e));
        }
        tracing::debug!(player = %self.id, "play");
        self.emit_settings();
        self.emit_progress();
        Ok(())
    }

    /// Stop the device and keep the position. Idempotent.
    pub fn pause(&mut self) -> Result<(), PlayerError> {
        self.shared.set_playing(false);
        if let Some(session) = self.session.as_mut() {
            session.stop().map_err(PlayerError::device)?;
            self.shared
                .transition(PlaybackState::Playing, PlaybackState::Paused);
        }
        tracing::debug!(player = %self.id, "pause");
        self.emit_settings();
        self.emit_progress();
        Ok(())
    }

    /// Stop the device and rewind to the start. The source stays open.
    pub fn stop(&mut self) -> Result<(), PlayerError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.stop().map_err(PlayerError::device)?;
        // Stopped, so this lands before the next callback reads.
        if let Err(e) = session.seek(0) {
            tracing::warn!(player = %self.id, "rewind on stop failed: {e:#}");
        }
        self.shared.set_current_frame(0);
        self.shared.set_playing(false);
        self.shared.set_state(PlaybackState::Stopped);
        tracing::debug!(player = %self.id, "stop");
        self.emit_settings();
        self.emit_progress();
        Ok(())
    }

    /// Seek to `position_micros`, clamped to `[0, duration]`.
    pub fn seek(&mut self, position_micros: i64) -> Result<(), PlayerError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let micros = u64::try_from(position_micros).unwrap_or(0);
        let mut frame = micros_to_frames(micros, self.shared.sample_rate());
        let total = self.shared.total_frames();
        if total > 0 {
            frame = frame.min(total);
        }
        let result = session.seek(frame);
        tracing::debug!(player = %self.id, frame, ok = result.is_ok(), "seek");
        self.emit_progress();
        result.map_err(|e| PlayerError::Seek(format!("{e:#}")))
    }

    pub fn set_volume(&mut self, volume: f64) {
        self.shared.set_volume(volume as f32);
        self.emit_settings();
    }

    /// Close the device and decoder. The player stays usable for another `load`.
    pub fn dispose(&mut self) {
        self.teardown();
        self.shared.set_playing(false);
        self.shared.set_state(PlaybackState::Idle);
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.stop() {
                tracing::warn!(player = %self.id, "stop before close failed: {e:#}");
            }
            drop(session);
            self.shared.clear_format();
            tracing::debug!(player = %self.id, "session closed");
        }
    }

    fn emit_progress(&self) {
        self.notifier
            .notify_blocking(PlayerEvent::Progress(self.shared.progress_snapshot()));
    }

    fn emit_settings(&self) {
        self.notifier
            .notify_blocking(PlayerEvent::Settings(self.shared.settings_snapshot()));
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.teardown();
    }
}
