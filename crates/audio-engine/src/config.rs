//! Engine configuration.
//!
//! Loaded from TOML (every field optional) and overridden from the command line.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

/// Which playback strategy backs a player.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Decode inside the output callback (pull model, lock-free shared state).
    #[default]
    Direct,
    /// Decode on a background thread into a bounded queue drained by the callback.
    Queued,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "queued" => Ok(Self::Queued),
            other => Err(anyhow!("unknown backend: {other} (expected direct or queued)")),
        }
    }
}

/// Playback tuning parameters shared by decode/resample/playback stages.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Playback strategy used for new players.
    pub backend: Backend,
    /// Output device by case-insensitive substring match; default device when unset.
    pub device: Option<String>,
    /// Discard output instead of opening an audio device.
    pub null_output: bool,
    /// Maximum number of concurrently registered players.
    pub max_players: usize,
    /// Requested fixed device buffer size in frames (clamped to what the device supports).
    pub buffer_frames: Option<u32>,
    /// Resampler input chunk size in frames.
    pub chunk_frames: usize,
    /// Max frames pulled per output callback refill (queued backend).
    pub refill_max_frames: usize,
    /// Target queue depth in seconds (queued backend).
    pub buffer_seconds: f32,
    /// Capacity of the notification handoff queue per player.
    pub notification_capacity: usize,
    /// Emit progress periodically while playing; `0` disables.
    pub progress_interval_ms: u64,
}

impl Default for EngineConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            backend: Backend::Direct,
            device: None,
            null_output: false,
            max_players: 1,
            buffer_frames: None,
            chunk_frames: 1024,
            refill_max_frames: 4096,
            buffer_seconds: 2.0,
            notification_capacity: 64,
            progress_interval_ms: 0,
        }
    }
}

impl EngineConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::from_toml(&raw).with_context(|| format!("parse config {:?}", path))
    }

    /// Parse configuration from a TOML string; missing keys take their defaults.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg = toml::from_str::<EngineConfig>(raw)?;
        Ok(cfg.sanitized())
    }

    /// Clamp values that would otherwise stall or break a stage.
    pub fn sanitized(mut self) -> Self {
        self.max_players = self.max_players.max(1);
        self.chunk_frames = self.chunk_frames.max(1);
        self.refill_max_frames = self.refill_max_frames.max(1);
        self.notification_capacity = self.notification_capacity.max(1);
        if !(self.buffer_seconds.is_finite() && self.buffer_seconds > 0.0) {
            self.buffer_seconds = 2.0;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg = EngineConfig::from_toml("").unwrap();
        assert_eq!(cfg.backend, Backend::Direct);
        assert_eq!(cfg.max_players, 1);
        assert_eq!(cfg.chunk_frames, 1024);
        assert_eq!(cfg.notification_capacity, 64);
    }

    #[test]
    fn toml_overrides_fields() {
        let cfg = EngineConfig::from_toml(
            "backend = \"queued\"\ndevice = \"usb\"\nmax_players = 4\nbuffer_frames = 512\n",
        )
        .unwrap();
        assert_eq!(cfg.backend, Backend::Queued);
        assert_eq!(cfg.device.as_deref(), Some("usb"));
        assert_eq!(cfg.max_players, 4);
        assert_eq!(cfg.buffer_frames, Some(512));
    }

    #[test]
    fn sanitized_clamps_degenerate_values() {
        let cfg = EngineConfig::from_toml("max_players = 0\nchunk_frames = 0\nbuffer_seconds = -1.0\n")
            .unwrap();
        assert_eq!(cfg.max_players, 1);
        assert_eq!(cfg.chunk_frames, 1);
        assert_eq!(cfg.buffer_seconds, 2.0);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(EngineConfig::from_toml("backend = \"exotic\"").is_err());
        assert!("exotic".parse::<Backend>().is_err());
        assert_eq!(" Queued ".parse::<Backend>().unwrap(), Backend::Queued);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = EngineConfig::load(Path::new("/nonexistent/engine.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }
}
