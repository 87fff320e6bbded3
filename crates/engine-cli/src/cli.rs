use std::path::PathBuf;

use anyhow::Result;
use audio_engine::{Backend, EngineConfig};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "enginectl", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// TOML engine config; command-line flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Playback backend: direct or queued
    #[arg(long)]
    pub backend: Option<Backend>,

    /// Discard audio instead of opening a device
    #[arg(long)]
    pub null_output: bool,

    /// Maximum number of players `serve` accepts
    #[arg(long)]
    pub max_players: Option<usize>,

    /// Requested device buffer size in frames
    #[arg(long)]
    pub buffer_frames: Option<u32>,

    /// Emit progress every N ms while playing (0 disables)
    #[arg(long)]
    pub progress_interval_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List output devices and exit
    ListDevices,

    /// Play one URI until it completes, printing player events as JSON lines
    Play {
        /// file:// URI, http(s):// URL, or a plain path
        uri: String,

        /// Initial volume (1.0 = unity gain)
        #[arg(long, default_value_t = 1.0)]
        volume: f64,

        /// Start position in milliseconds
        #[arg(long)]
        seek_ms: Option<u64>,
    },

    /// Read JSON method calls from stdin and write responses and events to stdout
    Serve,
}

impl Args {
    /// Config file (or defaults) with command-line overrides applied.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut cfg = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        if let Some(device) = &self.device {
            cfg.device = Some(device.clone());
        }
        if let Some(backend) = self.backend {
            cfg.backend = backend;
        }
        if self.null_output {
            cfg.null_output = true;
        }
        if let Some(max) = self.max_players {
            cfg.max_players = max;
        }
        if let Some(frames) = self.buffer_frames {
            cfg.buffer_frames = Some(frames);
        }
        if let Some(ms) = self.progress_interval_ms {
            cfg.progress_interval_ms = ms;
        }
        Ok(cfg.sanitized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "enginectl",
            "--backend",
            "queued",
            "--null-output",
            "--max-players",
            "3",
            "serve",
        ]);
        let cfg = args.engine_config().unwrap();
        assert_eq!(cfg.backend, Backend::Queued);
        assert!(cfg.null_output);
        assert_eq!(cfg.max_players, 3);
        assert!(matches!(args.cmd, Command::Serve));
    }

    #[test]
    fn play_parses_uri_and_options() {
        let args = Args::parse_from(["enginectl", "play", "/tmp/a.flac", "--seek-ms", "1500"]);
        match args.cmd {
            Command::Play {
                uri,
                volume,
                seek_ms,
            } => {
                assert_eq!(uri, "/tmp/a.flac");
                assert_eq!(volume, 1.0);
                assert_eq!(seek_ms, Some(1500));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_backend_is_a_parse_error() {
        assert!(Args::try_parse_from(["enginectl", "--backend", "exotic", "serve"]).is_err());
    }
}
