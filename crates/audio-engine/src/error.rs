//! Control-surface error taxonomy.
//!
//! Internal stages return `anyhow::Result`; failures crossing the public transport/registry
//! surface are folded into [`PlayerError`] so callers get a stable kind plus a message.

use audio_engine_types::ErrorResponse;

/// Failure reported synchronously by a transport or registry operation.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    /// Decoder or output device could not be initialized.
    #[error("open failed: {0}")]
    Open(String),
    /// Neither the hinted nor the content-sniffing probe recognized the source.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("seek failed: {0}")]
    Seek(String),
    /// Start/stop of an already open stream failed.
    #[error("device error: {0}")]
    Device(String),
    #[error("player {0} already exists")]
    PlayerExists(String),
    #[error("only {0} concurrent player(s) supported")]
    PlayerLimit(usize),
    #[error("unknown player {0}")]
    UnknownPlayer(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("{0} is not implemented")]
    NotImplemented(String),
}

impl PlayerError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Open(_) => "open_failed",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::Seek(_) => "seek_failed",
            Self::Device(_) => "device_error",
            Self::PlayerExists(_) => "player_exists",
            Self::PlayerLimit(_) => "player_limit",
            Self::UnknownPlayer(_) => "unknown_player",
            Self::InvalidArgs(_) => "invalid_args",
            Self::NotImplemented(_) => "not_implemented",
        }
    }

    /// Map a failed load onto the taxonomy, keeping the full context chain in the message.
    pub fn from_open(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        if err.downcast_ref::<crate::decode::UnsupportedFormat>().is_some() {
            Self::UnsupportedFormat(message)
        } else {
            Self::Open(message)
        }
    }

    pub fn device(err: anyhow::Error) -> Self {
        Self::Device(format!("{err:#}"))
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn from_open_keeps_context_chain() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("no such file")).context("open /tmp/x");
        let mapped = PlayerError::from_open(err.unwrap_err());
        assert_eq!(mapped.kind(), "open_failed");
        assert!(mapped.to_string().contains("open /tmp/x: no such file"));
    }

    #[test]
    fn from_open_detects_unsupported_format() {
        let err = anyhow::Error::new(crate::decode::UnsupportedFormat("x.bin".to_string()))
            .context("probe");
        let mapped = PlayerError::from_open(err);
        assert_eq!(mapped.kind(), "unsupported_format");
    }

    #[test]
    fn to_response_carries_kind_and_message() {
        let resp = PlayerError::PlayerLimit(1).to_response();
        assert_eq!(resp.code, "player_limit");
        assert_eq!(resp.message, "only 1 concurrent player(s) supported");
    }
}
