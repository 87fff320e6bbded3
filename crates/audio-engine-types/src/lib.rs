use serde::{Deserialize, Serialize};

/// Processing state reported to listeners.
///
/// Serialized as its integer code (`0..=4`) so hosts can map it directly onto their own
/// processing-state enums.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ProcessingState {
    /// Nothing loaded, or playback was stopped.
    Idle,
    /// A source is being opened.
    Loading,
    /// Waiting on data. Never produced by the local engine (no buffering model).
    Buffering,
    /// A source is open; playing or paused.
    Ready,
    /// The source reached its end.
    Completed,
}

impl From<ProcessingState> for u8 {
    fn from(state: ProcessingState) -> Self {
        match state {
            ProcessingState::Idle => 0,
            ProcessingState::Loading => 1,
            ProcessingState::Buffering => 2,
            ProcessingState::Ready => 3,
            ProcessingState::Completed => 4,
        }
    }
}

impl TryFrom<u8> for ProcessingState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Idle),
            1 => Ok(Self::Loading),
            2 => Ok(Self::Buffering),
            3 => Ok(Self::Ready),
            4 => Ok(Self::Completed),
            other => Err(format!("unknown processing state {other}")),
        }
    }
}

/// Progress snapshot emitted on transport changes and on completion.
///
/// All positions and durations are in microseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackEvent {
    pub processing_state: ProcessingState,
    /// Playback position at `update_time`.
    pub update_position: i64,
    /// Equal to `duration`; the engine has no partial-buffering model.
    pub buffered_position: i64,
    pub duration: i64,
    /// Wall-clock milliseconds since the Unix epoch when the snapshot was taken.
    pub update_time: i64,
    /// Always `0`: a player holds exactly one source.
    pub current_index: u32,
}

/// Settings snapshot emitted on play/pause and volume changes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackData {
    pub playing: bool,
    pub volume: f64,
    /// Fixed at `1.0`; rate changes are not supported.
    pub speed: f64,
    /// Fixed at `0` (off).
    pub loop_mode: u8,
    /// Fixed at `0` (off).
    pub shuffle_mode: u8,
}

impl PlaybackData {
    /// Settings snapshot with the unsupported fields pinned to their defaults.
    pub fn new(playing: bool, volume: f64) -> Self {
        Self {
            playing,
            volume,
            speed: 1.0,
            loop_mode: 0,
            shuffle_mode: 0,
        }
    }
}

/// Audio source tree sent with a `load` call.
///
/// Only the first leaf `uri` is played; concatenating sources are flattened to their first child.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AudioSourceMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub children: Vec<AudioSourceMessage>,
}

impl AudioSourceMessage {
    /// First playable URI in depth-first order.
    pub fn first_uri(&self) -> Option<&str> {
        if let Some(uri) = self.uri.as_deref() {
            return Some(uri);
        }
        self.children.iter().find_map(|c| c.first_uri())
    }
}

/// Arguments of `init`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitArgs {
    pub id: String,
}

/// Arguments of `load`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadArgs {
    pub audio_source: AudioSourceMessage,
}

/// Arguments of `seek`. A missing position seeks to the start.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SeekArgs {
    #[serde(default)]
    pub position: Option<i64>,
}

/// Arguments of `setVolume`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeArgs {
    pub volume: f64,
}

/// Structured failure returned by the method-call surface.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Stable error kind, e.g. `open_failed` or `player_limit`.
    pub code: String,
    pub message: String,
}

/// One line of outbound traffic from a serving host.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Acknowledgement of a method call.
    Response {
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorResponse>,
    },
    /// Progress snapshot for one player.
    Event { player: String, event: PlaybackEvent },
    /// Settings snapshot for one player.
    Data { player: String, data: PlaybackData },
}
