//! Method-call dispatch.
//!
//! Maps `{ "player": id?, "method": name, "args": {...} }` calls onto the registry and its
//! transports. Calls without a `player` go to the only player when exactly one exists.

use audio_engine_types::{ErrorResponse, InitArgs, LoadArgs, OutboundMessage, SeekArgs, VolumeArgs};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::PlayerError;
use crate::notify::PlayerEvent;
use crate::registry::PlayerRegistry;
use crate::transport::Transport;

/// Accepted but without effect.
const STUB_METHODS: &[&str] = &[
    "setSpeed",
    "setLoopMode",
    "setShuffleMode",
    "setPitch",
    "setSkipSilence",
];

/// One inbound method call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MethodCall {
    /// Echoed back in the response.
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub player: Option<String>,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

/// Execute one call. The `Ok` value is the method's result payload.
pub fn dispatch(registry: &mut PlayerRegistry, call: &MethodCall) -> Result<Value, PlayerError> {
    match call.method.as_str() {
        "init" => {
            let id = match call.player.clone() {
                Some(id) => id,
                None => parse_args::<InitArgs>(&call.args)?.id,
            };
            registry.init(&id)?;
            Ok(json!({}))
        }
        "disposePlayer" => {
            let id = call
                .player
                .clone()
                .or_else(|| parse_args::<InitArgs>(&call.args).ok().map(|a| a.id))
                .ok_or_else(|| PlayerError::InvalidArgs("player id required".to_string()))?;
            registry.dispose_player(&id);
            Ok(json!({}))
        }
        "disposeAllPlayers" => {
            registry.dispose_all_players();
            Ok(json!({}))
        }
        "load" => {
            let args: LoadArgs = parse_args(&call.args)?;
            let uri = args
                .audio_source
                .first_uri()
                .ok_or_else(|| PlayerError::InvalidArgs("audioSource has no uri".to_string()))?
                .to_string();
            let duration = target(registry, call)?.load(&uri)?;
            Ok(json!({ "duration": duration }))
        }
        "play" => {
            target(registry, call)?.play()?;
            Ok(json!({}))
        }
        "pause" => {
            target(registry, call)?.pause()?;
            Ok(json!({}))
        }
        "stop" => {
            target(registry, call)?.stop()?;
            Ok(json!({}))
        }
        "seek" => {
            let args: SeekArgs = parse_args(&call.args)?;
            target(registry, call)?.seek(args.position.unwrap_or(0))?;
            Ok(json!({}))
        }
        "setVolume" => {
            let args: VolumeArgs = parse_args(&call.args)?;
            target(registry, call)?.set_volume(args.volume);
            Ok(json!({}))
        }
        method if STUB_METHODS.contains(&method) => {
            target(registry, call)?;
            tracing::info!(method, "not implemented; ignoring");
            Ok(json!({}))
        }
        other => Err(PlayerError::NotImplemented(other.to_string())),
    }
}

/// Parse and execute one JSON line, producing the response to send back.
pub fn handle_line(registry: &mut PlayerRegistry, line: &str) -> OutboundMessage {
    let call: MethodCall = match serde_json::from_str(line) {
        Ok(call) => call,
        Err(e) => {
            return OutboundMessage::Response {
                seq: None,
                result: None,
                error: Some(ErrorResponse {
                    code: "invalid_args".to_string(),
                    message: format!("malformed call: {e}"),
                }),
            };
        }
    };
    respond(call.seq, dispatch(registry, &call))
}

pub fn respond(seq: Option<u64>, result: Result<Value, PlayerError>) -> OutboundMessage {
    match result {
        Ok(value) => OutboundMessage::Response {
            seq,
            result: Some(value),
            error: None,
        },
        Err(e) => OutboundMessage::Response {
            seq,
            result: None,
            error: Some(e.to_response()),
        },
    }
}

/// Outbound form of a player event.
pub fn event_message(player: &str, event: &PlayerEvent) -> OutboundMessage {
    match *event {
        PlayerEvent::Progress(event) => OutboundMessage::Event {
            player: player.to_string(),
            event,
        },
        PlayerEvent::Settings(data) => OutboundMessage::Data {
            player: player.to_string(),
            data,
        },
    }
}

fn target<'a>(
    registry: &'a mut PlayerRegistry,
    call: &MethodCall,
) -> Result<&'a mut Transport, PlayerError> {
    let id = match call.player.as_deref() {
        Some(id) => id.to_string(),
        None => registry
            .sole_player_id()
            .map(str::to_string)
            .ok_or_else(|| PlayerError::InvalidArgs("player id required".to_string()))?,
    };
    registry.get_mut(&id)
}

fn parse_args<T: DeserializeOwned>(args: &Value) -> Result<T, PlayerError> {
    let args = if args.is_null() { json!({}) } else { args.clone() };
    serde_json::from_value(args).map_err(|e| PlayerError::InvalidArgs(e.to_string()))
}
