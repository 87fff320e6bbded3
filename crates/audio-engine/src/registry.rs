//! Player registry.
//!
//! Owns every [`Transport`] by id. The number of live players is capped by
//! `EngineConfig::max_players` (one by default).

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::device::{CpalOutput, OutputBackend};
use crate::error::PlayerError;
use crate::notify::EventListener;
use crate::null_output::NullOutput;
use crate::transport::Transport;

/// Builds the output backend for a new player.
pub type OutputFactory = Box<dyn FnMut(&EngineConfig) -> Box<dyn OutputBackend>>;

pub struct PlayerRegistry {
    config: EngineConfig,
    listener: Arc<dyn EventListener>,
    make_output: OutputFactory,
    players: BTreeMap<String, Transport>,
}

impl PlayerRegistry {
    pub fn new(
        config: EngineConfig,
        listener: Arc<dyn EventListener>,
        make_output: OutputFactory,
    ) -> Self {
        Self {
            config: config.sanitized(),
            listener,
            make_output,
            players: BTreeMap::new(),
        }
    }

    /// Registry whose players open the configured device, or a paced null output when
    /// `null_output` is set.
    pub fn with_default_output(config: EngineConfig, listener: Arc<dyn EventListener>) -> Self {
        Self::new(config, listener, Box::new(default_output))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a player bound to `id`.
    pub fn init(&mut self, id: &str) -> Result<&mut Transport, PlayerError> {
        if self.players.contains_key(id) {
            return Err(PlayerError::PlayerExists(id.to_string()));
        }
        if self.players.len() >= self.config.max_players {
            return Err(PlayerError::PlayerLimit(self.config.max_players));
        }
        let output = (self.make_output)(&self.config);
        let transport = Transport::new(id, self.config.clone(), output, self.listener.clone())?;
        tracing::info!(player = id, backend = ?self.config.backend, "player created");
        Ok(self.players.entry(id.to_string()).or_insert(transport))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut Transport, PlayerError> {
        self.players
            .get_mut(id)
            .ok_or_else(|| PlayerError::UnknownPlayer(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<&Transport> {
        self.players.get(id)
    }

    /// The only player, when exactly one exists.
    pub fn sole_player_id(&self) -> Option<&str> {
        if self.players.len() == 1 {
            self.players.keys().next().map(String::as_str)
        } else {
            None
        }
    }

    /// Release a player. Returns whether it existed; disposing twice is fine.
    pub fn dispose_player(&mut self, id: &str) -> bool {
        match self.players.remove(id) {
            Some(mut transport) => {
                transport.dispose();
                tracing::info!(player = id, "player disposed");
                true
            }
            None => false,
        }
    }

    pub fn dispose_all_players(&mut self) {
        let ids: Vec<String> = self.players.keys().cloned().collect();
        for id in ids {
            self.dispose_player(&id);
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.players.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

impl Drop for PlayerRegistry {
    fn drop(&mut self) {
        self.dispose_all_players();
    }
}

fn default_output(config: &EngineConfig) -> Box<dyn OutputBackend> {
    if config.null_output {
        Box::new(NullOutput::paced(config.buffer_frames))
    } else {
        Box::new(CpalOutput::new(config.device.clone(), config.buffer_frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopListener;

    fn registry(max_players: usize) -> PlayerRegistry {
        let config = EngineConfig {
            max_players,
            ..EngineConfig::default()
        };
        PlayerRegistry::new(
            config,
            Arc::new(NoopListener),
            Box::new(|_: &EngineConfig| {
                Box::new(NullOutput::paced(Some(64))) as Box<dyn OutputBackend>
            }),
        )
    }

    #[test]
    fn default_limit_allows_one_player() {
        let mut reg = registry(1);
        reg.init("a").unwrap();
        let err = reg.init("b").err().unwrap();
        assert_eq!(err.kind(), "player_limit");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut reg = registry(4);
        reg.init("a").unwrap();
        let err = reg.init("a").err().unwrap();
        assert_eq!(err.kind(), "player_exists");
    }

    #[test]
    fn dispose_is_idempotent_and_frees_a_slot() {
        let mut reg = registry(1);
        reg.init("a").unwrap();
        assert!(reg.dispose_player("a"));
        assert!(!reg.dispose_player("a"));
        reg.init("b").unwrap();
        assert_eq!(reg.sole_player_id(), Some("b"));
        reg.dispose_all_players();
        reg.dispose_all_players();
        assert!(reg.is_empty());
    }

    #[test]
    fn unknown_player_is_an_error() {
        let mut reg = registry(2);
        let err = reg.get_mut("nope").err().unwrap();
        assert_eq!(err.kind(), "unknown_player");
    }

    #[test]
    fn sole_player_requires_exactly_one() {
        let mut reg = registry(2);
        assert_eq!(reg.sole_player_id(), None);
        reg.init("a").unwrap();
        reg.init("b").unwrap();
        assert_eq!(reg.sole_player_id(), None);
        assert_eq!(reg.ids().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
