//! Turn manager configuration.

use std::path::PathBuf;

use lockstep_sim::Turn;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default number of turns between issuing and executing a command.
pub const DEFAULT_COMMAND_DELAY: u32 = 2;

/// With a delay of one, a turn would have to be sealed before the turn
/// that seals it has run.
pub const MIN_COMMAND_DELAY: u32 = 2;

/// Default single-player turn length in milliseconds.
pub const DEFAULT_TURN_LENGTH_SP: u32 = 200;

/// Default multiplayer turn length in milliseconds.
pub const DEFAULT_TURN_LENGTH_MP: u32 = 500;

/// Default period, in turns, of forced full state hashes.
pub const DEFAULT_FULL_HASH_INTERVAL: u32 = 20;

/// Turn scheduling parameters shared by every role.
///
/// The command queue holds `command_delay + 1` turns and the accepted
/// command window is `(current, current + command_delay + 1]`. Peers in
/// one session MUST agree on `command_delay` and `full_hash_interval`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub command_delay: u32,
    pub turn_length_sp_ms: u32,
    pub turn_length_mp_ms: u32,
    pub full_hash_interval: u32,
    /// Where to write the state dump on the first sync error.
    pub oos_dump_path: Option<PathBuf>,
    /// Compute and log a state hash after every local turn.
    pub verify_local_hashes: bool,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            command_delay: DEFAULT_COMMAND_DELAY,
            turn_length_sp_ms: DEFAULT_TURN_LENGTH_SP,
            turn_length_mp_ms: DEFAULT_TURN_LENGTH_MP,
            full_hash_interval: DEFAULT_FULL_HASH_INTERVAL,
            oos_dump_path: None,
            verify_local_hashes: false,
        }
    }
}

impl TurnConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_delay < MIN_COMMAND_DELAY {
            return Err(ConfigError::CommandDelayTooShort(self.command_delay));
        }
        if self.full_hash_interval == 0 {
            return Err(ConfigError::ZeroHashInterval);
        }
        if self.turn_length_sp_ms == 0 {
            return Err(ConfigError::ZeroTurnLength("turn_length_sp_ms"));
        }
        if self.turn_length_mp_ms == 0 {
            return Err(ConfigError::ZeroTurnLength("turn_length_mp_ms"));
        }
        Ok(())
    }

    /// Ready turn of a fresh session.
    ///
    /// The first batch sealed at turn 0 is for `command_delay`; every turn
    /// before it starts out ready with no commands.
    pub fn initial_ready_turn(&self) -> Turn {
        self.command_delay.saturating_sub(1)
    }

    /// Number of turn slots in the command queue.
    pub fn queue_depth(&self) -> usize {
        self.command_delay as usize + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnConfig::default();
        assert_eq!(config.command_delay, 2);
        assert_eq!(config.turn_length_sp_ms, 200);
        assert_eq!(config.turn_length_mp_ms, 500);
        assert_eq!(config.full_hash_interval, 20);
        assert_eq!(config.queue_depth(), 3);
        assert_eq!(config.initial_ready_turn(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_delay_of_one_rejected() {
        let config = TurnConfig {
            command_delay: 1,
            ..TurnConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::CommandDelayTooShort(1)));

        let config = TurnConfig {
            command_delay: 3,
            ..TurnConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.initial_ready_turn(), 2);
        assert_eq!(config.queue_depth(), 4);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TurnConfig =
            serde_json::from_str(r#"{"command_delay": 4, "oos_dump_path": "logs/oos.txt"}"#)
                .unwrap();
        assert_eq!(config.command_delay, 4);
        assert_eq!(config.queue_depth(), 5);
        assert_eq!(config.turn_length_mp_ms, DEFAULT_TURN_LENGTH_MP);
        assert_eq!(config.oos_dump_path, Some(PathBuf::from("logs/oos.txt")));
        assert!(!config.verify_local_hashes);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = TurnConfig {
            verify_local_hashes: true,
            ..TurnConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: TurnConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        let zero_delay = TurnConfig {
            command_delay: 0,
            ..TurnConfig::default()
        };
        assert_eq!(
            zero_delay.validate(),
            Err(ConfigError::CommandDelayTooShort(0))
        );

        let zero_interval = TurnConfig {
            full_hash_interval: 0,
            ..TurnConfig::default()
        };
        assert_eq!(zero_interval.validate(), Err(ConfigError::ZeroHashInterval));

        let zero_mp = TurnConfig {
            turn_length_mp_ms: 0,
            ..TurnConfig::default()
        };
        assert_eq!(
            zero_mp.validate(),
            Err(ConfigError::ZeroTurnLength("turn_length_mp_ms"))
        );
    }
}
