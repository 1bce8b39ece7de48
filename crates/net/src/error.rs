//! Error types for the turn manager.
//!
//! Protocol violations are returned to the caller so that a hostile or
//! buggy peer can be dropped without taking the session down.

use lockstep_sim::{ClientId, SimError, Turn};
use lockstep_wire::WireError;
use thiserror::Error;

/// A message from a peer that breaks the lockstep protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Command targets a turn outside `(current, current + delay + 1]`.
    #[error("command for turn {turn} outside window ({current}, {max}]")]
    CommandOutOfWindow { turn: Turn, current: Turn, max: Turn },

    #[error("client {0} is not tracked")]
    UnknownClient(ClientId),

    #[error("client {0} is already tracked")]
    ClientAlreadyTracked(ClientId),

    /// Batch-finished notice that does not advance the client by one turn.
    #[error("client {client} finished commands for turn {got}, expected {expected}")]
    OutOfSequenceCommands {
        client: ClientId,
        expected: Turn,
        got: Turn,
    },

    /// Hash report that does not advance the client by one turn.
    #[error("client {client} reported update for turn {got}, expected {expected}")]
    OutOfSequenceUpdate {
        client: ClientId,
        expected: Turn,
        got: Turn,
    },

    /// Command sent for a turn the client has already sealed or cannot fill yet.
    #[error("client {client} sent a command for turn {got}, expected {expected}")]
    UnexpectedCommandTurn {
        client: ClientId,
        expected: Turn,
        got: Turn,
    },

    /// Turn-ready broadcast that skips or repeats a turn.
    #[error("turn {got} marked ready, expected {expected}")]
    ReadyTurnOutOfSequence { expected: Turn, got: Turn },

    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),
}

/// Invalid turn manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("command_delay must be at least 2, got {0}")]
    CommandDelayTooShort(u32),
    #[error("full_hash_interval must be at least 1")]
    ZeroHashInterval,
    #[error("{0} must be greater than zero")]
    ZeroTurnLength(&'static str),
}

/// Errors surfaced by turn manager operations.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("simulation error: {0}")]
    Simulation(#[from] SimError),
    #[error("malformed message: {0}")]
    Wire(#[from] WireError),
    #[error("no game was quicksaved")]
    NoQuickSave,
}
