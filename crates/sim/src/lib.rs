//! Lockstep Simulation Contract
//!
//! This crate holds the types shared by every participant in a lockstep
//! session and the contract the turn manager uses to drive a deterministic
//! simulation. The turn manager decides *when* and *with which commands* the
//! simulation advances; the simulation itself only has to be deterministic.
//!
//! # Determinism Constraints
//!
//! A `Simulation` implementation MUST NOT:
//! - Read wall-clock time
//! - Use ambient/unseeded randomness
//! - Iterate unordered containers while mutating or hashing state
//!
//! Identical `(turn_length_ms, commands, prior state)` MUST yield identical
//! resulting state and identical state hashes on every peer.
//!
//! A reference implementation, [`World`], is provided for tests, tools and
//! headless sessions.

#![deny(unsafe_code)]

mod world;

use std::fmt;
use std::io;

use thiserror::Error;

pub use world::{LOCAL_ENTITY_ID_BASE, MOVE_SPEED, STATE_HASH_ALGO_ID, World};

// ============================================================================
// Type Aliases
// ============================================================================

/// One discrete, fixed-duration step of the deterministic simulation.
pub type Turn = u32;

/// Network-level participant identifier assigned by the session layer.
pub type ClientId = u32;

/// In-game player identifier. Commands are owned by a player, not a client.
pub type PlayerId = i32;

/// Player id used before the session layer assigns one.
pub const OBSERVER_PLAYER: PlayerId = -1;

/// Unique identifier for an entity within a simulation.
pub type EntityId = u64;

// ============================================================================
// State Hash
// ============================================================================

/// Opaque state checksum produced by [`Simulation::compute_state_hash`].
///
/// Quick and full hashes may differ in length; peers only ever compare
/// hashes computed with the same `quick` flag for the same turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StateHash(pub Vec<u8>);

impl StateHash {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for StateHash {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Instruction data carried by a [`Command`].
///
/// Explicit tagged union so that peers never need a scripting runtime to
/// move command data around.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    /// Create a new entity owned by the issuing player.
    Spawn { position: [f64; 2] },
    /// Order an owned entity to walk towards `target`.
    Move { entity: EntityId, target: [f64; 2] },
    /// Cancel an owned entity's current movement order.
    Stop { entity: EntityId },
    /// Destroy an owned entity at the next flush.
    Destroy { entity: EntityId },
}

/// One player-issued instruction.
///
/// The turn a command executes on is the key it is queued under, not a
/// field of the command.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub player: PlayerId,
    pub payload: CommandPayload,
}

impl Command {
    pub fn new(player: PlayerId, payload: CommandPayload) -> Self {
        Self { player, payload }
    }
}

// ============================================================================
// Simulation Contract
// ============================================================================

/// Errors reported by a [`Simulation`].
#[derive(Debug, Error)]
pub enum SimError {
    #[error("failed to decode simulation state: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("invalid simulation state: {0}")]
    InvalidState(String),
    #[error("simulation cannot {0} in its current state")]
    Unavailable(&'static str),
}

/// Deterministic simulation driven by a turn manager.
pub trait Simulation {
    /// Advance exactly one turn of `turn_length_ms` using `commands` in the
    /// given order.
    fn step(&mut self, turn_length_ms: u32, commands: &[Command]);

    /// Compute a checksum of the synchronised state.
    ///
    /// `quick == false` requests the expensive full hash.
    fn compute_state_hash(&self, quick: bool) -> Result<StateHash, SimError>;

    /// Serialize the full synchronised state.
    fn serialize_state(&self) -> Result<Vec<u8>, SimError>;

    /// Replace the synchronised state. On error the current state MUST be
    /// left untouched.
    fn deserialize_state(&mut self, bytes: &[u8]) -> Result<(), SimError>;

    /// Remove entities destroyed since the previous turn.
    fn flush_destroyed_entities(&mut self);

    /// Interpolate visual state between the previous and the current turn.
    /// `offset` is in `[0, 1]`.
    fn interpolate(&mut self, sim_frame_length: f32, offset: f32, real_frame_length: f32);

    /// Write a human-readable dump of the full state, for out-of-sync
    /// diagnostics.
    fn dump_debug_state(&self, out: &mut dyn io::Write) -> io::Result<()>;
}

// ============================================================================
// Tests
// ============================================================================
