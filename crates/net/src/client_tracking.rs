//! Per-client progress tracked by the server.

use lockstep_sim::{ClientId, Turn};

use crate::error::ProtocolError;

/// How far one client has got.
///
/// Both counters advance by exactly one turn per notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTracking {
    /// Last turn the client finished sending commands for.
    pub ready_turn: Turn,
    /// Last turn the client executed and hashed.
    pub simulated_turn: Turn,
}

impl ClientTracking {
    /// Start tracking a client that joins at `turn`.
    ///
    /// Its first batch notice is for `turn + command_delay`, so every turn
    /// before that counts as already sealed.
    pub fn new(turn: Turn, command_delay: u32) -> Self {
        Self {
            ready_turn: turn + command_delay.saturating_sub(1),
            simulated_turn: turn,
        }
    }

    /// The only turn this client may still send commands for.
    pub fn open_turn(&self) -> Turn {
        self.ready_turn + 1
    }

    pub fn finish_commands(&mut self, client: ClientId, turn: Turn) -> Result<(), ProtocolError> {
        let expected = self.ready_turn + 1;
        if turn != expected {
            return Err(ProtocolError::OutOfSequenceCommands {
                client,
                expected,
                got: turn,
            });
        }
        self.ready_turn = turn;
        Ok(())
    }

    pub fn finish_update(&mut self, client: ClientId, turn: Turn) -> Result<(), ProtocolError> {
        let expected = self.simulated_turn + 1;
        if turn != expected {
            return Err(ProtocolError::OutOfSequenceUpdate {
                client,
                expected,
                got: turn,
            });
        }
        self.simulated_turn = turn;
        Ok(())
    }
}
