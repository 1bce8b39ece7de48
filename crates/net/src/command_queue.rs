//! Command buffering by target turn.
//!
//! The queue is a ring of `delay + 1` slots. Slot 0 always holds the
//! commands for `current_turn + 1`; each executed turn pops the front slot
//! and pushes an empty one at the back, so offsets stay valid without
//! renumbering.
//!
//! Within a slot, commands are grouped per client and merged in ascending
//! client id order. That order is part of the determinism contract.

use std::collections::{BTreeMap, VecDeque};

use lockstep_sim::{ClientId, Command, Turn};

use crate::error::ProtocolError;

/// Commands for one turn, grouped by originating client.
type TurnSlot = BTreeMap<ClientId, Vec<Command>>;

/// Per-peer multi-turn command buffer.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    slots: VecDeque<TurnSlot>,
}

impl CommandQueue {
    /// Create a queue for the given command delay (`delay + 1` slots).
    pub fn new(command_delay: u32) -> Self {
        let depth = command_delay as usize + 1;
        Self {
            slots: (0..depth).map(|_| TurnSlot::new()).collect(),
        }
    }

    /// Number of turn slots.
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Highest turn accepted while at `current_turn`.
    pub fn max_turn(&self, current_turn: Turn) -> Turn {
        current_turn.saturating_add(self.depth() as Turn)
    }

    /// Queue `command` from `client` for execution on `turn`.
    ///
    /// Rejects turns outside `(current_turn, current_turn + depth]` without
    /// touching the queue.
    pub fn add(
        &mut self,
        current_turn: Turn,
        client: ClientId,
        command: Command,
        turn: Turn,
    ) -> Result<(), ProtocolError> {
        let max = self.max_turn(current_turn);
        if turn <= current_turn || turn > max {
            return Err(ProtocolError::CommandOutOfWindow {
                turn,
                current: current_turn,
                max,
            });
        }

        let offset = (turn - current_turn - 1) as usize;
        self.slots[offset].entry(client).or_default().push(command);
        Ok(())
    }

    /// Merge the front slot into one ordered batch and rotate the ring.
    pub fn take_next(&mut self) -> Vec<Command> {
        let front = self.slots.pop_front().unwrap_or_default();
        self.slots.push_back(TurnSlot::new());
        front.into_values().flatten().collect()
    }

    /// Number of commands queued for the slot at `offset` (0 = next turn).
    pub fn queued_at(&self, offset: usize) -> usize {
        self.slots
            .get(offset)
            .map_or(0, |slot| slot.values().map(Vec::len).sum())
    }

    /// Total number of queued commands.
    pub fn len(&self) -> usize {
        (0..self.depth()).map(|offset| self.queued_at(offset)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued command, keeping the depth.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(TurnSlot::clear);
    }
}
