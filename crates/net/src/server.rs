//! Authoritative server turn manager.
//!
//! The server does not run the simulation. It decides when a turn is ready
//! (every client has sealed its commands for it), broadcasts that decision
//! with the turn length, echoes commands to every client and cross-checks
//! the state hashes the clients report.
//!
//! # Client lifecycle
//!
//! `initialise_client` starts tracking a client, `uninitialise_client` stops.
//! While tracked, a client's ready and simulated turns advance by exactly one
//! per notification; anything else is rejected as a protocol violation.

use std::collections::BTreeMap;

use lockstep_sim::{ClientId, StateHash, Turn};
use lockstep_wire::{EndCommandBatch, NetMessage, SyncError, decode_message};
use tracing::{debug, info, warn};

use crate::client_tracking::ClientTracking;
use crate::config::TurnConfig;
use crate::error::{ConfigError, ProtocolError, TurnError};
use crate::transport::ServerTransport;

pub struct ServerTurnManager<T> {
    transport: T,
    ready_turn: Turn,
    /// Length broadcast with the next ready turn.
    turn_length: u32,
    clients: BTreeMap<ClientId, ClientTracking>,
    /// Reported hashes by turn, then by client.
    state_hashes: BTreeMap<Turn, BTreeMap<ClientId, StateHash>>,
    /// Turn length of every ready turn, indexed by turn.
    saved_turn_lengths: Vec<u32>,
    command_delay: u32,
}

impl<T: ServerTransport> ServerTurnManager<T> {
    pub fn new(transport: T, config: &TurnConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let ready_turn = config.initial_ready_turn();
        Ok(Self {
            transport,
            ready_turn,
            turn_length: config.turn_length_mp_ms,
            clients: BTreeMap::new(),
            state_hashes: BTreeMap::new(),
            // Turns up to the initial ready turn are never broadcast.
            saved_turn_lengths: vec![0; ready_turn as usize + 1],
            command_delay: config.command_delay,
        })
    }

    pub fn ready_turn(&self) -> Turn {
        self.ready_turn
    }

    pub fn turn_length(&self) -> u32 {
        self.turn_length
    }

    /// Length used for the next ready turn. Earlier turns are unaffected.
    pub fn set_turn_length(&mut self, msecs: u32) {
        info!(msecs, "turn length changed");
        self.turn_length = msecs;
    }

    /// Length that was broadcast for `turn`, if it is ready.
    pub fn saved_turn_length(&self, turn: Turn) -> Option<u32> {
        if turn > self.ready_turn {
            return None;
        }
        self.saved_turn_lengths.get(turn as usize).copied()
    }

    pub fn client_tracking(&self, client: ClientId) -> Option<&ClientTracking> {
        self.clients.get(&client)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Turns with hash reports still awaiting comparison.
    pub fn pending_hash_turns(&self) -> usize {
        self.state_hashes.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Start tracking a client that joins having executed `turn`.
    pub fn initialise_client(&mut self, client: ClientId, turn: Turn) -> Result<(), ProtocolError> {
        debug!(client, turn, "initialise client");
        if self.clients.contains_key(&client) {
            return Err(ProtocolError::ClientAlreadyTracked(client));
        }
        self.clients.insert(client, ClientTracking::new(turn, self.command_delay));
        Ok(())
    }

    /// Stop tracking a client. The remaining clients may now be ready.
    pub fn uninitialise_client(&mut self, client: ClientId) -> Result<(), ProtocolError> {
        debug!(client, "uninitialise client");
        if self.clients.remove(&client).is_none() {
            return Err(ProtocolError::UnknownClient(client));
        }
        self.check_clients_ready();
        Ok(())
    }

    /// `client` will send no more commands for `turn`.
    pub fn notify_finished_client_commands(
        &mut self,
        client: ClientId,
        turn: Turn,
    ) -> Result<(), ProtocolError> {
        debug!(client, turn, "client finished commands");
        self.clients
            .get_mut(&client)
            .ok_or(ProtocolError::UnknownClient(client))?
            .finish_commands(client, turn)
            .inspect_err(|err| warn!(%err, "rejected batch notice"))?;

        self.check_clients_ready();
        Ok(())
    }

    /// Advance the global ready turn while every client is past it.
    fn check_clients_ready(&mut self) {
        // Nobody to wait for is not the same as everybody being ready.
        if self.clients.is_empty() {
            return;
        }

        while self
            .clients
            .values()
            .all(|tracking| tracking.ready_turn > self.ready_turn)
        {
            self.ready_turn += 1;
            debug!(turn = self.ready_turn, "ready for turn");

            self.transport
                .broadcast(NetMessage::EndCommandBatch(EndCommandBatch {
                    turn: self.ready_turn,
                    turn_length: self.turn_length,
                }));
            self.saved_turn_lengths.push(self.turn_length);
        }
    }

    /// `client` executed `turn` and computed `hash`.
    ///
    /// Every turn that all clients have executed is compared against the
    /// lowest client id's hash and then forgotten.
    pub fn notify_finished_client_update(
        &mut self,
        client: ClientId,
        turn: Turn,
        hash: StateHash,
    ) -> Result<(), ProtocolError> {
        self.clients
            .get_mut(&client)
            .ok_or(ProtocolError::UnknownClient(client))?
            .finish_update(client, turn)
            .inspect_err(|err| warn!(%err, "rejected hash report"))?;

        self.state_hashes
            .entry(turn)
            .or_default()
            .insert(client, hash);

        let Some(newest) = self.clients.values().map(|c| c.simulated_turn).min() else {
            return Ok(());
        };

        for (&checked, hashes) in self.state_hashes.range(..=newest) {
            let mut reports = hashes.iter();
            let Some((&host, expected)) = reports.next() else {
                continue;
            };
            if let Some((&other, actual)) = reports.find(|(_, hash)| *hash != expected) {
                warn!(turn = checked, host, client = other, %expected, %actual, "clients out of sync");
                self.transport
                    .broadcast(NetMessage::SyncError(SyncError::new(checked, expected)));
            }
        }

        self.state_hashes.retain(|&t, _| t > newest);
        Ok(())
    }

    /// Dispatch a message received from `client`.
    ///
    /// `client` is the sender's authenticated id; the id inside a command is
    /// replaced with it before the command is echoed.
    pub fn handle_client_message(
        &mut self,
        client: ClientId,
        message: NetMessage,
    ) -> Result<(), ProtocolError> {
        let kind = message.kind();
        match message {
            NetMessage::Simulation(mut command) => {
                let tracking = self
                    .clients
                    .get(&client)
                    .ok_or(ProtocolError::UnknownClient(client))?;
                let expected = tracking.open_turn();
                if command.turn != expected {
                    warn!(client, turn = command.turn, expected, "command for a sealed turn");
                    return Err(ProtocolError::UnexpectedCommandTurn {
                        client,
                        expected,
                        got: command.turn,
                    });
                }
                command.command().map_err(ProtocolError::InvalidCommand)?;

                command.client = client;
                self.transport.broadcast(NetMessage::Simulation(command));
                Ok(())
            }
            NetMessage::EndCommandBatch(batch) => {
                self.notify_finished_client_commands(client, batch.turn)
            }
            NetMessage::SyncCheck(check) => {
                self.notify_finished_client_update(client, check.turn, StateHash(check.hash))
            }
            NetMessage::SyncError(_) => {
                warn!(client, kind, "unexpected message from client");
                Err(ProtocolError::UnexpectedMessage(kind))
            }
        }
    }

    /// Decode and dispatch a raw transport frame from `client`.
    pub fn handle_client_frame(&mut self, client: ClientId, frame: &[u8]) -> Result<(), TurnError> {
        let message =
            decode_message(frame).inspect_err(|err| warn!(client, %err, "malformed frame"))?;
        Ok(self.handle_client_message(client, message)?)
    }
}
