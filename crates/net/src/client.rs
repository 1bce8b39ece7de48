//! Multiplayer client role.
//!
//! Commands are sent to the server and only executed once the server echoes
//! them back, so the issuing client runs exactly the command set every other
//! peer received. After each turn the client reports its state hash for
//! cross-checking.

use lockstep_replay::ReplayLogger;
use lockstep_sim::{ClientId, CommandPayload, Simulation, StateHash, Turn};
use lockstep_wire::{EndCommandBatch, NetMessage, SimulationMessage, SyncCheck};
use tracing::{debug, error, warn};

use crate::config::TurnConfig;
use crate::error::{ConfigError, ProtocolError, TurnError};
use crate::transport::ClientTransport;
use crate::turn_manager::{TurnCore, TurnManager, TurnRole};

/// Client-side hooks, sending through `T`.
#[derive(Debug)]
pub struct ClientRole<T> {
    transport: T,
}

/// Turn manager for a networked client.
pub type ClientTurnManager<S, R, T> = TurnManager<S, R, ClientRole<T>>;

impl<T: ClientTransport> TurnRole for ClientRole<T> {
    fn post_command<S: Simulation, R: ReplayLogger>(
        &mut self,
        core: &mut TurnCore<S, R>,
        payload: CommandPayload,
    ) -> Result<(), ProtocolError> {
        let turn = core.current_turn() + core.config().command_delay;
        debug!(turn, "post command");

        // Not queued locally: the server echoes it back to every client.
        let message = SimulationMessage::new(core.client_id(), core.player_id(), turn, payload);
        self.transport.send(NetMessage::Simulation(message));
        Ok(())
    }

    fn on_simulation_message<S: Simulation, R: ReplayLogger>(
        &mut self,
        core: &mut TurnCore<S, R>,
        message: &SimulationMessage,
    ) -> Result<(), ProtocolError> {
        let command = message.command().map_err(ProtocolError::InvalidCommand)?;
        core.add_command(message.client, command, message.turn)
    }

    fn notify_finished_own_commands<S: Simulation, R: ReplayLogger>(
        &mut self,
        core: &mut TurnCore<S, R>,
        turn: Turn,
    ) {
        debug!(turn, "finished own commands");
        self.transport
            .send(NetMessage::EndCommandBatch(EndCommandBatch {
                turn,
                turn_length: core.config().turn_length_mp_ms,
            }));
    }

    fn notify_finished_update<S: Simulation, R: ReplayLogger>(
        &mut self,
        core: &mut TurnCore<S, R>,
        turn: Turn,
    ) {
        let hash = match core.compute_turn_hash(turn) {
            Ok((hash, quick)) => {
                debug!(turn, %hash, quick, "finished update");
                core.log_hash(&hash, quick);
                hash
            }
            Err(err) => {
                // The server tracks reports turn by turn; an empty hash keeps
                // our counter moving and is flagged as a mismatch.
                error!(turn, %err, "failed to compute state hash");
                StateHash(Vec::new())
            }
        };
        self.transport
            .send(NetMessage::SyncCheck(SyncCheck::new(turn, &hash)));
    }

    fn on_destroy_connection<S: Simulation, R: ReplayLogger>(&mut self, core: &mut TurnCore<S, R>) {
        // Don't leave the server waiting on a batch we will never finish.
        let turn = core.current_turn() + core.config().command_delay;
        self.notify_finished_own_commands(core, turn);
    }
}

impl<S: Simulation, R: ReplayLogger, T: ClientTransport> TurnManager<S, R, ClientRole<T>> {
    /// Create a client turn manager using the multiplayer turn length.
    pub fn client(
        sim: S,
        replay: R,
        transport: T,
        client_id: ClientId,
        config: TurnConfig,
    ) -> Result<Self, ConfigError> {
        let turn_length = config.turn_length_mp_ms;
        Self::new(
            sim,
            replay,
            ClientRole { transport },
            config,
            turn_length,
            client_id,
        )
    }

    /// Dispatch a message received from the server.
    pub fn handle_server_message(&mut self, message: NetMessage) -> Result<(), TurnError> {
        let kind = message.kind();
        match message {
            NetMessage::Simulation(command) => self.on_simulation_message(&command)?,
            NetMessage::EndCommandBatch(batch) => self
                .core_mut()
                .finished_all_commands(batch.turn, batch.turn_length)?,
            NetMessage::SyncError(sync_error) => {
                let expected = StateHash(sync_error.hash_expected);
                self.core_mut().on_sync_error(sync_error.turn, &expected);
            }
            NetMessage::SyncCheck(_) => {
                warn!(kind, "unexpected message from server");
                return Err(ProtocolError::UnexpectedMessage(kind).into());
            }
        }
        Ok(())
    }

    /// Decode and dispatch a raw transport frame from the server.
    pub fn handle_server_frame(&mut self, frame: &[u8]) -> Result<(), TurnError> {
        let message = lockstep_wire::decode_message(frame)
            .inspect_err(|err| warn!(%err, "malformed frame from server"))?;
        self.handle_server_message(message)
    }

    pub fn transport(&self) -> &T {
        &self.role().transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.role_mut().transport
    }
}
