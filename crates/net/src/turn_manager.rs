//! Lockstep turn scheduling shared by the client and local roles.
//!
//! [`TurnCore`] owns the turn counters, the command queue, the time
//! accumulator and the snapshot slots. [`TurnManager`] composes a core with a
//! [`TurnRole`] that supplies the role-specific hooks (sending commands,
//! sealing batches, reporting hashes).
//!
//! # Scheduling
//!
//! The simulation only steps from `current_turn` to `current_turn + 1` when
//! `ready_turn > current_turn` and the time accumulator is non-negative.
//! When the next turn is not ready the accumulator is reset to zero, so a
//! lagging session pauses instead of rushing to catch up later.

use std::fs;
use std::path::PathBuf;

use lockstep_replay::ReplayLogger;
use lockstep_sim::{
    ClientId, Command, CommandPayload, OBSERVER_PLAYER, PlayerId, SimError, Simulation, StateHash,
    Turn,
};
use lockstep_wire::SimulationMessage;
use tracing::{debug, error, info, warn};

use crate::command_queue::CommandQueue;
use crate::config::TurnConfig;
use crate::error::{ConfigError, ProtocolError, TurnError};
use crate::transport::SessionUi;

/// Result of a call to [`TurnManager::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Not yet time for the next turn.
    Idle,
    /// Time for the next turn, but it is not ready. The accumulator was reset.
    Stalled,
    /// At least one turn executed.
    Advanced { turns: usize },
}

impl UpdateOutcome {
    pub fn advanced(self) -> bool {
        matches!(self, Self::Advanced { .. })
    }
}

/// Diagnostics gathered on the first sync error of a session.
#[derive(Debug, Clone)]
pub struct SyncErrorReport {
    /// Turn the peers disagreed on.
    pub turn: Turn,
    pub expected: StateHash,
    /// Local turn when the error arrived.
    pub current_turn: Turn,
    /// Local hash recomputed with the same quick flag as `turn`.
    pub current_hash: Option<StateHash>,
    /// Full debug dump of the local state.
    pub dump: Vec<u8>,
    /// File the dump was written to, if any.
    pub dump_path: Option<PathBuf>,
    pub message: String,
}

struct QuickSave {
    state: Vec<u8>,
    metadata: Vec<u8>,
}

// ============================================================================
// Turn Core
// ============================================================================

/// State shared by every turn manager role.
pub struct TurnCore<S, R> {
    sim: S,
    replay: R,
    config: TurnConfig,
    current_turn: Turn,
    ready_turn: Turn,
    turn_length: u32,
    /// Real time minus simulated time, in seconds.
    delta_sim_time: f32,
    player_id: PlayerId,
    client_id: ClientId,
    sync_error: Option<SyncErrorReport>,
    queue: CommandQueue,
    time_warp_num_turns: u32,
    time_warp_states: Vec<Vec<u8>>,
    quick_save: Option<QuickSave>,
    ui: Option<Box<dyn SessionUi>>,
}

impl<S: Simulation, R: ReplayLogger> TurnCore<S, R> {
    fn new(
        sim: S,
        replay: R,
        config: TurnConfig,
        turn_length: u32,
        client_id: ClientId,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            sim,
            replay,
            queue: CommandQueue::new(config.command_delay),
            current_turn: 0,
            ready_turn: config.initial_ready_turn(),
            config,
            turn_length,
            delta_sim_time: 0.0,
            player_id: OBSERVER_PLAYER,
            client_id,
            sync_error: None,
            time_warp_num_turns: 0,
            time_warp_states: Vec::new(),
            quick_save: None,
            ui: None,
        })
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    pub fn current_turn(&self) -> Turn {
        self.current_turn
    }

    pub fn ready_turn(&self) -> Turn {
        self.ready_turn
    }

    /// Length of the next turn in milliseconds.
    pub fn turn_length(&self) -> u32 {
        self.turn_length
    }

    pub fn delta_sim_time(&self) -> f32 {
        self.delta_sim_time
    }

    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn set_player_id(&mut self, player_id: PlayerId) {
        self.player_id = player_id;
    }

    pub fn set_ui(&mut self, ui: Box<dyn SessionUi>) {
        self.ui = Some(ui);
    }

    pub fn simulation(&self) -> &S {
        &self.sim
    }

    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.sim
    }

    pub fn replay(&self) -> &R {
        &self.replay
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn has_sync_error(&self) -> bool {
        self.sync_error.is_some()
    }

    pub fn sync_error_report(&self) -> Option<&SyncErrorReport> {
        self.sync_error.as_ref()
    }

    pub fn time_warp_snapshot_count(&self) -> usize {
        self.time_warp_states.len()
    }

    /// Queue a command received for `turn`.
    pub fn add_command(
        &mut self,
        client: ClientId,
        command: Command,
        turn: Turn,
    ) -> Result<(), ProtocolError> {
        debug!(client, player = command.player, turn, "add command");
        self.queue
            .add(self.current_turn, client, command, turn)
            .inspect_err(|err| warn!(client, %err, "rejected command"))
    }

    /// Every participant has finished sending commands for `turn`.
    pub fn finished_all_commands(
        &mut self,
        turn: Turn,
        turn_length: u32,
    ) -> Result<(), ProtocolError> {
        let expected = self.ready_turn + 1;
        if turn != expected {
            warn!(turn, expected, "out-of-sequence turn ready notice");
            return Err(ProtocolError::ReadyTurnOutOfSequence {
                expected,
                got: turn,
            });
        }
        debug!(turn, turn_length, "turn ready");
        self.ready_turn = turn;
        self.turn_length = turn_length;
        Ok(())
    }

    /// Turn 1 and every `full_hash_interval`-th turn use the full hash.
    pub fn turn_needs_full_hash(&self, turn: Turn) -> bool {
        turn == 1 || turn % self.config.full_hash_interval == 0
    }

    /// Hash the state after `turn`, choosing quick or full per turn.
    pub fn compute_turn_hash(&self, turn: Turn) -> Result<(StateHash, bool), SimError> {
        let quick = !self.turn_needs_full_hash(turn);
        Ok((self.sim.compute_state_hash(quick)?, quick))
    }

    pub(crate) fn log_hash(&mut self, hash: &StateHash, quick: bool) {
        self.replay.hash(hash, quick);
    }

    /// Report that a peer disagrees with the state hash for `turn`.
    ///
    /// Only the first call per session gathers diagnostics; later calls
    /// return `None`.
    pub fn on_sync_error(
        &mut self,
        turn: Turn,
        expected: &StateHash,
    ) -> Option<&SyncErrorReport> {
        debug!(turn, %expected, "sync error");
        if self.sync_error.is_some() {
            return None;
        }

        let current_hash = self
            .compute_turn_hash(turn)
            .map(|(hash, _)| hash)
            .inspect_err(|err| error!(%err, "failed to hash state for sync error"))
            .ok();

        let mut dump = Vec::new();
        if let Err(err) = self.sim.dump_debug_state(&mut dump) {
            error!(%err, "failed to dump simulation state");
        }

        let dump_path = self.config.oos_dump_path.clone().filter(|path| {
            fs::write(path, &dump)
                .inspect_err(|err| error!(path = %path.display(), %err, "failed to write state dump"))
                .is_ok()
        });

        let mut message = format!(
            "Out of sync on turn {turn}: expected hash {expected}\n\n\
             Current state: turn {}, hash {}",
            self.current_turn,
            current_hash.as_ref().map_or_else(|| "unknown".to_string(), |h| h.to_string()),
        );
        match &dump_path {
            Some(path) => {
                message.push_str(&format!("\n\nDumping current state to {}", path.display()));
            }
            None => {
                error!(turn, dump = %String::from_utf8_lossy(&dump), "out of sync state dump");
                message.push_str("\n\nCurrent state dumped to the log");
            }
        }

        match self.ui.as_mut() {
            Some(ui) => ui.display_message("Sync error", &message),
            None => error!("{message}"),
        }

        self.sync_error = Some(SyncErrorReport {
            turn,
            expected: expected.clone(),
            current_turn: self.current_turn,
            current_hash,
            dump,
            dump_path,
            message,
        });
        self.sync_error.as_ref()
    }

    /// Smooth rendering between the previous and the next turn.
    pub fn interpolate(&mut self, sim_frame_length: f32, real_frame_length: f32) {
        let offset = self.interpolation_offset();
        self.sim
            .interpolate(sim_frame_length, offset, real_frame_length);
    }

    /// `clamp(delta / turn_length + 1, 0, 1)` with the turn length in seconds.
    pub fn interpolation_offset(&self) -> f32 {
        (self.delta_sim_time / (self.turn_length as f32 / 1000.0) + 1.0).clamp(0.0, 1.0)
    }

    /// Whether [`TurnManager::update`] would execute a turn. No side effects.
    pub fn will_update(&self, sim_frame_length: f32) -> bool {
        self.delta_sim_time + sim_frame_length >= 0.0 && self.ready_turn > self.current_turn
    }

    /// Hard-reset the turn counters, dropping every queued command.
    pub fn reset_state(&mut self, current_turn: Turn, ready_turn: Turn) {
        self.current_turn = current_turn;
        self.ready_turn = ready_turn;
        self.delta_sim_time = 0.0;
        self.queue.reset();
    }

    /// Snapshot the state every `num_turns` turns. Zero disables recording.
    pub fn enable_time_warp_recording(&mut self, num_turns: u32) {
        info!(num_turns, "time warp recording enabled");
        self.time_warp_states.clear();
        self.time_warp_num_turns = num_turns;
    }

    /// Restore the most recent snapshot and restart the counters at turn 0.
    ///
    /// Returns `Ok(false)` when there is nothing to rewind to. A snapshot that
    /// fails to load is kept and the live state is left untouched.
    pub fn rewind_time_warp(&mut self) -> Result<bool, TurnError> {
        let Some(state) = self.time_warp_states.last() else {
            return Ok(false);
        };
        if let Err(err) = self.sim.deserialize_state(state) {
            error!(%err, "failed to rewind time warp");
            return Err(err.into());
        }
        self.time_warp_states.pop();
        info!(
            remaining = self.time_warp_states.len(),
            "rewound time warp"
        );

        // The queue and counters are not part of the snapshot.
        self.reset_state(0, self.config.initial_ready_turn());
        Ok(true)
    }

    pub fn quick_save(&mut self) -> Result<(), TurnError> {
        let state = self
            .sim
            .serialize_state()
            .inspect_err(|err| error!(%err, "failed to quicksave game"))?;
        let metadata = self
            .ui
            .as_mut()
            .map(|ui| ui.saved_game_data())
            .unwrap_or_default();

        self.quick_save = Some(QuickSave { state, metadata });
        info!(turn = self.current_turn, "quicksaved game");
        Ok(())
    }

    /// Restore the last quicksave. The slot is kept for later loads.
    pub fn quick_load(&mut self) -> Result<(), TurnError> {
        let Some(save) = &self.quick_save else {
            error!("cannot quickload game: no game was quicksaved");
            return Err(TurnError::NoQuickSave);
        };
        if let Err(err) = self.sim.deserialize_state(&save.state) {
            error!(%err, "failed to quickload game");
            return Err(err.into());
        }
        if let Some(ui) = self.ui.as_mut()
            && !save.metadata.is_empty()
        {
            ui.restore_saved_game_data(&save.metadata);
        }
        info!("quickloaded game");

        self.reset_state(0, self.config.initial_ready_turn());
        Ok(())
    }

    /// Execute the next turn: flush, snapshot, merge, log and step.
    fn advance_turn(&mut self, record_time_warp: bool) {
        // Increment first so commands posted from here target the next turn.
        self.current_turn += 1;

        // Transient entities never reach a snapshot.
        self.sim.flush_destroyed_entities();

        if record_time_warp
            && self.time_warp_num_turns != 0
            && self.current_turn % self.time_warp_num_turns == 0
        {
            match self.sim.serialize_state() {
                Ok(state) => self.time_warp_states.push(state),
                Err(err) => error!(turn = self.current_turn, %err, "time warp snapshot failed"),
            }
        }

        let commands = self.queue.take_next();
        self.replay
            .turn(self.current_turn - 1, self.turn_length, &commands);

        debug!(
            turn = self.current_turn,
            commands = commands.len(),
            "running turn"
        );
        self.sim.step(self.turn_length, &commands);
    }
}

// ============================================================================
// Roles
// ============================================================================

/// Role-specific hooks called by [`TurnManager`].
pub trait TurnRole {
    /// Issue a command from the local player.
    fn post_command<S: Simulation, R: ReplayLogger>(
        &mut self,
        core: &mut TurnCore<S, R>,
        payload: CommandPayload,
    ) -> Result<(), ProtocolError>;

    /// A command arrived from the network.
    fn on_simulation_message<S: Simulation, R: ReplayLogger>(
        &mut self,
        core: &mut TurnCore<S, R>,
        message: &SimulationMessage,
    ) -> Result<(), ProtocolError>;

    /// No more local commands will be issued for `turn`.
    fn notify_finished_own_commands<S: Simulation, R: ReplayLogger>(
        &mut self,
        core: &mut TurnCore<S, R>,
        turn: Turn,
    );

    /// The simulation finished executing `turn`.
    fn notify_finished_update<S: Simulation, R: ReplayLogger>(
        &mut self,
        core: &mut TurnCore<S, R>,
        turn: Turn,
    );

    /// The connection to the server is going away.
    fn on_destroy_connection<S: Simulation, R: ReplayLogger>(
        &mut self,
        _core: &mut TurnCore<S, R>,
    ) {
    }
}

// ============================================================================
// Turn Manager
// ============================================================================

/// A [`TurnCore`] driven by a [`TurnRole`].
pub struct TurnManager<S, R, H> {
    core: TurnCore<S, R>,
    role: H,
}

impl<S: Simulation, R: ReplayLogger, H: TurnRole> TurnManager<S, R, H> {
    pub fn new(
        sim: S,
        replay: R,
        role: H,
        config: TurnConfig,
        turn_length: u32,
        client_id: ClientId,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            core: TurnCore::new(sim, replay, config, turn_length, client_id)?,
            role,
        })
    }

    /// Advance the simulation by as many ready turns as real time allows,
    /// up to `max_turns` (at least one).
    ///
    /// Call once per rendered frame with the frame's duration in seconds.
    pub fn update(&mut self, sim_frame_length: f32, max_turns: usize) -> UpdateOutcome {
        let core = &mut self.core;
        core.delta_sim_time += sim_frame_length;

        if core.delta_sim_time < 0.0 {
            return UpdateOutcome::Idle;
        }

        debug!(
            current = core.current_turn,
            ready = core.ready_turn,
            "update"
        );

        if core.ready_turn <= core.current_turn {
            // Pause rather than build up a backlog to rush through later.
            core.delta_sim_time = 0.0;
            return UpdateOutcome::Stalled;
        }

        let mut turns = 0;
        for _ in 0..max_turns.max(1) {
            if self.core.delta_sim_time < 0.0 || self.core.ready_turn <= self.core.current_turn {
                break;
            }

            let sealed = self.core.current_turn + self.core.config.command_delay;
            self.role
                .notify_finished_own_commands(&mut self.core, sealed);

            self.core.advance_turn(true);

            let turn = self.core.current_turn;
            self.role.notify_finished_update(&mut self.core, turn);

            self.core.delta_sim_time -= self.core.turn_length as f32 / 1000.0;
            turns += 1;
        }

        UpdateOutcome::Advanced { turns }
    }

    /// Run every ready turn immediately, without notifications or time
    /// accounting. Used to catch up after joining a running game.
    pub fn update_fast_forward(&mut self) -> bool {
        self.core.delta_sim_time = 0.0;

        debug!(
            current = self.core.current_turn,
            ready = self.core.ready_turn,
            "fast forward"
        );

        if self.core.ready_turn <= self.core.current_turn {
            return false;
        }
        while self.core.ready_turn > self.core.current_turn {
            self.core.advance_turn(false);
        }
        true
    }

    pub fn post_command(&mut self, payload: CommandPayload) -> Result<(), ProtocolError> {
        self.role.post_command(&mut self.core, payload)
    }

    pub fn on_simulation_message(
        &mut self,
        message: &SimulationMessage,
    ) -> Result<(), ProtocolError> {
        self.role.on_simulation_message(&mut self.core, message)
    }

    pub fn on_destroy_connection(&mut self) {
        self.role.on_destroy_connection(&mut self.core);
    }

    pub fn core(&self) -> &TurnCore<S, R> {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut TurnCore<S, R> {
        &mut self.core
    }

    pub fn role(&self) -> &H {
        &self.role
    }

    pub fn role_mut(&mut self) -> &mut H {
        &mut self.role
    }

    /// Tear down, returning the simulation and the replay logger.
    pub fn into_parts(self) -> (S, R) {
        (self.core.sim, self.core.replay)
    }

    pub fn current_turn(&self) -> Turn {
        self.core.current_turn
    }

    pub fn ready_turn(&self) -> Turn {
        self.core.ready_turn
    }

    pub fn simulation(&self) -> &S {
        &self.core.sim
    }

    pub fn set_player_id(&mut self, player_id: PlayerId) {
        self.core.set_player_id(player_id);
    }

    pub fn will_update(&self, sim_frame_length: f32) -> bool {
        self.core.will_update(sim_frame_length)
    }

    pub fn interpolate(&mut self, sim_frame_length: f32, real_frame_length: f32) {
        self.core.interpolate(sim_frame_length, real_frame_length);
    }

    pub fn has_sync_error(&self) -> bool {
        self.core.has_sync_error()
    }
}

// ============================================================================
// Tests
// ============================================================================
