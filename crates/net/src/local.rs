//! Single-player role.
//!
//! No network latency to hide: commands go straight into the next turn and
//! every turn is ready as soon as it is sealed.

use lockstep_replay::ReplayLogger;
use lockstep_sim::{Command, CommandPayload, Simulation, Turn};
use lockstep_wire::SimulationMessage;
use tracing::{error, warn};

use crate::config::TurnConfig;
use crate::error::{ConfigError, ProtocolError};
use crate::turn_manager::{TurnCore, TurnManager, TurnRole};

/// Local hooks for single-player sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRole;

/// Turn manager for a single-player session.
pub type LocalTurnManager<S, R> = TurnManager<S, R, LocalRole>;

impl TurnRole for LocalRole {
    fn post_command<S: Simulation, R: ReplayLogger>(
        &mut self,
        core: &mut TurnCore<S, R>,
        payload: CommandPayload,
    ) -> Result<(), ProtocolError> {
        let turn = core.current_turn() + 1;
        let command = Command::new(core.player_id(), payload);
        core.add_command(core.client_id(), command, turn)
    }

    fn on_simulation_message<S: Simulation, R: ReplayLogger>(
        &mut self,
        _core: &mut TurnCore<S, R>,
        message: &SimulationMessage,
    ) -> Result<(), ProtocolError> {
        warn!(
            client = message.client,
            turn = message.turn,
            "network command in a local session"
        );
        Err(ProtocolError::UnexpectedMessage("simulation"))
    }

    fn notify_finished_own_commands<S: Simulation, R: ReplayLogger>(
        &mut self,
        core: &mut TurnCore<S, R>,
        turn: Turn,
    ) {
        let turn_length = core.turn_length();
        if let Err(err) = core.finished_all_commands(turn, turn_length) {
            warn!(turn, %err, "local turn out of sequence");
        }
    }

    fn notify_finished_update<S: Simulation, R: ReplayLogger>(
        &mut self,
        core: &mut TurnCore<S, R>,
        turn: Turn,
    ) {
        if !core.config().verify_local_hashes {
            return;
        }
        match core.compute_turn_hash(turn) {
            Ok((hash, quick)) => core.log_hash(&hash, quick),
            Err(err) => error!(turn, %err, "failed to compute state hash"),
        }
    }
}

impl<S: Simulation, R: ReplayLogger> TurnManager<S, R, LocalRole> {
    /// Create a single-player turn manager using the single-player turn length.
    pub fn local(sim: S, replay: R, config: TurnConfig) -> Result<Self, ConfigError> {
        let turn_length = config.turn_length_sp_ms;
        Self::new(sim, replay, LocalRole, config, turn_length, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_replay::{ReplayRecorder, VerifyOptions, verify_replay};
    use lockstep_sim::{STATE_HASH_ALGO_ID, Simulation as _, World};
    use proptest::prelude::*;

    fn world_manager(config: TurnConfig) -> LocalTurnManager<World, ReplayRecorder> {
        let mut mgr =
            TurnManager::local(World::new(), ReplayRecorder::new(STATE_HASH_ALGO_ID), config)
                .unwrap();
        mgr.set_player_id(1);
        mgr
    }

    fn spawn(x: f64) -> CommandPayload {
        CommandPayload::Spawn {
            position: [x, 0.0],
        }
    }

    #[test]
    fn test_uses_single_player_turn_length() {
        let mgr = world_manager(TurnConfig::default());
        assert_eq!(mgr.core().turn_length(), 200);
        assert_eq!(mgr.core().client_id(), 0);
    }

    #[test]
    fn test_command_runs_next_turn() {
        let mut mgr = world_manager(TurnConfig::default());
        mgr.post_command(spawn(1.0)).unwrap();
        mgr.update(0.2, 1);

        assert_eq!(mgr.current_turn(), 1);
        assert_eq!(mgr.simulation().entity_ids(), vec![1]);
        assert_eq!(mgr.simulation().owner(1), Some(1));
    }

    #[test]
    fn test_never_stalls() {
        let mut mgr = world_manager(TurnConfig::default());
        for _ in 0..50 {
            assert!(mgr.update(1.0, 1).advanced());
        }
        assert_eq!(mgr.current_turn(), 50);
        assert_eq!(mgr.ready_turn(), 51);
    }

    #[test]
    fn test_longer_delay_keeps_running() {
        let mut mgr = world_manager(TurnConfig {
            command_delay: 3,
            ..TurnConfig::default()
        });
        assert_eq!(mgr.ready_turn(), 2);

        mgr.post_command(spawn(1.0)).unwrap();
        for _ in 0..10 {
            assert!(mgr.update(1.0, 1).advanced());
        }
        assert_eq!(mgr.current_turn(), 10);
        assert_eq!(mgr.ready_turn(), 12);
        assert_eq!(mgr.simulation().entity_ids(), vec![1]);

        mgr.core_mut().quick_save().unwrap();
        mgr.core_mut().quick_load().unwrap();
        assert_eq!(mgr.ready_turn(), 2);
        assert!(mgr.update(1.0, 1).advanced());
    }

    #[test]
    fn test_network_command_rejected() {
        let mut mgr = world_manager(TurnConfig::default());
        let message = SimulationMessage::new(2, 2, 2, spawn(0.0));
        assert_eq!(
            mgr.on_simulation_message(&message),
            Err(ProtocolError::UnexpectedMessage("simulation"))
        );
        assert!(mgr.core().queue().is_empty());
    }

    #[test]
    fn test_hashes_logged_only_when_enabled() {
        let mut mgr = world_manager(TurnConfig::default());
        mgr.update(1.0, 3);
        assert_eq!(mgr.core().replay().hashes().count(), 0);

        let mut mgr = world_manager(TurnConfig {
            verify_local_hashes: true,
            ..TurnConfig::default()
        });
        mgr.update(1.0, 3);
        let quick: Vec<_> = mgr.core().replay().hashes().map(|(_, q)| q).collect();
        assert_eq!(quick, vec![false, true, true]);
    }

    #[test]
    fn test_rewind_to_turn_30_snapshot() {
        let mut mgr = world_manager(TurnConfig::default());
        mgr.core_mut().enable_time_warp_recording(10);

        for turn in 0..29 {
            if turn % 7 == 0 {
                mgr.post_command(spawn(turn as f64)).unwrap();
            }
            mgr.update(1.0, 1);
        }
        // The turn-30 snapshot is taken before turn 30 executes.
        let snapshot_hash = mgr.simulation().compute_state_hash(false).unwrap();
        mgr.update(1.0, 1);
        assert_eq!(mgr.current_turn(), 30);
        assert_eq!(mgr.core().time_warp_snapshot_count(), 3);

        mgr.post_command(spawn(99.0)).unwrap();
        mgr.update(1.0, 5);
        assert_eq!(mgr.simulation().entity_ids().len(), 6);

        assert!(mgr.core_mut().rewind_time_warp().unwrap());
        assert_eq!(mgr.simulation().turn(), 29);
        assert_eq!(
            mgr.simulation().compute_state_hash(false).unwrap(),
            snapshot_hash
        );
        assert_eq!(mgr.simulation().entity_ids().len(), 5);
        assert_eq!(mgr.current_turn(), 0);
        assert_eq!(mgr.ready_turn(), 1);
        assert!(mgr.core().queue().is_empty());
        assert_eq!(mgr.core().time_warp_snapshot_count(), 2);
    }

    #[test]
    fn test_quickload_restores_world() {
        let mut mgr = world_manager(TurnConfig::default());
        mgr.post_command(spawn(1.0)).unwrap();
        mgr.update(1.0, 1);
        mgr.core_mut().quick_save().unwrap();
        let saved = mgr.simulation().compute_state_hash(false).unwrap();

        mgr.post_command(spawn(2.0)).unwrap();
        mgr.update(1.0, 3);
        assert_ne!(mgr.simulation().compute_state_hash(false).unwrap(), saved);

        mgr.core_mut().quick_load().unwrap();
        assert_eq!(mgr.simulation().compute_state_hash(false).unwrap(), saved);
        assert_eq!(mgr.current_turn(), 0);
    }

    fn arb_payload() -> impl Strategy<Value = CommandPayload> {
        prop_oneof![
            (-50.0..50.0f64, -50.0..50.0f64).prop_map(|(x, y)| CommandPayload::Spawn {
                position: [x, y]
            }),
            (1u64..6, -50.0..50.0f64, -50.0..50.0f64).prop_map(|(entity, x, y)| {
                CommandPayload::Move {
                    entity,
                    target: [x, y],
                }
            }),
            (1u64..6).prop_map(|entity| CommandPayload::Stop { entity }),
            (1u64..6).prop_map(|entity| CommandPayload::Destroy { entity }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn identical_streams_give_identical_hashes(
            script in proptest::collection::vec(
                (0usize..3, proptest::collection::vec(arb_payload(), 0..3)),
                1..40,
            ),
        ) {
            let config = TurnConfig {
                verify_local_hashes: true,
                ..TurnConfig::default()
            };
            let mut a = world_manager(config.clone());
            let mut b = world_manager(config);

            for (turns, payloads) in &script {
                for payload in payloads {
                    a.post_command(payload.clone()).unwrap();
                    b.post_command(payload.clone()).unwrap();
                }
                for _ in 0..*turns {
                    a.update(0.2, 1);
                    b.update(0.2, 1);
                }
            }

            let (_, replay_a) = a.into_parts();
            let (_, replay_b) = b.into_parts();
            let hashes_a: Vec<_> = replay_a.hashes().collect();
            let hashes_b: Vec<_> = replay_b.hashes().collect();
            prop_assert_eq!(&hashes_a, &hashes_b);

            // The recorded session replays to the same hashes.
            let report = verify_replay(
                &replay_a.finalize(),
                &mut World::new(),
                &VerifyOptions::default(),
            );
            prop_assert!(report.is_ok());
        }
    }
}
