//! Reference deterministic world.
//!
//! Entities belong to players and walk towards movement targets at a fixed
//! speed. Commands may only affect entities owned by the issuing player.
//!
//! Local entities (UI previews such as placement ghosts) live alongside the
//! synchronised ones but are never hashed or serialized, since each peer
//! creates them independently.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use prost::Message;
use sha2::{Digest, Sha256};

use crate::{Command, CommandPayload, EntityId, PlayerId, SimError, Simulation, StateHash, Turn};

/// Movement speed in units per second.
pub const MOVE_SPEED: f64 = 8.0;

/// First id handed out to local (non-synchronised) entities.
pub const LOCAL_ENTITY_ID_BASE: EntityId = 1 << 48;

/// Identifier for the hash algorithms used by [`World`].
pub const STATE_HASH_ALGO_ID: &str = "world-v1-quick-fnv1a64-full-sha256";

// ============================================================================
// Hashing helpers
// ============================================================================

/// FNV-1a 64-bit offset basis.
const FNV1A_OFFSET_BASIS: u64 = 0xcbf29ce484222325;

/// FNV-1a 64-bit prime.
const FNV1A_PRIME: u64 = 0x100000001b3;

#[derive(Debug, Clone)]
struct Fnv1a64 {
    state: u64,
}

impl Fnv1a64 {
    fn new() -> Self {
        Self {
            state: FNV1A_OFFSET_BASIS,
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV1A_PRIME);
        }
    }

    fn finish(self) -> u64 {
        self.state
    }
}

/// Canonicalize an f64 for hashing and serialization.
///
/// - `-0.0` → `+0.0`
/// - Any NaN → quiet NaN bit pattern `0x7ff8000000000000`
fn canonicalize_f64(value: f64) -> u64 {
    const QUIET_NAN_BITS: u64 = 0x7ff8000000000000;

    if value.is_nan() {
        QUIET_NAN_BITS
    } else if value == 0.0 {
        0u64
    } else {
        value.to_bits()
    }
}

fn canonical(value: f64) -> f64 {
    f64::from_bits(canonicalize_f64(value))
}

fn is_finite_point(p: [f64; 2]) -> bool {
    p[0].is_finite() && p[1].is_finite()
}

// ============================================================================
// Serialized state
// ============================================================================

#[derive(Clone, PartialEq, Message)]
struct WorldStateProto {
    #[prost(uint32, tag = "1")]
    turn: Turn,

    #[prost(uint64, tag = "2")]
    elapsed_ms: u64,

    #[prost(uint64, tag = "3")]
    next_entity_id: EntityId,

    /// Synchronised entities, ordered by id ascending.
    #[prost(message, repeated, tag = "4")]
    entities: Vec<EntityProto>,
}

#[derive(Clone, PartialEq, Message)]
struct EntityProto {
    #[prost(uint64, tag = "1")]
    id: EntityId,

    #[prost(sint32, tag = "2")]
    owner: PlayerId,

    #[prost(double, repeated, tag = "3")]
    position: Vec<f64>,

    /// Empty when the entity has no movement order.
    #[prost(double, repeated, tag = "4")]
    target: Vec<f64>,

    #[prost(bool, tag = "5")]
    destroyed: bool,
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone)]
struct Entity {
    owner: PlayerId,
    position: [f64; 2],
    target: Option<[f64; 2]>,
    /// Position at the start of the latest turn, for interpolation.
    prev_position: [f64; 2],
    render_position: [f64; 2],
    local: bool,
}

impl Entity {
    fn new(owner: PlayerId, position: [f64; 2], local: bool) -> Self {
        Self {
            owner,
            position,
            target: None,
            prev_position: position,
            render_position: position,
            local,
        }
    }
}

// ============================================================================
// World
// ============================================================================

/// Reference [`Simulation`] implementation.
#[derive(Debug, Clone)]
pub struct World {
    turn: Turn,
    elapsed_ms: u64,
    /// Entities by id; BTreeMap keeps iteration deterministic.
    entities: BTreeMap<EntityId, Entity>,
    /// Entities destroyed since the last flush.
    destroyed: BTreeSet<EntityId>,
    next_entity_id: EntityId,
    next_local_id: EntityId,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Create an empty world at turn 0.
    pub fn new() -> Self {
        Self {
            turn: 0,
            elapsed_ms: 0,
            entities: BTreeMap::new(),
            destroyed: BTreeSet::new(),
            next_entity_id: 1,
            next_local_id: LOCAL_ENTITY_ID_BASE,
        }
    }

    /// Number of steps executed so far.
    pub fn turn(&self) -> Turn {
        self.turn
    }

    /// Total simulated time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    /// Synchronised entity ids, ascending.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|(_, e)| !e.local)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Number of entities including local ones.
    pub fn total_entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn position(&self, entity: EntityId) -> Option<[f64; 2]> {
        self.entities.get(&entity).map(|e| e.position)
    }

    pub fn owner(&self, entity: EntityId) -> Option<PlayerId> {
        self.entities.get(&entity).map(|e| e.owner)
    }

    /// Interpolated position from the last [`Simulation::interpolate`] call.
    pub fn render_position(&self, entity: EntityId) -> Option<[f64; 2]> {
        self.entities.get(&entity).map(|e| e.render_position)
    }

    pub fn is_destroyed(&self, entity: EntityId) -> bool {
        self.destroyed.contains(&entity)
    }

    /// Create a local entity, e.g. a building placement preview.
    pub fn spawn_local(&mut self, position: [f64; 2]) -> EntityId {
        let id = self.next_local_id;
        self.next_local_id += 1;
        self.entities
            .insert(id, Entity::new(crate::OBSERVER_PLAYER, position, true));
        id
    }

    /// Mark an entity for removal at the next flush.
    pub fn destroy_entity(&mut self, entity: EntityId) {
        if self.entities.contains_key(&entity) {
            self.destroyed.insert(entity);
        }
    }

    fn apply_command(&mut self, command: &Command) {
        match command.payload {
            CommandPayload::Spawn { position } => {
                if command.player < 0 || !is_finite_point(position) {
                    return;
                }
                let id = self.next_entity_id;
                self.next_entity_id += 1;
                self.entities
                    .insert(id, Entity::new(command.player, position, false));
            }
            CommandPayload::Move { entity, target } => {
                if !is_finite_point(target) {
                    return;
                }
                if let Some(e) = self.owned_mut(command.player, entity) {
                    e.target = Some(target);
                }
            }
            CommandPayload::Stop { entity } => {
                if let Some(e) = self.owned_mut(command.player, entity) {
                    e.target = None;
                }
            }
            CommandPayload::Destroy { entity } => {
                if self.owned_mut(command.player, entity).is_some() {
                    self.destroyed.insert(entity);
                }
            }
        }
    }

    /// Synchronised, live entity owned by `player`.
    fn owned_mut(&mut self, player: PlayerId, entity: EntityId) -> Option<&mut Entity> {
        if self.destroyed.contains(&entity) {
            return None;
        }
        self.entities
            .get_mut(&entity)
            .filter(|e| !e.local && e.owner == player)
    }

    fn encode_state(&self) -> Vec<u8> {
        let entities = self
            .entities
            .iter()
            .filter(|(_, e)| !e.local)
            .map(|(&id, e)| EntityProto {
                id,
                owner: e.owner,
                position: e.position.iter().copied().map(canonical).collect(),
                target: e
                    .target
                    .map(|t| t.iter().copied().map(canonical).collect())
                    .unwrap_or_default(),
                destroyed: self.destroyed.contains(&id),
            })
            .collect();

        WorldStateProto {
            turn: self.turn,
            elapsed_ms: self.elapsed_ms,
            next_entity_id: self.next_entity_id,
            entities,
        }
        .encode_to_vec()
    }

    fn quick_hash(&self) -> u64 {
        let mut hasher = Fnv1a64::new();
        hasher.update(&self.turn.to_le_bytes());
        for (&id, entity) in self.entities.iter().filter(|(_, e)| !e.local) {
            hasher.update(&id.to_le_bytes());
            hasher.update(&canonicalize_f64(entity.position[0]).to_le_bytes());
            hasher.update(&canonicalize_f64(entity.position[1]).to_le_bytes());
        }
        hasher.finish()
    }
}

impl Simulation for World {
    fn step(&mut self, turn_length_ms: u32, commands: &[Command]) {
        for command in commands {
            self.apply_command(command);
        }

        let step = MOVE_SPEED * f64::from(turn_length_ms) / 1000.0;
        for entity in self.entities.values_mut() {
            entity.prev_position = entity.position;
            let Some(target) = entity.target else {
                continue;
            };
            let dx = target[0] - entity.position[0];
            let dy = target[1] - entity.position[1];
            let distance = (dx * dx + dy * dy).sqrt();
            if distance <= step {
                entity.position = target;
                entity.target = None;
            } else {
                entity.position[0] += dx / distance * step;
                entity.position[1] += dy / distance * step;
            }
        }

        self.turn += 1;
        self.elapsed_ms += u64::from(turn_length_ms);
    }

    fn compute_state_hash(&self, quick: bool) -> Result<StateHash, SimError> {
        if quick {
            Ok(StateHash(self.quick_hash().to_le_bytes().to_vec()))
        } else {
            Ok(StateHash(Sha256::digest(self.encode_state()).to_vec()))
        }
    }

    fn serialize_state(&self) -> Result<Vec<u8>, SimError> {
        Ok(self.encode_state())
    }

    fn deserialize_state(&mut self, bytes: &[u8]) -> Result<(), SimError> {
        let proto = WorldStateProto::decode(bytes)?;

        // Build the replacement fully before touching the live state.
        let mut entities = BTreeMap::new();
        let mut destroyed = BTreeSet::new();
        for e in proto.entities {
            if e.position.len() != 2 {
                return Err(SimError::InvalidState(format!(
                    "entity {} position must have exactly 2 elements",
                    e.id
                )));
            }
            let target = match e.target.len() {
                0 => None,
                2 => Some([e.target[0], e.target[1]]),
                _ => {
                    return Err(SimError::InvalidState(format!(
                        "entity {} target must have 0 or 2 elements",
                        e.id
                    )));
                }
            };
            if e.id >= proto.next_entity_id || e.id >= LOCAL_ENTITY_ID_BASE {
                return Err(SimError::InvalidState(format!(
                    "entity id {} out of range",
                    e.id
                )));
            }
            let mut entity = Entity::new(e.owner, [e.position[0], e.position[1]], false);
            entity.target = target;
            if e.destroyed {
                destroyed.insert(e.id);
            }
            entities.insert(e.id, entity);
        }

        self.turn = proto.turn;
        self.elapsed_ms = proto.elapsed_ms;
        self.next_entity_id = proto.next_entity_id;
        self.entities = entities;
        self.destroyed = destroyed;
        Ok(())
    }

    fn flush_destroyed_entities(&mut self) {
        for id in std::mem::take(&mut self.destroyed) {
            self.entities.remove(&id);
        }
    }

    fn interpolate(&mut self, _sim_frame_length: f32, offset: f32, _real_frame_length: f32) {
        let t = f64::from(offset.clamp(0.0, 1.0));
        for entity in self.entities.values_mut() {
            entity.render_position = [
                entity.prev_position[0] + (entity.position[0] - entity.prev_position[0]) * t,
                entity.prev_position[1] + (entity.position[1] - entity.prev_position[1]) * t,
            ];
        }
    }

    fn dump_debug_state(&self, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "hash algorithm: {STATE_HASH_ALGO_ID}")?;
        writeln!(out, "turn: {}", self.turn)?;
        writeln!(out, "elapsed_ms: {}", self.elapsed_ms)?;
        writeln!(out, "next_entity_id: {}", self.next_entity_id)?;
        for (id, e) in &self.entities {
            writeln!(
                out,
                "entity {id}: owner={} local={} destroyed={} position=({:?}, {:?}) target={:?}",
                e.owner,
                e.local,
                self.destroyed.contains(id),
                e.position[0],
                e.position[1],
                e.target,
            )?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spawn(player: PlayerId, x: f64, y: f64) -> Command {
        Command::new(player, CommandPayload::Spawn { position: [x, y] })
    }

    fn move_to(player: PlayerId, entity: EntityId, x: f64, y: f64) -> Command {
        Command::new(
            player,
            CommandPayload::Move {
                entity,
                target: [x, y],
            },
        )
    }

    #[test]
    fn test_spawn_assigns_sequential_ids() {
        let mut world = World::new();
        world.step(200, &[spawn(1, 0.0, 0.0), spawn(2, 5.0, 5.0)]);

        assert_eq!(world.entity_ids(), vec![1, 2]);
        assert_eq!(world.owner(1), Some(1));
        assert_eq!(world.owner(2), Some(2));
        assert_eq!(world.turn(), 1);
        assert_eq!(world.elapsed_ms(), 200);
    }

    #[test]
    fn test_observer_cannot_spawn() {
        let mut world = World::new();
        world.step(200, &[spawn(crate::OBSERVER_PLAYER, 0.0, 0.0)]);
        assert!(world.entity_ids().is_empty());
    }

    #[test]
    fn test_move_reaches_target_exactly() {
        let mut world = World::new();
        world.step(200, &[spawn(1, 0.0, 0.0)]);
        world.step(200, &[move_to(1, 1, 1.0, 0.0)]);

        // 8 units/s * 0.2 s = 1.6 units per turn; target is 1.0 away.
        assert_eq!(world.position(1), Some([1.0, 0.0]));
    }

    #[test]
    fn test_move_partial_step() {
        let mut world = World::new();
        world.step(500, &[spawn(1, 0.0, 0.0)]);
        world.step(500, &[move_to(1, 1, 10.0, 0.0)]);

        assert_eq!(world.position(1), Some([4.0, 0.0]));
        world.step(500, &[]);
        assert_eq!(world.position(1), Some([8.0, 0.0]));
        world.step(500, &[]);
        assert_eq!(world.position(1), Some([10.0, 0.0]));
    }

    #[test]
    fn test_commands_only_affect_owned_entities() {
        let mut world = World::new();
        world.step(200, &[spawn(1, 0.0, 0.0)]);
        world.step(
            200,
            &[
                move_to(2, 1, 10.0, 10.0),
                Command::new(2, CommandPayload::Destroy { entity: 1 }),
            ],
        );

        assert_eq!(world.position(1), Some([0.0, 0.0]));
        assert!(!world.is_destroyed(1));
    }

    #[test]
    fn test_non_finite_move_ignored() {
        let mut world = World::new();
        world.step(200, &[spawn(1, 0.0, 0.0)]);
        world.step(200, &[move_to(1, 1, f64::NAN, 0.0)]);
        assert_eq!(world.position(1), Some([0.0, 0.0]));
    }

    #[test]
    fn test_destroyed_entities_kept_until_flush() {
        let mut world = World::new();
        world.step(200, &[spawn(1, 0.0, 0.0)]);
        world.step(200, &[Command::new(1, CommandPayload::Destroy { entity: 1 })]);

        assert!(world.is_destroyed(1));
        assert_eq!(world.entity_ids(), vec![1]);

        world.flush_destroyed_entities();
        assert!(world.entity_ids().is_empty());
        assert!(!world.is_destroyed(1));
    }

    #[test]
    fn test_local_entities_excluded_from_hash_and_state() {
        let mut world = World::new();
        world.step(200, &[spawn(1, 0.0, 0.0)]);
        let quick = world.compute_state_hash(true).unwrap();
        let full = world.compute_state_hash(false).unwrap();

        let preview = world.spawn_local([3.0, 3.0]);
        assert!(preview >= LOCAL_ENTITY_ID_BASE);
        assert_eq!(world.total_entity_count(), 2);
        assert_eq!(world.compute_state_hash(true).unwrap(), quick);
        assert_eq!(world.compute_state_hash(false).unwrap(), full);

        let mut restored = World::new();
        restored
            .deserialize_state(&world.serialize_state().unwrap())
            .unwrap();
        assert_eq!(restored.total_entity_count(), 1);
    }

    #[test]
    fn test_hash_lengths() {
        let world = World::new();
        assert_eq!(world.compute_state_hash(true).unwrap().as_bytes().len(), 8);
        assert_eq!(world.compute_state_hash(false).unwrap().as_bytes().len(), 32);
    }

    #[test]
    fn test_hash_changes_with_state() {
        let mut world = World::new();
        world.step(200, &[spawn(1, 0.0, 0.0)]);
        let before = world.compute_state_hash(true).unwrap();
        world.step(200, &[move_to(1, 1, 5.0, 0.0)]);
        assert_ne!(before, world.compute_state_hash(true).unwrap());
    }

    #[test]
    fn test_serialize_roundtrip_preserves_hashes() {
        let mut world = World::new();
        world.step(200, &[spawn(1, 0.0, 0.0), spawn(2, -1.0, 4.0)]);
        world.step(200, &[move_to(1, 1, 9.0, 9.0)]);
        world.step(200, &[Command::new(2, CommandPayload::Destroy { entity: 2 })]);

        let bytes = world.serialize_state().unwrap();
        let mut restored = World::new();
        restored.deserialize_state(&bytes).unwrap();

        assert_eq!(restored.turn(), world.turn());
        assert!(restored.is_destroyed(2));
        assert_eq!(
            restored.compute_state_hash(false).unwrap(),
            world.compute_state_hash(false).unwrap()
        );

        // Continuing from the restored state stays in lockstep.
        world.step(200, &[]);
        restored.step(200, &[]);
        assert_eq!(
            restored.compute_state_hash(true).unwrap(),
            world.compute_state_hash(true).unwrap()
        );
    }

    #[test]
    fn test_deserialize_garbage_leaves_state_untouched() {
        let mut world = World::new();
        world.step(200, &[spawn(1, 0.0, 0.0)]);
        let before = world.compute_state_hash(false).unwrap();

        assert!(world.deserialize_state(&[0xff, 0xff, 0xff]).is_err());
        assert_eq!(world.compute_state_hash(false).unwrap(), before);
    }

    #[test]
    fn test_deserialize_rejects_bad_position() {
        let bad = WorldStateProto {
            turn: 3,
            elapsed_ms: 600,
            next_entity_id: 2,
            entities: vec![EntityProto {
                id: 1,
                owner: 1,
                position: vec![1.0],
                target: vec![],
                destroyed: false,
            }],
        };
        let mut world = World::new();
        let result = world.deserialize_state(&bad.encode_to_vec());
        assert!(matches!(result, Err(SimError::InvalidState(_))));
        assert_eq!(world.turn(), 0);
    }

    #[test]
    fn test_negative_zero_hashes_like_zero() {
        let mut a = World::new();
        let mut b = World::new();
        a.step(200, &[spawn(1, 0.0, 0.0)]);
        b.step(200, &[spawn(1, -0.0, 0.0)]);
        assert_eq!(
            a.compute_state_hash(false).unwrap(),
            b.compute_state_hash(false).unwrap()
        );
        assert_eq!(
            a.compute_state_hash(true).unwrap(),
            b.compute_state_hash(true).unwrap()
        );
    }

    #[test]
    fn test_f64_canonicalization() {
        assert_eq!(canonicalize_f64(-0.0), 0u64);
        assert_eq!(
            canonicalize_f64(f64::NAN),
            canonicalize_f64(f64::from_bits(0x7ff0000000000001))
        );
        assert_eq!(canonicalize_f64(1.5), 1.5f64.to_bits());
    }

    #[test]
    fn test_interpolate_midpoint() {
        let mut world = World::new();
        world.step(500, &[spawn(1, 0.0, 0.0)]);
        world.step(500, &[move_to(1, 1, 10.0, 0.0)]);

        world.interpolate(0.1, 0.5, 0.1);
        assert_eq!(world.render_position(1), Some([2.0, 0.0]));

        world.interpolate(0.1, 1.0, 0.1);
        assert_eq!(world.render_position(1), Some([4.0, 0.0]));
    }

    #[test]
    fn test_dump_debug_state_lists_entities() {
        let mut world = World::new();
        world.step(200, &[spawn(4, 1.0, 2.0)]);
        let mut out = Vec::new();
        world.dump_debug_state(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("turn: 1"));
        assert!(text.contains("entity 1: owner=4"));
    }

    fn arb_command() -> impl Strategy<Value = Command> {
        let player = 0..3i32;
        let entity = 1..6u64;
        let coord = -50.0..50.0f64;
        prop_oneof![
            (player.clone(), coord.clone(), coord.clone())
                .prop_map(|(p, x, y)| spawn(p, x, y)),
            (player.clone(), entity.clone(), coord.clone(), coord)
                .prop_map(|(p, e, x, y)| move_to(p, e, x, y)),
            (player.clone(), entity.clone())
                .prop_map(|(p, e)| Command::new(p, CommandPayload::Stop { entity: e })),
            (player, entity)
                .prop_map(|(p, e)| Command::new(p, CommandPayload::Destroy { entity: e })),
        ]
    }

    proptest! {
        #[test]
        fn independent_worlds_agree(
            turns in prop::collection::vec(prop::collection::vec(arb_command(), 0..4), 1..20)
        ) {
            let mut a = World::new();
            let mut b = World::new();
            for commands in &turns {
                a.flush_destroyed_entities();
                b.flush_destroyed_entities();
                a.step(200, commands);
                b.step(200, commands);
                prop_assert_eq!(a.compute_state_hash(true).unwrap(), b.compute_state_hash(true).unwrap());
            }
            prop_assert_eq!(a.compute_state_hash(false).unwrap(), b.compute_state_hash(false).unwrap());
        }
    }
}
