//! Lockstep Wire Protocol Types
//!
//! Shared Protobuf message types exchanged between clients and the server
//! of a lockstep session. All messages travel over a reliable, ordered
//! channel; the turn manager hands the transport fully-formed
//! [`NetMessage`] values and receives decoded ones back.
//!
//! # Message Flow
//!
//! - `SimulationMessage`: client → server (command issued), then server →
//!   all clients (echo, including the issuer)
//! - `EndCommandBatch`: client → server ("finished my commands for turn N"),
//!   and server → all clients ("turn N is ready, with this turn length")
//! - `SyncCheck`: client → server (state hash after executing turn N)
//! - `SyncError`: server → all clients (hash mismatch detected)

#![deny(unsafe_code)]

use prost::Message;
use thiserror::Error;

use lockstep_sim::{ClientId, Command, CommandPayload, PlayerId, StateHash, Turn};

// ============================================================================
// Command Payloads
// ============================================================================

/// Position pair on the wire.
#[derive(Clone, PartialEq, Message)]
pub struct PointProto {
    #[prost(double, tag = "1")]
    pub x: f64,

    #[prost(double, tag = "2")]
    pub y: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct SpawnOrder {
    #[prost(message, optional, tag = "1")]
    pub position: Option<PointProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct MoveOrder {
    #[prost(uint64, tag = "1")]
    pub entity: u64,

    #[prost(message, optional, tag = "2")]
    pub target: Option<PointProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StopOrder {
    #[prost(uint64, tag = "1")]
    pub entity: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct DestroyOrder {
    #[prost(uint64, tag = "1")]
    pub entity: u64,
}

/// Serialized [`CommandPayload`].
#[derive(Clone, PartialEq, Message)]
pub struct CommandPayloadProto {
    #[prost(oneof = "command_payload_proto::Kind", tags = "1, 2, 3, 4")]
    pub kind: Option<command_payload_proto::Kind>,
}

pub mod command_payload_proto {
    use super::{DestroyOrder, MoveOrder, SpawnOrder, StopOrder};

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Spawn(SpawnOrder),
        #[prost(message, tag = "2")]
        Move(MoveOrder),
        #[prost(message, tag = "3")]
        Stop(StopOrder),
        #[prost(message, tag = "4")]
        Destroy(DestroyOrder),
    }
}

// ============================================================================
// Turn Manager Messages
// ============================================================================

/// A command scheduled for a specific turn.
#[derive(Clone, PartialEq, Message)]
pub struct SimulationMessage {
    /// Issuing client. Overwritten by the server with the authenticated
    /// sender before echoing.
    #[prost(uint32, tag = "1")]
    pub client: ClientId,

    #[prost(sint32, tag = "2")]
    pub player: PlayerId,

    /// Turn the command executes on.
    #[prost(uint32, tag = "3")]
    pub turn: Turn,

    #[prost(message, optional, tag = "4")]
    pub payload: Option<CommandPayloadProto>,
}

/// Command batch boundary.
///
/// Client → server: the client will send no more commands for `turn`.
/// Server → client: every client has finished `turn`; it may execute with
/// `turn_length` milliseconds.
#[derive(Clone, PartialEq, Message)]
pub struct EndCommandBatch {
    #[prost(uint32, tag = "1")]
    pub turn: Turn,

    #[prost(uint32, tag = "2")]
    pub turn_length: u32,
}

/// State hash reported by a client after executing `turn`.
#[derive(Clone, PartialEq, Message)]
pub struct SyncCheck {
    #[prost(uint32, tag = "1")]
    pub turn: Turn,

    #[prost(bytes = "vec", tag = "2")]
    pub hash: Vec<u8>,
}

/// Broadcast when clients disagree on the state hash for `turn`.
#[derive(Clone, PartialEq, Message)]
pub struct SyncError {
    #[prost(uint32, tag = "1")]
    pub turn: Turn,

    #[prost(bytes = "vec", tag = "2")]
    pub hash_expected: Vec<u8>,
}

/// Envelope for everything the turn manager sends or receives.
#[derive(Clone, PartialEq, Message)]
pub struct NetMessageProto {
    #[prost(oneof = "NetMessage", tags = "1, 2, 3, 4")]
    pub message: Option<NetMessage>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum NetMessage {
    #[prost(message, tag = "1")]
    Simulation(SimulationMessage),
    #[prost(message, tag = "2")]
    EndCommandBatch(EndCommandBatch),
    #[prost(message, tag = "3")]
    SyncCheck(SyncCheck),
    #[prost(message, tag = "4")]
    SyncError(SyncError),
}

impl NetMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Simulation(_) => "simulation",
            Self::EndCommandBatch(_) => "end_command_batch",
            Self::SyncCheck(_) => "sync_check",
            Self::SyncError(_) => "sync_error",
        }
    }
}

/// Encode a message for the transport.
pub fn encode_message(message: &NetMessage) -> Vec<u8> {
    NetMessageProto {
        message: Some(message.clone()),
    }
    .encode_to_vec()
}

/// Errors decoding a transport frame.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("empty message envelope")]
    EmptyEnvelope,
}

/// Decode a message received from the transport.
pub fn decode_message(bytes: &[u8]) -> Result<NetMessage, WireError> {
    NetMessageProto::decode(bytes)?
        .message
        .ok_or(WireError::EmptyEnvelope)
}

// ============================================================================
// Replay Artifact Types
// ============================================================================

/// One executed turn as recorded in a replay.
#[derive(Clone, PartialEq, Message)]
pub struct ReplayTurnProto {
    #[prost(uint32, tag = "1")]
    pub turn: Turn,

    #[prost(uint32, tag = "2")]
    pub turn_length: u32,

    /// Commands in execution order.
    #[prost(message, repeated, tag = "3")]
    pub commands: Vec<ReplayCommandProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReplayCommandProto {
    #[prost(sint32, tag = "1")]
    pub player: PlayerId,

    #[prost(message, optional, tag = "2")]
    pub payload: Option<CommandPayloadProto>,
}

/// State hash recorded after the preceding turn.
#[derive(Clone, PartialEq, Message)]
pub struct ReplayHashProto {
    #[prost(bytes = "vec", tag = "1")]
    pub hash: Vec<u8>,

    #[prost(bool, tag = "2")]
    pub quick: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReplayEntryProto {
    #[prost(oneof = "replay_entry_proto::Entry", tags = "1, 2")]
    pub entry: Option<replay_entry_proto::Entry>,
}

pub mod replay_entry_proto {
    use super::{ReplayHashProto, ReplayTurnProto};

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Entry {
        #[prost(message, tag = "1")]
        Turn(ReplayTurnProto),
        #[prost(message, tag = "2")]
        Hash(ReplayHashProto),
    }
}

/// Complete replay log of a session.
#[derive(Clone, PartialEq, Message)]
pub struct ReplayArtifact {
    /// Schema version (starts at 1).
    #[prost(uint32, tag = "1")]
    pub replay_format_version: u32,

    /// Hash algorithm identifier of the recording simulation.
    #[prost(string, tag = "2")]
    pub state_hash_algo_id: String,

    /// Turn and hash records in recording order.
    #[prost(message, repeated, tag = "3")]
    pub entries: Vec<ReplayEntryProto>,
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<[f64; 2]> for PointProto {
    fn from(p: [f64; 2]) -> Self {
        Self { x: p[0], y: p[1] }
    }
}

impl From<PointProto> for [f64; 2] {
    fn from(p: PointProto) -> Self {
        [p.x, p.y]
    }
}

impl From<CommandPayload> for CommandPayloadProto {
    fn from(payload: CommandPayload) -> Self {
        use command_payload_proto::Kind;

        let kind = match payload {
            CommandPayload::Spawn { position } => Kind::Spawn(SpawnOrder {
                position: Some(position.into()),
            }),
            CommandPayload::Move { entity, target } => Kind::Move(MoveOrder {
                entity,
                target: Some(target.into()),
            }),
            CommandPayload::Stop { entity } => Kind::Stop(StopOrder { entity }),
            CommandPayload::Destroy { entity } => Kind::Destroy(DestroyOrder { entity }),
        };
        Self { kind: Some(kind) }
    }
}

impl TryFrom<CommandPayloadProto> for CommandPayload {
    type Error = &'static str;

    fn try_from(proto: CommandPayloadProto) -> Result<Self, Self::Error> {
        use command_payload_proto::Kind;

        match proto.kind.ok_or("command payload is empty")? {
            Kind::Spawn(order) => Ok(Self::Spawn {
                position: order.position.ok_or("spawn order has no position")?.into(),
            }),
            Kind::Move(order) => Ok(Self::Move {
                entity: order.entity,
                target: order.target.ok_or("move order has no target")?.into(),
            }),
            Kind::Stop(order) => Ok(Self::Stop {
                entity: order.entity,
            }),
            Kind::Destroy(order) => Ok(Self::Destroy {
                entity: order.entity,
            }),
        }
    }
}

impl SimulationMessage {
    pub fn new(client: ClientId, player: PlayerId, turn: Turn, payload: CommandPayload) -> Self {
        Self {
            client,
            player,
            turn,
            payload: Some(payload.into()),
        }
    }

    /// Decode the carried command.
    pub fn command(&self) -> Result<Command, &'static str> {
        let payload = self
            .payload
            .clone()
            .ok_or("simulation message has no payload")?
            .try_into()?;
        Ok(Command::new(self.player, payload))
    }
}

impl From<Command> for ReplayCommandProto {
    fn from(command: Command) -> Self {
        Self {
            player: command.player,
            payload: Some(command.payload.into()),
        }
    }
}

impl TryFrom<ReplayCommandProto> for Command {
    type Error = &'static str;

    fn try_from(proto: ReplayCommandProto) -> Result<Self, Self::Error> {
        let payload = proto
            .payload
            .ok_or("replay command has no payload")?
            .try_into()?;
        Ok(Command::new(proto.player, payload))
    }
}

impl SyncCheck {
    pub fn new(turn: Turn, hash: &StateHash) -> Self {
        Self {
            turn,
            hash: hash.0.clone(),
        }
    }
}

impl SyncError {
    pub fn new(turn: Turn, expected: &StateHash) -> Self {
        Self {
            turn,
            hash_expected: expected.0.clone(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulation_message_through_envelope() {
        let msg = NetMessage::Simulation(SimulationMessage::new(
            3,
            1,
            7,
            CommandPayload::Move {
                entity: 12,
                target: [1.5, -2.0],
            },
        ));
        let decoded = decode_message(&encode_message(&msg)).unwrap();
        assert_eq!(decoded, msg);

        let NetMessage::Simulation(sim) = decoded else {
            panic!("expected simulation message");
        };
        assert_eq!(
            sim.command().unwrap(),
            Command::new(
                1,
                CommandPayload::Move {
                    entity: 12,
                    target: [1.5, -2.0]
                }
            )
        );
    }

    #[test]
    fn test_negative_player_survives_encoding() {
        let msg = NetMessage::Simulation(SimulationMessage::new(
            0,
            lockstep_sim::OBSERVER_PLAYER,
            2,
            CommandPayload::Stop { entity: 1 },
        ));
        let NetMessage::Simulation(sim) = decode_message(&encode_message(&msg)).unwrap() else {
            panic!("expected simulation message");
        };
        assert_eq!(sim.player, -1);
    }

    #[test]
    fn test_empty_envelope_rejected() {
        let bytes = NetMessageProto { message: None }.encode_to_vec();
        assert!(matches!(
            decode_message(&bytes),
            Err(WireError::EmptyEnvelope)
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            decode_message(&[0x0a, 0xff, 0xff, 0xff]),
            Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn test_missing_payload_rejected() {
        let msg = SimulationMessage {
            client: 1,
            player: 1,
            turn: 3,
            payload: None,
        };
        assert!(msg.command().is_err());

        let empty = SimulationMessage {
            payload: Some(CommandPayloadProto { kind: None }),
            ..msg
        };
        assert!(empty.command().is_err());
    }

    #[test]
    fn test_move_without_target_rejected() {
        let proto = CommandPayloadProto {
            kind: Some(command_payload_proto::Kind::Move(MoveOrder {
                entity: 4,
                target: None,
            })),
        };
        assert!(CommandPayload::try_from(proto).is_err());
    }

    #[test]
    fn test_sync_messages_carry_hash_bytes() {
        let hash = StateHash(vec![0xde, 0xad]);
        assert_eq!(SyncCheck::new(4, &hash).hash, vec![0xde, 0xad]);
        assert_eq!(SyncError::new(4, &hash).hash_expected, vec![0xde, 0xad]);
    }

    #[test]
    fn test_message_kind_names() {
        let msg = NetMessage::EndCommandBatch(EndCommandBatch {
            turn: 2,
            turn_length: 500,
        });
        assert_eq!(msg.kind(), "end_command_batch");
    }
}
