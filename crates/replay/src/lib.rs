//! Lockstep Replay System
//!
//! This crate provides the replay log sink used by the turn manager and the
//! tools to persist and verify it.
//!
//! # Architecture
//!
//! - `ReplayLogger`: append-only sink for executed turns and state hashes
//! - `ReplayRecorder`: in-memory logger producing a `ReplayArtifact`
//! - `NullReplayLogger`: discards everything
//! - `verify_replay`: re-runs a recorded session through a fresh
//!   simulation and checks every recorded hash
//!
//! Turn records use the pre-step turn number: the entry for turn `n`
//! carries the commands that take the simulation from `n` to `n + 1`.
//! A hash record refers to the state after the turn record preceding it.

#![deny(unsafe_code)]

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use lockstep_sim::{Command, SimError, Simulation, StateHash, Turn};
use lockstep_wire::{
    ReplayArtifact, ReplayEntryProto, ReplayHashProto, ReplayTurnProto, replay_entry_proto,
};
use prost::Message;
use thiserror::Error;
use tracing::{debug, warn};

/// Current replay schema version.
pub const REPLAY_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Replay Logger
// ============================================================================

/// Append-only sink for the turn manager's replay records.
///
/// Records MUST be kept in the order they are received.
pub trait ReplayLogger {
    /// One executed turn, logged even when `commands` is empty.
    fn turn(&mut self, turn: Turn, turn_length: u32, commands: &[Command]);

    /// State hash computed after the most recent turn.
    fn hash(&mut self, hash: &StateHash, quick: bool);
}

/// Logger that discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReplayLogger;

impl ReplayLogger for NullReplayLogger {
    fn turn(&mut self, _turn: Turn, _turn_length: u32, _commands: &[Command]) {}

    fn hash(&mut self, _hash: &StateHash, _quick: bool) {}
}

// ============================================================================
// Replay Recorder
// ============================================================================

/// A single replay record.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayEntry {
    Turn {
        turn: Turn,
        turn_length: u32,
        commands: Vec<Command>,
    },
    Hash {
        hash: StateHash,
        quick: bool,
    },
}

impl From<ReplayEntry> for ReplayEntryProto {
    fn from(entry: ReplayEntry) -> Self {
        let entry = match entry {
            ReplayEntry::Turn {
                turn,
                turn_length,
                commands,
            } => replay_entry_proto::Entry::Turn(ReplayTurnProto {
                turn,
                turn_length,
                commands: commands.into_iter().map(Into::into).collect(),
            }),
            ReplayEntry::Hash { hash, quick } => {
                replay_entry_proto::Entry::Hash(ReplayHashProto { hash: hash.0, quick })
            }
        };
        Self { entry: Some(entry) }
    }
}

impl TryFrom<ReplayEntryProto> for ReplayEntry {
    type Error = &'static str;

    fn try_from(proto: ReplayEntryProto) -> Result<Self, Self::Error> {
        match proto.entry.ok_or("replay entry is empty")? {
            replay_entry_proto::Entry::Turn(t) => {
                let commands: Result<Vec<Command>, _> =
                    t.commands.into_iter().map(TryInto::try_into).collect();
                Ok(Self::Turn {
                    turn: t.turn,
                    turn_length: t.turn_length,
                    commands: commands?,
                })
            }
            replay_entry_proto::Entry::Hash(h) => Ok(Self::Hash {
                hash: StateHash(h.hash),
                quick: h.quick,
            }),
        }
    }
}

/// Records turns and hashes in memory.
#[derive(Debug, Default, Clone)]
pub struct ReplayRecorder {
    state_hash_algo_id: String,
    entries: Vec<ReplayEntry>,
}

impl ReplayRecorder {
    /// Create a recorder for a simulation using the given hash algorithm.
    pub fn new(state_hash_algo_id: impl Into<String>) -> Self {
        Self {
            state_hash_algo_id: state_hash_algo_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[ReplayEntry] {
        &self.entries
    }

    /// Turn records only, in order.
    pub fn turns(&self) -> impl Iterator<Item = (Turn, u32, &[Command])> {
        self.entries.iter().filter_map(|e| match e {
            ReplayEntry::Turn {
                turn,
                turn_length,
                commands,
            } => Some((*turn, *turn_length, commands.as_slice())),
            ReplayEntry::Hash { .. } => None,
        })
    }

    /// Hash records only, in order.
    pub fn hashes(&self) -> impl Iterator<Item = (&StateHash, bool)> {
        self.entries.iter().filter_map(|e| match e {
            ReplayEntry::Hash { hash, quick } => Some((hash, *quick)),
            ReplayEntry::Turn { .. } => None,
        })
    }

    /// Finalize the replay artifact.
    pub fn finalize(self) -> ReplayArtifact {
        ReplayArtifact {
            replay_format_version: REPLAY_FORMAT_VERSION,
            state_hash_algo_id: self.state_hash_algo_id,
            entries: self.entries.into_iter().map(Into::into).collect(),
        }
    }
}

impl ReplayLogger for ReplayRecorder {
    fn turn(&mut self, turn: Turn, turn_length: u32, commands: &[Command]) {
        self.entries.push(ReplayEntry::Turn {
            turn,
            turn_length,
            commands: commands.to_vec(),
        });
    }

    fn hash(&mut self, hash: &StateHash, quick: bool) {
        self.entries.push(ReplayEntry::Hash {
            hash: hash.clone(),
            quick,
        });
    }
}

// ============================================================================
// Replay Verification
// ============================================================================

/// Replay verification error.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("unsupported replay format version {found}")]
    UnsupportedVersion { found: u32 },
    #[error("hash algorithm mismatch: replay uses {recorded}, verifier uses {current}")]
    AlgorithmMismatch { recorded: String, current: String },
    #[error("turn records not contiguous: expected turn {expected}, got {actual}")]
    NonContiguousTurn { expected: Turn, actual: Turn },
    #[error("hash record precedes any turn record")]
    OrphanHash,
    #[error("invalid replay format: {reason}")]
    InvalidFormat { reason: String },
    #[error("state hash mismatch after turn {turn}: expected {expected}, got {actual}")]
    HashMismatch {
        turn: Turn,
        expected: StateHash,
        actual: StateHash,
    },
    #[error(transparent)]
    Simulation(#[from] SimError),
}

/// Options for replay verification.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// When set, the artifact's hash algorithm id must match.
    pub state_hash_algo_id: Option<String>,
}

/// Summary of a successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerifyReport {
    pub turns: usize,
    pub hashes_checked: usize,
}

/// Verify a replay artifact against a fresh simulation.
///
/// `simulation` MUST be in the state the recorded session started from.
/// Each turn flushes destroyed entities before stepping, exactly as the
/// turn manager does.
pub fn verify_replay<S: Simulation>(
    artifact: &ReplayArtifact,
    simulation: &mut S,
    options: &VerifyOptions,
) -> Result<VerifyReport, VerifyError> {
    if artifact.replay_format_version != REPLAY_FORMAT_VERSION {
        return Err(VerifyError::UnsupportedVersion {
            found: artifact.replay_format_version,
        });
    }

    if let Some(current) = &options.state_hash_algo_id
        && *current != artifact.state_hash_algo_id
    {
        return Err(VerifyError::AlgorithmMismatch {
            recorded: artifact.state_hash_algo_id.clone(),
            current: current.clone(),
        });
    }

    let mut report = VerifyReport::default();
    // Turn the simulation has reached: one past the last logged turn.
    let mut reached: Option<Turn> = None;

    for proto in &artifact.entries {
        let entry: ReplayEntry =
            proto
                .clone()
                .try_into()
                .map_err(|e: &str| VerifyError::InvalidFormat {
                    reason: e.to_string(),
                })?;

        match entry {
            ReplayEntry::Turn {
                turn,
                turn_length,
                commands,
            } => {
                if let Some(expected) = reached
                    && turn != expected
                {
                    return Err(VerifyError::NonContiguousTurn {
                        expected,
                        actual: turn,
                    });
                }
                let next = turn.checked_add(1).ok_or_else(|| VerifyError::InvalidFormat {
                    reason: format!("turn {turn} overflows the turn counter"),
                })?;
                simulation.flush_destroyed_entities();
                simulation.step(turn_length, &commands);
                reached = Some(next);
                report.turns += 1;
            }
            ReplayEntry::Hash { hash, quick } => {
                let Some(turn) = reached else {
                    return Err(VerifyError::OrphanHash);
                };
                let actual = simulation.compute_state_hash(quick)?;
                if actual != hash {
                    warn!(turn, %hash, %actual, "replay hash mismatch");
                    return Err(VerifyError::HashMismatch {
                        turn,
                        expected: hash,
                        actual,
                    });
                }
                report.hashes_checked += 1;
            }
        }
    }

    debug!(
        turns = report.turns,
        hashes = report.hashes_checked,
        "replay verified"
    );
    Ok(report)
}

// ============================================================================
// Replay I/O
// ============================================================================

/// Replay file error.
#[derive(Debug, Error)]
pub enum ReplayIoError {
    #[error("replay artifact already exists at {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("replay I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to decode replay: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Write a replay artifact to a file. Existing files are never overwritten.
pub fn write_replay(artifact: &ReplayArtifact, path: &Path) -> Result<(), ReplayIoError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    if path.exists() {
        return Err(ReplayIoError::AlreadyExists(path.to_path_buf()));
    }

    let encoded = artifact.encode_to_vec();
    let mut file = fs::File::create(path)?;
    file.write_all(&encoded)?;

    Ok(())
}

/// Read a replay artifact from a file.
pub fn read_replay(path: &Path) -> Result<ReplayArtifact, ReplayIoError> {
    let data = fs::read(path)?;
    Ok(ReplayArtifact::decode(data.as_slice())?)
}

// ============================================================================
// Tests
// ============================================================================
