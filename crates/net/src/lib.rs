//! Lockstep Network Turn Manager
//!
//! Keeps every participant of a multiplayer session executing the same
//! deterministic simulation turn by turn, and detects when they diverge.
//!
//! - `CommandQueue`: commands buffered by target turn
//! - `TurnManager`: per-frame scheduling, snapshots, out-of-sync reporting,
//!   composed with a role:
//!   - `ClientRole`: networked client, commands round-trip via the server
//!   - `LocalRole`: single player, no network delay
//! - `ServerTurnManager`: turn-ready barrier and hash cross-checking
//!
//! # Delay scheduling
//!
//! While on turn `n` a peer schedules new commands for `n + D`, where `D` is
//! the command delay. Every other peer has finished scheduling for `n` (or
//! `n` could not have started) and has not finished `n + D`, so peers are on
//! turns `n - 1` to `n + 1` and may send commands for `n + 1` to `n + D + 1`.
//! The command queue therefore holds `D + 1` turns, and the accepted window
//! is derived from the same constant.
//!
//! # I/O
//!
//! Nothing here blocks or touches sockets. Outbound messages go through
//! [`ClientTransport`] / [`ServerTransport`]; inbound messages are handed to
//! `handle_server_message` / `handle_client_message`. Everything runs on the
//! caller's thread, once per frame.

#![deny(unsafe_code)]

pub mod client;
pub mod client_tracking;
pub mod command_queue;
pub mod config;
pub mod error;
pub mod local;
pub mod server;
pub mod transport;
pub mod turn_manager;

pub use client::{ClientRole, ClientTurnManager};
pub use client_tracking::ClientTracking;
pub use command_queue::CommandQueue;
pub use config::TurnConfig;
pub use error::{ConfigError, ProtocolError, TurnError};
pub use local::{LocalRole, LocalTurnManager};
pub use server::ServerTurnManager;
pub use transport::{ClientTransport, Outbox, ServerTransport, SessionUi};
pub use turn_manager::{SyncErrorReport, TurnCore, TurnManager, TurnRole, UpdateOutcome};


// ============================================================================
// Tests
// ============================================================================
