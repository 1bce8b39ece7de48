//! Collaborator seams: message transport and session UI.
//!
//! The turn manager never touches sockets. It hands fully formed messages
//! to a transport and receives inbound ones through `handle_*_message`.

use lockstep_wire::NetMessage;

/// Reliable, ordered delivery from a client to the server.
pub trait ClientTransport {
    fn send(&mut self, message: NetMessage);
}

/// Reliable, ordered delivery from the server to every client.
pub trait ServerTransport {
    fn broadcast(&mut self, message: NetMessage);
}

/// Session-level user interface hooks.
///
/// Replaces direct access to a global GUI: quicksave metadata and the
/// blocking sync-error message both go through here.
pub trait SessionUi {
    /// Show a blocking message to the user.
    fn display_message(&mut self, title: &str, message: &str);

    /// Opaque UI state stored alongside a quicksave.
    fn saved_game_data(&mut self) -> Vec<u8>;

    /// Restore UI state saved by [`SessionUi::saved_game_data`].
    fn restore_saved_game_data(&mut self, data: &[u8]);
}

/// In-process transport that collects outbound messages.
///
/// Used for loopback sessions and tests; the owner drains it and delivers
/// the messages itself.
#[derive(Debug, Default, Clone)]
pub struct Outbox {
    messages: Vec<NetMessage>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[NetMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Take every queued message, oldest first.
    pub fn drain(&mut self) -> Vec<NetMessage> {
        std::mem::take(&mut self.messages)
    }
}

impl ClientTransport for Outbox {
    fn send(&mut self, message: NetMessage) {
        self.messages.push(message);
    }
}

impl ServerTransport for Outbox {
    fn broadcast(&mut self, message: NetMessage) {
        self.messages.push(message);
    }
}
