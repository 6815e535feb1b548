//! Messages exchanged between the listeners, reader loops and the two actors.
//!
//! [`Event`] flows into the server (the single owner of client identity).
//! [`Dispatch`] is what the server forwards to the broadcast handler once an
//! event has been relabeled with the sender's client id.

use crate::connection::{Connection, ConnectionHandle, ConnectionId};

pub const RATE_LIMIT_NOTICE: &str = "You are being rate limited!\n";

#[derive(Debug)]
pub enum Event {
    /// A listener accepted a transport; the server has not registered it yet.
    NewConnection(Connection),
    /// The connection's transport failed, ended, or rejected a write.
    DeadConnection { id: ConnectionId },
    /// A frame that passed the sender's rate limit.
    Broadcast { id: ConnectionId, text: String },
    /// Text meant only for the given connection.
    DirectMessage { id: ConnectionId, text: String },
    /// Deliver `text` to everyone, close all connections and stop.
    Shutdown { text: String },
}

#[derive(Debug)]
pub enum Dispatch {
    Joined {
        connection: ConnectionHandle,
        text: String,
    },
    Left {
        id: ConnectionId,
        text: String,
    },
    Broadcast {
        /// Origin of the message, for logging. The sender still receives its
        /// own broadcast.
        sender: ConnectionId,
        text: String,
    },
    Direct {
        id: ConnectionId,
        text: String,
    },
    Shutdown {
        text: String,
    },
}

pub fn joined_text(client_id: u64) -> String {
    format!("user {client_id} has joined\n")
}

pub fn left_text(client_id: u64) -> String {
    format!("user {client_id} has left\n")
}

/// `text` keeps its own line terminator.
pub fn broadcast_text(client_id: u64, text: &str) -> String {
    format!("user {client_id} > {text}")
}
