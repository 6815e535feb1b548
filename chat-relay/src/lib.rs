//! Text relay shared by raw TCP and WebSocket clients.
//!
//! Every line (TCP) or text message (WebSocket) a client sends is relabeled
//! as `user N > ...` and delivered to all connected clients. The work is
//! split between a few tasks that only talk through bounded channels:
//!
//! - [`listener`] accepts TCP sockets and WebSocket upgrades and reports them
//!   as new connections.
//! - [`server`] holds the [`server::Authority`], the sole owner of the client
//!   registry. It assigns ids, starts reader loops, and sequences shutdown.
//!   [`server::Server`] binds the listeners and wires everything together.
//! - [`reader`] runs one loop per client, turning frames into events and
//!   applying the per-client rate limit from [`rate_limit`].
//! - [`handler`] owns the fan-out set, writes to clients, and reports peers
//!   whose writes fail.
//! - [`connection`] hides the transport behind a reader and a write handle.
//! - [`event`] defines what crosses the channels.
//! - [`cli`] parses the command-line interface.

pub mod cli;
pub mod connection;
pub mod event;
pub mod handler;
pub mod listener;
pub mod rate_limit;
pub mod reader;
pub mod server;
