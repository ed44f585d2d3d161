//! Multi-user chat relay over TCP with NUL-delimited frames.
//!
//! A client's first frame is the name it wants; every later frame is a chat
//! line the server relays to all registered users as `name:text`. Sessions
//! that stay silent past the idle timeout are evicted. Clients reconnect
//! on their own and re-send their name each time.
//!
//! - [`cli`] parses the `server`, `client` and `stress` subcommands.
//! - [`server`] accepts connections and runs the event loop around the
//!   [`registry`], which owns every [`session`] and the set of names.
//! - [`client`] keeps one connection alive and forwards local input.
//! - [`transport`] runs the per-connection reader and writer tasks; writes go
//!   through a [`write_queue`] of pooled handles and shared [`message`]
//!   buffers, framed by [`frame`].
//! - [`stress`] drives many clients at once against a running server.
//!
//! Both the server and the client keep their state on a single task and
//! learn about I/O and [`timer`]s through completion events.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
pub mod stress;
pub mod timer;
pub mod transport;
pub mod write_queue;

pub use error::{Error, Result};
