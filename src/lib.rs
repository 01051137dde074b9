//! multiconn: a multi-client TCP server framework
//!
//! Clients exchange delimiter-framed text messages (`<<EOF>>` terminated)
//! with a server that dispatches them to an application handler. The
//! handler may reply to the sending connection or broadcast to all.
//!
//! Components:
//! - `framing`: delimiter codec and text encodings
//! - `connection`: one socket, its receive loop and lifecycle
//! - `registry`: the set of open connections, with broadcast
//! - `server`: the listener and accept loop with admission control
//! - `events`: notification traits relayed from connections to the application
//!
//! Logging goes through `tracing`; install a subscriber to see it.

pub mod connection;
pub mod events;
pub mod framing;
pub mod registry;
pub mod server;

pub use connection::{ConnState, Connection, ConnectionError, ConnectionId, ConnectionOptions};
pub use events::{ConnectionEvent, ConnectionEvents, ServerEvent, ServerHandler};
pub use framing::{Encoding, DELIMITER};
pub use registry::Registry;
pub use server::{ConnectionFactory, ListenState, Server, ServerError, ServerOptions};
