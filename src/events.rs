//! Notifications raised by connections and relayed by the server.
//!
//! A [`Connection`] reports to one [`ConnectionEvents`] subscriber. The
//! [`Registry`] subscribes to every connection it holds and relays to the
//! application's [`ServerHandler`], tagging each event with its connection.
//!
//! Both traits are also implemented for unbounded channel senders, for
//! applications that prefer to consume events from a receiver.

use crate::connection::Connection;
use crate::registry::Registry;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Subscriber for a single connection.
///
/// Callbacks run on the connection's receive task. For one connection they
/// never overlap, messages arrive in wire order, and `on_closed` is the last
/// call made.
pub trait ConnectionEvents: Send + Sync + 'static {
    /// A complete frame was received, delimiter stripped and decoded.
    fn on_message(&self, connection: &Arc<Connection>, text: String);

    /// The connection closed. Raised exactly once.
    fn on_closed(&self, connection: &Arc<Connection>);
}

/// Application handler for a server.
///
/// Called concurrently for different connections.
pub trait ServerHandler: Send + Sync + 'static {
    /// A client sent a message. `clients` can be used to broadcast.
    fn on_message(&self, clients: &Registry, connection: &Arc<Connection>, text: String);

    /// A client connection closed and has left the registry.
    fn on_disconnected(&self, _clients: &Registry, _connection: &Arc<Connection>) {}
}

/// Channel form of [`ConnectionEvents`].
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Message {
        connection: Arc<Connection>,
        text: String,
    },
    Closed {
        connection: Arc<Connection>,
    },
}

impl ConnectionEvents for mpsc::UnboundedSender<ConnectionEvent> {
    fn on_message(&self, connection: &Arc<Connection>, text: String) {
        let _ = self.send(ConnectionEvent::Message {
            connection: Arc::clone(connection),
            text,
        });
    }

    fn on_closed(&self, connection: &Arc<Connection>) {
        let _ = self.send(ConnectionEvent::Closed {
            connection: Arc::clone(connection),
        });
    }
}

/// Channel form of [`ServerHandler`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    MessageReceived {
        connection: Arc<Connection>,
        text: String,
    },
    ClientDisconnected {
        connection: Arc<Connection>,
    },
}

impl ServerHandler for mpsc::UnboundedSender<ServerEvent> {
    fn on_message(&self, _clients: &Registry, connection: &Arc<Connection>, text: String) {
        let _ = self.send(ServerEvent::MessageReceived {
            connection: Arc::clone(connection),
            text,
        });
    }

    fn on_disconnected(&self, _clients: &Registry, connection: &Arc<Connection>) {
        let _ = self.send(ServerEvent::ClientDisconnected {
            connection: Arc::clone(connection),
        });
    }
}
