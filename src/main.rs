//! multiconn-server: sample server for the multiconn framework
//!
//! Listens for clients exchanging `<<EOF>>`-framed text and answers every
//! message with the current local time, sent back to the sender only.
//! Runs until interrupted with Ctrl-C.
//!
//! Features:
//! - Configurable bind address, backlog and client limit
//! - Optional receive buffer limit per connection
//! - Configuration via CLI arguments or TOML file

mod config;

use config::Config;
use multiconn::{Connection, Registry, Server, ServerHandler};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Replies to each message with the time it was received.
struct ClockReply;

impl ServerHandler for ClockReply {
    fn on_message(&self, _clients: &Registry, connection: &Arc<Connection>, text: String) {
        info!(client = %connection.id(), message = %text, "Received message");

        let now = chrono::Local::now().format("%H:%M:%S").to_string();
        if let Err(e) = connection.send(&now) {
            debug!(client = %connection.id(), error = %e, "Failed to reply");
        }
    }

    fn on_disconnected(&self, clients: &Registry, connection: &Arc<Connection>) {
        info!(client = %connection.id(), remaining = clients.len(), "Client disconnected");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        max_clients = config.max_clients,
        max_receive_buffer = ?config.max_receive_buffer,
        max_send_queue = config.max_send_queue,
        encoding = ?config.encoding,
        "Starting multiconn server"
    );

    let server = Server::new(config.server_options(), Arc::new(ClockReply));
    server.listen(&config.host, config.port)?;

    tokio::signal::ctrl_c().await?;
    info!(clients = server.registry().len(), "Shutting down");
    server.close();

    Ok(())
}
