//! TCP listener accepting framed connections.
//!
//! The accept loop runs as one task with a single accept outstanding. Each
//! accepted socket becomes a [`Connection`] through the configured
//! [`ConnectionFactory`], is admitted to the [`Registry`] if there is room,
//! and starts receiving. Admission happens after the TCP handshake: a client
//! over the limit is accepted and immediately closed.

use crate::connection::{Connection, ConnectionOptions};
use crate::events::ServerHandler;
use crate::registry::Registry;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Default maximum number of concurrent clients
pub const DEFAULT_MAX_CLIENTS: usize = 100;

/// Default length of the pending connection queue
pub const DEFAULT_BACKLOG: u32 = 100;

/// Server settings
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Connections beyond this count are closed right after accept
    pub max_clients: usize,
    /// Listen backlog used by [`Server::listen`]
    pub backlog: u32,
    /// Options for connections built by the default factory
    pub connection: ConnectionOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_clients: DEFAULT_MAX_CLIENTS,
            backlog: DEFAULT_BACKLOG,
            connection: ConnectionOptions::default(),
        }
    }
}

/// Listener lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    None,
    Listening,
    /// Terminal; a stopped server cannot listen again.
    Stopped,
}

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("no IPv4 address found for '{0}'")]
    InvalidAddress(String),
    #[error("failed to listen: {0}")]
    Io(#[from] io::Error),
}

/// Builds a [`Connection`] for each accepted socket.
pub trait ConnectionFactory: Send + Sync + 'static {
    fn create(&self, stream: TcpStream) -> Arc<Connection>;
}

/// Factory producing plain connections with fixed options.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFactory {
    pub options: ConnectionOptions,
}

impl ConnectionFactory for DefaultFactory {
    fn create(&self, stream: TcpStream) -> Arc<Connection> {
        Connection::new(stream, self.options)
    }
}

struct ListenerState {
    state: ListenState,
    local_addr: Option<SocketAddr>,
    /// Dropping this stops the accept loop.
    stop: Option<oneshot::Sender<()>>,
}

struct Shared {
    max_clients: usize,
    backlog: u32,
    registry: Arc<Registry>,
    factory: Arc<dyn ConnectionFactory>,
    listener: Mutex<ListenerState>,
}

/// Multi-client TCP server instance
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Create a server relaying client events to `handler`.
    pub fn new(options: ServerOptions, handler: Arc<dyn ServerHandler>) -> Self {
        let factory = Arc::new(DefaultFactory {
            options: options.connection,
        });
        Self::with_factory(options, handler, factory)
    }

    /// Create a server building connections with `factory`.
    pub fn with_factory(
        options: ServerOptions,
        handler: Arc<dyn ServerHandler>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Server {
            shared: Arc::new(Shared {
                max_clients: options.max_clients,
                backlog: options.backlog,
                registry: Registry::new(handler),
                factory,
                listener: Mutex::new(ListenerState {
                    state: ListenState::None,
                    local_addr: None,
                    stop: None,
                }),
            }),
        }
    }

    /// Bind and start accepting with the configured backlog.
    ///
    /// Returns the bound address, so port `0` can be used.
    pub fn listen(&self, host: &str, port: u16) -> Result<SocketAddr, ServerError> {
        self.listen_with_backlog(host, port, self.shared.backlog)
    }

    /// Bind and start accepting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen_with_backlog(&self, host: &str, port: u16, backlog: u32) -> Result<SocketAddr, ServerError> {
        let addr = resolve(host, port)?;

        let mut listener_state = self.shared.lock();
        match listener_state.state {
            ListenState::Listening => return Err(ServerError::InvalidOperation("already listening")),
            ListenState::Stopped => return Err(ServerError::InvalidOperation("server has been stopped")),
            ListenState::None => {}
        }

        let listener = TcpListener::from_std(create_listener(addr, backlog)?)?;
        let local_addr = listener.local_addr()?;
        let (stop_tx, stop_rx) = oneshot::channel();

        listener_state.state = ListenState::Listening;
        listener_state.local_addr = Some(local_addr);
        listener_state.stop = Some(stop_tx);
        drop(listener_state);

        info!(
            address = %local_addr,
            backlog,
            max_clients = self.shared.max_clients,
            "Server listening"
        );

        tokio::spawn(accept_loop(Arc::clone(&self.shared), listener, stop_rx));
        Ok(local_addr)
    }

    /// Stop accepting. Idempotent; the server cannot listen again.
    pub fn stop_listen(&self) {
        self.shared.stop();
    }

    /// Stop accepting and close every registered connection.
    pub fn close(&self) {
        self.stop_listen();
        self.shared.registry.close_all();
    }

    pub fn state(&self) -> ListenState {
        self.shared.lock().state
    }

    /// Address bound by the last successful `listen`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.lock().local_addr
    }

    /// Registered connections; use it to broadcast.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_listening(&self) -> bool {
        self.lock().state == ListenState::Listening
    }

    fn stop(&self) {
        let mut listener_state = self.lock();
        if listener_state.state == ListenState::Stopped {
            return;
        }
        let was_listening = listener_state.state == ListenState::Listening;
        listener_state.state = ListenState::Stopped;
        listener_state.stop = None;
        drop(listener_state);

        if was_listening {
            info!("Server stopped listening");
        }
    }

    /// Turn an accepted socket into a registered, receiving connection.
    ///
    /// The listener state is checked again after registering: a `close`
    /// that drained the registry before this connection joined has already
    /// marked the listener stopped, so the late arrival is closed here.
    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let connection = self.factory.create(stream);
        if !self.is_listening() {
            debug!(peer = %peer, "Listener stopped, dropping accepted client");
            connection.close();
            return;
        }

        match self.registry.admit(&connection, self.max_clients) {
            Ok(true) if !self.is_listening() => {
                debug!(peer = %peer, "Listener stopped during admission, dropping client");
                self.registry.remove(&connection);
                connection.close();
            }
            Ok(true) => match connection.start_receive() {
                Ok(()) => debug!(id = %connection.id(), peer = %peer, "Client connected"),
                Err(e) => {
                    debug!(id = %connection.id(), error = %e, "Failed to start receiving");
                    connection.close();
                }
            },
            Ok(false) => {
                warn!(peer = %peer, max_clients = self.max_clients, "Client limit reached, rejecting");
                connection.close();
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Failed to register connection");
                connection.close();
            }
        }
    }
}

/// Accept connections until stopped or until accept fails.
async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, mut stop: oneshot::Receiver<()>) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = &mut stop => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => shared.admit(stream, peer),
            Err(e) => {
                error!(error = %e, "Failed to accept connection, stopping listener");
                shared.stop();
                break;
            }
        }
    }

    drop(listener);
    debug!("Accept loop finished");
}

/// Resolve `host` to an IPv4 socket address.
fn resolve(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    (host, port)
        .to_socket_addrs()?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| ServerError::InvalidAddress(host.to_string()))
}

fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}
