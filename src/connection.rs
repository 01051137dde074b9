//! Connection state machine for a single framed TCP connection.
//!
//! A connection exclusively owns its socket. Once receiving, two tasks serve
//! it:
//! - the receive task reads chunks, extracts frames and raises notifications
//! - the write task drains queued frames onto the socket in order
//!
//! All lifecycle state lives behind one per-connection mutex. `send` and
//! `close` never await, so they can be called from any thread, including
//! from inside a notification callback.

use crate::events::ConnectionEvents;
use crate::framing::{self, Encoding, FrameDecoder, FrameError};
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{self, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, debug_span, trace, warn, Instrument};

/// Bytes requested per read.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Default limit on encoded bytes queued but not yet written.
pub const DEFAULT_MAX_SEND_QUEUE: usize = 16 * 1024 * 1024;

/// How long queued frames may keep flushing after `close`.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Created, not yet receiving.
    New,
    /// Outbound connect in progress.
    Connecting,
    /// Established.
    Open,
    /// Releasing the socket.
    Closing,
    /// Terminal.
    Closed,
}

/// Per-connection settings.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Text encoding for sent and received messages.
    pub encoding: Encoding,
    /// Close the connection once this many unframed bytes are buffered.
    pub max_receive_buffer: Option<usize>,
    /// Close the connection when a send would queue more than this many
    /// unwritten bytes. An empty queue always accepts one frame.
    pub max_send_queue: Option<usize>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            encoding: Encoding::default(),
            max_receive_buffer: None,
            max_send_queue: Some(DEFAULT_MAX_SEND_QUEUE),
        }
    }
}

/// Connection errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The operation is not valid in the connection's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    /// Name resolution produced no address.
    #[error("no address found for host '{host}'")]
    Resolve { host: String },
    /// The peer is not draining sent frames fast enough.
    #[error("send queue holds {queued} bytes, limit is {limit}")]
    SendQueueFull { queued: usize, limit: usize },
    /// Resolution or connect failed.
    #[error("network failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Socket halves and queued frames, held until receiving starts.
struct Transport {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

struct Inner {
    state: ConnState,
    receiving: bool,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    transport: Option<Transport>,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    /// Dropping this stops the receive task.
    shutdown: Option<oneshot::Sender<()>>,
    /// Dropping this bounds how long the write task may keep flushing.
    write_stop: Option<oneshot::Sender<()>>,
    receive_buffer: Option<FrameDecoder>,
    events: Option<Arc<dyn ConnectionEvents>>,
}

impl Inner {
    fn attach(&mut self, stream: TcpStream) {
        self.local_addr = stream.local_addr().ok();
        self.peer_addr = stream.peer_addr().ok();

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        self.transport = Some(Transport {
            reader,
            writer,
            outbound: rx,
        });
        self.outbound = Some(tx);
    }

    fn is_closing(&self) -> bool {
        matches!(self.state, ConnState::Closing | ConnState::Closed)
    }
}

/// Outcome of feeding received bytes to the connection.
enum Ingest {
    Frames(Vec<String>),
    Overflow(FrameError),
    Closed,
}

/// A single framed TCP connection.
pub struct Connection {
    id: ConnectionId,
    options: ConnectionOptions,
    /// Encoded bytes queued for the write task.
    queued: Arc<AtomicUsize>,
    inner: Mutex<Inner>,
}

impl Connection {
    /// Wrap an accepted socket. The connection starts in [`ConnState::New`].
    pub fn new(stream: TcpStream, options: ConnectionOptions) -> Arc<Self> {
        let connection = Self::unconnected(options);
        connection.lock().attach(stream);
        connection
    }

    /// Create an outbound connection to be established with [`Connection::connect`].
    pub fn unconnected(options: ConnectionOptions) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            options,
            queued: Arc::new(AtomicUsize::new(0)),
            inner: Mutex::new(Inner {
                state: ConnState::New,
                receiving: false,
                local_addr: None,
                peer_addr: None,
                transport: None,
                outbound: None,
                shutdown: None,
                write_stop: None,
                receive_buffer: None,
                events: None,
            }),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_closing()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock().peer_addr
    }

    /// Set the subscriber for this connection's notifications.
    ///
    /// Must happen before [`Connection::start_receive`]; a closed connection
    /// rejects subscribers since it will never notify them.
    pub fn subscribe(&self, events: Arc<dyn ConnectionEvents>) -> Result<(), ConnectionError> {
        let mut inner = self.lock();
        if inner.is_closing() {
            return Err(ConnectionError::InvalidOperation("connection is closed"));
        }
        if inner.receiving {
            return Err(ConnectionError::InvalidOperation("connection is already receiving"));
        }
        inner.events = Some(events);
        Ok(())
    }

    /// Resolve `host`, connect, then start receiving.
    ///
    /// Only valid on a connection created with [`Connection::unconnected`]
    /// that has not connected yet.
    pub async fn connect(self: &Arc<Self>, host: &str, port: u16) -> Result<(), ConnectionError> {
        {
            let mut inner = self.lock();
            match inner.state {
                ConnState::New if inner.outbound.is_none() => inner.state = ConnState::Connecting,
                ConnState::New | ConnState::Open => {
                    return Err(ConnectionError::InvalidOperation("connection is already connected"))
                }
                ConnState::Connecting => {
                    return Err(ConnectionError::InvalidOperation("connect already in progress"))
                }
                ConnState::Closing | ConnState::Closed => {
                    return Err(ConnectionError::InvalidOperation("connection is closed"))
                }
            }
        }

        let stream = match establish(host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                let mut inner = self.lock();
                if inner.state == ConnState::Connecting {
                    inner.state = ConnState::New;
                }
                return Err(e);
            }
        };

        {
            let mut inner = self.lock();
            if inner.state != ConnState::Connecting {
                return Err(ConnectionError::InvalidOperation(
                    "connection was closed while connecting",
                ));
            }
            inner.attach(stream);
            inner.state = ConnState::Open;
            debug!(id = %self.id, peer = ?inner.peer_addr, "Connected");
        }

        self.start_receive()
    }

    /// Queue `payload` as one frame.
    ///
    /// Delimiter occurrences are stripped from the payload first. Frames from
    /// concurrent calls are queued whole under the connection lock and are
    /// never interleaved on the wire. A send that would overrun the send
    /// queue limit fails with [`ConnectionError::SendQueueFull`] and closes
    /// the connection.
    pub fn send(self: &Arc<Self>, payload: &str) -> Result<(), ConnectionError> {
        let result = self.enqueue(payload);
        if let Err(ConnectionError::SendQueueFull { queued, limit }) = result {
            warn!(id = %self.id, queued, limit, "Send queue limit exceeded, closing");
            self.close();
        }
        result
    }

    /// Queue a frame without closing on a full queue.
    pub(crate) fn enqueue(&self, payload: &str) -> Result<(), ConnectionError> {
        let frame = framing::encode_frame(payload, self.options.encoding);
        let len = frame.len();

        let inner = self.lock();
        if inner.is_closing() {
            return Err(ConnectionError::InvalidOperation("connection is closed"));
        }
        let outbound = inner
            .outbound
            .as_ref()
            .ok_or(ConnectionError::InvalidOperation("connection is not connected"))?;

        let queued = self.queued.load(Ordering::Acquire);
        if let Some(limit) = self.options.max_send_queue {
            if queued > 0 && queued + len > limit {
                return Err(ConnectionError::SendQueueFull { queued, limit });
            }
        }
        outbound
            .send(frame)
            .map_err(|_| ConnectionError::InvalidOperation("connection is closed"))?;
        self.queued.fetch_add(len, Ordering::AcqRel);

        trace!(id = %self.id, bytes = len, queued = queued + len, "Queued frame");
        Ok(())
    }

    /// Start the receive and write tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_receive(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let (transport, shutdown, write_stop, peer) = {
            let mut inner = self.lock();
            match inner.state {
                ConnState::Closing | ConnState::Closed => {
                    return Err(ConnectionError::InvalidOperation("connection is closed"))
                }
                ConnState::Connecting => {
                    return Err(ConnectionError::InvalidOperation("connect still in progress"))
                }
                ConnState::New | ConnState::Open => {}
            }
            if inner.receiving {
                return Err(ConnectionError::InvalidOperation("connection is already receiving"));
            }
            let transport = inner
                .transport
                .take()
                .ok_or(ConnectionError::InvalidOperation("connection is not connected"))?;

            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let (write_stop_tx, write_stop_rx) = oneshot::channel();
            inner.shutdown = Some(shutdown_tx);
            inner.write_stop = Some(write_stop_tx);
            inner.receive_buffer = Some(FrameDecoder::new(self.options.max_receive_buffer));
            inner.receiving = true;
            inner.state = ConnState::Open;
            (transport, shutdown_rx, write_stop_rx, inner.peer_addr)
        };

        let Transport {
            reader,
            writer,
            outbound,
        } = transport;
        let span = debug_span!("connection", id = %self.id, peer = ?peer);

        let weak = Arc::downgrade(self);
        let queued = Arc::clone(&self.queued);
        tokio::spawn(
            async move {
                if let Err(e) = write_frames(writer, outbound, &queued, write_stop).await {
                    debug!(error = %e, "Write failed");
                    if let Some(connection) = weak.upgrade() {
                        connection.close();
                    }
                }
            }
            .instrument(span.clone()),
        );

        tokio::spawn(
            Arc::clone(self)
                .receive_loop(reader, shutdown)
                .instrument(span),
        );

        Ok(())
    }

    /// Close the connection.
    ///
    /// Idempotent. Releases the socket once. Frames already queued get up to
    /// [`CLOSE_FLUSH_TIMEOUT`] to reach the peer before the write side is
    /// dropped, so a peer that stopped reading cannot hold the socket open.
    /// The closed notification is raised once, by the receive task if one is
    /// running, otherwise here.
    pub fn close(self: &Arc<Self>) {
        let (transport, outbound, shutdown, write_stop, notify_now) = {
            let mut inner = self.lock();
            if inner.is_closing() {
                return;
            }
            inner.state = ConnState::Closing;
            inner.receive_buffer = None;
            (
                inner.transport.take(),
                inner.outbound.take(),
                inner.shutdown.take(),
                inner.write_stop.take(),
                !inner.receiving,
            )
        };

        drop(transport);
        drop(outbound);
        drop(write_stop);
        self.lock().state = ConnState::Closed;
        debug!(id = %self.id, "Connection closed");

        // Signal the receive task only once the state reads Closed.
        drop(shutdown);
        if notify_now {
            self.raise_closed();
        }
    }

    async fn receive_loop(self: Arc<Self>, mut reader: OwnedReadHalf, mut shutdown: oneshot::Receiver<()>) {
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        'receive: loop {
            let read = tokio::select! {
                _ = &mut shutdown => break 'receive,
                read = reader.read(&mut chunk) => read,
            };

            let n = match read {
                Ok(0) => {
                    debug!("Peer closed connection");
                    self.close();
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Read failed");
                    self.close();
                    break;
                }
            };

            match self.ingest(&chunk[..n]) {
                Ingest::Frames(frames) => {
                    for text in frames {
                        if !self.raise_message(text) {
                            break 'receive;
                        }
                    }
                }
                Ingest::Overflow(e) => {
                    warn!(error = %e, "Receive buffer limit exceeded, closing");
                    self.close();
                    break;
                }
                Ingest::Closed => break,
            }
        }

        drop(reader);
        self.raise_closed();
    }

    fn ingest(&self, data: &[u8]) -> Ingest {
        let mut inner = self.lock();
        if inner.state != ConnState::Open {
            return Ingest::Closed;
        }
        let Some(buffer) = inner.receive_buffer.as_mut() else {
            return Ingest::Closed;
        };
        if let Err(e) = buffer.push(data) {
            return Ingest::Overflow(e);
        }

        let mut frames = Vec::new();
        while let Some(frame) = buffer.next_frame() {
            frames.push(self.options.encoding.decode(&frame));
        }
        Ingest::Frames(frames)
    }

    /// Deliver one message unless the connection has closed meanwhile.
    fn raise_message(self: &Arc<Self>, text: String) -> bool {
        let events = {
            let inner = self.lock();
            if inner.state != ConnState::Open {
                return false;
            }
            inner.events.clone()
        };

        trace!(len = text.len(), "Message received");
        if let Some(events) = events {
            events.on_message(self, text);
        }
        true
    }

    fn raise_closed(self: &Arc<Self>) {
        let events = self.lock().events.take();
        if let Some(events) = events {
            events.on_closed(self);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("peer_addr", &inner.peer_addr)
            .finish()
    }
}

/// Resolve `host` (preferring IPv4) and connect.
async fn establish(host: &str, port: u16) -> Result<TcpStream, ConnectionError> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    let addr = addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ConnectionError::Resolve {
            host: host.to_string(),
        })?;

    Ok(TcpStream::connect(addr).await?)
}

/// Write queued frames until the queue closes, then shut down the write side.
///
/// Once `stop` fires, whatever is left must flush within
/// [`CLOSE_FLUSH_TIMEOUT`] or the writer is dropped unflushed.
async fn write_frames<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    queued: &AtomicUsize,
    mut stop: oneshot::Receiver<()>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let flush = async {
        while let Some(frame) = outbound.recv().await {
            writer.write_all(&frame).await?;
            queued.fetch_sub(frame.len(), Ordering::AcqRel);
        }
        writer.shutdown().await
    };
    tokio::pin!(flush);

    let finished = tokio::select! {
        result = &mut flush => Some(result),
        _ = &mut stop => None,
    };
    match finished {
        Some(result) => result,
        None => match timeout(CLOSE_FLUSH_TIMEOUT, &mut flush).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "peer did not drain queued frames after close",
            )),
        },
    }
}
