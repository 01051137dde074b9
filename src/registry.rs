//! Registry of active connections.
//!
//! Membership is an insertion-ordered list guarded by a single mutex. The
//! accept loop adds, connection close notifications remove, and application
//! threads broadcast, all under that one lock.

use crate::connection::{Connection, ConnectionError};
use crate::events::{ConnectionEvents, ServerHandler};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, trace, warn};

/// The set of open connections held by a server.
pub struct Registry {
    members: Mutex<Vec<Arc<Connection>>>,
    handler: Arc<dyn ServerHandler>,
    me: Weak<Registry>,
}

impl Registry {
    /// Create a registry relaying connection notifications to `handler`.
    pub fn new(handler: Arc<dyn ServerHandler>) -> Arc<Self> {
        Arc::new_cyclic(|me| Registry {
            members: Mutex::new(Vec::new()),
            handler,
            me: me.clone(),
        })
    }

    /// Add a connection and subscribe to its notifications.
    ///
    /// Fails if the connection is already registered, closed, or receiving
    /// (a receiving connection can no longer be subscribed to).
    pub fn add(&self, connection: &Arc<Connection>) -> Result<(), ConnectionError> {
        self.admit(connection, usize::MAX).map(|_| ())
    }

    /// Add a connection unless `limit` open members are already registered.
    ///
    /// Members that closed but have not been removed yet do not count.
    /// Returns `Ok(false)` when at capacity.
    pub(crate) fn admit(&self, connection: &Arc<Connection>, limit: usize) -> Result<bool, ConnectionError> {
        let mut members = self.lock();
        if members.iter().filter(|m| !m.is_closed()).count() >= limit {
            return Ok(false);
        }
        if members.iter().any(|m| Arc::ptr_eq(m, connection)) {
            return Err(ConnectionError::InvalidOperation("connection is already registered"));
        }

        connection.subscribe(Arc::new(Relay {
            registry: self.me.clone(),
        }))?;
        members.push(Arc::clone(connection));
        trace!(id = %connection.id(), members = members.len(), "Registered connection");
        Ok(true)
    }

    /// Remove a connection. Returns whether it was a member.
    pub fn remove(&self, connection: &Arc<Connection>) -> bool {
        let mut members = self.lock();
        match members.iter().position(|m| Arc::ptr_eq(m, connection)) {
            Some(idx) => {
                members.remove(idx);
                trace!(id = %connection.id(), members = members.len(), "Unregistered connection");
                true
            }
            None => false,
        }
    }

    /// Send `payload` to every member.
    ///
    /// The lock is held for the whole iteration, so membership cannot change
    /// mid-broadcast. Members that closed but have not been removed yet are
    /// skipped. Members whose send queue is full are closed once the lock is
    /// released. Returns the number of members the frame was queued for.
    pub fn broadcast(&self, payload: &str) -> usize {
        let mut sent = 0;
        let mut overrun = Vec::new();
        {
            let members = self.lock();
            for connection in members.iter() {
                match connection.enqueue(payload) {
                    Ok(()) => sent += 1,
                    Err(ConnectionError::SendQueueFull { queued, limit }) => {
                        warn!(id = %connection.id(), queued, limit, "Send queue limit exceeded, closing");
                        overrun.push(Arc::clone(connection));
                    }
                    Err(e) => debug!(id = %connection.id(), error = %e, "Skipped broadcast"),
                }
            }
            trace!(sent, members = members.len(), "Broadcast");
        }

        for connection in &overrun {
            connection.close();
        }
        sent
    }

    /// Close every member.
    ///
    /// Membership is drained first and connections are closed outside the
    /// lock; each still raises its disconnect notification.
    pub fn close_all(&self) {
        let drained = std::mem::take(&mut *self.lock());
        for connection in &drained {
            connection.close();
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "Closed all connections");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, connection: &Arc<Connection>) -> bool {
        self.lock().iter().any(|m| Arc::ptr_eq(m, connection))
    }

    /// Current members, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Connection>>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forwards one connection's notifications to the registry's handler.
struct Relay {
    registry: Weak<Registry>,
}

impl ConnectionEvents for Relay {
    fn on_message(&self, connection: &Arc<Connection>, text: String) {
        if let Some(registry) = self.registry.upgrade() {
            registry.handler.on_message(&registry, connection, text);
        }
    }

    fn on_closed(&self, connection: &Arc<Connection>) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(connection);
            registry.handler.on_disconnected(&registry, connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::events::ServerEvent;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn accepted_pair() -> (TcpStream, Arc<Connection>) {
        accepted_pair_with(ConnectionOptions::default()).await
    }

    async fn accepted_pair_with(options: ConnectionOptions) -> (TcpStream, Arc<Connection>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let connection = Connection::new(accepted.unwrap().0, options);
        (client.unwrap(), connection)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let (tx, _rx) = mpsc::unbounded_channel::<ServerEvent>();
        let registry = Registry::new(Arc::new(tx));
        let (_client, connection) = accepted_pair().await;

        registry.add(&connection).unwrap();
        assert!(registry.contains(&connection));
        assert!(matches!(
            registry.add(&connection),
            Err(ConnectionError::InvalidOperation(_))
        ));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&connection));
        assert!(!registry.remove(&connection));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel::<ServerEvent>();
        let registry = Registry::new(Arc::new(tx));
        let (_client, connection) = accepted_pair().await;

        connection.close();
        assert!(registry.add(&connection).is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_admit_respects_limit() {
        let (tx, _rx) = mpsc::unbounded_channel::<ServerEvent>();
        let registry = Registry::new(Arc::new(tx));
        let (_c1, first) = accepted_pair().await;
        let (_c2, second) = accepted_pair().await;

        assert!(registry.admit(&first, 1).unwrap());
        assert!(!registry.admit(&second, 1).unwrap());
        assert_eq!(registry.snapshot().len(), 1);
        assert!(Arc::ptr_eq(&registry.snapshot()[0], &first));
    }

    #[tokio::test]
    async fn test_closed_member_frees_its_slot() {
        let (tx, _rx) = mpsc::unbounded_channel::<ServerEvent>();
        let registry = Registry::new(Arc::new(tx));
        let (_c1, first) = accepted_pair().await;
        let (_c2, second) = accepted_pair().await;

        assert!(registry.admit(&first, 1).unwrap());
        first.start_receive().unwrap();
        first.close();

        // The receive task has not run yet, so `first` is still a member.
        assert!(registry.contains(&first));
        assert!(registry.admit(&second, 1).unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_closes_overrun_member() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
        let registry = Registry::new(Arc::new(tx));
        let (_client, connection) = accepted_pair_with(ConnectionOptions {
            max_send_queue: Some(16),
            ..Default::default()
        })
        .await;
        registry.add(&connection).unwrap();
        connection.start_receive().unwrap();

        assert_eq!(registry.broadcast("first frame"), 1);
        assert_eq!(registry.broadcast("second frame"), 0);
        assert!(connection.is_closed());
        assert!(matches!(
            next_event(&mut rx).await,
            ServerEvent::ClientDisconnected { .. }
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_relays_disconnect() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
        let registry = Registry::new(Arc::new(tx));
        let (client, connection) = accepted_pair().await;

        registry.add(&connection).unwrap();
        connection.start_receive().unwrap();
        drop(client);

        match next_event(&mut rx).await {
            ServerEvent::ClientDisconnected { connection: closed } => {
                assert!(Arc::ptr_eq(&closed, &connection));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_and_close_all() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
        let registry = Registry::new(Arc::new(tx));

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (client, connection) = accepted_pair().await;
            registry.add(&connection).unwrap();
            connection.start_receive().unwrap();
            clients.push(client);
        }

        assert_eq!(registry.broadcast("ping<<EOF>>"), 3);
        registry.close_all();
        assert!(registry.is_empty());

        for client in &mut clients {
            let mut out = Vec::new();
            timeout(Duration::from_secs(2), client.read_to_end(&mut out))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(out, b"ping<<EOF>>");
        }

        for _ in 0..3 {
            assert!(matches!(
                next_event(&mut rx).await,
                ServerEvent::ClientDisconnected { .. }
            ));
        }
    }
}
