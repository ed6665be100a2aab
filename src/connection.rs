//! Open channels and the shared connection table
//!
//! A [`Connection`] owns the write half of a dialed TCP stream; the read
//! half lives in the receive task spawned alongside it. The
//! [`ConnectionTable`] is the one piece of state mutated from multiple
//! tasks: receive loops, the accept loop, and API callers all add and
//! remove entries concurrently.

use crate::endpoint::Endpoint;
use crate::error::NetworkError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// An open outbound channel to a remote peer's listen endpoint
///
/// Closing is idempotent: the local `close()` path and a remote-initiated
/// disconnect may race to close the same channel, and the loser must be a
/// no-op rather than a crash.
pub struct Connection {
    /// The remote listen endpoint this channel is keyed under
    endpoint: Endpoint,
    /// Write half of the stream; the read half belongs to the receive task
    writer: Mutex<OwnedWriteHalf>,
    /// Set exactly once, by whichever close path gets there first
    closed: AtomicBool,
}

impl Connection {
    /// Wrap the write half of a freshly-dialed stream
    pub fn new(endpoint: Endpoint, writer: OwnedWriteHalf) -> Self {
        Self {
            endpoint,
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    /// The remote listen endpoint this channel is keyed under
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Write `text` to the channel as one complete frame
    ///
    /// # Errors
    ///
    /// [`NetworkError::SendFailed`] when the channel is already closed or
    /// the write fails.
    pub async fn send_text(&self, text: &str) -> Result<(), NetworkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::SendFailed {
                address: self.endpoint.to_string(),
                reason: "connection is closed".to_string(),
            });
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(text.as_bytes())
            .await
            .map_err(|e| NetworkError::SendFailed {
                address: self.endpoint.to_string(),
                reason: e.to_string(),
            })?;
        writer.flush().await.map_err(|e| NetworkError::SendFailed {
            address: self.endpoint.to_string(),
            reason: e.to_string(),
        })?;

        Ok(())
    }

    /// Shut the write half down; a second call is a no-op
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await; // ignore errors during shutdown
    }

    /// Whether this channel has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Shared mapping from remote listen endpoint to its open channel
///
/// Invariant: an entry exists for endpoint E iff there is a live dialed
/// channel to E. Entries are added only after a successful dial and
/// removed on explicit disconnect, a received close announcement, local
/// shutdown, or the owning receive task observing end-of-stream.
#[derive(Default)]
pub struct ConnectionTable {
    connections: DashMap<Endpoint, Arc<Connection>>,
}

impl ConnectionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a channel under its endpoint
    pub fn insert(&self, connection: Arc<Connection>) {
        self.connections.insert(connection.endpoint(), connection);
    }

    /// Look up the channel for an endpoint
    pub fn get(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        self.connections.get(endpoint).map(|entry| entry.clone())
    }

    /// Remove and return the channel for an endpoint
    ///
    /// Removing an absent endpoint returns `None`; callers that must not
    /// mask a failed disconnect turn that into an error themselves.
    pub fn remove(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        self.connections.remove(endpoint).map(|(_, conn)| conn)
    }

    /// Whether an endpoint currently has an open channel
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.connections.contains_key(endpoint)
    }

    /// All currently-connected endpoints
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// A point-in-time snapshot of every open channel
    ///
    /// Iteration works on the snapshot, so a callback may remove entries
    /// without deadlocking against the table's own locking.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Run `f` over a snapshot of every open channel
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for connection in self.snapshot() {
            f(&connection);
        }
    }

    /// Number of open channels
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::{TcpListener, TcpStream};

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::LOCALHOST, port)
    }

    async fn connected_pair(port: u16) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialed = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let (_read, write) = dialed.into_split();
        (Arc::new(Connection::new(endpoint(port), write)), accepted)
    }

    #[tokio::test]
    async fn test_send_and_receive_text() {
        use tokio::io::AsyncReadExt;

        let (connection, mut accepted) = connected_pair(9001).await;
        connection.send_text("hello").await.unwrap();

        let mut buf = [0u8; 16];
        let n = accepted.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (connection, _accepted) = connected_pair(9001).await;

        connection.close().await;
        assert!(connection.is_closed());
        connection.close().await; // second close must not crash

        assert!(matches!(
            connection.send_text("late").await,
            Err(NetworkError::SendFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_table_insert_get_remove() {
        let table = ConnectionTable::new();
        assert!(table.is_empty());

        let (connection, _accepted) = connected_pair(9001).await;
        table.insert(connection.clone());

        assert_eq!(table.len(), 1);
        assert!(table.contains(&endpoint(9001)));
        assert!(table.get(&endpoint(9001)).is_some());
        assert!(table.get(&endpoint(9002)).is_none());

        let removed = table.remove(&endpoint(9001)).unwrap();
        assert_eq!(removed.endpoint(), endpoint(9001));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_remove_absent_is_none() {
        let table = ConnectionTable::new();
        assert!(table.remove(&endpoint(9001)).is_none());
    }

    #[tokio::test]
    async fn test_for_each_callback_may_mutate_table() {
        let table = ConnectionTable::new();
        let mut accepted = Vec::new();
        for port in [9001, 9002, 9003] {
            let (connection, socket) = connected_pair(port).await;
            table.insert(connection);
            accepted.push(socket);
        }

        // Removing from within the callback must not deadlock
        let mut seen = 0;
        table.for_each(|connection| {
            seen += 1;
            table.remove(&connection.endpoint());
        });

        assert_eq!(seen, 3);
        assert!(table.is_empty());
    }
}
