//! Common test helpers and utilities
//!
//! Shared fixtures for the mesh integration tests: peers on ephemeral
//! ports, and bounded polling for conditions that converge over time.

use meshchat::{Endpoint, Envelope, Peer, PeerBuilder};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Build and start a peer on an ephemeral port with the given bootstrap peers
pub async fn start_peer(username: &str, bootstrap: &[Endpoint]) -> Peer {
    let mut builder = PeerBuilder::new().with_username(username);
    for peer in bootstrap {
        builder = builder.add_peer(peer.to_string());
    }
    let peer = builder.build().unwrap();
    peer.start().await.unwrap();
    peer
}

/// Record every envelope a peer observes
///
/// Returns the shared vector backing the registered observer.
pub fn record_messages(peer: &Peer) -> Arc<Mutex<Vec<Envelope>>> {
    let seen: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    peer.add_observer(Arc::new(move |envelope: &Envelope| {
        sink.lock().unwrap().push(envelope.clone());
    }));
    seen
}

/// Poll `condition` until it holds or a 5 second deadline passes
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
