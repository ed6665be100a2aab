//! # meshchat
//!
//! A peer-to-peer TCP overlay for decentralized group chat. Every peer
//! listens for inbound connections and maintains outbound channels to the
//! peers it knows, exchanging JSON envelopes and flooding new-peer
//! announcements so the mesh converges without a central directory.
//!
//! ## Quick Start
//!
//! ```no_run
//! use meshchat::{Envelope, PeerBuilder};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> meshchat::Result<()> {
//!     let peer = PeerBuilder::new()
//!         .with_listen_port(9001)
//!         .add_peer("127.0.0.1:9002")
//!         .with_username("alice")
//!         .build()?;
//!
//!     peer.add_observer(Arc::new(|envelope: &Envelope| {
//!         if let Some(text) = envelope.kind() {
//!             println!("<{}>: {}", envelope.username().unwrap_or("?"), text);
//!         }
//!     }));
//!
//!     peer.start().await?;
//!     peer.send_to_everyone(Envelope::chat("alice", "hello").wire()).await?;
//!     peer.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod connection;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod events;
pub mod logging;
pub mod peer;

// Re-export main types
pub use connection::{Connection, ConnectionTable};
pub use endpoint::{resolve, Endpoint};
pub use envelope::{
    Envelope, CLOSED_CONNECTION_REQUEST, NEW_CONNECTION_REQUEST, RECV_BUFFER_SIZE, SYSTEM_USERNAME,
};
pub use error::{AddressError, EnvelopeError, Error, NetworkError, Result};
pub use events::{Observer, ObserverBus, SubscriptionHandle};
pub use peer::{Peer, PeerBuilder, PeerConfig, PeerState, DEFAULT_LISTEN_ADDR};
