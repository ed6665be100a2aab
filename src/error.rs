//! Error types for meshchat
//!
//! Errors are grouped by the subsystem that produces them. The crate-level
//! [`Error`] wraps each group so callers can use a single `Result` alias
//! while still matching on the precise failure.

use thiserror::Error;

/// Errors produced while resolving a `host[:port]` string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The input is not an IPv4 dotted-quad (or `localhost`), or the
    /// `host:port` shape itself is broken.
    ///
    /// A non-numeric port suffix lands here rather than in
    /// [`AddressError::PortOutOfRange`]: the whole `host:port` token is
    /// considered malformed when its suffix does not parse as an integer.
    #[error("invalid address: {input:?} (expected x.x.x.x or x.x.x.x:port)")]
    InvalidAddress {
        /// The offending input, as given
        input: String,
    },

    /// The port parsed as an integer but lies outside 0-65535
    #[error("port {port} out of range (0-65535)")]
    PortOutOfRange {
        /// The out-of-range value
        port: i64,
    },
}

/// Errors produced while constructing an [`Envelope`](crate::Envelope)
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// The input was not a key/value record (e.g. an array or a bare number)
    #[error("message is not a key/value record")]
    NotARecord,

    /// The wire text did not deserialize at all
    #[error("malformed message: {reason}")]
    Malformed {
        /// What the deserializer reported
        reason: String,
    },
}

/// Errors produced by the networking layer
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Binding the listening socket failed; peer startup aborts
    #[error("failed to bind {address}: {reason}")]
    BindFailed {
        /// The local endpoint we tried to bind
        address: String,
        /// What the OS reported
        reason: String,
    },

    /// An outbound dial failed
    #[error("failed to connect to {address}: {reason}")]
    ConnectionFailed {
        /// The remote endpoint we tried to reach
        address: String,
        /// What the OS reported
        reason: String,
    },

    /// Writing a frame to an open channel failed
    #[error("failed to send to {address}: {reason}")]
    SendFailed {
        /// The remote endpoint of the channel
        address: String,
        /// What went wrong
        reason: String,
    },

    /// An operation named an endpoint with no registered channel
    #[error("no open connection to {address}")]
    NotConnected {
        /// The unknown endpoint
        address: String,
    },

    /// A lifecycle operation was called in the wrong state
    #[error("cannot {operation} while peer is {state}")]
    InvalidState {
        /// The operation that was attempted
        operation: String,
        /// The state the peer was in
        state: String,
    },
}

/// Top-level error type for meshchat operations
#[derive(Error, Debug)]
pub enum Error {
    /// Address resolution errors
    #[error(transparent)]
    Address(#[from] AddressError),

    /// Message codec errors
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Networking errors
    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
