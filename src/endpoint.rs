//! Endpoint resolution and validation
//!
//! An [`Endpoint`] is the (IPv4 address, port) pair that identifies one side
//! of a connection, and the key under which open channels are stored.
//! [`resolve`] turns a configured `host[:port]` string into a canonical
//! endpoint, rejecting anything that is not an IPv4 literal.

use crate::error::AddressError;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// An (IPv4 address, port) pair identifying one side of a connection
///
/// Two endpoints are equal iff address and port match exactly; hostname
/// aliases are canonicalized by [`resolve`] before an `Endpoint` ever
/// exists, so `localhost:9001` and `127.0.0.1:9001` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    ip: Ipv4Addr,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from an already-validated address and port
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The IPv4 address
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// The port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Convert to a `SocketAddr` for use with the socket APIs
    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_socket_addr()
    }
}

/// Parse and validate a `host[:port]` string into a canonical [`Endpoint`]
///
/// The host must be an IPv4 dotted-quad or the literal `localhost`, which
/// canonicalizes to `127.0.0.1`. The port comes from the `:port` suffix if
/// present, else from `fallback_port`, else defaults to 0. A suffix present
/// in `text` wins over `fallback_port`.
///
/// # Errors
///
/// - [`AddressError::InvalidAddress`] for anything that is not IPv4 (IPv6
///   literals, hostnames, malformed tokens), for more than one `:`, and for
///   a port suffix that does not parse as an integer.
/// - [`AddressError::PortOutOfRange`] when the port parses but falls
///   outside 0-65535.
///
/// # Example
///
/// ```
/// use meshchat::endpoint::resolve;
///
/// let endpoint = resolve("localhost:8080", None).unwrap();
/// assert_eq!(endpoint.to_string(), "127.0.0.1:8080");
/// ```
pub fn resolve(text: &str, fallback_port: Option<u16>) -> Result<Endpoint, AddressError> {
    let text = text.trim();

    let invalid = || AddressError::InvalidAddress {
        input: text.to_string(),
    };

    if text.matches(':').count() > 1 {
        return Err(invalid());
    }

    let (host, suffix_port) = match text.split_once(':') {
        Some((host, suffix)) => {
            // A suffix that is not an integer makes the whole token
            // malformed; this is not classified as a port error.
            let port: i64 = suffix.parse().map_err(|_| invalid())?;
            (host, Some(port))
        },
        None => (text, None),
    };

    let port = suffix_port
        .or_else(|| fallback_port.map(i64::from))
        .unwrap_or(0);
    if !(0..=65535).contains(&port) {
        return Err(AddressError::PortOutOfRange { port });
    }

    let ip = if host == "localhost" {
        Ipv4Addr::LOCALHOST
    } else {
        host.parse::<Ipv4Addr>().map_err(|_| invalid())?
    };

    Ok(Endpoint::new(ip, port as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_address_with_port() {
        for (text, ip, port) in [
            ("127.0.0.1:9001", Ipv4Addr::new(127, 0, 0, 1), 9001),
            ("0.0.0.0:0", Ipv4Addr::new(0, 0, 0, 0), 0),
            ("192.168.1.42:65535", Ipv4Addr::new(192, 168, 1, 42), 65535),
            ("10.0.0.1:1", Ipv4Addr::new(10, 0, 0, 1), 1),
        ] {
            let endpoint = resolve(text, None).unwrap();
            assert_eq!(endpoint.ip(), ip);
            assert_eq!(endpoint.port(), port);
        }
    }

    #[test]
    fn test_valid_address_without_port_defaults_to_zero() {
        let endpoint = resolve("10.1.2.3", None).unwrap();
        assert_eq!(endpoint.port(), 0);
    }

    #[test]
    fn test_fallback_port_used_when_no_suffix() {
        let endpoint = resolve("10.1.2.3", Some(4242)).unwrap();
        assert_eq!(endpoint.port(), 4242);
    }

    #[test]
    fn test_suffix_wins_over_fallback_port() {
        let endpoint = resolve("10.1.2.3:9000", Some(4242)).unwrap();
        assert_eq!(endpoint.port(), 9000);
    }

    #[test]
    fn test_localhost_canonicalizes() {
        let endpoint = resolve("localhost:8080", None).unwrap();
        assert_eq!(endpoint.ip(), Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(endpoint.port(), 8080);
    }

    #[test]
    fn test_port_out_of_range() {
        for text in ["1.2.3.4:65536", "1.2.3.4:100000", "1.2.3.4:-1"] {
            assert!(matches!(
                resolve(text, None),
                Err(AddressError::PortOutOfRange { .. })
            ));
        }
    }

    #[test]
    fn test_non_numeric_port_is_an_address_error() {
        assert!(matches!(
            resolve("1.2.3.4:http", None),
            Err(AddressError::InvalidAddress { .. })
        ));
        assert!(matches!(
            resolve("1.2.3.4:", None),
            Err(AddressError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_ipv6_rejected() {
        for text in ["::1", "fe80::1:9001", "[::1]:9001"] {
            assert!(matches!(
                resolve(text, None),
                Err(AddressError::InvalidAddress { .. })
            ));
        }
    }

    #[test]
    fn test_hostnames_and_garbage_rejected() {
        for text in ["example.com", "example.com:80", "10.0.0", "256.0.0.1", ""] {
            assert!(matches!(
                resolve(text, None),
                Err(AddressError::InvalidAddress { .. })
            ));
        }
    }

    #[test]
    fn test_whitespace_trimmed() {
        let endpoint = resolve("  127.0.0.1:9001  ", None).unwrap();
        assert_eq!(endpoint.to_string(), "127.0.0.1:9001");
    }

    #[test]
    fn test_display_and_socket_addr() {
        let endpoint = resolve("127.0.0.1:9001", None).unwrap();
        assert_eq!(endpoint.to_string(), "127.0.0.1:9001");
        assert_eq!(
            endpoint.to_socket_addr(),
            "127.0.0.1:9001".parse::<SocketAddr>().unwrap()
        );
    }
}
