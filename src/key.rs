use std::{fmt, net::SocketAddr};

/// Identity of a remote endpoint: a `(network, address)` pair.
///
/// Keys compare structurally and are never resolved, so two addresses
/// that resolve to the same socket endpoint still select distinct
/// buckets.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    network: String,
    address: String,
}

impl Key {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.address)
    }
}

/// A remote socket address keys its connection under the `tcp` network.
impl From<SocketAddr> for Key {
    fn from(addr: SocketAddr) -> Self {
        Self::new("tcp", addr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_equality() {
        assert_eq!(Key::new("tcp", "1.2.3.4:80"), Key::new("tcp", "1.2.3.4:80"));
        assert_ne!(Key::new("tcp", "1.2.3.4:80"), Key::new("udp", "1.2.3.4:80"));
        assert_ne!(
            Key::new("tcp", "1.2.3.4:80"),
            Key::new("tcp", "host.example:80")
        );
    }

    #[test]
    fn test_from_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let key = Key::from(addr);
        assert_eq!(key.network(), "tcp");
        assert_eq!(key.address(), "127.0.0.1:8080");
    }
}
