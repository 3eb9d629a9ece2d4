use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use url::{Host, Url};

use crate::TransportError;

/// Address family of an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// TCP over IPv4/IPv6 (`tcp://host:port`).
    Tcp,
    /// Same-host Unix-domain socket (`file:///path/to/socket`).
    File,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Tcp => write!(f, "tcp"),
            Family::File => write!(f, "file"),
        }
    }
}

/// A connectable endpoint for one rank.
///
/// Parsed from and displayed as a URI: `tcp://127.0.0.1:25252`,
/// `tcp://[::1]:25252`, `file:///tmp/cohort/rank-0.sock`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Tcp { host: String, port: u16 },
    File(PathBuf),
}

impl Address {
    /// TCP address from host and port.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Address::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Unix-domain socket address. The path must be absolute.
    pub fn file(path: impl Into<PathBuf>) -> Result<Self, TransportError> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(TransportError::InvalidAddress {
                address: path.display().to_string(),
                reason: "socket path must be absolute".into(),
            });
        }
        Ok(Address::File(path))
    }

    pub fn family(&self) -> Family {
        match self {
            Address::Tcp { .. } => Family::Tcp,
            Address::File(_) => Family::File,
        }
    }

    /// An address of the same family and host that the OS (TCP) or a
    /// fresh unique file name (Unix socket) will make distinct.
    ///
    /// Used when a rank needs its own listener next to a known address.
    pub fn ephemeral_sibling(&self) -> Address {
        match self {
            Address::Tcp { host, .. } => Address::tcp(host.clone(), 0),
            Address::File(path) => {
                let dir = path.parent().unwrap_or_else(|| Path::new("/"));
                Address::File(dir.join(unique_socket_name()))
            }
        }
    }

    /// Fresh Unix-socket address in the system temporary directory.
    pub fn temporary_file() -> Address {
        Address::File(std::env::temp_dir().join(unique_socket_name()))
    }

    /// Read an address from an environment variable, if set.
    pub fn from_env(var: &str) -> Result<Option<Address>, TransportError> {
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => value.trim().parse().map(Some),
            _ => Ok(None),
        }
    }

    /// Parse a comma-separated address list.
    pub fn parse_list(list: &str) -> Result<Vec<Address>, TransportError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

fn unique_socket_name() -> String {
    format!("cohort-{}.sock", uuid::Uuid::new_v4().simple())
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{host}]:{port}")
            }
            Address::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Address::File(path) => match Url::from_file_path(path) {
                Ok(url) => write!(f, "{url}"),
                Err(()) => write!(f, "file://{}", path.display()),
            },
        }
    }
}

impl FromStr for Address {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TransportError::InvalidAddress {
            address: s.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(s).map_err(|e| invalid(&e.to_string()))?;
        match url.scheme() {
            "tcp" => {
                let host = match url.host() {
                    Some(Host::Domain(d)) => d.to_string(),
                    Some(Host::Ipv4(ip)) => ip.to_string(),
                    Some(Host::Ipv6(ip)) => ip.to_string(),
                    None => return Err(invalid("missing host")),
                };
                let port = url.port().ok_or_else(|| invalid("missing port"))?;
                Ok(Address::Tcp { host, port })
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|()| invalid("not an absolute local path"))?;
                Ok(Address::File(path))
            }
            other => Err(invalid(&format!("unsupported scheme {other:?}"))),
        }
    }
}

impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_tcp() {
        let addr: Address = "tcp://127.0.0.1:25252".parse().unwrap();
        assert_eq!(addr, Address::tcp("127.0.0.1", 25252));
        assert_eq!(addr.family(), Family::Tcp);
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:25252");
    }

    #[test]
    fn parse_tcp_ipv6_strips_brackets() {
        let addr: Address = "tcp://[::1]:4000".parse().unwrap();
        assert_eq!(addr, Address::tcp("::1", 4000));
        assert_eq!(addr.to_string(), "tcp://[::1]:4000");
    }

    #[test]
    fn parse_hostname() {
        let addr: Address = "tcp://player-3.local:80".parse().unwrap();
        assert_eq!(addr, Address::tcp("player-3.local", 80));
    }

    #[test]
    fn parse_file() {
        let addr: Address = "file:///tmp/cohort/rank-0.sock".parse().unwrap();
        assert_eq!(addr, Address::File(PathBuf::from("/tmp/cohort/rank-0.sock")));
        assert_eq!(addr.family(), Family::File);
        assert_eq!(addr.to_string(), "file:///tmp/cohort/rank-0.sock");
    }

    #[test]
    fn reject_missing_port_and_unknown_scheme() {
        assert!("tcp://127.0.0.1".parse::<Address>().is_err());
        assert!("udp://127.0.0.1:9".parse::<Address>().is_err());
        assert!("127.0.0.1:9".parse::<Address>().is_err());
    }

    #[test]
    fn relative_file_paths_are_rejected() {
        assert!(Address::file("relative.sock").is_err());
    }

    #[test]
    fn ephemeral_sibling_keeps_host_and_directory() {
        let tcp = Address::tcp("10.0.0.7", 9999).ephemeral_sibling();
        assert_eq!(tcp, Address::tcp("10.0.0.7", 0));

        let file = Address::File(PathBuf::from("/run/cohort/root.sock"));
        let (a, b) = (file.ephemeral_sibling(), file.ephemeral_sibling());
        assert_ne!(a, b);
        let Address::File(path) = a else {
            panic!("expected file address")
        };
        assert_eq!(path.parent(), Some(Path::new("/run/cohort")));
    }

    #[test]
    fn parse_list_skips_blanks() {
        let list = Address::parse_list("tcp://127.0.0.1:1, tcp://127.0.0.1:2,,").unwrap();
        assert_eq!(
            list,
            vec![Address::tcp("127.0.0.1", 1), Address::tcp("127.0.0.1", 2)]
        );
    }

    proptest! {
        #[test]
        fn tcp_display_parses_back(a in any::<u8>(), b in any::<u8>(), port in 1..u16::MAX) {
            let addr = Address::tcp(format!("10.{a}.{b}.1"), port);
            let parsed: Address = addr.to_string().parse().unwrap();
            prop_assert_eq!(parsed, addr);
        }
    }
}
