//! Nameserver discovery from the system configuration.
//!
//! When the caller has no nameservers of its own, the glibc-style
//! `/etc/resolv.conf` is the place to find some.  Only `nameserver`
//! lines matter here; the other keywords glibc understands are
//! accepted and skipped.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use crate::transport::DNS_PORT;

/// Where the system resolver configuration lives on Unix-y systems.
const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// The parsed system resolver configuration: the nameservers to
/// query, in the order they were listed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResolvConf {
    pub servers: Vec<SocketAddr>,
}

impl ResolvConf {
    /// Read and parse `/etc/resolv.conf`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::parse_file(RESOLV_CONF_PATH)
    }

    /// Read and parse a configuration file.
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(error) => Err(ConfigError::Io(Arc::new(error))),
        }
    }

    /// Parse a configuration out of a string.
    ///
    /// The format is that of the `/etc/resolv.conf` file: one keyword
    /// per line, with `#` or `;` starting a comment line.  Lines of
    /// the form `nameserver <ip>` become servers (on port 53); the
    /// other keywords glibc knows are skipped; anything else fails.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut servers = Vec::new();

        for line in text.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let mut words = line.split_whitespace();
            match words.next() {
                Some("nameserver") => {
                    let address = words.next().and_then(|word| word.parse::<IpAddr>().ok());
                    match address {
                        Some(address) => servers.push(SocketAddr::new(address, DNS_PORT)),
                        None => {
                            return Err(ConfigError::UnableToParseConfig {
                                line: line.to_string(),
                            })
                        }
                    }
                }
                Some("domain" | "search" | "sortlist" | "options") => {
                    tracing::trace!(line, "skipping resolver configuration keyword");
                }
                _ => {
                    return Err(ConfigError::UnableToParseConfig {
                        line: line.to_string(),
                    })
                }
            }
        }

        if servers.is_empty() {
            return Err(ConfigError::MissingNameservers);
        }

        Ok(Self { servers })
    }
}

/// Errors encountered discovering nameservers.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Io(Arc<io::Error>),

    /// A line of the configuration file makes no sense.
    UnableToParseConfig { line: String },

    /// The configuration parsed, but named no servers to query.
    MissingNameservers,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(error) => write!(f, "could not read configuration: {error}"),
            ConfigError::UnableToParseConfig { line } => {
                write!(f, "could not parse configuration line '{line}'")
            }
            ConfigError::MissingNameservers => write!(f, "configuration names no servers"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn parse_nameserver_lines() {
        let conf = ResolvConf::parse(
            "# a comment\n\
             ; another comment\n\
             nameserver 192.0.2.1\n\
             nameserver 2001:db8::1\n\
             \n\
             search example.com\n\
             options ndots:2\n",
        )
        .unwrap();

        assert_eq!(
            vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 53),
                SocketAddr::new(IpAddr::V6("2001:db8::1".parse::<Ipv6Addr>().unwrap()), 53),
            ],
            conf.servers,
        );
    }

    #[test]
    fn parse_rejects_garbage_nameserver() {
        let result = ResolvConf::parse("nameserver not-an-ip\n");
        assert!(matches!(
            result,
            Err(ConfigError::UnableToParseConfig { .. })
        ));
    }

    #[test]
    fn parse_rejects_unknown_keyword() {
        let result = ResolvConf::parse("namesrver 192.0.2.1\n");
        assert!(matches!(
            result,
            Err(ConfigError::UnableToParseConfig { .. })
        ));
    }

    #[test]
    fn parse_rejects_empty_configuration() {
        let result = ResolvConf::parse("# nothing but comments\n");
        assert!(matches!(result, Err(ConfigError::MissingNameservers)));
    }

    #[test]
    fn parse_file_surfaces_io_errors() {
        let result = ResolvConf::parse_file("/definitely/does/not/exist");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
