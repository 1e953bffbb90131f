use std::fmt;
use std::io;
use std::sync::Arc;

use dns_wire::protocol::deserialise::ProtocolError;
use dns_wire::protocol::serialise;

use crate::config::ConfigError;

/// How a query (or the channel carrying it) can fail.
///
/// This type is `Clone` because a single transport failure is fanned
/// out to every query in flight on the channel, which is also why the
/// underlying I/O error is kept behind an `Arc`.
#[derive(Debug, Clone)]
pub enum ResolveError {
    /// The queried name does not split into DNS labels.
    InvalidName(String),

    /// The query message could not be serialised.
    Serialise(serialise::Error),

    /// The response arrived but violated the wire format.
    Protocol(ProtocolError),

    /// No response arrived within the channel's query timeout.
    Timeout,

    /// `cancel_all` was called while the query was in flight.
    Cancelled,

    /// All 65 536 query ids are already in flight on this channel.
    TooManyQueries,

    /// The channel was torn down while the query was in flight, or
    /// the query was submitted after the channel had gone away.
    ChannelClosed,

    /// The socket (or TLS session) failed.  Fatal: every query in
    /// flight on the channel fails with the same error, and later
    /// queries fail immediately.
    Transport(Arc<io::Error>),

    /// No nameserver to talk to.
    MissingNameservers,

    /// Nameserver discovery from the system configuration failed.
    Config(ConfigError),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResolveError::InvalidName(name) => write!(f, "invalid domain name '{name}'"),
            ResolveError::Serialise(error) => write!(f, "could not serialise query: {error}"),
            ResolveError::Protocol(error) => write!(f, "malformed response: {error}"),
            ResolveError::Timeout => write!(f, "query timed out"),
            ResolveError::Cancelled => write!(f, "query cancelled"),
            ResolveError::TooManyQueries => write!(f, "no free query id"),
            ResolveError::ChannelClosed => write!(f, "channel closed"),
            ResolveError::Transport(error) => write!(f, "transport failed: {error}"),
            ResolveError::MissingNameservers => write!(f, "no nameservers configured"),
            ResolveError::Config(error) => write!(f, "could not discover nameservers: {error}"),
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResolveError::Serialise(error) => Some(error),
            ResolveError::Protocol(error) => Some(error),
            ResolveError::Transport(error) => Some(error.as_ref()),
            ResolveError::Config(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for ResolveError {
    fn from(error: io::Error) -> Self {
        ResolveError::Transport(Arc::new(error))
    }
}
