//! An asynchronous DNS stub resolver.
//!
//! A [`Channel`] is a single opened connection to one nameserver (or to
//! the mDNS multicast group), multiplexing any number of concurrent
//! queries over it: each query gets a fresh 16-bit id, responses are
//! matched back to their callers by id, and every query is bounded by a
//! timeout.  Four kinds of channel are available: UDP, multicast UDP
//! (mDNS), TCP, and TCP with TLS (DNS-over-TLS).
//!
//! The typed helpers in [`lookup`] cover the common cases of resolving
//! a name to addresses, service records, or reverse-lookup names; for
//! anything else, [`Channel::send_query`] returns the whole response
//! message.

#![warn(clippy::pedantic)]
// TODO: fix
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::similar_names)]
#![allow(clippy::wildcard_imports)]

pub mod channel;
pub mod config;
pub mod lookup;
pub mod util;

mod transport;

pub use self::channel::{Channel, Config};
pub use self::config::{ConfigError, ResolvConf};
pub use self::util::types::ResolveError;
