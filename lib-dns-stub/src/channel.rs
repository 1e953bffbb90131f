//! The query multiplexer.
//!
//! A [`Channel`] owns one opened transport connection and tracks every
//! query in flight on it: each submitted query is assigned a fresh
//! 16-bit id and parked in a map next to a single-shot completion;
//! responses coming off the wire are matched back to their entry by
//! id.  A query leaves the map exactly once, through whichever comes
//! first of a matched response, its timeout, [`Channel::cancel_all`],
//! or a transport failure.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use dns_wire::protocol::types::{
    DomainName, Header, Message, Question, RecordClass, RecordType, FLAG_RECURSION_DESIRED,
};

use crate::transport::{self, Opened, Reader, Sink};
use crate::util::net::read_stream_frame;
use crate::util::types::ResolveError;

const MUTEX_POISON_MESSAGE: &str = "[internal error] in-flight query map poisoned";

/// How long to wait for a response before failing a query, unless the
/// channel was configured otherwise.
const DEF_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a channel, fixed at connect time.
#[derive(Debug, Copy, Clone)]
pub struct Config {
    /// Per-query timeout: how long after submission a query fails
    /// with `ResolveError::Timeout` if no response has matched it.
    pub query_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            query_timeout: DEF_QUERY_TIMEOUT,
        }
    }
}

/// A connection to a nameserver (or the mDNS group), multiplexing
/// concurrent queries.
///
/// Channels are cheap to clone; clones share the connection and the
/// in-flight queries.  The background task reading the socket stops
/// when the last clone is dropped.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
    _driver: Arc<DriverGuard>,
}

struct Shared {
    pending: Mutex<Pending>,
    sink: Sink,
    is_multicast: bool,
    query_timeout: Duration,
}

/// Everything that must change atomically with respect to response
/// dispatch: the id counter and the in-flight map.
struct Pending {
    next_id: u16,
    next_generation: u64,
    queries: HashMap<u16, SentQuery>,
    closed: Option<ResolveError>,
}

/// A query in flight: what we sent, and the waiting caller.
///
/// The 16-bit wire id wraps and gets reused, so the id alone does not
/// identify a submission for the lifetime of the channel.  The
/// generation does: it never wraps, and anything that wants to remove
/// this entry later (the timeout task, a failed write's cleanup) must
/// present the generation it was armed with.
struct SentQuery {
    generation: u64,
    request: Message,
    sender: oneshot::Sender<Result<Message, ResolveError>>,
}

/// Aborts the driver task when the last channel clone goes away.
struct DriverGuard {
    handle: JoinHandle<()>,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl Channel {
    /// Open a UDP channel to the preferred nameserver of
    /// `nameservers` (the first IPv4 entry, else the first entry).
    pub async fn udp(nameservers: &[SocketAddr]) -> Result<Self, ResolveError> {
        Self::udp_with_config(nameservers, Config::default()).await
    }

    /// Like [`Channel::udp`], with explicit configuration.
    pub async fn udp_with_config(
        nameservers: &[SocketAddr],
        config: Config,
    ) -> Result<Self, ResolveError> {
        Ok(Self::start(transport::udp(nameservers).await?, config))
    }

    /// Open an mDNS channel: multicast UDP on `224.0.0.251:5353`,
    /// with recursion-desired cleared on outgoing queries.
    pub async fn udp_multicast() -> Result<Self, ResolveError> {
        Self::udp_multicast_with_config(Config::default()).await
    }

    /// Like [`Channel::udp_multicast`], with explicit configuration.
    pub async fn udp_multicast_with_config(config: Config) -> Result<Self, ResolveError> {
        Ok(Self::start(transport::udp_multicast().await?, config))
    }

    /// Open a TCP channel to a nameserver.
    pub async fn tcp(nameserver: SocketAddr) -> Result<Self, ResolveError> {
        Self::tcp_with_config(nameserver, Config::default()).await
    }

    /// Like [`Channel::tcp`], with explicit configuration.
    pub async fn tcp_with_config(
        nameserver: SocketAddr,
        config: Config,
    ) -> Result<Self, ResolveError> {
        Ok(Self::start(transport::tcp(nameserver).await?, config))
    }

    /// Open a DNS-over-TLS channel to a nameserver, given as a host
    /// name to resolve, connect to on port 853, and verify TLS
    /// against.
    pub async fn dot(host: &str) -> Result<Self, ResolveError> {
        Self::dot_with_config(host, Config::default()).await
    }

    /// Like [`Channel::dot`], with explicit configuration.
    pub async fn dot_with_config(host: &str, config: Config) -> Result<Self, ResolveError> {
        Ok(Self::start(transport::dot(host).await?, config))
    }

    /// Open a UDP channel to the nameservers in `/etc/resolv.conf`.
    pub async fn system() -> Result<Self, ResolveError> {
        let conf = crate::config::ResolvConf::load().map_err(ResolveError::Config)?;
        Self::udp(&conf.servers).await
    }

    fn start(opened: Opened, config: Config) -> Self {
        let Opened {
            reader,
            sink,
            multicast,
        } = opened;

        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending {
                next_id: 0,
                next_generation: 0,
                queries: HashMap::new(),
                closed: None,
            }),
            sink,
            is_multicast: multicast,
            query_timeout: config.query_timeout,
        });

        let driver = tokio::spawn(run_driver(reader, Arc::clone(&shared)));

        Self {
            shared,
            _driver: Arc::new(DriverGuard { handle: driver }),
        }
    }

    /// Send a query for `host` and wait for the matching response.
    ///
    /// `host` is split on `.` into labels; a trailing dot is allowed
    /// but not required.  The query asks one question, class IN, with
    /// recursion desired unless this is a multicast channel.
    /// `extra_flags` is OR-ed into the header's flags field (see the
    /// `FLAG_*` constants in `dns_wire`); pass 0 for a standard query.
    ///
    /// The entry is registered in the in-flight map before anything
    /// is written to the socket, so a response arriving immediately
    /// still finds it.
    pub async fn send_query(
        &self,
        host: &str,
        qtype: RecordType,
        extra_flags: u16,
    ) -> Result<Message, ResolveError> {
        let name = query_name(host)?;

        let (id, generation, receiver, octets) = {
            let mut pending = self.shared.pending.lock().expect(MUTEX_POISON_MESSAGE);

            if let Some(error) = &pending.closed {
                return Err(error.clone());
            }

            let Some(id) = pending.allocate_id() else {
                return Err(ResolveError::TooManyQueries);
            };
            let generation = pending.next_generation;
            pending.next_generation += 1;

            let request = build_request(id, name, qtype, extra_flags, self.shared.is_multicast);
            let octets = request.to_octets().map_err(ResolveError::Serialise)?;

            let (sender, receiver) = oneshot::channel();
            pending.queries.insert(
                id,
                SentQuery {
                    generation,
                    request,
                    sender,
                },
            );

            (id, generation, receiver, octets)
        };

        tracing::trace!(id, host, %qtype, "sending query");

        if let Err(error) = self.shared.sink.send(&octets).await {
            // nothing will ever complete the entry we just parked;
            // the generation check means that if something else
            // already resolved it (and the id moved on to a new
            // query), the new occupant is left alone
            let _ = self.shared.take_if_current(id, generation);
            return Err(ResolveError::Transport(Arc::new(error)));
        }

        self.arm_timeout(id, generation);

        match receiver.await {
            Ok(result) => result,
            // the channel (and its driver) went away entirely
            Err(_) => Err(ResolveError::ChannelClosed),
        }
    }

    /// Fail every query currently in flight with
    /// `ResolveError::Cancelled` and empty the map.  The connection
    /// itself stays open and usable.
    pub fn cancel_all(&self) {
        let mut pending = self.shared.pending.lock().expect(MUTEX_POISON_MESSAGE);
        for (id, sent) in pending.queries.drain() {
            tracing::debug!(id, request = ?sent.request.questions, "cancelling query");
            let _ = sent.sender.send(Err(ResolveError::Cancelled));
        }
    }

    /// Schedule the task that times the query out.  Holds only a weak
    /// reference, so a forgotten timer cannot keep the channel alive.
    ///
    /// The timer captures the submission's generation: by the time it
    /// fires, the query may long since have completed and its id been
    /// handed to a fresh query, and a bare `remove(&id)` would fail
    /// that innocent newcomer.
    fn arm_timeout(&self, id: u16, generation: u64) {
        let shared = Arc::downgrade(&self.shared);
        let timeout = self.shared.query_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = shared.upgrade() {
                if let Some(sent) = shared.take_if_current(id, generation) {
                    tracing::debug!(id, request = ?sent.request.questions, "query timed out");
                    let _ = sent.sender.send(Err(ResolveError::Timeout));
                }
            }
        });
    }
}

impl Pending {
    /// Claim the next free id, starting from the counter and skipping
    /// over ids still in flight.  `None` when every id is taken.
    fn allocate_id(&mut self) -> Option<u16> {
        if self.queries.len() > usize::from(u16::MAX) {
            return None;
        }

        let mut id = self.next_id;
        while self.queries.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_id = id.wrapping_add(1);
        Some(id)
    }
}

impl Shared {
    /// Remove the entry for `id`, but only if it is still the same
    /// submission tagged with `generation`.  Ids wrap and get reused;
    /// the generation never does.
    fn take_if_current(&self, id: u16, generation: u64) -> Option<SentQuery> {
        let mut pending = self.pending.lock().expect(MUTEX_POISON_MESSAGE);
        if pending
            .queries
            .get(&id)
            .is_some_and(|sent| sent.generation == generation)
        {
            pending.queries.remove(&id)
        } else {
            None
        }
    }

    /// Remove the entry for `id`, but only if the response actually
    /// answers it per `matches`.  Entries for reused ids can be
    /// targeted by stragglers from the id's previous occupant, so the
    /// question echo has to agree before the entry is consumed.
    fn take_if_answered(
        &self,
        id: u16,
        matches: impl FnOnce(&SentQuery) -> bool,
    ) -> Option<SentQuery> {
        let mut pending = self.pending.lock().expect(MUTEX_POISON_MESSAGE);
        if pending.queries.get(&id).is_some_and(matches) {
            pending.queries.remove(&id)
        } else {
            None
        }
    }

    /// Hand a message that arrived on the wire to whichever query it
    /// answers.
    fn dispatch(&self, octets: &[u8]) {
        match Message::from_octets(octets) {
            Ok(message) => {
                if !message.header.is_response {
                    tracing::trace!(id = message.header.id, "ignoring non-response message");
                    return;
                }

                let sent = self.take_if_answered(message.header.id, |sent| {
                    response_answers_request(&sent.request, &message)
                });

                if let Some(sent) = sent {
                    tracing::trace!(
                        id = message.header.id,
                        answers = message.answers.len(),
                        "matched response"
                    );
                    let _ = sent.sender.send(Ok(message));
                } else {
                    tracing::trace!(id = message.header.id, "ignoring unsolicited response");
                }
            }
            // a mangled response that still identifies itself (header
            // plus question echo) fails the query it was for;
            // anything less identifiable is dropped without
            // disturbing the queries in flight
            Err(error) => match error.header {
                Some(header) if header.is_response => {
                    let sent = self.take_if_answered(header.id, |sent| {
                        header.opcode == sent.request.header.opcode
                            && (error.questions.is_empty()
                                || error.questions == sent.request.questions)
                    });

                    if let Some(sent) = sent {
                        tracing::debug!(id = header.id, %error, "failing query with mangled response");
                        let _ = sent.sender.send(Err(ResolveError::Protocol(error.error)));
                    } else {
                        tracing::trace!(id = header.id, "ignoring unmatched mangled response");
                    }
                }
                _ => tracing::warn!(%error, "could not decode message"),
            },
        }
    }

    /// A transport failure is fatal: fail everything in flight, and
    /// make later submissions fail immediately with the same error.
    fn fail_all(&self, error: &ResolveError) {
        let mut pending = self.pending.lock().expect(MUTEX_POISON_MESSAGE);
        pending.closed = Some(error.clone());
        for (id, sent) in pending.queries.drain() {
            tracing::debug!(id, "failing in-flight query");
            let _ = sent.sender.send(Err(error.clone()));
        }
    }
}

/// Read messages off the transport and dispatch them until the
/// transport fails or the channel is dropped.
async fn run_driver(reader: Reader, shared: Arc<Shared>) {
    let error = match reader {
        Reader::Datagram { socket, recv_limit } => {
            let mut buf = vec![0u8; recv_limit + 1];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(count) if count > recv_limit => {
                        tracing::trace!(length = count, "ignoring oversized datagram");
                    }
                    Ok(count) => shared.dispatch(&buf[..count]),
                    Err(error) => break error,
                }
            }
        }
        Reader::Stream { mut read } => loop {
            match read_stream_frame(&mut read).await {
                Ok(frame) => shared.dispatch(&frame),
                Err(error) => break error,
            }
        },
    };

    tracing::debug!(%error, "transport failed");
    shared.fail_all(&ResolveError::Transport(Arc::new(error)));
}

/// Turn a host string into a query name: split on `.`, dropping the
/// trailing empty label if the host was written with a trailing dot.
fn query_name(host: &str) -> Result<DomainName, ResolveError> {
    let name = if host.ends_with('.') {
        DomainName::from_dotted_string(host)
    } else {
        DomainName::from_dotted_string(&format!("{host}."))
    };

    name.ok_or_else(|| ResolveError::InvalidName(host.to_string()))
}

/// Whether a response can be taken as answering a stored request.
/// The ids already matched, but ids get reused, so that is not enough
/// on its own: the opcode must be echoed, and so must the question
/// section when the response carries one.  mDNS responders routinely
/// omit the question section, which is why an empty echo is allowed
/// through.
fn response_answers_request(request: &Message, response: &Message) -> bool {
    if response.header.opcode != request.header.opcode {
        return false;
    }

    response.questions.is_empty() || response.questions == request.questions
}

fn build_request(
    id: u16,
    name: DomainName,
    qtype: RecordType,
    extra_flags: u16,
    is_multicast: bool,
) -> Message {
    let flags = if is_multicast {
        extra_flags
    } else {
        extra_flags | FLAG_RECURSION_DESIRED
    };

    let mut request = Message::from_question(
        id,
        Question {
            name,
            qtype,
            qclass: RecordClass::IN,
        },
    );
    request.header = Header::from_id_and_flags(id, flags);
    request
}
