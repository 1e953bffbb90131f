//! Opening the channel's underlying socket: plain UDP, multicast UDP
//! (mDNS), TCP, or TCP wrapped in TLS (DNS-over-TLS).  Each
//! constructor hands back a read half for the channel's driver task
//! and a write sink for queries; the multiplexer on top neither knows
//! nor cares which wire mode is active.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, LazyLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::util::net::{bind_multicast_udp, bind_reusable_udp, send_stream_frame};
use crate::util::types::ResolveError;

/// The port unicast DNS speaks on, over both UDP and TCP.
pub const DNS_PORT: u16 = 53;

/// The port DNS-over-TLS speaks on.
pub const DOT_PORT: u16 = 853;

/// The mDNS link-local multicast group and port.
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;

/// Unicast DNS messages over UDP are limited to 512 octets; anything
/// bigger arrives truncated (or over a stream transport instead).
pub const MAX_UDP_MESSAGE: usize = 512;

/// mDNS runs entirely within a local network, so it allows messages
/// up to the link MTU.
pub const MAX_MDNS_MESSAGE: usize = 1500;

static TLS_CONFIG: LazyLock<Arc<ClientConfig>> = LazyLock::new(|| {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Arc::new(config)
});

/// An opened connection, ready for a `Channel` to drive.
pub struct Opened {
    pub reader: Reader,
    pub sink: Sink,
    pub multicast: bool,
}

/// The receive half of a connection.
pub enum Reader {
    /// One message per datagram; datagrams over `recv_limit` octets
    /// are dropped.
    Datagram {
        socket: Arc<UdpSocket>,
        recv_limit: usize,
    },

    /// A reliable ordered byte stream (TCP, or TLS over TCP), carrying
    /// length-prefixed messages.
    Stream {
        read: Box<dyn AsyncRead + Send + Unpin>,
    },
}

/// The send half of a connection.
pub enum Sink {
    /// An unconnected datagram socket sending to a fixed remote
    /// address (the mDNS group).
    DatagramTo {
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
    },

    /// A connected datagram socket.
    Datagram { socket: Arc<UdpSocket> },

    /// A byte stream; messages get the 2-octet length prefix.
    Stream {
        write: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    },
}

impl Sink {
    /// Send one encoded message.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), io::Error> {
        match self {
            Sink::DatagramTo { socket, remote } => {
                socket.send_to(bytes, remote).await?;
            }
            Sink::Datagram { socket } => {
                socket.send(bytes).await?;
            }
            Sink::Stream { write } => {
                let mut write = write.lock().await;
                send_stream_frame(&mut *write, bytes).await?;
            }
        }
        Ok(())
    }
}

/// Open a UDP connection to the preferred nameserver of `nameservers`:
/// the first IPv4 entry, or failing that the first entry.  The local
/// socket is bound to the unspecified address of the matching family.
pub async fn udp(nameservers: &[SocketAddr]) -> Result<Opened, ResolveError> {
    let Some(remote) = preferred_nameserver(nameservers) else {
        return Err(ResolveError::MissingNameservers);
    };

    let bind: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = Arc::new(bind_reusable_udp(bind)?);
    socket.connect(remote).await?;
    tracing::debug!(%remote, "opened udp channel");

    Ok(Opened {
        reader: Reader::Datagram {
            socket: Arc::clone(&socket),
            recv_limit: MAX_UDP_MESSAGE,
        },
        sink: Sink::Datagram { socket },
        multicast: false,
    })
}

/// Open the mDNS connection: joined to `224.0.0.251` with queries
/// addressed to the group on port 5353.
pub async fn udp_multicast() -> Result<Opened, ResolveError> {
    let socket = Arc::new(bind_multicast_udp(MDNS_GROUP, MDNS_PORT)?);
    tracing::debug!(group = %MDNS_GROUP, "opened mdns channel");

    Ok(Opened {
        reader: Reader::Datagram {
            socket: Arc::clone(&socket),
            recv_limit: MAX_MDNS_MESSAGE,
        },
        sink: Sink::DatagramTo {
            socket,
            remote: SocketAddr::from((MDNS_GROUP, MDNS_PORT)),
        },
        multicast: true,
    })
}

/// Open a TCP connection to a nameserver.
pub async fn tcp(nameserver: SocketAddr) -> Result<Opened, ResolveError> {
    let stream = TcpStream::connect(nameserver).await?;
    tracing::debug!(remote = %nameserver, "opened tcp channel");

    let (read, write) = stream.into_split();
    Ok(Opened {
        reader: Reader::Stream {
            read: Box::new(read),
        },
        sink: Sink::Stream {
            write: tokio::sync::Mutex::new(Box::new(write)),
        },
        multicast: false,
    })
}

/// Open a DNS-over-TLS connection: resolve `host`, connect to port
/// 853, and run the TLS handshake with `host` as the server name.
/// From the framing's point of view TLS is just another byte stream.
pub async fn dot(host: &str) -> Result<Opened, ResolveError> {
    let Ok(server_name) = ServerName::try_from(host.to_string()) else {
        return Err(ResolveError::InvalidName(host.to_string()));
    };

    let mut addrs = tokio::net::lookup_host((host, DOT_PORT)).await?;
    let Some(addr) = addrs.next() else {
        return Err(ResolveError::MissingNameservers);
    };

    let connector = TlsConnector::from(Arc::clone(&TLS_CONFIG));
    let stream = TcpStream::connect(addr).await?;
    let stream = connector.connect(server_name, stream).await?;
    tracing::debug!(remote = %addr, host, "opened dns-over-tls channel");

    let (read, write) = tokio::io::split(stream);
    Ok(Opened {
        reader: Reader::Stream {
            read: Box::new(read),
        },
        sink: Sink::Stream {
            write: tokio::sync::Mutex::new(Box::new(write)),
        },
        multicast: false,
    })
}

/// Pick the nameserver a UDP channel talks to: the first IPv4 entry,
/// or the first entry of any kind if there is no IPv4 one.
fn preferred_nameserver(nameservers: &[SocketAddr]) -> Option<SocketAddr> {
    nameservers
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| nameservers.first())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_nameserver_takes_first_ipv4() {
        let v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        let v4_a: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let v4_b: SocketAddr = "192.0.2.2:53".parse().unwrap();

        assert_eq!(
            Some(v4_a),
            preferred_nameserver(&[v6, v4_a, v4_b]),
        );
    }

    #[test]
    fn preferred_nameserver_falls_back_to_first() {
        let v6_a: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        let v6_b: SocketAddr = "[2001:db8::2]:53".parse().unwrap();

        assert_eq!(Some(v6_a), preferred_nameserver(&[v6_a, v6_b]));
        assert_eq!(None, preferred_nameserver(&[]));
    }
}
