use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;

/// Read one DNS message from a stream transport.
///
/// A DNS stream message is slightly different to a DNS datagram
/// message: it has a big-endian u16 prefix giving the total length of
/// the message.  This is redundant (the header says how many fields
/// there are, and the fields contain length information), but it means
/// the entire message can be read before parsing begins.  A partial
/// message stays in the stream's buffers until the rest of it arrives.
pub async fn read_stream_frame<S>(stream: &mut S) -> Result<Vec<u8>, io::Error>
where
    S: AsyncRead + Unpin,
{
    let expected = usize::from(stream.read_u16().await?);
    let mut bytes = vec![0u8; expected];
    stream.read_exact(&mut bytes).await?;
    Ok(bytes)
}

/// Write one DNS message to a stream transport, prefixed by its
/// length as a big-endian u16.
pub async fn send_stream_frame<S>(stream: &mut S, bytes: &[u8]) -> Result<(), io::Error>
where
    S: AsyncWrite + Unpin,
{
    let Ok(length) = u16::try_from(bytes.len()) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "message too large for stream framing",
        ));
    };

    stream.write_all(&length.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;

    Ok(())
}

/// Bind a datagram socket with `SO_REUSEADDR` and (on unix)
/// `SO_REUSEPORT` set, ready for tokio.
pub fn bind_reusable_udp(addr: SocketAddr) -> Result<UdpSocket, io::Error> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };

    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)] // this is currently restricted to Unix's in socket2
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    tracing::trace!(%addr, "bound datagram socket");
    UdpSocket::from_std(socket.into())
}

/// Bind the mDNS datagram socket: the well-known port with the reuse
/// flags set (so other mDNS stacks on the host keep working), joined
/// to the link-local group on the default interface.
pub fn bind_multicast_udp(group: Ipv4Addr, port: u16) -> Result<UdpSocket, io::Error> {
    let socket = bind_reusable_udp(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
    socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
    Ok(socket)
}
