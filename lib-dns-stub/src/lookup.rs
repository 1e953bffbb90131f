//! Typed convenience queries.
//!
//! Each of these sends one query through [`Channel::send_query`] and
//! picks the matching records out of the answer section.  Records of
//! other types (a CNAME in front of the addresses, say) are simply
//! skipped; callers who want the whole response should use
//! [`Channel::send_query`] directly.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use dns_wire::protocol::types::{DomainName, RecordType, RecordTypeWithData};

use crate::channel::Channel;
use crate::util::types::ResolveError;

/// Resolve a host name to IPv4 addresses.
pub async fn lookup_a(channel: &Channel, host: &str) -> Result<Vec<Ipv4Addr>, ResolveError> {
    let response = channel.send_query(host, RecordType::A, 0).await?;

    Ok(response
        .answers
        .iter()
        .filter_map(|rr| match &rr.rtype_with_data {
            RecordTypeWithData::A { address } => Some(*address),
            _ => None,
        })
        .collect())
}

/// Resolve a host name to IPv6 addresses.
pub async fn lookup_aaaa(channel: &Channel, host: &str) -> Result<Vec<Ipv6Addr>, ResolveError> {
    let response = channel.send_query(host, RecordType::AAAA, 0).await?;

    Ok(response
        .answers
        .iter()
        .filter_map(|rr| match &rr.rtype_with_data {
            RecordTypeWithData::AAAA { address } => Some(*address),
            _ => None,
        })
        .collect())
}

/// One SRV answer: where (and how eagerly) to contact a service.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SrvTarget {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: DomainName,
}

/// Resolve a service name (like `_ldap._tcp.example.com`) to its SRV
/// targets.  Targets come back in answer order; weighting between
/// them is the caller's business.
pub async fn lookup_srv(channel: &Channel, service: &str) -> Result<Vec<SrvTarget>, ResolveError> {
    let response = channel.send_query(service, RecordType::SRV, 0).await?;

    Ok(response
        .answers
        .iter()
        .filter_map(|rr| match &rr.rtype_with_data {
            RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            } => Some(SrvTarget {
                priority: *priority,
                weight: *weight,
                port: *port,
                target: target.clone(),
            }),
            _ => None,
        })
        .collect())
}

/// Reverse-resolve an address to its PTR names, via the standard
/// `in-addr.arpa` / `ip6.arpa` reverse name.
pub async fn lookup_ptr(
    channel: &Channel,
    address: IpAddr,
) -> Result<Vec<DomainName>, ResolveError> {
    let response = channel
        .send_query(&reverse_name(address), RecordType::PTR, 0)
        .await?;

    Ok(response
        .answers
        .iter()
        .filter_map(|rr| match &rr.rtype_with_data {
            RecordTypeWithData::PTR { ptrdname } => Some(ptrdname.clone()),
            _ => None,
        })
        .collect())
}

/// The reverse-lookup name for an address: octets reversed under
/// `in-addr.arpa` for IPv4, nibbles reversed under `ip6.arpa` for
/// IPv6.
fn reverse_name(address: IpAddr) -> String {
    match address {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{d}.{c}.{b}.{a}.in-addr.arpa.")
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(72);
            for octet in v6.octets().iter().rev() {
                name.push_str(&format!("{:x}.{:x}.", octet & 0x0f, octet >> 4));
            }
            name.push_str("ip6.arpa.");
            name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::sync::Arc;

    use dns_wire::protocol::types::test_util::*;
    use dns_wire::protocol::types::{Message, RecordClass, ResourceRecord};

    #[test]
    fn reverse_name_v4() {
        assert_eq!(
            "4.3.2.1.in-addr.arpa.",
            reverse_name(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)))
        );
    }

    #[test]
    fn reverse_name_v6() {
        let address: Ipv6Addr = "2001:db8::567:89ab".parse().unwrap();
        assert_eq!(
            "b.a.9.8.7.6.5.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2.ip6.arpa.",
            reverse_name(IpAddr::V6(address))
        );
    }

    /// A nameserver that answers every query with the given records.
    async fn canned_nameserver(answers: Vec<ResourceRecord>) -> SocketAddr {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let answers = Arc::new(answers);

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((count, peer)) = socket.recv_from(&mut buf).await {
                let request = Message::from_octets(&buf[..count]).unwrap();
                let mut response = request.make_response();
                response.answers = answers.as_ref().clone();
                let octets = response.to_octets().unwrap();
                socket.send_to(&octets, peer).await.unwrap();
            }
        });

        addr
    }

    #[tokio::test]
    async fn lookup_a_picks_only_addresses() {
        let server = canned_nameserver(vec![
            cname_record("www.example.com.", "host.example.com."),
            a_record("host.example.com.", Ipv4Addr::new(192, 0, 2, 10)),
            a_record("host.example.com.", Ipv4Addr::new(192, 0, 2, 11)),
        ])
        .await;
        let channel = Channel::udp(&[server]).await.unwrap();

        let addresses = lookup_a(&channel, "www.example.com").await.unwrap();
        assert_eq!(
            vec![Ipv4Addr::new(192, 0, 2, 10), Ipv4Addr::new(192, 0, 2, 11)],
            addresses,
        );
    }

    #[tokio::test]
    async fn lookup_aaaa_picks_only_addresses() {
        let server = canned_nameserver(vec![
            aaaa_record("www.example.com.", "2001:db8::1".parse().unwrap()),
            a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 10)),
        ])
        .await;
        let channel = Channel::udp(&[server]).await.unwrap();

        let addresses = lookup_aaaa(&channel, "www.example.com").await.unwrap();
        assert_eq!(vec!["2001:db8::1".parse::<Ipv6Addr>().unwrap()], addresses);
    }

    #[tokio::test]
    async fn lookup_srv_keeps_all_fields() {
        let server = canned_nameserver(vec![srv_record(
            "_ldap._tcp.example.com.",
            389,
            "ldap.example.com.",
        )])
        .await;
        let channel = Channel::udp(&[server]).await.unwrap();

        let targets = lookup_srv(&channel, "_ldap._tcp.example.com").await.unwrap();
        assert_eq!(
            vec![SrvTarget {
                priority: 0,
                weight: 0,
                port: 389,
                target: domain("ldap.example.com."),
            }],
            targets,
        );
    }

    #[tokio::test]
    async fn lookup_ptr_resolves_reverse_names() {
        let server = canned_nameserver(vec![ResourceRecord {
            name: domain("10.2.0.192.in-addr.arpa."),
            rtype_with_data: RecordTypeWithData::PTR {
                ptrdname: domain("host.example.com."),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        }])
        .await;
        let channel = Channel::udp(&[server]).await.unwrap();

        let names = lookup_ptr(&channel, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)))
            .await
            .unwrap();
        assert_eq!(vec![domain("host.example.com.")], names);
    }
}
