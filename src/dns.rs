//! DNS resolution for routing checks.
//!
//! Without an override the system resolver is used. A policy with a DNS
//! override is checked against that server directly, since that is the
//! server its resolver hook forwards to.

use async_trait::async_trait;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::classify::is_valid_domain;
use crate::error::{PbrError, Result};

/// Default DNS resolution timeout in seconds
const DNS_TIMEOUT_SECS: u64 = 5;

const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// Host name resolution, optionally against a specific server.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, server: Option<SocketAddr>) -> Result<Vec<IpAddr>>;
}

/// System resolver, or direct UDP queries when a server is given.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, server: Option<SocketAddr>) -> Result<Vec<IpAddr>> {
        resolve_host(host, server).await
    }
}

/// Resolve `host` to its addresses, sorted and deduplicated.
/// IP literals resolve to themselves.
pub async fn resolve_host(host: &str, server: Option<SocketAddr>) -> Result<Vec<IpAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }
    let host = host.trim_end_matches('.');
    if !is_valid_domain(host) {
        return Err(PbrError::Validation(format!("Invalid host name '{}'", host)));
    }

    let timeout = Duration::from_secs(DNS_TIMEOUT_SECS);
    let addrs = match server {
        None => system_lookup(host, timeout).await?,
        Some(server) => {
            let mut addrs = query_server(host, RecordType::A, server, timeout).await?;
            addrs.extend(query_server(host, RecordType::AAAA, server, timeout).await?);
            addrs
        }
    };

    if addrs.is_empty() {
        return Err(PbrError::NotFound(format!("No addresses for {}", host)));
    }
    Ok(addrs.into_iter().collect::<BTreeSet<_>>().into_iter().collect())
}

async fn system_lookup(host: &str, timeout: Duration) -> Result<Vec<IpAddr>> {
    match tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0))).await {
        Ok(Ok(addrs)) => Ok(addrs.map(|a| a.ip()).collect()),
        Ok(Err(e)) => Err(PbrError::NotFound(format!("{}: {}", host, e))),
        Err(_) => Err(PbrError::TransientNetwork(format!(
            "DNS lookup of {} timed out",
            host
        ))),
    }
}

fn build_query(host: &str, record_type: RecordType) -> Result<Message> {
    let name = Name::from_str(&format!("{}.", host))
        .map_err(|e| PbrError::Validation(format!("Invalid host name '{}': {}", host, e)))?;
    let mut message = Message::new();
    message.set_id(rand_id());
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, record_type));
    Ok(message)
}

fn rand_id() -> u16 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos ^ std::process::id()) as u16
}

/// Single UDP query to `server`.
async fn query_server(
    host: &str,
    record_type: RecordType,
    server: SocketAddr,
    timeout: Duration,
) -> Result<Vec<IpAddr>> {
    let query = build_query(host, record_type)?;
    let bytes = query
        .to_vec()
        .map_err(|e| PbrError::Validation(format!("Failed to encode DNS query: {}", e)))?;

    let bind: SocketAddr = if server.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let net_err = |e: std::io::Error| PbrError::TransientNetwork(format!("DNS {}: {}", server, e));
    let socket = UdpSocket::bind(bind).await.map_err(net_err)?;
    socket.send_to(&bytes, server).await.map_err(net_err)?;

    let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
    let len = loop {
        let (len, src) = match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
            Ok(result) => result.map_err(net_err)?,
            Err(_) => {
                return Err(PbrError::TransientNetwork(format!(
                    "DNS query to {} timed out",
                    server
                )))
            }
        };
        if src == server {
            break len;
        }
        debug!("Ignoring DNS response from unexpected source {}", src);
    };

    let response = Message::from_vec(&buf[..len])
        .map_err(|e| PbrError::TransientNetwork(format!("Bad DNS response from {}: {}", server, e)))?;
    if response.id() != query.id() {
        return Err(PbrError::TransientNetwork(format!(
            "DNS response ID mismatch from {}",
            server
        )));
    }
    Ok(extract_addresses(&response))
}

fn extract_addresses(response: &Message) -> Vec<IpAddr> {
    response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(a)) => Some(IpAddr::V6(a.0)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Record;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_ip_literal_resolves_to_itself() {
        let addrs = resolve_host("10.1.2.3", None).await.unwrap();
        assert_eq!(addrs, vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_invalid_host() {
        assert!(matches!(
            resolve_host("not a host!!", None).await,
            Err(PbrError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_localhost_resolves() {
        let addrs = resolve_host("localhost", None).await.unwrap();
        assert!(addrs.iter().any(|a| a.is_loopback()));
    }

    #[tokio::test]
    async fn test_query_override_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            loop {
                let (len, src) = server.recv_from(&mut buf).await.unwrap();
                let query = Message::from_vec(&buf[..len]).unwrap();
                let mut response = query.clone();
                response.set_message_type(hickory_proto::op::MessageType::Response);
                let q = query.queries()[0].clone();
                if q.query_type() == RecordType::A {
                    response.add_answer(Record::from_rdata(
                        q.name().clone(),
                        60,
                        RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
                    ));
                }
                server.send_to(&response.to_vec().unwrap(), src).await.unwrap();
            }
        });

        let addrs = resolve_host("example.com", Some(server_addr)).await.unwrap();
        assert_eq!(addrs, vec!["93.184.216.34".parse::<IpAddr>().unwrap()]);
    }
}
