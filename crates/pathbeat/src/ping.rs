//! Single-host ping engine

use std::net::IpAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pathbeat_common::{
    AddressFamily, EchoRequest, Host, Result, SocketError, DEFAULT_PAYLOAD_SIZE, DEFAULT_TTL,
};
use pathbeat_network::IcmpSocket;

use crate::resolve::async_resolve;

/// Tuning knobs for [`ping`] and [`async_ping`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingOptions {
    /// Number of Echo Requests to send.
    pub count: u32,
    /// Seconds between sends (not applied after the last).
    pub interval: f64,
    /// Seconds to wait for each reply.
    pub timeout: f64,
    /// Identifier for outgoing requests; random when absent. Advisory
    /// on unprivileged sockets, where the kernel assigns its own.
    pub identifier: Option<u16>,
    /// Source address to bind the socket to.
    pub source: Option<IpAddr>,
    /// Address family; resolution prefers IPv4 when absent.
    pub family: Option<AddressFamily>,
    /// Raw socket (true) or datagram socket (false).
    pub privileged: bool,
    /// Explicit payload; mutually exclusive with `payload_size`.
    pub payload: Option<Vec<u8>>,
    /// Size of the random payload when `payload` is absent.
    pub payload_size: usize,
    pub ttl: u8,
    /// DS field / traffic class. Unix only; zero leaves it untouched.
    pub traffic_class: u8,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            count: 4,
            interval: 1.0,
            timeout: 2.0,
            identifier: None,
            source: None,
            family: None,
            privileged: true,
            payload: None,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            ttl: DEFAULT_TTL,
            traffic_class: 0,
        }
    }
}

pub(crate) fn build_request(
    destination: IpAddr,
    identifier: u16,
    sequence: u16,
    ttl: u8,
    traffic_class: u8,
    payload: &Option<Vec<u8>>,
    payload_size: usize,
) -> EchoRequest {
    let request = EchoRequest::new(destination, identifier, sequence)
        .with_ttl(ttl)
        .with_traffic_class(traffic_class)
        .with_payload_size(payload_size);

    match payload {
        Some(payload) => request.with_payload(payload.clone()),
        None => request,
    }
}

/// Send `count` Echo Requests to one host and aggregate the replies.
///
/// Timeouts and ICMP error responses simply contribute no RTT; socket
/// and resolution failures surface as errors.
pub async fn async_ping(address: &str, options: &PingOptions) -> Result<Host> {
    let mut resolved = async_resolve(address, options.family).await?;
    let destination = resolved.remove(0);
    let family = AddressFamily::of(destination);

    let socket = IcmpSocket::with_source(family, options.privileged, options.source)?;
    let identifier = options
        .identifier
        .unwrap_or_else(|| rand::thread_rng().gen());
    let timeout = Duration::from_secs_f64(options.timeout);

    let mut rtts = Vec::with_capacity(options.count as usize);

    for sequence in 0..options.count {
        let mut request = build_request(
            destination,
            identifier,
            sequence as u16,
            options.ttl,
            options.traffic_class,
            &options.payload,
            options.payload_size,
        );

        socket.send(&mut request).await?;

        match await_matching_reply(&socket, &request, timeout).await? {
            Some(reply) if reply.raise_for_status().is_ok() => {
                if let Some(send_time) = request.send_time() {
                    let rtt = reply
                        .receive_time
                        .duration_since(send_time)
                        .as_secs_f64()
                        * 1000.0;
                    rtts.push(rtt);
                }
            }
            Some(reply) => {
                debug!(%destination, sequence, icmp_type = reply.icmp_type, "probe answered with an ICMP error");
            }
            None => {
                debug!(%destination, sequence, "probe timed out");
            }
        }

        if sequence + 1 < options.count {
            tokio::time::sleep(Duration::from_secs_f64(options.interval)).await;
        }
    }

    socket.close();

    Ok(Host::new(destination, options.count, rtts))
}

/// Blocking variant of [`async_ping`].
pub fn ping(address: &str, options: &PingOptions) -> Result<Host> {
    crate::runtime::block_on(async_ping(address, options))
}

/// Wait for the reply matching the request, discarding everything else
/// until the deadline. `None` means the deadline passed.
pub(crate) async fn await_matching_reply(
    socket: &IcmpSocket,
    request: &EchoRequest,
    timeout: Duration,
) -> Result<Option<pathbeat_common::EchoReply>> {
    // On a datagram socket the kernel rewrites the identifier; match
    // against the one it bound, which is known after the first send.
    let expected_identifier = if socket.is_privileged() {
        request.identifier()
    } else {
        socket.bound_identifier().unwrap_or_else(|| request.identifier())
    };

    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }

        match socket.receive(remaining).await {
            Ok(reply)
                if reply.identifier == expected_identifier
                    && reply.sequence == request.sequence() =>
            {
                return Ok(Some(reply));
            }
            // A reply for someone else's exchange; keep waiting
            Ok(_) => continue,
            Err(SocketError::Timeout(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = PingOptions::default();
        assert_eq!(options.count, 4);
        assert_eq!(options.payload_size, 56);
        assert_eq!(options.ttl, 64);
        assert!(options.privileged);
        assert!(options.identifier.is_none());
    }

    #[test]
    fn test_options_serde_round_trip() {
        let options = PingOptions {
            count: 2,
            privileged: false,
            ..PingOptions::default()
        };
        let json = serde_json::to_string(&options).unwrap();
        let parsed: PingOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.count, 2);
        assert!(!parsed.privileged);
        assert_eq!(parsed.payload_size, options.payload_size);
    }

    #[test]
    fn test_build_request_uses_explicit_payload() {
        let payload = Some(vec![1u8, 2, 3]);
        let mut request = build_request(
            "127.0.0.1".parse().unwrap(),
            7,
            1,
            64,
            0,
            &payload,
            56,
        );
        assert_eq!(request.payload_bytes(), &[1, 2, 3]);
        assert_eq!(request.payload_size(), 3);
    }
}
