//! Core types for pathbeat measurements

use std::fmt;
use std::net::IpAddr;
use std::ops::Deref;
use std::time::Instant;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::IcmpError;

/// IP address family of a probe or reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// The family of an address.
    pub fn of(address: IpAddr) -> Self {
        if address.is_ipv4() {
            AddressFamily::V4
        } else {
            AddressFamily::V6
        }
    }

    /// Numeric family (4 or 6), as reported in measurement output.
    pub fn number(self) -> u8 {
        match self {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "IPv4"),
            AddressFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Default random payload size in bytes.
pub const DEFAULT_PAYLOAD_SIZE: usize = 56;

/// Default time to live for outgoing probes.
pub const DEFAULT_TTL: u8 = 64;

/// An outbound ICMP Echo Request.
///
/// The payload is either supplied explicitly or generated lazily from
/// alphanumeric random bytes the first time the request is encoded; once
/// generated it is stable and can be read back. `send_time` is written by
/// the socket on the first successful send.
#[derive(Debug, Clone)]
pub struct EchoRequest {
    destination: IpAddr,
    scope_id: u32,
    identifier: u16,
    sequence: u16,
    ttl: u8,
    traffic_class: u8,
    payload: Option<Vec<u8>>,
    payload_size: usize,
    send_time: Option<Instant>,
}

impl EchoRequest {
    pub fn new(destination: IpAddr, identifier: u16, sequence: u16) -> Self {
        Self {
            destination,
            scope_id: 0,
            identifier,
            sequence,
            ttl: DEFAULT_TTL,
            traffic_class: 0,
            payload: None,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            send_time: None,
        }
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_traffic_class(mut self, traffic_class: u8) -> Self {
        self.traffic_class = traffic_class;
        self
    }

    /// Use an explicit payload instead of a random one.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload_size = payload.len();
        self.payload = Some(payload);
        self
    }

    /// Size of the random payload generated when no payload is supplied.
    pub fn with_payload_size(mut self, payload_size: usize) -> Self {
        self.payload_size = payload_size;
        self
    }

    /// Zone index for IPv6 link-local destinations.
    pub fn with_scope_id(mut self, scope_id: u32) -> Self {
        self.scope_id = scope_id;
        self
    }

    pub fn destination(&self) -> IpAddr {
        self.destination
    }

    pub fn scope_id(&self) -> u32 {
        self.scope_id
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn traffic_class(&self) -> u8 {
        self.traffic_class
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// The payload, if supplied or already generated.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// The payload to put on the wire, generating it on first use.
    pub fn payload_bytes(&mut self) -> &[u8] {
        let size = self.payload_size;
        self.payload.get_or_insert_with(|| random_payload(size))
    }

    /// Monotonic send timestamp, set by the socket on successful send.
    pub fn send_time(&self) -> Option<Instant> {
        self.send_time
    }

    /// Record the send timestamp. Only the first call takes effect.
    pub fn stamp_sent(&mut self, at: Instant) {
        self.send_time.get_or_insert(at);
    }
}

fn random_payload(size: usize) -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .collect()
}

/// A decoded inbound ICMP message.
///
/// For Echo Replies the identifier and sequence are the ones of the
/// originating request. For error messages they are extracted from the
/// embedded offending packet, or zero when the embedded bytes are too
/// short to read them.
#[derive(Debug, Clone)]
pub struct EchoReply {
    /// Address of the responder.
    pub source: IpAddr,
    pub family: AddressFamily,
    pub identifier: u16,
    pub sequence: u16,
    pub icmp_type: u8,
    pub icmp_code: u8,
    /// Wire bytes received, ICMP header included (IP header excluded).
    pub bytes_received: usize,
    /// Monotonic receive timestamp, stamped by the socket.
    pub receive_time: Instant,
    /// TTL of the enclosing IPv4 header. `None` on IPv6.
    pub ttl: Option<u8>,
}

impl EchoReply {
    /// Whether this message is an Echo Reply for its family.
    pub fn is_echo_reply(&self) -> bool {
        match self.family {
            AddressFamily::V4 => self.icmp_type == 0,
            AddressFamily::V6 => self.icmp_type == 129,
        }
    }

    /// Map a non-Echo-Reply response to the matching [`IcmpError`].
    ///
    /// Does nothing for an Echo Reply.
    pub fn raise_for_status(&self) -> Result<(), IcmpError> {
        let (unreachable, exceeded) = match self.family {
            AddressFamily::V4 => (3, 11),
            AddressFamily::V6 => (1, 3),
        };

        if self.is_echo_reply() {
            return Ok(());
        }

        if self.icmp_type == unreachable {
            Err(IcmpError::DestinationUnreachable(self.clone()))
        } else if self.icmp_type == exceeded {
            Err(IcmpError::TimeExceeded(self.clone()))
        } else {
            Err(IcmpError::Other(self.clone()))
        }
    }
}

impl fmt::Display for EchoReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes from {}: type={} code={}",
            self.bytes_received, self.source, self.icmp_type, self.icmp_code
        )
    }
}

/// Aggregated result of pinging one destination.
///
/// Stores only the ordered RTT samples and the number of probes sent;
/// every statistic is derived on access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    address: IpAddr,
    packets_sent: u32,
    rtts: Vec<f64>,
}

impl Host {
    pub fn new(address: IpAddr, packets_sent: u32, rtts: Vec<f64>) -> Self {
        Self {
            address,
            packets_sent,
            rtts,
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn packets_sent(&self) -> u32 {
        self.packets_sent
    }

    /// Round-trip times in milliseconds, in arrival order.
    pub fn rtts(&self) -> &[f64] {
        &self.rtts
    }

    pub fn packets_received(&self) -> u32 {
        self.rtts.len() as u32
    }

    /// Fraction of probes that went unanswered, between 0 and 1.
    pub fn packet_loss(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }

        1.0 - f64::from(self.packets_received()) / f64::from(self.packets_sent)
    }

    pub fn min_rtt(&self) -> f64 {
        if self.rtts.is_empty() {
            return 0.0;
        }

        self.rtts.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn avg_rtt(&self) -> f64 {
        if self.rtts.is_empty() {
            return 0.0;
        }

        self.rtts.iter().sum::<f64>() / self.rtts.len() as f64
    }

    pub fn max_rtt(&self) -> f64 {
        self.rtts.iter().copied().fold(0.0, f64::max)
    }

    /// Mean absolute difference between consecutive RTTs.
    pub fn jitter(&self) -> f64 {
        if self.rtts.len() < 2 {
            return 0.0;
        }

        let sum: f64 = self
            .rtts
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).abs())
            .sum();

        sum / (self.rtts.len() - 1) as f64
    }

    pub fn is_alive(&self) -> bool {
        self.packets_received() > 0
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} received, {:.1}% loss",
            self.address,
            self.packets_received(),
            self.packets_sent,
            self.packet_loss() * 100.0
        )
    }
}

/// A gateway that responded during a traceroute, at a given distance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hop {
    distance: u8,
    #[serde(flatten)]
    host: Host,
}

impl Hop {
    pub fn new(distance: u8, host: Host) -> Self {
        Self { distance, host }
    }

    /// The TTL that elicited a response from this gateway.
    pub fn distance(&self) -> u8 {
        self.distance
    }

    pub fn host(&self) -> &Host {
        &self.host
    }
}

impl Deref for Hop {
    type Target = Host;

    fn deref(&self) -> &Host {
        &self.host
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>3}  {}  {:.3} ms", self.distance, self.address(), self.avg_rtt())
    }
}
