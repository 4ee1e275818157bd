//! Error types for pathbeat

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use crate::types::EchoReply;

/// Top-level error type for pathbeat operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("name lookup failed for {0:?}")]
    NameLookup(String),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Icmp(#[from] IcmpError),
}

/// Errors raised by the ICMP socket layer
#[derive(Error, Debug)]
pub enum SocketError {
    /// Raw socket creation was rejected by the OS.
    #[error("root privileges or the CAP_NET_RAW capability are required to open a raw ICMP socket")]
    Permission,

    /// Datagram socket creation was rejected by the OS.
    #[error(
        "unprivileged ICMP sockets are not allowed on this system; \
         check the net.ipv4.ping_group_range sysctl"
    )]
    UnprivilegedDisabled,

    /// The requested source address cannot be assigned to the socket.
    #[error("cannot assign source address {0} to the socket")]
    Address(IpAddr),

    /// The socket has been closed.
    #[error("operation on a closed socket")]
    Unavailable,

    /// Sending to an IPv4 broadcast address without enabling broadcast.
    #[error("cannot send to broadcast address {0} without enabling broadcast on the socket")]
    Broadcast(IpAddr),

    /// No reply arrived before the deadline.
    #[error("no ICMP datagram received within {:.3}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// A datagram too short to carry an ICMP header.
    #[error("truncated or malformed ICMP packet")]
    InvalidPacket,

    #[error("ICMP socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// An ICMP response that is not the awaited Echo Reply.
///
/// Each variant carries the offending reply so callers can inspect the
/// responder address and the raw type/code pair.
#[derive(Error, Debug)]
pub enum IcmpError {
    #[error("destination unreachable from {} (code {})", .0.source, .0.icmp_code)]
    DestinationUnreachable(EchoReply),

    #[error("time to live exceeded in transit, reported by {}", .0.source)]
    TimeExceeded(EchoReply),

    #[error("ICMP error type {} code {} from {}", .0.icmp_type, .0.icmp_code, .0.source)]
    Other(EchoReply),
}

impl IcmpError {
    /// The reply that triggered this error.
    pub fn reply(&self) -> &EchoReply {
        match self {
            IcmpError::DestinationUnreachable(reply)
            | IcmpError::TimeExceeded(reply)
            | IcmpError::Other(reply) => reply,
        }
    }
}

/// Convenient Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = SocketError::Timeout(Duration::from_millis(250));
        assert_eq!(
            err.to_string(),
            "no ICMP datagram received within 0.250s"
        );
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = SocketError::Unavailable.into();
        assert!(matches!(err, Error::Socket(SocketError::Unavailable)));
    }
}
