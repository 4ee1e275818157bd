//! ICMP packet handling
//!
//! Construction and parsing of ICMPv4 (RFC 792) and ICMPv6 (RFC 4443)
//! Echo messages, including identifier/sequence recovery from the packet
//! embedded in Destination Unreachable and Time Exceeded errors.

use pnet::packet::icmp::{
    checksum, echo_reply::EchoReplyPacket, echo_request::MutableEchoRequestPacket, IcmpCode,
    IcmpPacket, IcmpTypes,
};
use pnet::packet::icmpv6::{
    echo_reply::EchoReplyPacket as EchoReplyPacketV6,
    echo_request::MutableEchoRequestPacket as MutableEchoRequestPacketV6, Icmpv6Code, Icmpv6Packet,
    Icmpv6Types,
};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use std::io;

use pathbeat_common::SocketError;

/// Length of the ICMP Echo header (type, code, checksum, id, sequence).
pub const ICMP_HEADER_LEN: usize = 8;

/// Offset of the embedded offending datagram inside an ICMP error message.
const ERROR_PAYLOAD_OFFSET: usize = 8;

/// Length of the fixed IPv6 header embedded in ICMPv6 errors.
const EMBEDDED_IPV6_HEADER_LEN: usize = 40;

/// Construct an ICMPv4 Echo Request packet.
///
/// With `compute_checksum` the RFC 1071 checksum over the header and
/// payload is written into the buffer (privileged raw sockets). Without
/// it the field is left zero for the kernel to fill (datagram sockets).
pub fn build_icmpv4_echo_request(
    buffer: &mut [u8],
    identifier: u16,
    sequence: u16,
    payload: &[u8],
    compute_checksum: bool,
) -> io::Result<usize> {
    let mut packet = MutableEchoRequestPacket::new(buffer).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "Buffer too small for ICMPv4 packet",
        )
    })?;

    packet.set_icmp_type(IcmpTypes::EchoRequest);
    packet.set_icmp_code(IcmpCode::new(0));
    packet.set_identifier(identifier);
    packet.set_sequence_number(sequence);
    packet.set_payload(payload);

    if compute_checksum {
        // Calculate checksum on the immutable packet view
        let icmp_packet = IcmpPacket::new(packet.packet()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "Failed to create ICMP packet for checksum",
            )
        })?;
        let checksum = checksum(&icmp_packet);
        packet.set_checksum(checksum);
    }

    Ok(ICMP_HEADER_LEN + payload.len())
}

/// Construct an ICMPv6 Echo Request packet.
///
/// The checksum field is left zero: the kernel computes it over the
/// pseudo-header (source, destination, length, next-header 58) for both
/// raw and datagram ICMPv6 sockets.
pub fn build_icmpv6_echo_request(
    buffer: &mut [u8],
    identifier: u16,
    sequence: u16,
    payload: &[u8],
) -> io::Result<usize> {
    let mut packet = MutableEchoRequestPacketV6::new(buffer).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "Buffer too small for ICMPv6 packet",
        )
    })?;

    packet.set_icmpv6_type(Icmpv6Types::EchoRequest);
    packet.set_icmpv6_code(Icmpv6Code::new(0));
    packet.set_identifier(identifier);
    packet.set_sequence_number(sequence);
    packet.set_payload(payload);

    Ok(ICMP_HEADER_LEN + payload.len())
}

/// Header fields of a decoded inbound ICMP message.
///
/// For Echo Replies, `identifier` and `sequence` come from the echo
/// header itself; for error messages they are recovered from the
/// embedded original packet, and are zero when it is too short to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpMessage {
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub identifier: u16,
    pub sequence: u16,
}

/// Parse an ICMPv4 message. `buffer` starts at the ICMP header (the IP
/// header must already be stripped, see [`strip_ipv4_header`]).
pub fn parse_icmpv4_message(buffer: &[u8]) -> Result<IcmpMessage, SocketError> {
    if buffer.len() < ICMP_HEADER_LEN {
        return Err(SocketError::InvalidPacket);
    }

    let packet = IcmpPacket::new(buffer).ok_or(SocketError::InvalidPacket)?;
    let icmp_type = packet.get_icmp_type();
    let icmp_code = packet.get_icmp_code().0;

    let (identifier, sequence) = match icmp_type {
        IcmpTypes::EchoReply => {
            let reply = EchoReplyPacket::new(buffer).ok_or(SocketError::InvalidPacket)?;
            (reply.get_identifier(), reply.get_sequence_number())
        }
        IcmpTypes::DestinationUnreachable
        | IcmpTypes::TimeExceeded
        | IcmpTypes::ParameterProblem => buffer
            .get(ERROR_PAYLOAD_OFFSET..)
            .and_then(embedded_echo_header_v4)
            .unwrap_or((0, 0)),
        _ => (0, 0),
    };

    Ok(IcmpMessage {
        icmp_type: icmp_type.0,
        icmp_code,
        identifier,
        sequence,
    })
}

/// Parse an ICMPv6 message. `buffer` starts at the ICMPv6 header; v6
/// sockets never deliver the IP header.
pub fn parse_icmpv6_message(buffer: &[u8]) -> Result<IcmpMessage, SocketError> {
    if buffer.len() < ICMP_HEADER_LEN {
        return Err(SocketError::InvalidPacket);
    }

    let packet = Icmpv6Packet::new(buffer).ok_or(SocketError::InvalidPacket)?;
    let icmp_type = packet.get_icmpv6_type();
    let icmp_code = packet.get_icmpv6_code().0;

    let (identifier, sequence) = match icmp_type {
        Icmpv6Types::EchoReply => {
            let reply = EchoReplyPacketV6::new(buffer).ok_or(SocketError::InvalidPacket)?;
            (reply.get_identifier(), reply.get_sequence_number())
        }
        Icmpv6Types::DestinationUnreachable
        | Icmpv6Types::PacketTooBig
        | Icmpv6Types::TimeExceeded
        | Icmpv6Types::ParameterProblem => buffer
            .get(ERROR_PAYLOAD_OFFSET..)
            .and_then(embedded_echo_header_v6)
            .unwrap_or((0, 0)),
        _ => (0, 0),
    };

    Ok(IcmpMessage {
        icmp_type: icmp_type.0,
        icmp_code,
        identifier,
        sequence,
    })
}

/// Split a raw IPv4 datagram into its ICMP bytes and the header TTL.
///
/// IPv4 sockets (raw and datagram alike) deliver the IP header; its
/// length is the low nibble of the first byte in 32-bit words.
pub fn strip_ipv4_header(datagram: &[u8]) -> Option<(&[u8], u8)> {
    let header_len = usize::from(*datagram.first()? & 0x0f) * 4;
    if header_len < 20 || datagram.len() < header_len {
        return None;
    }

    let ttl = datagram[8];
    Some((&datagram[header_len..], ttl))
}

/// Read id and sequence from the Echo Request embedded in an ICMPv4
/// error payload: the offending IP header followed by at least the first
/// 8 bytes of the offending ICMP packet.
fn embedded_echo_header_v4(inner: &[u8]) -> Option<(u16, u16)> {
    let ip = Ipv4Packet::new(inner)?;
    let header_len = usize::from(ip.get_header_length()) * 4;
    if header_len < 20 {
        return None;
    }

    let echo = inner.get(header_len..header_len + ICMP_HEADER_LEN)?;
    Some((
        u16::from_be_bytes([echo[4], echo[5]]),
        u16::from_be_bytes([echo[6], echo[7]]),
    ))
}

/// Same recovery for ICMPv6 errors; the embedded IPv6 header is fixed
/// at 40 bytes.
fn embedded_echo_header_v6(inner: &[u8]) -> Option<(u16, u16)> {
    let echo = inner.get(EMBEDDED_IPV6_HEADER_LEN..EMBEDDED_IPV6_HEADER_LEN + ICMP_HEADER_LEN)?;
    Some((
        u16::from_be_bytes([echo[4], echo[5]]),
        u16::from_be_bytes([echo[6], echo[7]]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One's-complement sum-and-fold over a full packet. A packet with a
    /// correct checksum folds to 0xffff.
    fn ones_complement_fold(data: &[u8]) -> u16 {
        let mut sum = 0u32;
        let mut words = data.chunks_exact(2);
        for word in &mut words {
            sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
        }
        if let [last] = words.remainder() {
            sum += u32::from(u16::from_be_bytes([*last, 0]));
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }

    #[test]
    fn test_icmpv4_checksum_folds_to_all_ones() {
        // Odd and even payload sizes, including empty
        for size in [0usize, 1, 3, 32, 56, 57] {
            let payload = vec![0xa5u8; size];
            let mut buffer = vec![0u8; ICMP_HEADER_LEN + size];
            let len =
                build_icmpv4_echo_request(&mut buffer, 0x1234, 7, &payload, true).unwrap();
            assert_eq!(len, ICMP_HEADER_LEN + size);
            assert_eq!(ones_complement_fold(&buffer[..len]), 0xffff, "size {size}");
        }
    }

    #[test]
    fn test_icmpv4_zero_payload_is_bare_header() {
        let mut buffer = [0u8; ICMP_HEADER_LEN];
        let len = build_icmpv4_echo_request(&mut buffer, 1, 1, &[], true).unwrap();
        assert_eq!(len, 8);
    }

    #[test]
    fn test_icmpv4_known_packet() {
        // type=8, code=0, id=0x1234, seq=0x0001, 32 zero bytes of payload
        let mut buffer = [0u8; 40];
        let len = build_icmpv4_echo_request(&mut buffer, 0x1234, 0x0001, &[0u8; 32], true)
            .unwrap();
        assert_eq!(len, 40);
        assert_eq!(buffer[0], 8);
        assert_eq!(buffer[1], 0);
        assert_eq!(ones_complement_fold(&buffer), 0xffff);
    }

    #[test]
    fn test_icmpv4_unprivileged_leaves_checksum_zero() {
        let mut buffer = [0u8; 16];
        build_icmpv4_echo_request(&mut buffer, 42, 1, &[1u8; 8], false).unwrap();
        assert_eq!(&buffer[2..4], &[0, 0]);
    }

    #[test]
    fn test_icmpv4_build_parse_round_trip() {
        let payload = b"pathbeat";
        let mut buffer = vec![0u8; ICMP_HEADER_LEN + payload.len()];
        let len = build_icmpv4_echo_request(&mut buffer, 1234, 9, payload, true).unwrap();

        // Simulate an Echo Reply coming back
        buffer[0] = 0;

        let message = parse_icmpv4_message(&buffer[..len]).unwrap();
        assert_eq!(message.icmp_type, 0);
        assert_eq!(message.icmp_code, 0);
        assert_eq!(message.identifier, 1234);
        assert_eq!(message.sequence, 9);
        assert_eq!(&buffer[ICMP_HEADER_LEN..len], payload);
    }

    #[test]
    fn test_icmpv6_build_parse_round_trip() {
        let payload = b"pathbeat-v6";
        let mut buffer = vec![0u8; ICMP_HEADER_LEN + payload.len()];
        let len = build_icmpv6_echo_request(&mut buffer, 0xbeef, 3, payload).unwrap();
        assert_eq!(buffer[0], 128);

        // Simulate an Echo Reply coming back
        buffer[0] = 129;

        let message = parse_icmpv6_message(&buffer[..len]).unwrap();
        assert_eq!(message.identifier, 0xbeef);
        assert_eq!(message.sequence, 3);
    }

    #[test]
    fn test_short_packet_is_invalid() {
        assert!(matches!(
            parse_icmpv4_message(&[0u8; 7]),
            Err(SocketError::InvalidPacket)
        ));
        assert!(matches!(
            parse_icmpv6_message(&[0u8; 4]),
            Err(SocketError::InvalidPacket)
        ));
    }

    /// Build a synthetic ICMPv4 Time Exceeded message embedding an Echo
    /// Request with the given id and sequence.
    fn time_exceeded_v4(identifier: u16, sequence: u16) -> Vec<u8> {
        let mut packet = vec![0u8; 8];
        packet[0] = 11; // Time Exceeded

        // Embedded IPv4 header, minimal 20 bytes
        let mut ip_header = [0u8; 20];
        ip_header[0] = 0x45; // version 4, IHL 5
        ip_header[8] = 1; // remaining TTL
        ip_header[9] = 1; // protocol ICMP
        packet.extend_from_slice(&ip_header);

        // First 8 bytes of the offending Echo Request
        let mut echo = [0u8; 8];
        echo[0] = 8;
        echo[4..6].copy_from_slice(&identifier.to_be_bytes());
        echo[6..8].copy_from_slice(&sequence.to_be_bytes());
        packet.extend_from_slice(&echo);

        packet
    }

    #[test]
    fn test_icmpv4_error_extracts_embedded_id_and_sequence() {
        let packet = time_exceeded_v4(0x4242, 17);
        let message = parse_icmpv4_message(&packet).unwrap();
        assert_eq!(message.icmp_type, 11);
        assert_eq!(message.identifier, 0x4242);
        assert_eq!(message.sequence, 17);
    }

    #[test]
    fn test_icmpv4_truncated_error_is_unmatchable() {
        let mut packet = time_exceeded_v4(0x4242, 17);
        packet.truncate(20); // not enough of the embedded datagram left
        let message = parse_icmpv4_message(&packet).unwrap();
        assert_eq!(message.icmp_type, 11);
        assert_eq!(message.identifier, 0);
        assert_eq!(message.sequence, 0);
    }

    #[test]
    fn test_icmpv4_destination_unreachable_extracts_embedded_header() {
        let mut packet = time_exceeded_v4(0x0102, 4);
        packet[0] = 3; // Destination Unreachable
        packet[1] = 1; // host unreachable

        let message = parse_icmpv4_message(&packet).unwrap();
        assert_eq!(message.icmp_type, 3);
        assert_eq!(message.icmp_code, 1);
        assert_eq!(message.identifier, 0x0102);
        assert_eq!(message.sequence, 4);
    }

    #[test]
    fn test_icmpv4_unknown_type_is_unmatchable() {
        let mut packet = [0u8; 16];
        packet[0] = 5; // Redirect: no echo header to recover
        packet[4] = 0xff;

        let message = parse_icmpv4_message(&packet).unwrap();
        assert_eq!(message.icmp_type, 5);
        assert_eq!(message.identifier, 0);
        assert_eq!(message.sequence, 0);
    }

    #[test]
    fn test_icmpv6_error_extracts_embedded_id_and_sequence() {
        let mut packet = vec![0u8; 8];
        packet[0] = 3; // Time Exceeded

        // Embedded fixed-size IPv6 header
        let mut ip_header = [0u8; 40];
        ip_header[0] = 0x60; // version 6
        ip_header[6] = 58; // next header ICMPv6
        packet.extend_from_slice(&ip_header);

        let mut echo = [0u8; 8];
        echo[0] = 128;
        echo[4..6].copy_from_slice(&0xcafeu16.to_be_bytes());
        echo[6..8].copy_from_slice(&5u16.to_be_bytes());
        packet.extend_from_slice(&echo);

        let message = parse_icmpv6_message(&packet).unwrap();
        assert_eq!(message.icmp_type, 3);
        assert_eq!(message.identifier, 0xcafe);
        assert_eq!(message.sequence, 5);
    }

    #[test]
    fn test_strip_ipv4_header() {
        let mut datagram = vec![0u8; 28];
        datagram[0] = 0x45; // IHL 5 -> 20 byte header
        datagram[8] = 57; // TTL
        datagram[20] = 0; // Echo Reply type

        let (icmp, ttl) = strip_ipv4_header(&datagram).unwrap();
        assert_eq!(icmp.len(), 8);
        assert_eq!(ttl, 57);

        // Header longer than the datagram
        datagram[0] = 0x4f; // IHL 15 -> 60 byte header
        assert!(strip_ipv4_header(&datagram).is_none());
    }
}
