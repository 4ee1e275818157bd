//! Network primitives for pathbeat measurements

pub mod capabilities;
pub mod icmp;
pub mod socket;

pub use capabilities::has_net_raw;
pub use icmp::{
    build_icmpv4_echo_request, build_icmpv6_echo_request, parse_icmpv4_message,
    parse_icmpv6_message, strip_ipv4_header, IcmpMessage, ICMP_HEADER_LEN,
};
pub use socket::IcmpSocket;
