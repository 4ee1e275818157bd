//! ICMP Echo measurements for Rust
//!
//! pathbeat measures round-trip latency, detects liveness, and
//! discovers network paths using the ICMP Echo protocol over IPv4 and
//! IPv6. It works on privileged raw sockets (this library writes the
//! ICMP headers) or unprivileged datagram sockets (the kernel does).
//!
//! ```no_run
//! use pathbeat::{ping, PingOptions};
//!
//! let host = ping("127.0.0.1", &PingOptions { privileged: false, ..Default::default() })?;
//! assert!(host.is_alive());
//! println!("avg rtt: {:.2} ms", host.avg_rtt());
//! # Ok::<(), pathbeat::Error>(())
//! ```

pub mod multiping;
pub mod ping;
pub mod resolve;
pub mod traceroute;

mod runtime;

pub use pathbeat_common::{
    AddressFamily, EchoReply, EchoRequest, Error, Hop, Host, IcmpError, Result, SocketError,
    DEFAULT_PAYLOAD_SIZE, DEFAULT_TTL,
};
pub use pathbeat_network::{has_net_raw, IcmpSocket};

pub use multiping::{async_multiping, multiping, MultipingOptions};
pub use ping::{async_ping, ping, PingOptions};
pub use resolve::{async_resolve, resolve};
pub use traceroute::{traceroute, TracerouteOptions};
