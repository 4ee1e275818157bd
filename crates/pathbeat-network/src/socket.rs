//! ICMP socket abstraction
//!
//! A safe wrapper around raw and datagram ICMP sockets, handling:
//! - IPv4 and IPv6 support
//! - Privileged (RAW) and unprivileged (DGRAM) delivery modes
//! - Per-packet TTL and traffic class, source binding, broadcast
//! - Timestamped sends and deadline-bounded receives
//! - Integration with Tokio for async I/O
//!
//! On Linux with ping_group_range configured, DGRAM sockets allow
//! unprivileged users to send ICMP echo requests without CAP_NET_RAW.
//! The kernel then owns the ICMP header: it rewrites the identifier and
//! computes the checksum. The kernel-chosen identifier is readable
//! through [`IcmpSocket::bound_identifier`] after the first send.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;
use tracing::trace;

use pathbeat_common::{AddressFamily, EchoReply, EchoRequest, SocketError};

use crate::icmp::{
    build_icmpv4_echo_request, build_icmpv6_echo_request, parse_icmpv4_message,
    parse_icmpv6_message, strip_ipv4_header, ICMP_HEADER_LEN,
};

/// Largest IP datagram we are prepared to receive.
const RECV_BUFFER_LEN: usize = 65536;

/// A socket for sending ICMP Echo Requests and receiving replies.
///
/// Construction opens the descriptor; [`close`](IcmpSocket::close) is
/// idempotent and fails every later operation with
/// [`SocketError::Unavailable`]. The descriptor itself is released on
/// drop.
pub struct IcmpSocket {
    /// The underlying async file descriptor
    inner: AsyncFd<Socket>,
    family: AddressFamily,
    privileged: bool,
    source: Option<IpAddr>,
    closed: AtomicBool,
    /// Wakes pending receives when the socket is closed
    shutdown: Notify,
    /// Kernel-assigned identifier of a DGRAM socket, known after the
    /// first send
    bound_identifier: OnceLock<u16>,
}

impl IcmpSocket {
    /// Open an ICMP socket for the given family and delivery mode.
    ///
    /// Privileged mode uses a RAW socket (requires CAP_NET_RAW or root)
    /// and sends the ICMP header this library writes verbatim.
    /// Unprivileged mode uses a DGRAM socket and lets the kernel write
    /// the header.
    pub fn new(family: AddressFamily, privileged: bool) -> Result<Self, SocketError> {
        Self::with_source(family, privileged, None)
    }

    /// Open a socket bound to a specific source address.
    pub fn with_source(
        family: AddressFamily,
        privileged: bool,
        source: Option<IpAddr>,
    ) -> Result<Self, SocketError> {
        let (domain, protocol) = match family {
            AddressFamily::V4 => (Domain::IPV4, Protocol::ICMPV4),
            AddressFamily::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };
        let kind = if privileged { Type::RAW } else { Type::DGRAM };

        let socket = Socket::new(domain, kind, Some(protocol)).map_err(|err| {
            match err.kind() {
                io::ErrorKind::PermissionDenied if privileged => SocketError::Permission,
                io::ErrorKind::PermissionDenied | io::ErrorKind::Unsupported => {
                    SocketError::UnprivilegedDisabled
                }
                _ => SocketError::Io(err),
            }
        })?;
        socket.set_nonblocking(true)?;

        if let Some(address) = source {
            let bind_addr = SocketAddr::new(address, 0);
            socket.bind(&bind_addr.into()).map_err(|err| {
                if err.kind() == io::ErrorKind::AddrNotAvailable {
                    SocketError::Address(address)
                } else {
                    SocketError::Io(err)
                }
            })?;
        }

        trace!(%family, privileged, "created ICMP socket");

        Ok(Self {
            inner: AsyncFd::new(socket)?,
            family,
            privileged,
            source,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            bound_identifier: OnceLock::new(),
        })
    }

    /// Send an Echo Request to its destination.
    ///
    /// Sets the packet TTL and traffic class on the socket, writes the
    /// encoded message, and stamps `send_time` on the request when the
    /// send succeeds.
    pub async fn send(&self, request: &mut EchoRequest) -> Result<(), SocketError> {
        self.ensure_open()?;

        let destination = request.destination();
        if let IpAddr::V4(v4) = destination {
            if v4.is_broadcast() && !self.inner.get_ref().broadcast()? {
                return Err(SocketError::Broadcast(destination));
            }
        }

        let identifier = request.identifier();
        let sequence = request.sequence();
        let ttl = request.ttl();
        let traffic_class = request.traffic_class();
        let target = destination_sockaddr(destination, request.scope_id());

        let payload = request.payload_bytes();
        let mut buffer = vec![0u8; ICMP_HEADER_LEN + payload.len()];
        let len = match self.family {
            AddressFamily::V4 => build_icmpv4_echo_request(
                &mut buffer,
                identifier,
                sequence,
                payload,
                self.privileged,
            )?,
            AddressFamily::V6 => {
                build_icmpv6_echo_request(&mut buffer, identifier, sequence, payload)?
            }
        };

        self.set_ttl(ttl)?;
        #[cfg(unix)]
        if traffic_class != 0 {
            self.set_traffic_class(traffic_class)?;
        }

        loop {
            let mut guard = self.inner.writable().await?;

            match guard.try_io(|inner| inner.get_ref().send_to(&buffer[..len], &target)) {
                Ok(result) => {
                    result.map_err(|err| classify_send_error(err, destination))?;
                    break;
                }
                Err(_would_block) => continue,
            }
        }

        request.stamp_sent(Instant::now());

        if !self.privileged {
            self.record_bound_identifier();
        }

        Ok(())
    }

    /// Wait up to `timeout` for any ICMP datagram and decode it.
    ///
    /// Datagrams too short or malformed to decode are dropped and the
    /// wait resumes; matching a reply to a request is the caller's
    /// concern. Returns [`SocketError::Timeout`] when the deadline
    /// passes, and [`SocketError::Unavailable`] if the socket is closed
    /// while waiting.
    pub async fn receive(&self, timeout: Duration) -> Result<EchoReply, SocketError> {
        self.ensure_open()?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut buffer = vec![0u8; RECV_BUFFER_LEN];

        loop {
            self.ensure_open()?;

            let received = tokio::select! {
                _ = self.shutdown.notified() => return Err(SocketError::Unavailable),
                received = tokio::time::timeout_at(deadline, self.recv_once(&mut buffer)) => received,
            };

            let (len, source) = match received {
                Err(_elapsed) => return Err(SocketError::Timeout(timeout)),
                Ok(result) => result?,
            };
            let receive_time = Instant::now();

            if let Some(reply) = self.decode(&buffer[..len], source.ip(), receive_time) {
                return Ok(reply);
            }

            // Undecodable datagram: drop it and keep waiting. The
            // deadline is re-evaluated on the next iteration.
        }
    }

    async fn recv_once(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let mut guard = self.inner.readable().await?;

            match guard.try_io(|inner| {
                // socket2's recv_from requires an uninit buffer
                let maybe_uninit_buf = unsafe {
                    std::mem::transmute::<&mut [u8], &mut [std::mem::MaybeUninit<u8>]>(buffer)
                };
                inner.get_ref().recv_from(maybe_uninit_buf)
            }) {
                Ok(Ok((len, addr))) => {
                    let addr = addr
                        .as_socket()
                        .ok_or_else(|| io::Error::other("invalid socket address"))?;
                    return Ok((len, addr));
                }
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    }

    fn decode(&self, datagram: &[u8], source: IpAddr, receive_time: Instant) -> Option<EchoReply> {
        let (icmp_bytes, ttl) = match self.family {
            // IPv4 sockets deliver the IP header in front of the ICMP bytes
            AddressFamily::V4 => {
                let (icmp_bytes, ttl) = strip_ipv4_header(datagram)?;
                (icmp_bytes, Some(ttl))
            }
            AddressFamily::V6 => (datagram, None),
        };

        let message = match self.family {
            AddressFamily::V4 => parse_icmpv4_message(icmp_bytes).ok()?,
            AddressFamily::V6 => parse_icmpv6_message(icmp_bytes).ok()?,
        };

        Some(EchoReply {
            source,
            family: self.family,
            identifier: message.identifier,
            sequence: message.sequence,
            icmp_type: message.icmp_type,
            icmp_code: message.icmp_code,
            bytes_received: icmp_bytes.len(),
            receive_time,
            ttl,
        })
    }

    /// Close the socket. Idempotent; pending and future operations fail
    /// with [`SocketError::Unavailable`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.inner.get_ref().shutdown(Shutdown::Both);
            self.shutdown.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// The source address the socket was bound to, if any.
    pub fn address(&self) -> Option<IpAddr> {
        self.source
    }

    /// The identifier the kernel assigned to a DGRAM socket, known
    /// after the first successful send. `None` on RAW sockets, where
    /// the request's identifier goes out verbatim.
    pub fn bound_identifier(&self) -> Option<u16> {
        self.bound_identifier.get().copied()
    }

    /// Whether broadcast sends are enabled (IPv4 only).
    pub fn broadcast(&self) -> Result<bool, SocketError> {
        self.ensure_open()?;
        Ok(self.inner.get_ref().broadcast()?)
    }

    /// Enable or disable broadcast sends by setting `SO_BROADCAST`
    /// (IPv4 only).
    pub fn set_broadcast(&self, allow: bool) -> Result<(), SocketError> {
        self.ensure_open()?;
        if self.family != AddressFamily::V4 {
            return Err(SocketError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "broadcast is only available on IPv4 sockets",
            )));
        }

        Ok(self.inner.get_ref().set_broadcast(allow)?)
    }

    fn ensure_open(&self) -> Result<(), SocketError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SocketError::Unavailable)
        } else {
            Ok(())
        }
    }

    /// Set the time-to-live for the next outgoing packet.
    fn set_ttl(&self, ttl: u8) -> Result<(), SocketError> {
        match self.family {
            AddressFamily::V4 => self.inner.get_ref().set_ttl(u32::from(ttl))?,
            AddressFamily::V6 => self.inner.get_ref().set_unicast_hops_v6(u32::from(ttl))?,
        }

        Ok(())
    }

    /// Set the DS field / traffic class for the next outgoing packet.
    #[cfg(unix)]
    fn set_traffic_class(&self, traffic_class: u8) -> Result<(), SocketError> {
        match self.family {
            AddressFamily::V4 => self.inner.get_ref().set_tos(u32::from(traffic_class))?,
            AddressFamily::V6 => self
                .inner
                .get_ref()
                .set_tclass_v6(u32::from(traffic_class))?,
        }

        Ok(())
    }

    fn record_bound_identifier(&self) {
        if self.bound_identifier.get().is_some() {
            return;
        }

        if let Ok(addr) = self.inner.get_ref().local_addr() {
            if let Some(addr) = addr.as_socket() {
                // The kernel stores the ICMP identifier in the port field
                let _ = self.bound_identifier.set(addr.port());
            }
        }
    }
}

fn destination_sockaddr(destination: IpAddr, scope_id: u32) -> SockAddr {
    match destination {
        IpAddr::V4(v4) => SocketAddr::from(SocketAddrV4::new(v4, 0)).into(),
        IpAddr::V6(v6) => SocketAddr::from(SocketAddrV6::new(v6, 0, 0, scope_id)).into(),
    }
}

/// The kernel rejects sends to a broadcast address on sockets without
/// SO_BROADCAST with a permission error.
fn classify_send_error(err: io::Error, destination: IpAddr) -> SocketError {
    match destination {
        IpAddr::V4(_) if err.kind() == io::ErrorKind::PermissionDenied => {
            SocketError::Broadcast(destination)
        }
        _ => SocketError::Io(err),
    }
}
