//! Concurrent multi-host ping scheduler
//!
//! Interleaves probes to many destinations through at most one socket
//! per address family and demultiplexes the arriving replies by
//! (identifier, sequence). Destinations keep their own send pacing and
//! per-probe deadlines; the output list preserves the input order no
//! matter how replies arrive.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pathbeat_common::{
    AddressFamily, EchoReply, Host, Result, SocketError, DEFAULT_PAYLOAD_SIZE, DEFAULT_TTL,
};
use pathbeat_network::IcmpSocket;

use crate::ping::build_request;

/// Tuning knobs for [`multiping`] and [`async_multiping`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipingOptions {
    /// Number of Echo Requests per destination.
    pub count: u32,
    /// Seconds between probes to the same destination.
    pub interval: f64,
    /// Seconds to wait for each individual probe.
    pub timeout: f64,
    /// Upper bound on probes in flight at once.
    pub concurrent_tasks: usize,
    pub source: Option<IpAddr>,
    pub privileged: bool,
    pub payload: Option<Vec<u8>>,
    pub payload_size: usize,
    pub ttl: u8,
    pub traffic_class: u8,
}

impl Default for MultipingOptions {
    fn default() -> Self {
        Self {
            count: 2,
            interval: 0.5,
            timeout: 2.0,
            concurrent_tasks: 50,
            source: None,
            privileged: true,
            payload: None,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            ttl: DEFAULT_TTL,
            traffic_class: 0,
        }
    }
}

struct Target {
    address: IpAddr,
    family: AddressFamily,
    identifier: u16,
    sent: u32,
    rtts: Vec<f64>,
    /// Earliest moment the next probe to this destination may go out.
    next_send: Instant,
}

struct Probe {
    target: usize,
    sent_at: Instant,
    expires: Instant,
}

/// Per-family scheduler state: one shared socket and the in-flight map.
struct Lane {
    family: AddressFamily,
    privileged: bool,
    socket: Option<IcmpSocket>,
    inflight: HashMap<(u16, u16), Probe>,
    /// Wrapping sequence counter, shared by every destination in this
    /// family so sequence numbers alone stay unique in flight.
    next_sequence: u16,
}

impl Lane {
    fn new(family: AddressFamily, privileged: bool) -> Self {
        Self {
            family,
            privileged,
            socket: None,
            inflight: HashMap::new(),
            next_sequence: 0,
        }
    }

    fn ensure_socket(&mut self, options: &MultipingOptions) -> Result<()> {
        if self.socket.is_none() {
            self.socket = Some(IcmpSocket::with_source(
                self.family,
                options.privileged,
                options.source,
            )?);
        }

        Ok(())
    }

    fn allocate_sequence(&mut self) -> u16 {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.wrapping_add(1);
        sequence
    }

    /// In-flight map key. The kernel owns identifiers on unprivileged
    /// sockets, so there correlation is by sequence alone.
    fn key(&self, identifier: u16, sequence: u16) -> (u16, u16) {
        if self.privileged {
            (identifier, sequence)
        } else {
            (0, sequence)
        }
    }

    fn reply_key(&self, reply: &EchoReply) -> (u16, u16) {
        self.key(reply.identifier, reply.sequence)
    }

    /// Drop probes whose deadline has passed; returns how many.
    fn expire(&mut self, now: Instant) -> usize {
        let before = self.inflight.len();
        self.inflight.retain(|_, probe| probe.expires > now);
        before - self.inflight.len()
    }

    fn close(&self) {
        if let Some(socket) = &self.socket {
            socket.close();
        }
    }
}

async fn lane_receive(
    socket: Option<&IcmpSocket>,
    timeout: Duration,
) -> std::result::Result<EchoReply, SocketError> {
    match socket {
        Some(socket) => socket.receive(timeout).await,
        // A lane without a socket never produces a reply
        None => std::future::pending().await,
    }
}

/// Ping many destinations concurrently.
///
/// Destinations must be IP addresses; resolve hostnames first. The
/// returned list is in the exact order of `addresses`.
pub async fn async_multiping(
    addresses: &[IpAddr],
    options: &MultipingOptions,
) -> Result<Vec<Host>> {
    if addresses.is_empty() {
        return Ok(Vec::new());
    }

    let interval = Duration::from_secs_f64(options.interval);
    let timeout = Duration::from_secs_f64(options.timeout);
    let base_identifier: u16 = rand::thread_rng().gen();

    let start = Instant::now();
    let mut targets: Vec<Target> = addresses
        .iter()
        .enumerate()
        .map(|(index, &address)| Target {
            address,
            family: AddressFamily::of(address),
            // One identifier per destination, wrapping modulo 2^16
            identifier: base_identifier.wrapping_add(index as u16),
            sent: 0,
            rtts: Vec::new(),
            next_send: start,
        })
        .collect();

    let mut v4 = Lane::new(AddressFamily::V4, options.privileged);
    let mut v6 = Lane::new(AddressFamily::V6, options.privileged);
    let mut inflight_total = 0usize;

    loop {
        let now = Instant::now();

        inflight_total -= v4.expire(now) + v6.expire(now);

        // Fill the window with due probes
        for index in 0..targets.len() {
            if inflight_total >= options.concurrent_tasks {
                break;
            }

            let target = &mut targets[index];
            if target.sent >= options.count || target.next_send > now {
                continue;
            }

            let lane = match target.family {
                AddressFamily::V4 => &mut v4,
                AddressFamily::V6 => &mut v6,
            };
            lane.ensure_socket(options)?;

            let sequence = lane.allocate_sequence();
            let key = lane.key(target.identifier, sequence);
            let mut request = build_request(
                target.address,
                target.identifier,
                sequence,
                options.ttl,
                options.traffic_class,
                &options.payload,
                options.payload_size,
            );

            let socket = lane.socket.as_ref().ok_or(SocketError::Unavailable)?;
            socket.send(&mut request).await?;

            let sent_at = request.send_time().unwrap_or_else(Instant::now);
            lane.inflight.insert(
                key,
                Probe {
                    target: index,
                    sent_at,
                    expires: sent_at + timeout,
                },
            );
            target.sent += 1;
            target.next_send = sent_at + interval;
            inflight_total += 1;
        }

        if inflight_total == 0 && targets.iter().all(|target| target.sent >= options.count) {
            break;
        }

        // Sleep until the nearest deadline: the next allowed send (only
        // relevant while the window has room) or the earliest probe
        // expiry.
        let mut wake: Option<Instant> = None;
        if inflight_total < options.concurrent_tasks {
            for target in &targets {
                if target.sent < options.count {
                    wake = Some(wake.map_or(target.next_send, |at| at.min(target.next_send)));
                }
            }
        }
        for probe in v4.inflight.values().chain(v6.inflight.values()) {
            wake = Some(wake.map_or(probe.expires, |at| at.min(probe.expires)));
        }
        let Some(wake) = wake else { break };

        let remaining = wake.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            continue;
        }

        let (family, received) = tokio::select! {
            received = lane_receive(v4.socket.as_ref(), remaining) => (AddressFamily::V4, received),
            received = lane_receive(v6.socket.as_ref(), remaining) => (AddressFamily::V6, received),
        };

        match received {
            Ok(reply) => {
                let lane = match family {
                    AddressFamily::V4 => &mut v4,
                    AddressFamily::V6 => &mut v6,
                };

                let key = lane.reply_key(&reply);
                if let Some(probe) = lane.inflight.remove(&key) {
                    inflight_total -= 1;
                    let target = &mut targets[probe.target];

                    if reply.is_echo_reply() {
                        let rtt = reply
                            .receive_time
                            .duration_since(probe.sent_at)
                            .as_secs_f64()
                            * 1000.0;
                        target.rtts.push(rtt);
                    } else {
                        // An ICMP error completes the probe with no RTT
                        debug!(address = %target.address, icmp_type = reply.icmp_type, "probe answered with an ICMP error");
                    }
                }
                // Replies matching nothing in flight are discarded
            }
            // The wait reached the deadline; loop to expire and resend
            Err(SocketError::Timeout(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }

    v4.close();
    v6.close();

    Ok(targets
        .into_iter()
        .map(|target| Host::new(target.address, target.sent, target.rtts))
        .collect())
}

/// Blocking variant of [`async_multiping`].
pub fn multiping(addresses: &[IpAddr], options: &MultipingOptions) -> Result<Vec<Host>> {
    crate::runtime::block_on(async_multiping(addresses, options))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = MultipingOptions::default();
        assert_eq!(options.count, 2);
        assert_eq!(options.concurrent_tasks, 50);
        assert!(options.privileged);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let hosts = async_multiping(&[], &MultipingOptions::default())
            .await
            .unwrap();
        assert!(hosts.is_empty());
    }

    #[test]
    fn test_lane_keying() {
        let privileged = Lane::new(AddressFamily::V4, true);
        assert_eq!(privileged.key(7, 3), (7, 3));

        let unprivileged = Lane::new(AddressFamily::V4, false);
        assert_eq!(unprivileged.key(7, 3), (0, 3));
    }

    #[test]
    fn test_lane_sequences_wrap() {
        let mut lane = Lane::new(AddressFamily::V4, true);
        lane.next_sequence = u16::MAX;
        assert_eq!(lane.allocate_sequence(), u16::MAX);
        assert_eq!(lane.allocate_sequence(), 0);
    }
}
