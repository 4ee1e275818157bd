//! Traceroute engine
//!
//! Varies the time-to-live of outgoing Echo Requests to elicit Time
//! Exceeded responses from the gateways along the path, stopping once
//! the destination itself answers. Requires privileged (raw) sockets.

use std::net::IpAddr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pathbeat_common::{
    AddressFamily, Hop, Host, IcmpError, Result, DEFAULT_PAYLOAD_SIZE,
};
use pathbeat_network::IcmpSocket;

use crate::ping::{await_matching_reply, build_request};
use crate::resolve::async_resolve;

/// Tuning knobs for [`traceroute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerouteOptions {
    /// Probes per hop. With `fast`, a maximum rather than a requirement.
    pub count: u32,
    /// Seconds between probes at the same TTL.
    pub interval: f64,
    /// Seconds to wait for each probe.
    pub timeout: f64,
    /// Identifier for outgoing requests; random when absent.
    pub identifier: Option<u16>,
    pub source: Option<IpAddr>,
    /// Address family; resolution prefers IPv4 when absent.
    pub family: Option<AddressFamily>,
    /// TTL of the first probe.
    pub first_hop: u8,
    /// Largest TTL to try before giving up.
    pub max_hops: u8,
    /// Move on to the next TTL as soon as a gateway answers.
    pub fast: bool,
    pub payload: Option<Vec<u8>>,
    pub payload_size: usize,
    pub traffic_class: u8,
}

impl Default for TracerouteOptions {
    fn default() -> Self {
        Self {
            count: 2,
            interval: 0.05,
            timeout: 2.0,
            identifier: None,
            source: None,
            family: None,
            first_hop: 1,
            max_hops: 30,
            fast: false,
            payload: None,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            traffic_class: 0,
        }
    }
}

/// Determine the route to a destination host.
///
/// Returns the responding gateways ordered by strictly increasing
/// distance; silent hops are omitted. The last hop's address equals the
/// destination exactly when it was reached within `max_hops`.
pub fn traceroute(address: &str, options: &TracerouteOptions) -> Result<Vec<Hop>> {
    crate::runtime::block_on(traceroute_inner(address, options))
}

async fn traceroute_inner(address: &str, options: &TracerouteOptions) -> Result<Vec<Hop>> {
    let mut resolved = async_resolve(address, options.family).await?;
    let destination = resolved.remove(0);
    let family = AddressFamily::of(destination);

    // Time Exceeded observation needs a raw socket
    let socket = IcmpSocket::with_source(family, true, options.source)?;
    let identifier = options
        .identifier
        .unwrap_or_else(|| rand::thread_rng().gen());
    let timeout = Duration::from_secs_f64(options.timeout);
    let interval = Duration::from_secs_f64(options.interval);

    let mut hops = Vec::new();
    let mut destination_reached = false;
    let mut sequence: u16 = 0;

    for distance in options.first_hop..=options.max_hops {
        if destination_reached {
            break;
        }

        let mut responder: Option<IpAddr> = None;
        let mut rtts = Vec::new();
        let mut probes_sent = 0u32;

        for attempt in 0..options.count {
            let mut request = build_request(
                destination,
                identifier,
                sequence,
                distance,
                options.traffic_class,
                &options.payload,
                options.payload_size,
            );
            sequence = sequence.wrapping_add(1);

            socket.send(&mut request).await?;
            probes_sent += 1;

            if let Some(reply) = await_matching_reply(&socket, &request, timeout).await? {
                let rtt = request
                    .send_time()
                    .map(|sent| reply.receive_time.duration_since(sent).as_secs_f64() * 1000.0);

                match reply.raise_for_status() {
                    // The destination answered: the route is complete
                    Ok(()) => {
                        responder.get_or_insert(reply.source);
                        rtts.extend(rtt);
                        destination_reached = true;
                    }
                    // A gateway on the path decremented the TTL to zero
                    Err(IcmpError::TimeExceeded(_)) => {
                        // Fold multi-path responders into the first one
                        responder.get_or_insert(reply.source);
                        rtts.extend(rtt);
                        if reply.source == destination {
                            destination_reached = true;
                        }
                    }
                    // Unreachable and friends from the destination still
                    // mean the probe got all the way there
                    Err(_) => {
                        if reply.source == destination {
                            responder.get_or_insert(reply.source);
                            rtts.extend(rtt);
                            destination_reached = true;
                        } else {
                            debug!(distance, source = %reply.source, icmp_type = reply.icmp_type, "discarding ICMP error from mid-path");
                        }
                    }
                }
            }

            if destination_reached || (options.fast && responder.is_some()) {
                break;
            }

            if attempt + 1 < options.count {
                tokio::time::sleep(interval).await;
            }
        }

        if let Some(address) = responder {
            hops.push(Hop::new(distance, Host::new(address, probes_sent, rtts)));
        }
    }

    socket.close();

    Ok(hops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = TracerouteOptions::default();
        assert_eq!(options.first_hop, 1);
        assert_eq!(options.max_hops, 30);
        assert_eq!(options.count, 2);
        assert!(!options.fast);
    }
}
