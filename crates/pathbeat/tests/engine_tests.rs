//! End-to-end engine tests against loopback and TEST-NET-1.
//!
//! Environments differ in what they allow: unprivileged ICMP sockets
//! may be disabled (ping_group_range) and routes to TEST-NET-1 may be
//! missing. Tests that depend on such access skip themselves instead
//! of failing.

use pathbeat::{
    async_multiping, async_ping, AddressFamily, Error, IcmpSocket, MultipingOptions, PingOptions,
    SocketError,
};
use std::net::IpAddr;

/// Whether this environment lets us open an unprivileged ICMP socket.
fn icmp_allowed(family: AddressFamily) -> bool {
    IcmpSocket::new(family, false).is_ok()
}

fn fast_ping_options() -> PingOptions {
    PingOptions {
        count: 4,
        interval: 0.1,
        timeout: 1.0,
        privileged: false,
        ..PingOptions::default()
    }
}

#[tokio::test]
async fn test_loopback_ping_v4() {
    if !icmp_allowed(AddressFamily::V4) {
        println!("Skipping test: unprivileged ICMP sockets unavailable");
        return;
    }

    let host = async_ping("127.0.0.1", &fast_ping_options()).await.unwrap();

    assert_eq!(host.address(), "127.0.0.1".parse::<IpAddr>().unwrap());
    assert_eq!(host.packets_sent(), 4);
    assert_eq!(host.packets_received(), 4);
    assert_eq!(host.rtts().len(), 4);
    assert_eq!(host.packet_loss(), 0.0);
    assert!(host.is_alive());
    assert!(host.min_rtt() <= host.avg_rtt() && host.avg_rtt() <= host.max_rtt());
}

#[tokio::test]
async fn test_loopback_ping_v6() {
    if !icmp_allowed(AddressFamily::V6) {
        println!("Skipping test: unprivileged ICMPv6 sockets unavailable");
        return;
    }

    let options = PingOptions {
        count: 2,
        ..fast_ping_options()
    };
    let host = async_ping("::1", &options).await.unwrap();

    assert_eq!(host.address(), "::1".parse::<IpAddr>().unwrap());
    assert_eq!(host.packets_sent(), 2);
    assert!(host.is_alive());
}

#[tokio::test]
async fn test_unreachable_host() {
    if !icmp_allowed(AddressFamily::V4) {
        println!("Skipping test: unprivileged ICMP sockets unavailable");
        return;
    }

    // TEST-NET-1 never answers
    let options = PingOptions {
        count: 3,
        interval: 0.1,
        timeout: 0.2,
        privileged: false,
        ..PingOptions::default()
    };

    match async_ping("192.0.2.1", &options).await {
        Ok(host) => {
            assert_eq!(host.packets_sent(), 3);
            assert_eq!(host.packets_received(), 0);
            assert_eq!(host.packet_loss(), 1.0);
            assert!(!host.is_alive());
        }
        // No route to TEST-NET-1 in this environment
        Err(Error::Socket(SocketError::Io(err))) => {
            println!("Skipping test: cannot send to TEST-NET-1 ({err})");
        }
        Err(err) => panic!("unexpected error: {err}"),
    }
}

#[tokio::test]
async fn test_multiping_preserves_input_order() {
    if !icmp_allowed(AddressFamily::V4) {
        println!("Skipping test: unprivileged ICMP sockets unavailable");
        return;
    }

    let addresses: Vec<IpAddr> = ["127.0.0.1", "192.0.2.1", "127.0.0.1"]
        .iter()
        .map(|address| address.parse().unwrap())
        .collect();

    let options = MultipingOptions {
        count: 2,
        interval: 0.05,
        timeout: 0.5,
        concurrent_tasks: 2,
        privileged: false,
        ..MultipingOptions::default()
    };

    match async_multiping(&addresses, &options).await {
        Ok(hosts) => {
            assert_eq!(hosts.len(), 3);
            for (host, address) in hosts.iter().zip(&addresses) {
                assert_eq!(host.address(), *address);
                assert_eq!(host.packets_sent(), 2);
            }
            assert!(hosts[0].is_alive());
            assert!(!hosts[1].is_alive());
            assert!(hosts[2].is_alive());
        }
        Err(Error::Socket(SocketError::Io(err))) => {
            println!("Skipping test: cannot send to TEST-NET-1 ({err})");
        }
        Err(err) => panic!("unexpected error: {err}"),
    }
}

#[tokio::test]
async fn test_resolution_failure_surfaces() {
    let result = async_ping("definitely-not-a-real-host.invalid", &fast_ping_options()).await;
    assert!(matches!(result, Err(Error::NameLookup(_))));
}

#[test]
fn test_blocking_api_smoke() {
    if !icmp_allowed(AddressFamily::V4) {
        println!("Skipping test: unprivileged ICMP sockets unavailable");
        return;
    }

    let options = PingOptions {
        count: 1,
        timeout: 1.0,
        privileged: false,
        ..PingOptions::default()
    };
    let host = pathbeat::ping("127.0.0.1", &options).unwrap();
    assert_eq!(host.packets_sent(), 1);
}
