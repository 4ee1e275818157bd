//! Common types and utilities for pathbeat
//!
//! This crate provides the functionality shared across all pathbeat
//! components:
//! - Probe and reply descriptors (`EchoRequest`, `EchoReply`)
//! - Measurement aggregates with lazy statistics (`Host`, `Hop`)
//! - The error taxonomy

pub mod error;
pub mod types;

pub use error::{Error, IcmpError, Result, SocketError};
pub use types::{
    AddressFamily, EchoReply, EchoRequest, Hop, Host, DEFAULT_PAYLOAD_SIZE, DEFAULT_TTL,
};

/// Version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
