//! Linux capabilities probing
//!
//! Lets callers decide up front whether privileged (raw socket) mode is
//! available to the process.

use std::io;

#[cfg(target_os = "linux")]
use caps::{CapSet, Capability};

/// Check if the process has the CAP_NET_RAW capability
pub fn has_net_raw() -> io::Result<bool> {
    #[cfg(target_os = "linux")]
    {
        has_capability(Capability::CAP_NET_RAW)
    }
    #[cfg(not(target_os = "linux"))]
    {
        // On non-Linux (e.g. macOS), we can't check capabilities.
        // We assume true, and let the socket creation fail if permission denied.
        Ok(true)
    }
}

/// Check if the process has a specific capability
#[cfg(target_os = "linux")]
pub fn has_capability(cap: Capability) -> io::Result<bool> {
    let effective =
        caps::read(None, CapSet::Effective).map_err(|e| io::Error::other(e.to_string()))?;
    Ok(effective.contains(&cap))
}
