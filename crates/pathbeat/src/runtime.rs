//! Blocking entry points into the async engines

use std::future::Future;

use pathbeat_common::{Result, SocketError};

/// Run an async engine to completion on a private current-thread
/// runtime. Must not be called from inside an existing Tokio runtime.
pub(crate) fn block_on<T>(future: impl Future<Output = Result<T>>) -> Result<T> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(SocketError::Io)?;

    runtime.block_on(future)
}
