//! Daemon Core - the registry server process
//!
//! The daemon:
//! - Owns the work registry on a single dispatcher task
//! - Serves the control channel, forwarding each request to the dispatcher
//! - Periodically releases stale claims

pub mod dispatcher;
pub mod tick;

pub use dispatcher::*;
pub use tick::*;

use std::sync::Arc;

use log::info;

use crate::error::{ClaimrError, Result};
use crate::ipc::IpcServer;
use crate::registry::WorkRegistry;

/// Run `daemon` behind `server` until the server's shutdown token is cancelled.
///
/// Returns the registry as it stood when the dispatcher stopped.
pub async fn serve(daemon: Daemon, server: IpcServer) -> Result<WorkRegistry> {
    let (handle, join) = daemon.spawn();
    let served = server.run(Arc::new(handle.clone())).await;

    handle.shutdown().await;
    let registry = join
        .await
        .map_err(|e| ClaimrError::Ipc(format!("Dispatcher task failed: {}", e)))?;
    served?;

    let counts = registry.counts();
    info!(
        "server stopped pending={} claimed={} done={}",
        counts.pending, counts.claimed, counts.done
    );
    Ok(registry)
}
