//! Per-peer diagnostic log file
//!
//! When a peer is built with diagnostics enabled, startup routes the
//! process's `tracing` events into a file named after the peer's own
//! listen endpoint (`127.0.0.1:9001.log`). The subscriber is installed
//! with `try_init`, so if the embedding application (or an earlier peer in
//! the same process) already configured one, the existing subscriber wins
//! and this peer's events simply flow there.

use crate::endpoint::Endpoint;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Route tracing output to `<ip>:<port>.log` in the working directory
///
/// Returns the appender's worker guard on success; the caller must keep it
/// alive for as long as log lines should be flushed. Returns `None` when a
/// global subscriber is already installed.
pub fn init_peer_log(endpoint: &Endpoint) -> Option<WorkerGuard> {
    let appender = tracing_appender::rolling::never(".", format!("{endpoint}.log"));
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let installed = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .is_ok();

    if installed {
        Some(guard)
    } else {
        tracing::debug!(
            "a tracing subscriber is already installed; {} keeps using it",
            endpoint
        );
        None
    }
}
