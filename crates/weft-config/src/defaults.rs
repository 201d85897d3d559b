//! Built-in values used when the embedding application supplies none.

use std::collections::BTreeMap;

use crate::ServerLaunch;

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Wall-clock quantum between content coordinator drain cycles.
pub const DEFAULT_DRAIN_QUANTUM_MS: u64 = 250;

/// Budget for each step of a graceful server shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2_000;

/// Budget for the `initialize` handshake.
pub const DEFAULT_INITIALIZE_TIMEOUT_MS: u64 = 10_000;

/// Budget for ordinary requests.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Queue length at which a coordinator drains early instead of waiting for
/// the next quantum.
pub const DEFAULT_MAX_PENDING_EDITS: usize = 1_024;

/// Entries retained per server response cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Largest frame body accepted from a server before the stream is treated
/// as corrupt.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Consecutive malformed frames tolerated before an instance is torn down.
pub const DEFAULT_MAX_PROTOCOL_ERRORS: u32 = 8;

/// Launch table for the servers the host knows how to start out of the box.
///
/// Each entry expects the executable to be available on `PATH`.
#[must_use]
pub fn default_servers() -> BTreeMap<String, ServerLaunch> {
    [
        ("rust", ServerLaunch::new("rust-analyzer")),
        ("python", ServerLaunch::new("pyrefly").with_args(["lsp"])),
        ("typescript", ServerLaunch::new("tsgo").with_args(["--lsp"])),
    ]
    .into_iter()
    .map(|(language, launch)| (language.to_owned(), launch))
    .collect()
}
