//! Constants and default values for the subsystem runtime.
//!
//! Collects the timeouts and pool sizes used whenever a caller does not
//! supply its own.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

// ============================================================================
// Bounded waits
// ============================================================================

/// Wait applied when a caller does not supply a timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long an idle worker blocks on the queue before re-checking termination.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often the echo acceptor re-checks termination when no client connects.
pub const DEFAULT_ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Read timeout applied to each accepted connection.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded wait the binary grants the tree to unwind after a shutdown request.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ============================================================================
// Pools and queues
// ============================================================================

/// Worker pool size used when the configuration does not name one.
pub const DEFAULT_WORKERS: usize = 4;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration file looked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "subsysd.yaml";

/// Only supported configuration schema version.
pub const CONFIG_VERSION: &str = "1";

/// Listen address used when the configuration omits one.
pub const DEFAULT_LISTEN: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7878));

/// Root subsystem name used when the configuration omits one.
pub const DEFAULT_SERVER_NAME: &str = "echo";
