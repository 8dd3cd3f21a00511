use std::time::Duration;

use crate::common::{DEFAULT_BRANCH_DEPTH_B, DEFAULT_BUCKET_SIZE_K};

/// Default per-request deadline before an inflight request is failed.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Default cadence of the routing table maintenance pass.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Default concurrency width of lookup rounds, and the number of disjoint
/// lookup paths.
pub const DEFAULT_ALPHA: usize = 3;

/// Default number of consecutive unanswered requests before a node becomes
/// an eviction candidate.
pub const DEFAULT_MAX_TIMEOUTS: u32 = 3;

#[derive(Debug, Clone)]
/// Node configuration.
pub struct Config {
    /// Concurrency width per lookup round; also the number of disjoint
    /// lookup paths.
    ///
    /// Defaults to [DEFAULT_ALPHA].
    pub alpha: usize,
    /// Bucket size and lookup result width.
    ///
    /// Defaults to [DEFAULT_BUCKET_SIZE_K].
    pub k: usize,
    /// Maximum depth of routing tree branches that do not contain this
    /// node's own id.
    ///
    /// Defaults to [DEFAULT_BRANCH_DEPTH_B].
    pub b: usize,
    /// Consecutive unanswered requests before a node may be evicted.
    ///
    /// Defaults to [DEFAULT_MAX_TIMEOUTS].
    pub max_timeouts: u32,
    /// Deadline for a single request/response exchange.
    ///
    /// The longer this duration is, the longer lookups take on an
    /// unreliable network; the shorter it is, the more answers from busy
    /// but correct nodes are counted as failures.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT].
    pub request_timeout: Duration,
    /// Cadence at which unresponsive routing table entries are probed and
    /// possibly replaced from the bucket caches.
    ///
    /// Defaults to [DEFAULT_MAINTENANCE_INTERVAL].
    pub maintenance_interval: Duration,
    /// Explicit UDP port to bind.
    ///
    /// Defaults to None, binding an ephemeral port.
    pub port: Option<u16>,
    /// Publicly reachable UDP port to announce to other nodes.
    ///
    /// Cleared during bootstrap if the initial peer cannot reach us back on
    /// it. Defaults to None (this node does not claim to be reachable).
    pub public_port: Option<u16>,
    /// Ed25519 secret key seed this node's identity is derived from.
    ///
    /// Defaults to None, generating a fresh random key.
    pub signing_key: Option<[u8; 32]>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            k: DEFAULT_BUCKET_SIZE_K,
            b: DEFAULT_BRANCH_DEPTH_B,
            max_timeouts: DEFAULT_MAX_TIMEOUTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            port: None,
            public_port: None,
            signing_key: None,
        }
    }
}
