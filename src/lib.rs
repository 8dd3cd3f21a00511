//! # Kadmos
//!
//! Kademlia peer discovery for an overlay network of authenticated nodes
//! communicating over UDP.
//!
//! Every node derives its 224-bit id from its Ed25519 public key and signs
//! every response it sends, so a routing table entry is only ever learned
//! from a peer that proved possession of the key behind its id. On top of
//! the signed RPC layer the crate provides:
//!
//! - [Dht::bootstrap]: joining the network from a single known peer,
//!   including a self-reachability probe for the announced public port.
//! - [Dht::lookup]: locating the K closest nodes to a target id with
//!   parallel disjoint lookup paths and majority filtering of the results.
//! - A request handler serving `FindNode` and `Ping` while defending the
//!   routing table against eclipse and poisoning attempts.
//! - Periodic routing table maintenance that verifies liveness of
//!   unresponsive nodes and refills evicted slots from a replacement cache.

mod common;
mod error;

pub mod dht;
pub mod rpc;

pub use crate::common::{Distance, Node, PeerId, RoutingTable, RpcId};
pub use crate::rpc::Config;
pub use dht::Dht;
pub use error::Error;

/// Alias Result to be the crate Result.
pub type Result<T, E = error::Error> = core::result::Result<T, E>;
