//! Signed Kademlia RPC node: shared state and the socket I/O loop.

mod bootstrap;
mod config;
mod lookup;
mod maintenance;
mod server;
mod socket;

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ed25519_dalek::SigningKey;
use tracing::info;

use crate::common::{Message, Node, PeerId, RoutingTable};
use crate::Result;

pub use config::*;

use bootstrap::BootstrapCell;
use socket::RpcSocket;

/// A discovery node: identity, socket, routing table and join state.
///
/// All methods take `&self` and may be called from any thread; the
/// [Dht](crate::Dht) handle owns the I/O and maintenance threads that keep
/// an `Rpc` alive, but embedders can drive [Rpc::run] themselves for a
/// custom setup.
pub struct Rpc {
    pub(crate) config: Config,
    pub(crate) id: PeerId,
    pub(crate) socket: RpcSocket,
    pub(crate) routing_table: Mutex<RoutingTable>,
    pub(crate) bootstrap: BootstrapCell,
    /// The UDP port this node announces as publicly reachable, if any.
    /// Cleared when the bootstrap self-reachability probe fails.
    pub(crate) public_port: Mutex<Option<u16>>,
}

impl Rpc {
    /// Create a new Rpc node, binding its UDP socket and deriving its id
    /// from the configured (or a freshly generated) Ed25519 key.
    pub fn new(config: Config) -> Result<Rpc> {
        let signer = match config.signing_key {
            Some(seed) => SigningKey::from_bytes(&seed),
            None => {
                let mut seed = [0u8; 32];
                getrandom::getrandom(&mut seed).map_err(std::io::Error::from)?;
                SigningKey::from_bytes(&seed)
            }
        };

        let id = PeerId::from_public_key(&signer.verifying_key());
        let socket = RpcSocket::new(&config, signer)?;

        info!(?id, address = ?socket.local_addr(), "Starting discovery node");

        Ok(Rpc {
            id,
            routing_table: Mutex::new(
                RoutingTable::new(id)
                    .with_bucket_size(config.k)
                    .with_branch_depth(config.b),
            ),
            bootstrap: BootstrapCell::new(),
            public_port: Mutex::new(config.public_port),
            socket,
            config,
        })
    }

    // === Getters ===

    /// Returns this node's id.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Returns the address the socket is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    /// The currently announced public port, if any.
    pub fn public_port(&self) -> Option<u16> {
        *self.public_port.lock().expect("poisoned")
    }

    /// Returns a snapshot of the routing table.
    pub fn routing_table(&self) -> RoutingTable {
        self.routing_table.lock().expect("poisoned").clone()
    }

    /// Returns the number of nodes in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table.lock().expect("poisoned").size()
    }

    // === Public Methods ===

    /// Join the network through `initial_peer`.
    ///
    /// Returns `true` iff this node is bootstrapped when the call returns.
    /// See [crate::Dht::bootstrap].
    pub fn bootstrap(self: &Arc<Self>, initial_peer: SocketAddrV4) -> bool {
        bootstrap::bootstrap(self, initial_peer)
    }

    /// Locate up to K live nodes close to `target`.
    /// See [crate::Dht::lookup].
    pub fn lookup(self: &Arc<Self>, target: PeerId) -> Vec<Node> {
        lookup::peer_lookup(self, target)
    }

    /// Run one routing table maintenance pass: probe entries with
    /// unanswered requests and replace the dead from the bucket caches.
    pub fn maintain(self: &Arc<Self>) {
        maintenance::maintain(self)
    }

    /// Drive the socket until `shutdown` is flagged: expire overdue
    /// requests, receive packets, serve requests and dispatch responses to
    /// their waiting handlers.
    pub fn run(self: &Arc<Self>, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            self.socket.purge_expired();

            if let Some((message, from)) = self.socket.recv_from() {
                match message {
                    Message::Request { rpc_id, request } => {
                        server::handle_request(self, from, rpc_id, request);
                    }
                    Message::Response {
                        rpc_id,
                        public_key,
                        signature,
                        payload,
                    } => {
                        self.socket.deliver(from, rpc_id, &public_key, &signature, payload);
                    }
                }
            }
        }
    }
}
