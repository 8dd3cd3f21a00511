//! Dht node handle.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::common::{Node, PeerId, RoutingTable};
use crate::rpc::{Config, Rpc};
use crate::Result;

/// A running discovery node.
///
/// Owns the socket I/O thread and the maintenance timer. Clones share the
/// same underlying node; [Dht::shutdown] stops it.
pub struct Dht {
    rpc: Arc<Rpc>,
    shutdown: Arc<AtomicBool>,
    maintenance_wake: flume::Sender<()>,
    handles: Option<(JoinHandle<()>, JoinHandle<()>)>,
}

impl Clone for Dht {
    fn clone(&self) -> Self {
        Dht {
            rpc: self.rpc.clone(),
            shutdown: self.shutdown.clone(),
            maintenance_wake: self.maintenance_wake.clone(),
            handles: None,
        }
    }
}

impl Dht {
    /// Create a new Dht node with the default [Config].
    pub fn new() -> Result<Dht> {
        Dht::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Dht> {
        let interval = config.maintenance_interval;
        let rpc = Arc::new(Rpc::new(config)?);
        let shutdown = Arc::new(AtomicBool::new(false));

        let io_handle = {
            let rpc = rpc.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || rpc.run(&shutdown))
        };

        let (maintenance_wake, wake_receiver) = flume::bounded::<()>(1);
        let maintenance_handle = {
            let rpc = rpc.clone();
            thread::spawn(move || loop {
                match wake_receiver.recv_timeout(interval) {
                    // Woken up: we are shutting down.
                    Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
                    Err(flume::RecvTimeoutError::Timeout) => rpc.maintain(),
                }
            })
        };

        Ok(Dht {
            rpc,
            shutdown,
            maintenance_wake,
            handles: Some((io_handle, maintenance_handle)),
        })
    }

    // === Getters ===

    /// Returns this node's id.
    pub fn id(&self) -> PeerId {
        self.rpc.id()
    }

    /// Returns the address the node is listening to.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.rpc.local_addr()
    }

    /// The currently announced public port, if any. Cleared when the
    /// bootstrap self-reachability probe found it unreachable.
    pub fn public_port(&self) -> Option<u16> {
        self.rpc.public_port()
    }

    /// Returns a snapshot of the routing table.
    pub fn routing_table(&self) -> RoutingTable {
        self.rpc.routing_table()
    }

    /// Returns the number of nodes in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.rpc.routing_table_size()
    }

    /// Export the addresses of all tracked nodes, usable as initial peers
    /// for other nodes.
    pub fn to_bootstrap(&self) -> Vec<String> {
        self.rpc
            .routing_table()
            .nodes()
            .iter()
            .map(|node| node.address().to_string())
            .collect()
    }

    // === Public Methods ===

    /// Join the network through `initial_peer`.
    ///
    /// Safe to call from several threads at once: one caller runs the join
    /// protocol, the others wait and adopt its outcome. Returns `true` iff
    /// the node is bootstrapped when the call returns; on failure every
    /// side effect is rolled back, so the call can simply be retried.
    pub fn bootstrap(&self, initial_peer: SocketAddrV4) -> bool {
        self.rpc.bootstrap(initial_peer)
    }

    /// Locate up to K nodes believed live and close to `target`.
    ///
    /// Runs alpha parallel disjoint lookup paths and returns only nodes a
    /// strict majority of them agreed on, closest first.
    pub fn lookup(&self, target: PeerId) -> Vec<Node> {
        self.rpc.lookup(target)
    }

    /// Stop the node's threads. Only the handle created by
    /// [Dht::with_config] owns them; on clones this just flags the
    /// shutdown.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.maintenance_wake.try_send(());

        if let Some((io, maintenance)) = self.handles.take() {
            let _ = io.join();
            let _ = maintenance.join();
        }
    }
}
