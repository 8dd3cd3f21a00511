//! Joining the network from a single known peer.

use std::net::SocketAddrV4;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::common::{PeerId, Request};
use crate::rpc::{lookup, Rpc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BootstrapState {
    /// No successful bootstrap yet, and nobody is working on one.
    Needed,
    /// Exactly one caller is running the join protocol.
    InProgress,
    Done,
}

/// Shared bootstrap state cell.
///
/// State acquisition deliberately happens in two separate atomic steps
/// (see [BootstrapCell::reset_if_done] and [BootstrapCell::acquire]): a
/// single atomic step cannot simultaneously wait for an ongoing bootstrap
/// and re-bootstrap a completed one.
pub(crate) struct BootstrapCell {
    state: Mutex<BootstrapState>,
    changed: Condvar,
}

impl BootstrapCell {
    pub fn new() -> Self {
        BootstrapCell {
            state: Mutex::new(BootstrapState::Needed),
            changed: Condvar::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        *self.state.lock().expect("poisoned") == BootstrapState::Done
    }

    /// First acquisition step: a completed bootstrap means this call is a
    /// re-bootstrap request, so flip the cell back to [BootstrapState::Needed].
    fn reset_if_done(&self) {
        let mut state = self.state.lock().expect("poisoned");
        if *state == BootstrapState::Done {
            *state = BootstrapState::Needed;
        }
    }

    /// Second acquisition step: wait while another caller is bootstrapping,
    /// then either claim ownership (`true`) or observe that someone else
    /// finished the job meanwhile (`false`).
    fn acquire(&self) -> bool {
        let mut state = self.state.lock().expect("poisoned");
        loop {
            match *state {
                BootstrapState::InProgress => {
                    state = self.changed.wait(state).expect("poisoned");
                }
                BootstrapState::Done => return false,
                BootstrapState::Needed => {
                    *state = BootstrapState::InProgress;
                    return true;
                }
            }
        }
    }

    pub(crate) fn set(&self, next: BootstrapState) {
        let mut state = self.state.lock().expect("poisoned");
        *state = next;
        self.changed.notify_all();
    }
}

/// Join the network through `initial_peer`. Returns `true` iff the node is
/// bootstrapped when the call returns.
///
/// Concurrent callers coordinate through the state cell: one becomes the
/// owner, the rest block and adopt its outcome. Any early exit of the owner
/// rolls the cell back to [BootstrapState::Needed] and restores the
/// announced public port.
pub(crate) fn bootstrap(rpc: &Arc<Rpc>, initial_peer: SocketAddrV4) -> bool {
    rpc.bootstrap.reset_if_done();

    if !rpc.bootstrap.acquire() {
        // Another caller completed a bootstrap while we waited.
        return true;
    }

    let port_snapshot = *rpc.public_port.lock().expect("poisoned");

    // From here on we own the InProgress claim. The guard releases it and
    // restores the port on every exit path, including a panic unwinding out
    // of a lookup; it is defused only once the join succeeded.
    let mut rollback = RollbackGuard {
        rpc,
        port_snapshot,
        armed: true,
    };

    // Self-reachability probe, concurrent with the plain ping below. It
    // shares the initial peer but has its own outcome: failure withdraws
    // the announced port without failing the bootstrap.
    let probe = port_snapshot.map(|port| {
        let rpc = rpc.clone();
        thread::spawn(move || reachability_probe(&rpc, initial_peer, port))
    });

    let joined = join_through(rpc, initial_peer);

    // The probe is never cancelled; wait it out so the announced port is
    // settled before we report the join finished.
    if let Some(handle) = probe {
        let _ = handle.join();
    }

    if joined {
        rollback.armed = false;
        rpc.bootstrap.set(BootstrapState::Done);
    }

    joined
}

/// Ping the initial peer, and on success populate the routing table: the
/// peer itself, then our own neighborhood via a self-lookup, then the far
/// half of the id space via a lookup on a random id with a flipped bit 0.
fn join_through(rpc: &Arc<Rpc>, initial_peer: SocketAddrV4) -> bool {
    let Some((node, _)) = rpc
        .socket
        .send_request_sync(Request::Ping { return_port: None }, initial_peer)
    else {
        debug!(?initial_peer, "Initial peer did not answer, bootstrap failed");
        return false;
    };

    rpc.routing_table
        .lock()
        .expect("poisoned")
        .insert_unchecked(node);

    lookup::peer_lookup(rpc, rpc.id);
    lookup::peer_lookup(rpc, PeerId::random_in_half(!rpc.id.bit(0)));

    debug!(
        table_size = rpc.routing_table_size(),
        "Populated the routing table"
    );

    true
}

fn reachability_probe(rpc: &Arc<Rpc>, initial_peer: SocketAddrV4, port: u16) {
    match rpc.socket.send_request_sync(
        Request::Ping {
            return_port: Some(port),
        },
        initial_peer,
    ) {
        Some(_) => debug!(port, "Announced public port is reachable"),
        None => {
            warn!(
                port,
                "Announced public port is not reachable from the network, withdrawing it"
            );
            *rpc.public_port.lock().expect("poisoned") = None;
        }
    }
}

struct RollbackGuard<'a> {
    rpc: &'a Rpc,
    port_snapshot: Option<u16>,
    armed: bool,
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.rpc.public_port.lock().expect("poisoned") = self.port_snapshot;
            self.rpc.bootstrap.set(BootstrapState::Needed);
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn cell_starts_needed() {
        let cell = BootstrapCell::new();
        assert!(!cell.is_done());
        assert!(cell.acquire());
    }

    #[test]
    fn acquire_blocks_until_owner_finishes() {
        let cell = Arc::new(BootstrapCell::new());
        assert!(cell.acquire());

        let waiter = {
            let cell = cell.clone();
            thread::spawn(move || cell.acquire())
        };

        // The waiter must not claim ownership while we hold it.
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        cell.set(BootstrapState::Done);

        // Owner finished: the waiter adopts the outcome instead of
        // re-running the join.
        assert!(!waiter.join().unwrap());
        assert!(cell.is_done());
    }

    #[test]
    fn failed_owner_hands_over_to_a_waiter() {
        let cell = Arc::new(BootstrapCell::new());
        assert!(cell.acquire());

        let waiter = {
            let cell = cell.clone();
            thread::spawn(move || cell.acquire())
        };

        cell.set(BootstrapState::Needed);

        // The failure wakes the waiter as the next owner.
        assert!(waiter.join().unwrap());
        assert!(!cell.is_done());
    }

    #[test]
    fn reset_only_touches_done() {
        let cell = BootstrapCell::new();

        cell.reset_if_done();
        assert!(cell.acquire());

        cell.set(BootstrapState::Done);
        cell.reset_if_done();
        assert!(!cell.is_done());
    }
}
