//! Iterative peer lookup over parallel disjoint paths.
//!
//! A lookup runs D = alpha independent iterative paths. The paths share a
//! single claimed-nodes map, so no node is ever queried twice by the same
//! lookup, which keeps the paths disjoint: an adversary answering on one
//! path cannot steer the others. The final result only keeps nodes that a
//! strict majority of paths agreed on.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::debug;

use crate::common::{Distance, Node, PeerId, Request, ResponsePayload};
use crate::rpc::socket::Reply;
use crate::rpc::Rpc;

/// Replies fed back into one lookup path, in arrival order.
enum PathEvent {
    /// A queried node answered with its closest known nodes.
    Found(Node, Vec<Node>),
    /// The query keyed by this distance failed.
    Failed(Distance, Node),
}

/// Locate up to K nodes believed live and near `target`.
pub(crate) fn peer_lookup(rpc: &Arc<Rpc>, target: PeerId) -> Vec<Node> {
    let k = rpc.config.k;
    let paths = rpc.config.alpha.max(1);

    let seeds = rpc
        .routing_table
        .lock()
        .expect("poisoned")
        .closest(k, &target);

    // Round-robin partition of the seeds into disjoint starting sets of
    // roughly equal size, one per path.
    let mut partitions: Vec<Vec<Node>> = vec![Vec::new(); paths];
    for (i, node) in seeds.into_iter().enumerate() {
        partitions[i % paths].push(node);
    }

    let queried = Mutex::new(BTreeMap::new());
    let queried = &queried;

    let results: Vec<Vec<Node>> = thread::scope(|scope| {
        let handles: Vec<_> = partitions
            .into_iter()
            .map(|seeds| scope.spawn(move || lookup_path(rpc, target, seeds, queried)))
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().expect("lookup path panicked"))
            .collect()
    });

    let found = majority_filter(results, &target, k);

    debug!(?target, found = found.len(), "Lookup finished");

    found
}

/// One iterative path: alpha-wide rounds while progress is being made,
/// each followed by a closing round over everything claimable among the K
/// closest candidates.
fn lookup_path(
    rpc: &Arc<Rpc>,
    target: PeerId,
    seeds: Vec<Node>,
    queried: &Mutex<BTreeMap<Distance, Node>>,
) -> Vec<Node> {
    let k = rpc.config.k;
    let alpha = rpc.config.alpha;
    // Keeping more than K candidates lets the closing round fall back on
    // spares when nodes at the front time out.
    let max_candidates = (alpha + 1) * k;

    let (sender, receiver) = flume::unbounded();

    let mut candidates: BTreeMap<Distance, Node> = seeds
        .into_iter()
        .map(|node| (node.id().distance(&target), node))
        .collect();

    // Seeded with our own id so responses can never route the lookup back
    // to ourselves.
    let mut failed: HashSet<PeerId> = HashSet::new();
    failed.insert(rpc.id);

    loop {
        let batch = claim(&candidates, queried, k, alpha);
        if batch.is_empty() {
            // Nothing left to ask: settle for the closest candidates still
            // standing.
            return candidates.values().take(k).cloned().collect();
        }

        let pending = send_round(rpc, &sender, target, batch);
        process_responses(
            rpc,
            target,
            pending,
            &sender,
            &receiver,
            &mut candidates,
            &mut failed,
            queried,
            max_candidates,
        );

        // Closing round: everything still unclaimed among the K closest,
        // not just alpha of them.
        let closing = claim(&candidates, queried, k, usize::MAX);
        if !closing.is_empty() {
            let pending = send_round(rpc, &sender, target, closing);
            process_responses(
                rpc,
                target,
                pending,
                &sender,
                &receiver,
                &mut candidates,
                &mut failed,
                queried,
                max_candidates,
            );
        }
    }
}

/// Drain the path's reply queue until no request is outstanding.
///
/// A reply that moved the candidate minimum closer to the target
/// immediately triggers another alpha-wide round; anything else just
/// settles one outstanding request.
#[allow(clippy::too_many_arguments)]
fn process_responses(
    rpc: &Arc<Rpc>,
    target: PeerId,
    mut pending: usize,
    sender: &flume::Sender<PathEvent>,
    receiver: &flume::Receiver<PathEvent>,
    candidates: &mut BTreeMap<Distance, Node>,
    failed: &mut HashSet<PeerId>,
    queried: &Mutex<BTreeMap<Distance, Node>>,
    max_candidates: usize,
) {
    let k = rpc.config.k;
    let alpha = rpc.config.alpha;

    // The socket settles every request within its timeout; twice that only
    // passes when the I/O thread is gone, in which case the lookup gives up
    // on its outstanding requests instead of hanging.
    let grace = rpc.config.request_timeout * 2;

    while pending > 0 {
        let event = match receiver.recv_timeout(grace) {
            Ok(event) => event,
            Err(_) => {
                debug!(?target, pending, "Lookup path abandoned outstanding requests");
                return;
            }
        };

        match event {
            PathEvent::Found(responder, nodes) => {
                // The response carried a valid signature matching the
                // responder's id, so it is safe to (re)admit.
                rpc.routing_table
                    .lock()
                    .expect("poisoned")
                    .insert_unchecked(responder);

                let previous_min = candidates.keys().next().copied();

                for node in nodes {
                    if failed.contains(node.id()) {
                        continue;
                    }
                    candidates.insert(node.id().distance(&target), node);
                }
                while candidates.len() > max_candidates {
                    candidates.pop_last();
                }

                pending -= 1;

                let minimum = candidates.keys().next().copied();
                if minimum != previous_min {
                    // Progress: a closer candidate appeared, chase it.
                    let batch = claim(candidates, queried, k, alpha);
                    pending += send_round(rpc, sender, target, batch);
                }
            }
            PathEvent::Failed(distance, node) => {
                failed.insert(*node.id());
                rpc.routing_table
                    .lock()
                    .expect("poisoned")
                    .record_timeout(node.id());
                candidates.remove(&distance);

                pending -= 1;
            }
        }
    }
}

/// Atomically claim up to `width` not-yet-queried nodes among the K
/// closest candidates, marking them in the shared map under one lock hold
/// so no other path can claim them.
fn claim(
    candidates: &BTreeMap<Distance, Node>,
    queried: &Mutex<BTreeMap<Distance, Node>>,
    k: usize,
    width: usize,
) -> Vec<(Distance, Node)> {
    let mut claimed = queried.lock().expect("poisoned");

    let mut batch = Vec::new();
    for (distance, node) in candidates.iter().take(k) {
        if batch.len() == width {
            break;
        }
        if claimed.contains_key(distance) {
            continue;
        }

        claimed.insert(*distance, node.clone());
        batch.push((*distance, node.clone()));
    }

    batch
}

/// Send one `FindNode` per claimed candidate; replies land on the path's
/// queue. Returns the number of requests issued.
fn send_round(
    rpc: &Arc<Rpc>,
    sender: &flume::Sender<PathEvent>,
    target: PeerId,
    batch: Vec<(Distance, Node)>,
) -> usize {
    let requester_port = *rpc.public_port.lock().expect("poisoned");
    let issued = batch.len();

    for (distance, node) in batch {
        let request = Request::FindNode {
            requester_id: rpc.id,
            requester_port,
            target,
        };

        let sender = sender.clone();
        let address = *node.address();

        rpc.socket.send_request(request, address, move |reply| {
            let event = match reply {
                Reply::Response(responder, ResponsePayload::Nodes(nodes)) => {
                    PathEvent::Found(responder, nodes)
                }
                // A Pong for a FindNode is a protocol violation; treat the
                // node like one that never answered.
                Reply::Response(..) | Reply::Timeout => PathEvent::Failed(distance, node),
            };
            let _ = sender.send(event);
        });
    }

    issued
}

/// Keep the nodes that strictly more than half of the path outcomes
/// agreed on, closest first, at most `k` of them.
///
/// With a single path the threshold is trivially met by every returned
/// node, which is the intended degenerate behavior.
fn majority_filter(results: Vec<Vec<Node>>, target: &PeerId, k: usize) -> Vec<Node> {
    let paths = results.len();

    let mut counts: HashMap<PeerId, (Node, usize)> = HashMap::new();
    for path in results {
        for node in path {
            counts.entry(*node.id()).or_insert((node, 0)).1 += 1;
        }
    }

    let agreed: BTreeMap<Distance, Node> = counts
        .into_values()
        .filter(|(_, count)| count * 2 > paths)
        .map(|(node, _)| (node.id().distance(target), node))
        .collect();

    agreed.into_values().take(k).collect()
}
