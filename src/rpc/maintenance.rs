//! Periodic routing table maintenance: verify nodes with unanswered
//! requests and replace the dead from the bucket replacement caches.

use std::sync::Arc;

use tracing::debug;

use crate::common::{BucketSnapshot, Node, PeerId, Request};
use crate::rpc::socket::Reply;
use crate::rpc::Rpc;

/// One maintenance pass over every bucket with suspicious entries.
///
/// Buckets are handled independently; within a bucket every suspicious
/// node is probed concurrently. If the whole network is down every probe
/// fails and nothing is evicted, only timeout counters advance.
pub(crate) fn maintain(rpc: &Arc<Rpc>) {
    let buckets = rpc
        .routing_table
        .lock()
        .expect("poisoned")
        .suspicious_buckets();

    for bucket in buckets {
        check_bucket(rpc, bucket);
    }
}

fn check_bucket(rpc: &Arc<Rpc>, bucket: BucketSnapshot) {
    let (sender, receiver) = flume::unbounded();

    // Probe with a FindNode at a random target rather than a Ping: a
    // malfunctioning node may selectively ignore FindNode yet answer Ping,
    // and would then keep occupying a useless slot.
    let probes = bucket.suspicious.len();
    for info in bucket.suspicious {
        let sender = sender.clone();

        rpc.socket
            .send_request(probe_request(rpc), *info.node().address(), move |reply| {
                let _ = sender.send((info, matches!(reply, Reply::Response(..))));
            });
    }
    drop(sender);

    // The cache is probed at most once per bucket per pass, the first time
    // a replacement is actually needed.
    let mut cache_probe: Option<Vec<(Node, bool)>> = None;

    let grace = rpc.config.request_timeout * 2;
    for _ in 0..probes {
        let Ok((info, alive)) = receiver.recv_timeout(grace) else {
            debug!("Maintenance abandoned outstanding probes");
            break;
        };

        let id = *info.node().id();

        if alive {
            rpc.routing_table
                .lock()
                .expect("poisoned")
                .clear_timeout(&id);
            continue;
        }

        if info.timeout_count() + 1 < rpc.config.max_timeouts {
            rpc.routing_table
                .lock()
                .expect("poisoned")
                .record_timeout(&id);
            continue;
        }

        // The node exhausted its chances; promote the first cached
        // candidate that answers a probe, preserving cache order.
        let probed = cache_probe.get_or_insert_with(|| probe_cache(rpc, &bucket.cache));

        match probed.iter().position(|(_, alive)| *alive) {
            Some(index) => {
                let (replacement, _) = probed.remove(index);
                let replacement_id = *replacement.id();

                if rpc
                    .routing_table
                    .lock()
                    .expect("poisoned")
                    .promote_cached(&id, replacement)
                {
                    debug!(dead = ?id, promoted = ?replacement_id, "Replaced dead node from cache");
                }
            }
            None => {
                // No live replacement: membership stays as it is, the
                // counter keeps the node at the front of the eviction line.
                rpc.routing_table
                    .lock()
                    .expect("poisoned")
                    .record_timeout(&id);
            }
        }
    }
}

/// Probe every cached node once, concurrently, preserving cache order in
/// the result.
fn probe_cache(rpc: &Arc<Rpc>, cache: &[Node]) -> Vec<(Node, bool)> {
    if cache.is_empty() {
        return Vec::new();
    }

    let (sender, receiver) = flume::unbounded();

    for (index, node) in cache.iter().cloned().enumerate() {
        let sender = sender.clone();

        rpc.socket
            .send_request(probe_request(rpc), *node.address(), move |reply| {
                let _ = sender.send((index, node, matches!(reply, Reply::Response(..))));
            });
    }
    drop(sender);

    let grace = rpc.config.request_timeout * 2;
    let mut results = Vec::with_capacity(cache.len());
    for _ in 0..cache.len() {
        match receiver.recv_timeout(grace) {
            Ok(result) => results.push(result),
            Err(_) => break,
        }
    }

    results.sort_by_key(|(index, ..)| *index);
    results
        .into_iter()
        .map(|(_, node, alive)| (node, alive))
        .collect()
}

fn probe_request(rpc: &Arc<Rpc>) -> Request {
    Request::FindNode {
        requester_id: rpc.id,
        requester_port: *rpc.public_port.lock().expect("poisoned"),
        target: PeerId::random(),
    }
}
