//! Inbound request handling and the routing table admission rules.

use std::net::SocketAddrV4;
use std::sync::Arc;

use tracing::debug;

use crate::common::{Node, Request, ResponsePayload, RpcId};
use crate::rpc::socket::Reply;
use crate::rpc::Rpc;

pub(crate) fn handle_request(rpc: &Arc<Rpc>, from: SocketAddrV4, rpc_id: RpcId, request: Request) {
    match &request {
        Request::Ping { return_port } => {
            // A set return_port redirects the response: this is how a
            // joining node probes that its announced port is reachable.
            let to = match return_port {
                Some(port) => SocketAddrV4::new(*from.ip(), *port),
                None => from,
            };

            rpc.socket.respond(to, rpc_id, &request, ResponsePayload::Pong);
        }
        Request::FindNode {
            requester_id,
            requester_port,
            target,
        } => {
            // Only requesters announcing a reachable port are candidates
            // for the routing table.
            if let Some(port) = requester_port {
                admit(
                    rpc,
                    Node::new(*requester_id, SocketAddrV4::new(*from.ip(), *port)),
                );
            }

            let closest = rpc
                .routing_table
                .lock()
                .expect("poisoned")
                .closest(rpc.config.k, target);

            rpc.socket
                .respond(from, rpc_id, &request, ResponsePayload::Nodes(closest));
        }
    }
}

/// Decide what an unsolicited `FindNode` may do to the routing table.
///
/// The checks and the insert happen under a single routing table lock
/// hold. Three rules:
///
/// - Before bootstrap completes, nothing: inbound traffic must not be able
///   to pre-fill the table with an attacker's choice of nodes.
/// - A requester in the same half of the id space as us (equal bit 0) can
///   at most have an existing entry's timeout counter reset. Inbound
///   traffic never grows our home neighborhood.
/// - A requester from the other half goes through a normal insert. When
///   the bucket is full, the incumbent front entry is pinged first and
///   kept if it answers; only when the incumbent is dead and the newcomer
///   proves it answers (with a verified signature matching its claimed id)
///   does it take the slot. A forwarding impersonator can therefore not
///   displace a live genuine node.
fn admit(rpc: &Arc<Rpc>, node: Node) {
    let mut table = rpc.routing_table.lock().expect("poisoned");

    if !rpc.bootstrap.is_done() {
        return;
    }

    if node.id().bit(0) == rpc.id.bit(0) {
        table.clear_timeout(node.id());
        return;
    }

    let occupant = match table.insert(node.clone()) {
        Ok(()) => return,
        Err(occupant) => occupant,
    };
    drop(table);

    debug!(
        newcomer = ?node.id(),
        incumbent = ?occupant.id(),
        "Bucket full, verifying the incumbent before replacing it"
    );

    let occupant_id = *occupant.id();
    let outer = rpc.clone();

    rpc.socket.send_request(
        Request::Ping { return_port: None },
        *occupant.address(),
        move |reply| match reply {
            Reply::Response(..) => {
                // The incumbent is alive; it keeps the slot.
                outer
                    .routing_table
                    .lock()
                    .expect("poisoned")
                    .clear_timeout(&occupant_id);
            }
            Reply::Timeout => {
                outer
                    .routing_table
                    .lock()
                    .expect("poisoned")
                    .record_timeout(&occupant_id);

                let inner = outer.clone();
                outer.socket.send_request(
                    Request::Ping { return_port: None },
                    *node.address(),
                    move |reply| {
                        if let Reply::Response(responder, _) = reply {
                            if responder.id() == node.id() {
                                inner
                                    .routing_table
                                    .lock()
                                    .expect("poisoned")
                                    .insert_unchecked(responder);
                            }
                        }
                    },
                );
            }
        },
    );
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use super::*;
    use crate::common::{Message, PeerId};
    use crate::rpc::bootstrap::BootstrapState;
    use crate::rpc::test_support::{fast_config, spawn_node};
    use crate::rpc::Config;

    fn served_node() -> Arc<Rpc> {
        let rpc = Arc::new(Rpc::new(Config::default()).unwrap());
        rpc.bootstrap.set(BootstrapState::Done);
        rpc
    }

    fn find_node_from(id: PeerId, port: u16) -> Request {
        Request::FindNode {
            requester_id: id,
            requester_port: Some(port),
            target: PeerId::random(),
        }
    }

    #[test]
    fn nothing_is_admitted_before_bootstrap() {
        let rpc = Arc::new(Rpc::new(Config::default()).unwrap());
        let from = SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 5000);

        let stranger = PeerId::random_in_half(!rpc.id.bit(0));
        handle_request(&rpc, from, crate::common::RpcId::random(), find_node_from(stranger, 5000));

        assert_eq!(rpc.routing_table_size(), 0);
    }

    #[test]
    fn same_half_requester_is_not_inserted() {
        let rpc = served_node();
        let from = SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 5000);

        let neighbor = PeerId::random_in_half(rpc.id.bit(0));
        handle_request(&rpc, from, crate::common::RpcId::random(), find_node_from(neighbor, 5000));

        assert_eq!(rpc.routing_table_size(), 0);
    }

    #[test]
    fn same_half_requester_only_gets_its_counter_reset() {
        let rpc = served_node();
        let from = SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 5000);

        let neighbor = Node::new(
            PeerId::random_in_half(rpc.id.bit(0)),
            SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 5000),
        );

        {
            let mut table = rpc.routing_table.lock().unwrap();
            table.insert(neighbor.clone()).unwrap();
            table.record_timeout(neighbor.id());
            table.record_timeout(neighbor.id());
        }

        let members_before = rpc.routing_table().nodes();
        handle_request(
            &rpc,
            from,
            crate::common::RpcId::random(),
            find_node_from(*neighbor.id(), 5000),
        );

        let table = rpc.routing_table.lock().unwrap();
        assert_eq!(table.nodes(), members_before);
        assert_eq!(table.timeout_count(neighbor.id()), Some(0));
    }

    #[test]
    fn other_half_requester_is_inserted() {
        let rpc = served_node();
        let from = SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 5000);

        let stranger = PeerId::random_in_half(!rpc.id.bit(0));
        handle_request(&rpc, from, crate::common::RpcId::random(), find_node_from(stranger, 6000));

        let table = rpc.routing_table.lock().unwrap();
        assert!(table.contains(&stranger));

        // The insert used the announced port, not the transport port.
        let inserted = table.nodes().into_iter().find(|n| n.id() == &stranger).unwrap();
        assert_eq!(inserted.address().port(), 6000);
    }

    #[test]
    fn requester_without_public_port_is_ignored() {
        let rpc = served_node();
        let from = SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 5000);

        let request = Request::FindNode {
            requester_id: PeerId::random_in_half(!rpc.id.bit(0)),
            requester_port: None,
            target: PeerId::random(),
        };
        handle_request(&rpc, from, crate::common::RpcId::random(), request);

        assert_eq!(rpc.routing_table_size(), 0);
    }

    #[test]
    fn ping_response_is_redirected_to_return_port() {
        let node = spawn_node(fast_config());

        // The probe requester and the socket listening on the announced
        // port are distinct, like a NATed node asking "can you reach my
        // public address".
        let prober = crate::rpc::socket::RpcSocket::new(
            &fast_config(),
            ed25519_dalek::SigningKey::from_bytes(&rand::random()),
        )
        .unwrap();
        let listener = crate::rpc::socket::RpcSocket::new(
            &fast_config(),
            ed25519_dalek::SigningKey::from_bytes(&rand::random()),
        )
        .unwrap();

        let sent = prober.send_request(
            Request::Ping {
                return_port: Some(listener.local_addr().port()),
            },
            node.rpc.local_addr(),
            |_| {},
        );

        // The pong must show up at the listener, not at the prober.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            assert!(std::time::Instant::now() < deadline, "no redirected pong");

            if let Some((Message::Response { rpc_id, .. }, _)) = listener.recv_from() {
                assert_eq!(rpc_id, sent);
                break;
            }
        }
    }
}
