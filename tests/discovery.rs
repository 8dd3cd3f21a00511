//! End-to-end discovery scenarios over loopback nodes.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::thread;
use std::time::Duration;

use kadmos::{Config, Dht, PeerId};

/// Opt-in diagnostics: `RUST_LOG`-less default stays quiet in CI.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .try_init();
    });
}

fn fast_config() -> Config {
    init_tracing();
    Config {
        request_timeout: Duration::from_millis(150),
        // Keep the timer out of the way; maintenance is driven by the
        // scenarios that care about it.
        maintenance_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

/// A bound socket nobody reads from: every packet sent to it disappears.
fn black_hole() -> (UdpSocket, SocketAddrV4) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = match socket.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        _ => unreachable!(),
    };
    (socket, addr)
}

/// A node bound to a known port that it also announces publicly, so other
/// nodes may admit it into their routing tables.
fn reachable_node(config: Config) -> Dht {
    loop {
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let attempt = Dht::with_config(Config {
            port: Some(port),
            public_port: Some(port),
            ..config.clone()
        });

        match attempt {
            Ok(dht) => return dht,
            // The port was taken between probing and binding; try another.
            Err(_) => continue,
        }
    }
}

#[test]
fn bootstrap_against_a_single_live_peer() {
    let mut peer = Dht::with_config(fast_config()).unwrap();
    let mut joining = Dht::with_config(fast_config()).unwrap();

    assert!(joining.bootstrap(peer.local_addr()));

    let table = joining.routing_table();
    assert!(table.nodes().iter().any(|n| *n.id() == peer.id()));

    joining.shutdown();
    peer.shutdown();
}

#[test]
fn failed_bootstrap_rolls_back_and_can_be_retried() {
    let (_hole, hole_addr) = black_hole();

    let mut peer = Dht::with_config(fast_config()).unwrap();
    let mut joining = Dht::with_config(Config {
        public_port: Some(4000),
        ..fast_config()
    })
    .unwrap();

    assert!(!joining.bootstrap(hole_addr));
    // The requested public port survived the failure untouched.
    assert_eq!(joining.public_port(), Some(4000));
    assert_eq!(joining.routing_table_size(), 0);

    // The state rolled back to square one: a retry against a live peer
    // just works.
    assert!(joining.bootstrap(peer.local_addr()));

    joining.shutdown();
    peer.shutdown();
}

#[test]
fn concurrent_bootstrap_converges_on_one_outcome() {
    let mut peer = Dht::with_config(fast_config()).unwrap();
    let mut joining = Dht::with_config(fast_config()).unwrap();

    let outcomes: Vec<bool> = thread::scope(|scope| {
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let dht = joining.clone();
                let addr = peer.local_addr();
                scope.spawn(move || dht.bootstrap(addr))
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(outcomes, vec![true, true, true]);

    // One join, one table entry; concurrent callers did not each insert
    // and re-probe.
    assert_eq!(joining.routing_table_size(), 1);

    joining.shutdown();
    peer.shutdown();
}

#[test]
fn unreachable_public_port_is_withdrawn() {
    let mut peer = Dht::with_config(fast_config()).unwrap();

    // Announce a port that swallows everything sent to it: the peer's
    // reachability pong can never arrive.
    let (_hole, hole_addr) = black_hole();
    let mut joining = Dht::with_config(Config {
        public_port: Some(hole_addr.port()),
        ..fast_config()
    })
    .unwrap();

    // The join itself still succeeds; this node is simply not reachable.
    assert!(joining.bootstrap(peer.local_addr()));
    assert_eq!(joining.public_port(), None);

    joining.shutdown();
    peer.shutdown();
}

#[test]
fn reachable_public_port_is_kept() {
    let mut peer = Dht::with_config(fast_config()).unwrap();
    let mut joining = reachable_node(fast_config());
    let announced = joining.public_port();

    assert!(announced.is_some());
    assert!(joining.bootstrap(peer.local_addr()));
    assert_eq!(joining.public_port(), announced);

    joining.shutdown();
    peer.shutdown();
}

#[test]
fn lookup_traverses_a_small_mesh() {
    // A single lookup path admits every response, which is what a
    // cooperative loopback mesh warrants; the majority filter is exercised
    // where adversarial paths exist.
    let config = Config {
        alpha: 1,
        ..fast_config()
    };

    let mut hub = reachable_node(config.clone());
    let mut nodes: Vec<Dht> = (0..5).map(|_| reachable_node(config.clone())).collect();

    // The hub joins through the first node so it finishes bootstrapping
    // and starts admitting inbound requesters.
    assert!(hub.bootstrap(nodes[0].local_addr()));

    for node in &nodes {
        assert!(node.bootstrap(hub.local_addr()));
    }

    // Every node knows the hub at least.
    for node in &nodes {
        assert!(node
            .routing_table()
            .nodes()
            .iter()
            .any(|n| *n.id() == hub.id()));
    }

    let found = nodes[4].lookup(hub.id());
    assert!(!found.is_empty());
    assert_eq!(*found[0].id(), hub.id());

    // A lookup never returns the caller itself.
    let own = nodes[4].id();
    assert!(nodes[4].lookup(own).iter().all(|n| *n.id() != own));

    for node in &mut nodes {
        node.shutdown();
    }
    hub.shutdown();
}

#[test]
fn lookup_results_are_sorted_by_distance() {
    let config = Config {
        alpha: 1,
        ..fast_config()
    };

    let mut hub = reachable_node(config.clone());
    let mut nodes: Vec<Dht> = (0..4).map(|_| reachable_node(config.clone())).collect();

    assert!(hub.bootstrap(nodes[0].local_addr()));
    for node in &nodes {
        assert!(node.bootstrap(hub.local_addr()));
    }

    let target = PeerId::random();
    let found = nodes[0].lookup(target);

    let distances: Vec<_> = found.iter().map(|n| n.id().distance(&target)).collect();
    let mut sorted = distances.clone();
    sorted.sort();
    assert_eq!(distances, sorted);

    for node in &mut nodes {
        node.shutdown();
    }
    hub.shutdown();
}
