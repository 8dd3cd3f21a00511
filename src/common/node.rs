//! Node entries as they appear in the routing table and on the wire.

use std::fmt::{self, Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::common::PeerId;

#[derive(Clone, Eq)]
/// A known peer: its id and the IPv4 address it speaks UDP on.
///
/// Two nodes are equal iff their ids are equal; the address is mutable
/// state that may be updated when the old one stops responding.
pub struct Node {
    pub(crate) id: PeerId,
    pub(crate) address: SocketAddrV4,
}

impl Node {
    pub fn new(id: PeerId, address: SocketAddrV4) -> Node {
        Node { id, address }
    }

    // === Getters ===

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn address(&self) -> &SocketAddrV4 {
        &self.address
    }

    /// Creates a node with a random id for testing purposes.
    #[cfg(test)]
    pub(crate) fn random() -> Node {
        Node {
            id: PeerId::random(),
            address: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Debug for Node {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

// On the wire a node is the 3-tuple (id, address as a big-endian u32, port).
impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.id)?;
        tuple.serialize_element(&u32::from(*self.address.ip()))?;
        tuple.serialize_element(&self.address.port())?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NodeVisitor;

        impl<'de> Visitor<'de> for NodeVisitor {
            type Value = Node;

            fn expecting(&self, formatter: &mut Formatter) -> fmt::Result {
                formatter.write_str("a (peer_id, ipv4, port) tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Node, A::Error> {
                let id: PeerId = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let addr: u32 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let port: u16 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;

                Ok(Node::new(
                    id,
                    SocketAddrV4::new(Ipv4Addr::from(addr), port),
                ))
            }
        }

        deserializer.deserialize_tuple(3, NodeVisitor)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A [Node] as tracked by the routing table, together with the number of
/// consecutive requests it has failed to answer.
pub struct NodeInfo {
    pub(crate) node: Node,
    pub(crate) timeout_count: u32,
}

impl NodeInfo {
    /// A freshly inserted (or refreshed) entry starts with a clean record.
    pub fn new(node: Node) -> NodeInfo {
        NodeInfo {
            node,
            timeout_count: 0,
        }
    }

    // === Getters ===

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn timeout_count(&self) -> u32 {
        self.timeout_count
    }
}
