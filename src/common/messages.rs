//! CBOR wire messages and the signable encoding of responses.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::common::{Node, PeerId, RpcId};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A single UDP datagram payload.
pub enum Message {
    Request {
        rpc_id: RpcId,
        request: Request,
    },
    /// Responses are signed under the responder's long-term Ed25519 key;
    /// the signature covers the canonical encoding of
    /// `(rpc_id, request, payload)`, binding the reply to the exchange it
    /// answers.
    Response {
        rpc_id: RpcId,
        public_key: ByteBuf,
        signature: ByteBuf,
        payload: ResponsePayload,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Liveness probe. When `return_port` is set the response datagram is
    /// directed at that port instead of the transport source port, which is
    /// how a joining node checks that its announced public port is reachable.
    Ping { return_port: Option<u16> },
    /// Ask for the nodes closest to `target`. `requester_port` carries the
    /// requester's announced public port, if it believes it is reachable.
    FindNode {
        requester_id: PeerId,
        requester_port: Option<u16>,
        target: PeerId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    Pong,
    Nodes(Vec<Node>),
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|error| Error::PacketEncode(error.to_string()))?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        ciborium::de::from_reader(bytes).map_err(|error| Error::PacketDecode(error.to_string()))
    }
}

/// Canonical byte string a response signature is computed over.
///
/// Both sides derive it independently: the responder from the request it
/// received, the requester from the request it kept inflight. A forged
/// response therefore needs the responder's key even if the attacker saw
/// the request on the wire.
pub fn encode_signable(
    rpc_id: &RpcId,
    request: &Request,
    payload: &ResponsePayload,
) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(&(rpc_id, request, payload), &mut bytes)
        .map_err(|error| Error::PacketEncode(error.to_string()))?;
    Ok(bytes)
}
