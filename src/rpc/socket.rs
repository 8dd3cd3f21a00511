//! UDP socket layer: request/response correlation, deadlines and response
//! signatures.

use std::collections::BTreeMap;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_bytes::ByteBuf;
use tracing::{debug, trace};

use crate::common::{encode_signable, Message, Node, PeerId, Request, ResponsePayload, RpcId};
use crate::rpc::Config;
use crate::{Error, Result};

const MTU: usize = 2048;
const UDP_SOCKET_BUFFER_SIZE: i32 = 2 * 1024 * 1024; // 2MB

/// Outcome of a single request, delivered to its completion handler.
pub(crate) enum Reply {
    /// A verified, signed response: the authenticated responder and its
    /// payload.
    Response(Node, ResponsePayload),
    /// No verified response arrived within the request timeout.
    Timeout,
}

pub(crate) type ReplyHandler = Box<dyn FnOnce(Reply) + Send + 'static>;

/// A UdpSocket wrapper that signs responses, verifies and correlates
/// incoming ones, and expires requests nobody answered.
pub(crate) struct RpcSocket {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
    signer: SigningKey,
    request_timeout: Duration,
    inflight: Mutex<BTreeMap<RpcId, InflightRequest>>,
}

struct InflightRequest {
    to: SocketAddrV4,
    request: Request,
    sent_at: Instant,
    handler: ReplyHandler,
}

impl RpcSocket {
    pub fn new(config: &Config, signer: SigningKey) -> Result<Self> {
        let socket = match config.port {
            Some(port) => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?,
            None => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?,
        };

        // Increase OS-level UDP socket buffers to prevent packet loss under
        // high throughput; the default (~128KB) is too small for lookup
        // bursts at scale.
        set_socket_buffers(&socket, UDP_SOCKET_BUFFER_SIZE)?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unimplemented!("RpcSocket does not support Ipv6"),
        };

        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            local_addr,
            signer,
            request_timeout: config.request_timeout,
            inflight: Mutex::new(BTreeMap::new()),
        })
    }

    // === Getters ===

    /// Returns the address the socket is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Send a request to `to`. The handler fires exactly once: with the
    /// verified response, or with [Reply::Timeout] once the deadline
    /// passes.
    pub fn send_request(
        &self,
        request: Request,
        to: SocketAddrV4,
        handler: impl FnOnce(Reply) + Send + 'static,
    ) -> RpcId {
        let rpc_id = RpcId::random();

        let message = Message::Request {
            rpc_id,
            request: request.clone(),
        };

        self.inflight.lock().expect("poisoned").insert(
            rpc_id,
            InflightRequest {
                to,
                request,
                sent_at: Instant::now(),
                handler: Box::new(handler),
            },
        );

        // A send error is not reported to the handler; the request simply
        // times out, the same way a lost datagram would.
        self.send(to, &message);

        rpc_id
    }

    /// Synchronous variant of [Self::send_request], blocking the calling
    /// thread until the exchange resolves.
    pub fn send_request_sync(
        &self,
        request: Request,
        to: SocketAddrV4,
    ) -> Option<(Node, ResponsePayload)> {
        let (sender, receiver) = flume::bounded(1);

        self.send_request(request, to, move |reply| {
            let _ = sender.send(reply);
        });

        // The expiry sweep settles every request within the timeout; twice
        // that only passes when nothing is driving the socket anymore.
        match receiver.recv_timeout(self.request_timeout * 2) {
            Ok(Reply::Response(node, payload)) => Some((node, payload)),
            Ok(Reply::Timeout) | Err(_) => None,
        }
    }

    /// Send a signed response for `request` to the given address.
    pub fn respond(
        &self,
        to: SocketAddrV4,
        rpc_id: RpcId,
        request: &Request,
        payload: ResponsePayload,
    ) {
        let signable = match encode_signable(&rpc_id, request, &payload) {
            Ok(signable) => signable,
            Err(error) => {
                debug!(?error, "Failed to encode response for signing");
                return;
            }
        };
        let signature = self.signer.sign(&signable);

        let message = Message::Response {
            rpc_id,
            public_key: ByteBuf::from(self.signer.verifying_key().to_bytes().to_vec()),
            signature: ByteBuf::from(signature.to_bytes().to_vec()),
            payload,
        };

        self.send(to, &message);
    }

    /// Receives a single message on the socket.
    ///
    /// Undecodable packets, IPv6 packets and packets from port 0 are
    /// dropped silently (with a trace).
    pub fn recv_from(&self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(context = "socket_validation", message = "Packet from port 0");
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => {
                        trace!(context = "socket_message_receiving", ?message, ?from);
                        return Some((message, from));
                    }
                    Err(error) => {
                        trace!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            "Received invalid CBOR message"
                        );
                    }
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(context = "socket_validation", message = "Received IPv6 packet");
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_micros(100)); // yield for a bit
            }
            Err(e) => {
                trace!(context = "socket_error", ?e, "recv_from failed unexpectedly");
            }
        }

        None
    }

    /// Correlate and verify an incoming response, invoking its handler.
    ///
    /// The response is accepted only if its rpc id is inflight, it arrived
    /// from the address the request was sent to, the carried public key
    /// hashes to the responder's id, and the signature verifies over the
    /// original request. Anything else leaves the inflight entry in place,
    /// so a genuine response can still arrive before the deadline.
    pub fn deliver(
        &self,
        from: SocketAddrV4,
        rpc_id: RpcId,
        public_key: &[u8],
        signature: &[u8],
        payload: ResponsePayload,
    ) {
        let handler = {
            let mut inflight = self.inflight.lock().expect("poisoned");

            let Some(entry) = inflight.get(&rpc_id) else {
                trace!(context = "socket_validation", message = "Unexpected rpc id");
                return;
            };

            if !compare_socket_addr(&entry.to, &from) {
                trace!(
                    context = "socket_validation",
                    message = "Response from wrong address"
                );
                return;
            }

            let responder =
                match verify_response(&rpc_id, &entry.request, public_key, signature, &payload) {
                    Ok(id) => id,
                    Err(error) => {
                        debug!(?error, ?from, "Dropping response that failed verification");
                        return;
                    }
                };

            let entry = inflight.remove(&rpc_id).expect("checked above");
            let node = Node::new(responder, from);

            (entry.handler, node)
        };

        let (callback, node) = handler;
        callback(Reply::Response(node, payload));
    }

    /// Remove requests whose deadline passed and fire their handlers with
    /// [Reply::Timeout]. Handlers run outside the inflight lock, so they
    /// are free to issue follow-up requests.
    pub fn purge_expired(&self) {
        let timeout = self.request_timeout;

        let expired: Vec<InflightRequest> = {
            let mut inflight = self.inflight.lock().expect("poisoned");

            let expired_ids: Vec<RpcId> = inflight
                .iter()
                .filter(|(_, entry)| entry.sent_at.elapsed() > timeout)
                .map(|(id, _)| *id)
                .collect();

            expired_ids
                .into_iter()
                .filter_map(|id| inflight.remove(&id))
                .collect()
        };

        for entry in expired {
            trace!(context = "socket_timeout", to = ?entry.to, "Request timed out");
            (entry.handler)(Reply::Timeout);
        }
    }

    // === Private Methods ===

    fn send(&self, to: SocketAddrV4, message: &Message) {
        match message.to_bytes() {
            Ok(bytes) => {
                if let Err(error) = self.socket.send_to(&bytes, to) {
                    debug!(?error, ?to, "Error sending message");
                } else {
                    trace!(context = "socket_message_sending", ?message, ?to);
                }
            }
            Err(error) => {
                debug!(?error, "Error encoding message");
            }
        }
    }
}

fn verify_response(
    rpc_id: &RpcId,
    request: &Request,
    public_key: &[u8],
    signature: &[u8],
    payload: &ResponsePayload,
) -> Result<PeerId> {
    let key = VerifyingKey::try_from(public_key).map_err(|_| Error::InvalidPublicKey)?;
    let signature = Signature::from_slice(signature).map_err(|_| Error::InvalidSignature)?;

    let signable = encode_signable(rpc_id, request, payload)?;
    key.verify(&signable, &signature)
        .map_err(|_| Error::InvalidSignature)?;

    Ok(PeerId::from_public_key(&key))
}

// Same as SocketAddrV4::eq but ignores the ip if it is unspecified for
// testing reasons.
fn compare_socket_addr(a: &SocketAddrV4, b: &SocketAddrV4) -> bool {
    if a.port() != b.port() {
        return false;
    }

    if a.ip().is_unspecified() {
        return true;
    }

    a.ip() == b.ip()
}

#[cfg(unix)]
fn set_socket_buffers(socket: &UdpSocket, size: i32) -> std::io::Result<()> {
    use std::io::Error;
    use std::os::unix::io::AsRawFd;

    use libc::{setsockopt, SOL_SOCKET, SO_RCVBUF, SO_SNDBUF};

    let fd = socket.as_raw_fd();

    let recv = unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_RCVBUF,
            &size as *const _ as *const _,
            std::mem::size_of_val(&size) as u32,
        )
    };
    // OS may clamp the size or reject large values depending on sysctl
    // limits.
    if recv != 0 {
        return Err(Error::last_os_error());
    }

    let send = unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_SNDBUF,
            &size as *const _ as *const _,
            std::mem::size_of_val(&size) as u32,
        )
    };
    if send != 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

#[cfg(not(unix))]
fn set_socket_buffers(_socket: &UdpSocket, _size: i32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    fn socket() -> (RpcSocket, PeerId) {
        let seed: [u8; 32] = rand::random();
        let signer = SigningKey::from_bytes(&seed);
        let id = PeerId::from_public_key(&signer.verifying_key());

        (RpcSocket::new(&Config::default(), signer).unwrap(), id)
    }

    /// Drive a socket until its next inbound message, like the node's I/O
    /// thread would.
    fn next_message(socket: &RpcSocket) -> (Message, SocketAddrV4) {
        loop {
            if let Some(received) = socket.recv_from() {
                return received;
            }
        }
    }

    #[test]
    fn request_response_verified_roundtrip() {
        let (server, server_id) = socket();
        let server_addr = server.local_addr();

        let (client, _) = socket();

        let server_thread = thread::spawn(move || {
            let (message, from) = next_message(&server);
            match message {
                Message::Request { rpc_id, request } => {
                    assert_eq!(request, Request::Ping { return_port: None });
                    server.respond(from, rpc_id, &request, ResponsePayload::Pong);
                }
                Message::Response { .. } => panic!("expected a request"),
            }
        });

        let (sender, receiver) = flume::bounded(1);
        client.send_request(Request::Ping { return_port: None }, server_addr, {
            move |reply| {
                let _ = sender.send(reply);
            }
        });

        // Pump the client side until the response arrives.
        let reply = loop {
            if let Some((message, from)) = client.recv_from() {
                if let Message::Response {
                    rpc_id,
                    public_key,
                    signature,
                    payload,
                } = message
                {
                    client.deliver(from, rpc_id, &public_key, &signature, payload);
                }
            }
            if let Ok(reply) = receiver.try_recv() {
                break reply;
            }
        };

        match reply {
            Reply::Response(node, payload) => {
                assert_eq!(*node.id(), server_id);
                assert_eq!(node.address().port(), server_addr.port());
                assert_eq!(payload, ResponsePayload::Pong);
            }
            Reply::Timeout => panic!("expected a response"),
        }

        server_thread.join().unwrap();
    }

    #[test]
    fn unanswered_request_times_out() {
        let client = RpcSocket::new(
            &Config {
                request_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            SigningKey::from_bytes(&rand::random()),
        )
        .unwrap();

        // A bound socket nobody reads from: the request disappears.
        let black_hole = UdpSocket::bind("127.0.0.1:0").unwrap();
        let to = match black_hole.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            _ => unreachable!(),
        };

        let (sender, receiver) = flume::bounded(1);
        client.send_request(Request::Ping { return_port: None }, to, move |reply| {
            let _ = sender.send(matches!(reply, Reply::Timeout));
        });

        thread::sleep(Duration::from_millis(80));
        client.purge_expired();

        assert!(receiver.recv().unwrap());
    }

    #[test]
    fn forged_signature_is_dropped() {
        let (client, _) = socket();
        let (target, _) = socket();

        let (sender, receiver) = flume::bounded(1);
        let rpc_id = client.send_request(
            Request::Ping { return_port: None },
            target.local_addr(),
            move |reply| {
                let _ = sender.send(matches!(reply, Reply::Response(..)));
            },
        );

        // Deliver a response with a garbage signature; the inflight entry
        // must survive it.
        client.deliver(
            target.local_addr(),
            rpc_id,
            &[7u8; 32],
            &[9u8; 64],
            ResponsePayload::Pong,
        );

        assert!(receiver.try_recv().is_err());
    }
}
