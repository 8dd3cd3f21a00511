//! Node ids, lookup targets and the XOR metric between them.

use std::fmt::{self, Debug, Display, Formatter};

use ed25519_dalek::VerifyingKey;
use rand::Rng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha224};

use crate::{Error, Result};

/// The size of node ids in bytes (224 bits).
pub const ID_SIZE: usize = 28;

/// The size of rpc ids in bytes (160 bits).
pub const RPC_ID_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// A node id or a lookup target.
///
/// Ids are the SHA-224 digest of the node's Ed25519 public key, interpreted
/// as a 224-bit big-endian integer. Bit index 0 is the most significant bit.
pub struct PeerId(pub [u8; ID_SIZE]);

impl PeerId {
    /// Generate a random id from OS entropy.
    pub fn random() -> PeerId {
        let mut rng = rand::thread_rng();

        PeerId(rng.gen())
    }

    /// Generate a random id whose bit 0 equals `bit`, i.e. an id that lives
    /// in a chosen half of the id space.
    pub fn random_in_half(bit: bool) -> PeerId {
        let mut id = Self::random();

        if bit {
            id.0[0] |= 0b1000_0000;
        } else {
            id.0[0] &= 0b0111_1111;
        }

        id
    }

    /// Derive the id of the node owning `public_key`.
    pub fn from_public_key(public_key: &VerifyingKey) -> PeerId {
        let digest = Sha224::digest(public_key.as_bytes());

        let mut bytes = [0u8; ID_SIZE];
        bytes.copy_from_slice(digest.as_slice());

        PeerId(bytes)
    }

    /// Create a new id from some bytes. Returns Err if `bytes` is not of
    /// length [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<PeerId> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize {
                expected: ID_SIZE,
                got: bytes.len(),
            });
        }

        let mut tmp = [0u8; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(PeerId(tmp))
    }

    /// XOR distance between this id and `other`.
    ///
    /// Distance to self is zero, and `a.distance(b) == b.distance(a)`.
    pub fn distance(&self, other: &PeerId) -> Distance {
        let mut bytes = [0u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Distance(bytes)
    }

    /// Returns the bit at `index`, where index 0 is the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < ID_SIZE * 8);

        let byte = self.0[index / 8];
        (byte >> (7 - (index % 8))) & 1 == 1
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = deserializer.deserialize_bytes(BytesVisitor)?;
        PeerId::from_bytes(bytes).map_err(de::Error::custom)
    }
}

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// The XOR distance between two [PeerId]s, ordered as a 224-bit big-endian
/// integer.
///
/// XOR against a fixed target is a bijection over the id space, so two
/// distinct ids always map to distinct distances; ordering by [Distance] is
/// total and deterministic.
pub struct Distance(pub(crate) [u8; ID_SIZE]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_SIZE]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_SIZE]
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Correlation id of a single request/response exchange.
///
/// Randomly drawn from a CSPRNG per request; 160 bits make blind response
/// forgery impractical even for an attacker that can spoof source addresses.
pub struct RpcId(pub [u8; RPC_ID_SIZE]);

impl RpcId {
    pub fn random() -> RpcId {
        let mut rng = rand::thread_rng();

        RpcId(rng.gen())
    }
}

impl Debug for RpcId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "RpcId(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl Serialize for RpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for RpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = deserializer.deserialize_bytes(BytesVisitor)?;

        if bytes.len() != RPC_ID_SIZE {
            return Err(de::Error::invalid_length(bytes.len(), &"20 bytes"));
        }

        let mut tmp = [0u8; RPC_ID_SIZE];
        tmp.copy_from_slice(&bytes);

        Ok(RpcId(tmp))
    }
}

struct BytesVisitor;

impl<'de> Visitor<'de> for BytesVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, formatter: &mut Formatter) -> fmt::Result {
        formatter.write_str("a byte string")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        Ok(v.to_vec())
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
        Ok(v)
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(byte) = seq.next_element()? {
            bytes.push(byte);
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bit_zero_is_most_significant() {
        let mut bytes = [0u8; ID_SIZE];
        bytes[0] = 0b1000_0000;
        let id = PeerId(bytes);

        assert!(id.bit(0));
        assert!(!id.bit(1));

        let id = PeerId([0u8; ID_SIZE]);
        assert!(!id.bit(0));
    }

    #[test]
    fn bit_indexing_walks_msb_to_lsb() {
        let mut bytes = [0u8; ID_SIZE];
        bytes[1] = 0b0000_0001;
        let id = PeerId(bytes);

        assert!(id.bit(15));
        assert!(!id.bit(14));
        assert!(!id.bit(16));
    }

    #[test]
    fn distance_is_xor() {
        let a = PeerId::random();
        let b = PeerId::random();

        let d = a.distance(&b);

        for i in 0..ID_SIZE {
            assert_eq!(d.0[i], a.0[i] ^ b.0[i]);
        }
    }

    #[test]
    fn distance_symmetry_and_identity() {
        let a = PeerId::random();
        let b = PeerId::random();

        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), Distance::ZERO);
        assert!(a.distance(&a).is_zero());
    }

    #[test]
    fn distance_orders_numerically() {
        let zero = PeerId([0u8; ID_SIZE]);

        let mut one = [0u8; ID_SIZE];
        one[ID_SIZE - 1] = 1;
        let mut high = [0u8; ID_SIZE];
        high[0] = 1;

        assert!(zero.distance(&PeerId(one)) < zero.distance(&PeerId(high)));
    }

    #[test]
    fn random_in_half_pins_bit_zero() {
        for _ in 0..32 {
            assert!(PeerId::random_in_half(true).bit(0));
            assert!(!PeerId::random_in_half(false).bit(0));
        }
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert!(PeerId::from_bytes([0u8; 20]).is_err());
        assert!(PeerId::from_bytes([0u8; ID_SIZE]).is_ok());
    }
}
