//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Kadmos crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// Indicates an id was built from a byte slice of the wrong length.
    #[error("Invalid id size, expected {expected} bytes, got {got}")]
    InvalidIdSize { expected: usize, got: usize },

    #[error("Failed to decode packet bytes: {0}")]
    PacketDecode(String),

    #[error("Failed to encode message: {0}")]
    PacketEncode(String),

    /// The carried Ed25519 public key could not be parsed.
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// The response signature did not verify under the carried public key.
    #[error("Invalid response signature")]
    InvalidSignature,
}
