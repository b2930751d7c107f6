//! Cryptographic primitives for the step engine.
//!
//! - [`keccak`]: Keccak-256, the Ethereum pre-standard variant. Used for all
//!   Ethereum-facing hashing (MPT nodes, addresses, code, signing hashes).
//! - [`sha256`]: SHA-256, used for the step binary-tree commitment.
//! - [`ecdsa`]: secp256k1 public-key recovery for transaction signatures.

pub mod ecdsa;
pub mod keccak;

use sha2::Digest as _;

pub fn sha256(data: impl AsRef<[u8]>) -> [u8; 32] {
    sha2::Sha256::digest(data).into()
}

pub fn ripemd160(data: impl AsRef<[u8]>) -> [u8; 20] {
    ripemd::Ripemd160::digest(data).into()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid recovery id")]
    InvalidRecoveryId,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Public key recovery failed")]
    RecoveryFailed,
}
