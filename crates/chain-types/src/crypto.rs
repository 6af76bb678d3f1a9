//! Cryptographic helpers: ECDSA keys and signatures over secp256k1, and
//! deterministic hashing over canonicalized JSON.
//!
//! Public keys travel as hex of the SEC1 compressed point, signatures as
//! hex of the fixed 64-byte encoding, hashes as lowercase hex SHA-256.
//! The encoding is part of the protocol: hashes are computed over these
//! strings, so all nodes must agree on them.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::VerifyError;

/// An ECDSA keypair. The public half doubles as the wallet address.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Deserialize from the hex of the 32-byte secret scalar.
    pub fn from_hex(serialized: &str) -> Result<Self, VerifyError> {
        let bytes =
            hex::decode(serialized).map_err(|e| VerifyError::BadPublicKey(e.to_string()))?;
        let signing =
            SigningKey::from_slice(&bytes).map_err(|e| VerifyError::BadPublicKey(e.to_string()))?;
        Ok(Self { signing })
    }

    /// Serialize the secret scalar as hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    /// The serialized public key, used as `input` on transactions and as
    /// the wallet key in ledger state.
    pub fn public_key(&self) -> String {
        hex::encode(self.signing.verifying_key().to_encoded_point(true).as_bytes())
    }

    /// Sign a message (normally a hash-to-sign string). RFC 6979
    /// deterministic nonces, so the same key and message always produce
    /// the same signature.
    pub fn sign(&self, msg: &str) -> String {
        let signature: Signature = self.signing.sign(msg.as_bytes());
        hex::encode(signature.to_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the secret half
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key())
            .finish()
    }
}

/// Verify `signature` against `public_key` over `msg`.
pub fn verify_signature(public_key: &str, signature: &str, msg: &str) -> Result<(), VerifyError> {
    let key_bytes =
        hex::decode(public_key).map_err(|e| VerifyError::BadPublicKey(e.to_string()))?;
    let key = VerifyingKey::from_sec1_bytes(&key_bytes)
        .map_err(|e| VerifyError::BadPublicKey(e.to_string()))?;

    let sig_bytes = hex::decode(signature).map_err(|e| VerifyError::BadSignature(e.to_string()))?;
    let sig =
        Signature::from_slice(&sig_bytes).map_err(|e| VerifyError::BadSignature(e.to_string()))?;

    key.verify(msg.as_bytes(), &sig)
        .map_err(|_| VerifyError::SignatureMismatch)
}

/// Hash arbitrary serializable data deterministically.
///
/// The value is rendered to canonical JSON first: object keys sorted
/// (serde_json maps are BTreeMaps), absent optionals omitted. Two values
/// that are semantically equal hash identically regardless of the field
/// order their types declare.
pub fn hash_data<T: Serialize>(value: &T) -> String {
    let canonical = serde_json::to_value(value)
        .expect("hashable values serialize infallibly")
        .to_string();
    hash_string(&canonical)
}

/// SHA-256 of a raw string, hex encoded.
pub fn hash_string(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 of a raw string as 32 bytes. Used to seed the witness PRNG.
pub fn hash_seed(data: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_roundtrip() {
        let keypair = Keypair::generate();
        let sig = keypair.sign("hello");
        assert!(verify_signature(&keypair.public_key(), &sig, "hello").is_ok());
        assert_eq!(
            verify_signature(&keypair.public_key(), &sig, "goodbye"),
            Err(VerifyError::SignatureMismatch)
        );
    }

    #[test]
    fn test_sign_deterministic() {
        let keypair = Keypair::generate();
        assert_eq!(keypair.sign("msg"), keypair.sign("msg"));
    }

    #[test]
    fn test_keypair_hex_roundtrip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_hex(&keypair.to_hex()).unwrap();
        assert_eq!(keypair.public_key(), restored.public_key());
    }

    #[test]
    fn test_hash_data_ignores_field_order() {
        let a = serde_json::json!({ "b": 1, "a": [1, 2, 3] });
        let b = serde_json::json!({ "a": [1, 2, 3], "b": 1 });
        assert_eq!(hash_data(&a), hash_data(&b));
    }

    #[test]
    fn test_verify_rejects_garbage() {
        assert!(matches!(
            verify_signature("zz", "00", "m"),
            Err(VerifyError::BadPublicKey(_))
        ));
    }
}
