//! Cryptographic primitives for tasknet.
//!
//! Provides three things:
//!   1. BLAKE3 hashing: package digests, key difficulty, message ids
//!   2. Ed25519 node identity: every protocol message is signed by its sender
//!   3. Key difficulty: a cheap proof-of-work bound to the public key
//!
//! The private key lives inside `ed25519_dalek::SigningKey`, which zeroizes
//! itself on drop. There is no unsafe code in this module.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

/// Raw Ed25519 public key. Doubles as the node id on the wire (hex-encoded).
pub type PublicKey = [u8; 32];

/// Raw Ed25519 signature.
pub type SignatureBytes = [u8; 64];

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

// ── Key difficulty ────────────────────────────────────────────────────────────

/// Number of leading zero bits in BLAKE3(public_key).
///
/// A node proves it spent work generating its identity by presenting a key
/// whose digest starts with enough zero bits. Peers configure the minimum.
pub fn key_difficulty(public: &PublicKey) -> u32 {
    let digest = hash(public);
    let mut bits = 0;
    for byte in digest {
        if byte == 0 {
            bits += 8;
            continue;
        }
        bits += byte.leading_zeros();
        break;
    }
    bits
}

/// Does this key satisfy the required difficulty?
pub fn is_key_difficult(public: &PublicKey, required: u32) -> bool {
    key_difficulty(public) >= required
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A node's long-term Ed25519 identity.
///
/// The public key is the node id. The private key never leaves this struct
/// except through `private_bytes`, which hands back a zeroizing copy.
pub struct Keypair {
    signing: SigningKey,
    /// Public key: embedded as `sender` in every message this node signs.
    pub public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let public = signing.verifying_key().to_bytes();
        Self { signing, public }
    }

    /// Generate keys until one meets `difficulty`.
    ///
    /// Expected attempts double with each bit. Difficulty 0 returns the
    /// first key.
    pub fn generate_with_difficulty(difficulty: u32) -> Self {
        loop {
            let kp = Self::generate();
            if is_key_difficult(&kp.public, difficulty) {
                return kp;
            }
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&private_bytes);
        let public = signing.verifying_key().to_bytes();
        Self { signing, public }
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Hex-encoded public key, the form peers use to name each other.
    pub fn key_id(&self) -> String {
        hex::encode(self.public)
    }

    /// Sign arbitrary bytes.
    pub fn sign(&self, data: &[u8]) -> SignatureBytes {
        self.signing.sign(data).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `data` against a raw public key.
///
/// Returns false for malformed keys as well as bad signatures; callers
/// never need to distinguish the two.
pub fn verify(public: &PublicKey, data: &[u8], signature: &SignatureBytes) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public) else {
        return false;
    };
    let sig = Signature::from_bytes(signature);
    key.verify(data, &sig).is_ok()
}

/// Random nonce, e.g. `Hello::rand_val`.
pub fn random_u64() -> u64 {
    rand::random()
}

/// Parse a hex node id into a raw public key.
pub fn parse_key_id(key_id: &str) -> Result<PublicKey, CryptoError> {
    let bytes = hex::decode(key_id).map_err(|_| CryptoError::BadHex)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| CryptoError::BadKeyLength(len))
}

// ── Hex serde helpers ─────────────────────────────────────────────────────────

/// `#[serde(with = "hex_bytes")]` for fixed-size byte arrays.
pub mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<[u8; N], D::Error> {
        let text = String::deserialize(d)?;
        let raw = hex::decode(&text).map_err(de::Error::custom)?;
        let len = raw.len();
        raw.try_into()
            .map_err(|_| de::Error::custom(format!("expected {N} bytes, got {len}")))
    }

    /// Same encoding for `Option<[u8; N]>`; `None` is `null`.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer, const N: usize>(
            bytes: &Option<[u8; N]>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => s.serialize_some(&hex::encode(b)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
            d: D,
        ) -> Result<Option<[u8; N]>, D::Error> {
            let text: Option<String> = Option::deserialize(d)?;
            match text {
                None => Ok(None),
                Some(t) => {
                    let raw = hex::decode(&t).map_err(serde::de::Error::custom)?;
                    let len = raw.len();
                    raw.try_into().map(Some).map_err(|_| {
                        serde::de::Error::custom(format!("expected {N} bytes, got {len}"))
                    })
                }
            }
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key id is not valid hex")]
    BadHex,

    #[error("public key must be 32 bytes, got {0}")]
    BadKeyLength(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
