//! Public key abstraction for PFPK profiles
//!
//! Every wallet key type a chain can authenticate with is one entry in
//! [`KEY_TYPES`]. An entry selects the algorithm used to derive the
//! chain-agnostic address and to verify signatures. Supporting a new chain's
//! key type means adding a registry entry, never a new call site.

use std::fmt;
use std::hash::{Hash, Hasher};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bech32::{FromBase32, ToBase32, Variant};
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::types::PublicKeyRef;

/// Cosmos SDK secp256k1 key.
pub const COSMOS_SECP256K1: &str = "/cosmos.crypto.secp256k1.PubKey";
/// Injective ethsecp256k1 key (EVM-style addresses).
pub const INJECTIVE_ETH_SECP256K1: &str = "/injective.crypto.v1beta1.ethsecp256k1.PubKey";
/// Ethermint ethsecp256k1 key (EVM-style addresses).
pub const ETHERMINT_ETH_SECP256K1: &str = "/ethermint.crypto.v1.ethsecp256k1.PubKey";

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Crypto operation errors
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Unsupported public key type: {0}")]
    UnsupportedKeyType(String),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Invalid signature format: {0}")]
    InvalidSignature(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Address derivation and signature digest family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// RIPEMD160(SHA256(key)) addresses, SHA256(SHA256(msg)) digests.
    Secp256k1,
    /// Keccak256(uncompressed key)[12..] addresses, Keccak256(msg) digests.
    EthSecp256k1,
}

struct KeyTypeEntry {
    type_url: &'static str,
    algorithm: KeyAlgorithm,
}

/// Registered key types.
const KEY_TYPES: &[KeyTypeEntry] = &[
    KeyTypeEntry {
        type_url: COSMOS_SECP256K1,
        algorithm: KeyAlgorithm::Secp256k1,
    },
    KeyTypeEntry {
        type_url: INJECTIVE_ETH_SECP256K1,
        algorithm: KeyAlgorithm::EthSecp256k1,
    },
    KeyTypeEntry {
        type_url: ETHERMINT_ETH_SECP256K1,
        algorithm: KeyAlgorithm::EthSecp256k1,
    },
];

fn lookup_key_type(key_type: &str) -> Option<&'static KeyTypeEntry> {
    KEY_TYPES.iter().find(|entry| entry.type_url == key_type)
}

/// All registered key type URLs
pub fn supported_key_types() -> Vec<&'static str> {
    KEY_TYPES.iter().map(|entry| entry.type_url).collect()
}

impl KeyAlgorithm {
    fn derive_address(self, key: &VerifyingKey) -> [u8; 20] {
        let mut out = [0u8; 20];
        match self {
            KeyAlgorithm::Secp256k1 => {
                let compressed = key.to_encoded_point(true);
                let sha = Sha256::digest(compressed.as_bytes());
                out.copy_from_slice(&Ripemd160::digest(sha));
            }
            KeyAlgorithm::EthSecp256k1 => {
                let uncompressed = key.to_encoded_point(false);
                let hash = Keccak256::digest(&uncompressed.as_bytes()[1..]);
                out.copy_from_slice(&hash[12..]);
            }
        }
        out
    }

    fn message_digest(self, message: &[u8]) -> [u8; 32] {
        match self {
            KeyAlgorithm::Secp256k1 => Sha256::digest(Sha256::digest(message)).into(),
            KeyAlgorithm::EthSecp256k1 => Keccak256::digest(message).into(),
        }
    }

    fn signature_bytes(self, raw: &[u8]) -> CryptoResult<[u8; 64]> {
        let trimmed = match (self, raw.len()) {
            (_, 64) => raw,
            // r || s || v as produced by EVM wallets
            (KeyAlgorithm::EthSecp256k1, 65) => &raw[..64],
            (_, len) => {
                return Err(CryptoError::InvalidSignature(format!(
                    "signature must be 64 bytes, got {}",
                    len
                )))
            }
        };
        let mut out = [0u8; 64];
        out.copy_from_slice(trimmed);
        Ok(out)
    }
}

/// A wallet public key of a registered type.
///
/// The hex form is normalized to the compressed SEC1 encoding, so two
/// requests naming the same key always compare equal.
#[derive(Clone)]
pub struct PublicKey {
    key_type: &'static str,
    hex: String,
    algorithm: KeyAlgorithm,
    verifying_key: VerifyingKey,
}

impl PublicKey {
    /// Construct a key from its type URL and hex-encoded SEC1 bytes.
    pub fn new(key_type: &str, public_key_hex: &str) -> CryptoResult<Self> {
        let entry = lookup_key_type(key_type)
            .ok_or_else(|| CryptoError::UnsupportedKeyType(key_type.to_string()))?;

        let bytes = hex::decode(public_key_hex.trim())
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        let verifying_key = VerifyingKey::from_sec1_bytes(&bytes)
            .map_err(|_| CryptoError::InvalidPublicKey("not a secp256k1 point".into()))?;

        Ok(Self {
            key_type: entry.type_url,
            hex: hex::encode(verifying_key.to_encoded_point(true).as_bytes()),
            algorithm: entry.algorithm,
            verifying_key,
        })
    }

    pub fn from_ref(key: &PublicKeyRef) -> CryptoResult<Self> {
        Self::new(&key.key_type, &key.hex)
    }

    pub fn key_type(&self) -> &'static str {
        self.key_type
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Chain-agnostic address (lowercase hex, 20 bytes).
    pub fn address_hex(&self) -> String {
        hex::encode(self.algorithm.derive_address(&self.verifying_key))
    }

    /// Bech32 address for a chain prefix. Re-encodes [`Self::address_hex`].
    pub fn bech32_address(&self, prefix: &str) -> CryptoResult<String> {
        address_hex_to_bech32(&self.address_hex(), prefix)
    }

    /// Verify a base64 signature over `message`.
    ///
    /// Returns `Ok(false)` when the signature does not match. Errors are
    /// reserved for input that is not a signature at all.
    pub fn verify(&self, message: &[u8], signature_b64: &str) -> CryptoResult<bool> {
        let raw = BASE64
            .decode(signature_b64.trim())
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        let bytes = self.algorithm.signature_bytes(&raw)?;

        let Ok(signature) = Signature::from_slice(&bytes) else {
            return Ok(false);
        };
        // High-S signatures are malleable duplicates; cosmos rejects them
        if signature.normalize_s().is_some() {
            return Ok(false);
        }
        let digest = self.algorithm.message_digest(message);

        Ok(self.verifying_key.verify_prehash(&digest, &signature).is_ok())
    }

    pub fn to_ref(&self) -> PublicKeyRef {
        PublicKeyRef {
            key_type: self.key_type.to_string(),
            hex: self.hex.clone(),
        }
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_type == other.key_type && self.hex == other.hex
    }
}

impl Eq for PublicKey {}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_type.hash(state);
        self.hex.hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("type", &self.key_type)
            .field("hex", &self.hex)
            .finish()
    }
}

/// Compressed lowercase hex of a secp256k1 key given in any SEC1 encoding.
pub fn normalize_public_key_hex(public_key_hex: &str) -> CryptoResult<String> {
    let bytes = hex::decode(public_key_hex.trim().trim_start_matches("0x"))
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let key = VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|_| CryptoError::InvalidPublicKey("not a secp256k1 point".into()))?;
    Ok(hex::encode(key.to_encoded_point(true).as_bytes()))
}

/// Encode a 20-byte address hex under a bech32 prefix.
pub fn address_hex_to_bech32(address_hex: &str, prefix: &str) -> CryptoResult<String> {
    let bytes = hex::decode(address_hex).map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;
    bech32::encode(prefix, bytes.to_base32(), Variant::Bech32)
        .map_err(|e| CryptoError::InvalidAddress(e.to_string()))
}

/// Decode a bech32 address into its prefix and address hex.
pub fn bech32_to_address_hex(address: &str) -> CryptoResult<(String, String)> {
    let (prefix, data, variant) =
        bech32::decode(address).map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;
    if variant != Variant::Bech32 {
        return Err(CryptoError::InvalidAddress("expected bech32, got bech32m".into()));
    }
    let bytes = Vec::<u8>::from_base32(&data).map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;
    Ok((prefix, hex::encode(bytes)))
}
