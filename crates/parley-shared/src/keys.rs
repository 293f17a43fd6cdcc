use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::constants::{KDF_CONTEXT_SHADOW_HANDLE, PUBKEY_SIZE, SECRET_KEY_SIZE};
use crate::error::KeyError;

/// The instance's Ed25519 signing identity.
/// Peers learn the public half through `GET /federation/info`.
#[derive(Clone)]
pub struct InstanceKeypair {
    signing_key: SigningKey,
}

impl InstanceKeypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore a keypair from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; SECRET_KEY_SIZE]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    /// Restore a keypair from a hex-encoded secret key
    pub fn from_secret_hex(hex_secret: &str) -> Result<Self, KeyError> {
        let bytes = decode_fixed::<SECRET_KEY_SIZE>(hex_secret)?;
        Ok(Self::from_secret_bytes(&bytes))
    }

    /// Get the raw public key bytes
    pub fn public_key_bytes(&self) -> [u8; PUBKEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Public key in the hex form used on the wire
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Secret key in the hex form used for persistence
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.as_bytes())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Get the verifying (public) key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl std::fmt::Debug for InstanceKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceKeypair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Parse a hex-encoded Ed25519 public key as sent by a peer.
pub fn parse_public_key_hex(hex_key: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = decode_fixed::<PUBKEY_SIZE>(hex_key)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidKeyBytes)
}

/// Verify a signature against a public key
pub fn verify_signature(
    verifying_key: &VerifyingKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), KeyError> {
    verifying_key
        .verify(message, signature)
        .map_err(|_| KeyError::InvalidKeyBytes)
}

/// Derive the synthetic local handle for a shadow user.
///
/// The handle is deterministic in `(instance_id, remote_numeric_id)` plus the
/// remote public id when one is known, so a peer that reissues numeric ids
/// (or sends `0`) never maps two remote users onto one handle.
pub fn derive_shadow_handle(
    instance_id: i64,
    remote_numeric_id: i64,
    remote_public_id: Option<&str>,
) -> String {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SHADOW_HANDLE);
    hasher.update(&instance_id.to_le_bytes());
    hasher.update(&remote_numeric_id.to_le_bytes());
    if let Some(public_id) = remote_public_id {
        hasher.update(public_id.as_bytes());
    }
    let hex = hasher.finalize().to_hex();
    format!("fed_{}", &hex[..24])
}

fn decode_fixed<const N: usize>(hex_str: &str) -> Result<[u8; N], KeyError> {
    let bytes = hex::decode(hex_str.trim())?;
    if bytes.len() != N {
        return Err(KeyError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        });
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}
