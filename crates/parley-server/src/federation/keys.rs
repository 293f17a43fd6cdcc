//! The instance signing key.

use std::sync::{Arc, RwLock};

use parley_shared::keys::{parse_public_key_hex, InstanceKeypair};
use parley_shared::token::{self, ChallengeClaims};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ServerError;
use crate::state::Store;

/// Owns the instance's Ed25519 keypair.
///
/// The keypair is generated on first use and persisted; the loaded copy is
/// cached in memory until [`KeyAuthority::clear`] or
/// [`KeyAuthority::regenerate`].
pub struct KeyAuthority {
    store: Store,
    domain: String,
    cached: RwLock<Option<Arc<InstanceKeypair>>>,
}

impl KeyAuthority {
    pub fn new(store: Store, domain: &str) -> Self {
        Self {
            store,
            domain: domain.to_string(),
            cached: RwLock::new(None),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The active keypair, loading or generating it if needed.
    pub fn keypair(&self) -> Result<Arc<InstanceKeypair>, ServerError> {
        if let Some(kp) = self.cached.read().ok().and_then(|g| g.clone()) {
            return Ok(kp);
        }

        let material = self.store.with(|db| match db.canonical_key_material()? {
            Some(m) => Ok(m),
            None => {
                let kp = InstanceKeypair::generate();
                info!(public_key = %kp.public_key_hex(), "generated instance keypair");
                // Re-reads the earliest row, so a racing generator converges.
                db.insert_key_material(&kp.public_key_hex(), &kp.secret_hex())
            }
        })?;

        let keypair = Arc::new(
            InstanceKeypair::from_secret_hex(&material.secret_key)
                .map_err(|e| ServerError::Internal(format!("stored key is corrupt: {e}")))?,
        );
        if let Ok(mut guard) = self.cached.write() {
            *guard = Some(keypair.clone());
        }
        Ok(keypair)
    }

    pub fn public_key_hex(&self) -> Result<String, ServerError> {
        Ok(self.keypair()?.public_key_hex())
    }

    /// Sign any claim set with the instance key.
    pub fn sign<C: Serialize>(&self, claims: &C) -> Result<String, ServerError> {
        let keypair = self.keypair()?;
        token::sign(&keypair, claims)
            .map_err(|e| ServerError::Internal(format!("token signing failed: {e}")))
    }

    /// Short-lived proof that we hold our key, carrying `data`.
    pub fn sign_challenge(&self, data: &str) -> Result<String, ServerError> {
        self.sign(&ChallengeClaims::new(&self.domain, data))
    }

    /// Check a challenge against a hex-encoded public key. Any failure
    /// (bad key, bad signature, expired) yields `None`.
    pub fn verify_challenge(&self, challenge: &str, public_key_hex: &str) -> Option<ChallengeClaims> {
        let key = parse_public_key_hex(public_key_hex).ok()?;
        match token::verify::<ChallengeClaims>(challenge, &key) {
            Ok(claims) => Some(claims),
            Err(e) => {
                warn!(error = %e, "challenge verification failed");
                None
            }
        }
    }

    /// Delete the stored keypair and forget the cached copy.
    pub fn clear(&self) -> Result<(), ServerError> {
        self.store.with(|db| db.delete_key_material())?;
        if let Ok(mut guard) = self.cached.write() {
            *guard = None;
        }
        info!("instance keypair cleared");
        Ok(())
    }

    /// Replace the keypair. Peers pinned the old public key, so callers must
    /// also drop every instance record.
    pub fn regenerate(&self) -> Result<Arc<InstanceKeypair>, ServerError> {
        self.clear()?;
        self.keypair()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_store::Database;

    fn authority() -> KeyAuthority {
        KeyAuthority::new(Store::new(Database::open_in_memory().unwrap()), "a.example")
    }

    #[test]
    fn test_keypair_is_lazy_and_stable() {
        let keys = authority();
        let first = keys.public_key_hex().unwrap();
        assert_eq!(first, keys.public_key_hex().unwrap());

        // A second authority over the same store sees the persisted key.
        let other = KeyAuthority::new(keys.store.clone(), "a.example");
        assert_eq!(other.public_key_hex().unwrap(), first);
    }

    #[test]
    fn test_challenge_roundtrip() {
        let keys = authority();
        let challenge = keys.sign_challenge("a.example").unwrap();
        let claims = keys
            .verify_challenge(&challenge, &keys.public_key_hex().unwrap())
            .unwrap();
        assert_eq!(claims.data, "a.example");
        assert_eq!(claims.registered.iss, "a.example");
    }

    #[test]
    fn test_challenge_rejects_other_key() {
        let keys = authority();
        let other = InstanceKeypair::generate();
        let challenge = keys.sign_challenge("x").unwrap();

        assert!(keys.verify_challenge(&challenge, &other.public_key_hex()).is_none());
        assert!(keys.verify_challenge(&challenge, "not-hex").is_none());
        assert!(keys.verify_challenge("garbage", &keys.public_key_hex().unwrap()).is_none());
    }

    #[test]
    fn test_regenerate_changes_key() {
        let keys = authority();
        let before = keys.public_key_hex().unwrap();
        let after = keys.regenerate().unwrap().public_key_hex();
        assert_ne!(before, after);
        assert_eq!(keys.public_key_hex().unwrap(), after);
    }

    #[test]
    fn test_clear_drops_cache() {
        let keys = authority();
        let before = keys.public_key_hex().unwrap();
        keys.clear().unwrap();
        assert!(keys
            .store
            .with(|db| db.canonical_key_material())
            .unwrap()
            .is_none());
        assert_ne!(keys.public_key_hex().unwrap(), before);
    }
}
