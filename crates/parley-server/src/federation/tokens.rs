//! Bearer tokens asserting a user's identity to one peer instance.

use std::sync::Arc;

use parley_shared::keys::parse_public_key_hex;
use parley_shared::token::{self, BearerClaims};
use parley_shared::error::TokenError;
use tracing::debug;

use crate::error::ServerError;
use crate::federation::keys::KeyAuthority;
use crate::federation::registry::InstanceTrustRegistry;
use crate::state::Store;

/// A remote user whose bearer token checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// Numeric id on the issuing instance.
    pub subject_id: i64,
    pub name: String,
    pub avatar: Option<String>,
    pub public_id: String,
    pub issuer_domain: String,
    pub instance_id: i64,
}

pub struct TokenAuthority {
    store: Store,
    keys: Arc<KeyAuthority>,
    registry: Arc<InstanceTrustRegistry>,
}

impl TokenAuthority {
    pub fn new(store: Store, keys: Arc<KeyAuthority>, registry: Arc<InstanceTrustRegistry>) -> Self {
        Self {
            store,
            keys,
            registry,
        }
    }

    pub fn issue_bearer(
        &self,
        subject_id: i64,
        name: &str,
        avatar: Option<&str>,
        public_id: &str,
        target_domain: &str,
    ) -> Result<String, ServerError> {
        let claims = BearerClaims::new(
            self.keys.domain(),
            target_domain,
            subject_id,
            name,
            avatar,
            public_id,
        );
        self.keys.sign(&claims)
    }

    pub fn verify_bearer(&self, bearer: &str) -> Result<VerifiedIdentity, ServerError> {
        let peeked: BearerClaims = token::decode_unverified(bearer)
            .map_err(|_| ServerError::Unauthorized("Malformed token".to_string()))?;
        let issuer = peeked.registered.iss;

        // Untrusted issuers are turned away before any signature work.
        let instance = self.registry.require_active(&issuer).map_err(|e| {
            debug!(issuer = %issuer, error = %e, "bearer token from untrusted issuer");
            ServerError::Unauthorized("Untrusted issuer".to_string())
        })?;
        let public_key = instance
            .public_key
            .as_deref()
            .ok_or(ServerError::InvalidSignature)?;
        let key = parse_public_key_hex(public_key).map_err(|_| ServerError::InvalidSignature)?;

        let claims: BearerClaims = token::verify(bearer, &key).map_err(|e| match e {
            TokenError::Expired | TokenError::NotYetValid => {
                ServerError::Unauthorized(e.to_string())
            }
            _ => ServerError::InvalidSignature,
        })?;

        if claims.registered.aud.as_deref() != Some(self.keys.domain()) {
            return Err(ServerError::Unauthorized("Token audience mismatch".to_string()));
        }
        let public_id = claims
            .public_id
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ServerError::Unauthorized("Token missing publicId".to_string()))?;
        let subject_id = claims
            .sub
            .parse::<i64>()
            .map_err(|_| ServerError::Unauthorized("Malformed subject".to_string()))?;

        self.store.with(|db| db.touch_instance(instance.id))?;

        Ok(VerifiedIdentity {
            subject_id,
            name: claims.name,
            avatar: claims.avatar,
            public_id,
            issuer_domain: instance.domain,
            instance_id: instance.id,
        })
    }
}
