//! Compact signed tokens.
//!
//! A token is `base64url(header) . base64url(claims) . base64url(signature)`
//! where the signature is Ed25519 over the first two segments joined by a
//! dot. Two claim sets ride on this format: [`ChallengeClaims`] (proof of
//! key possession, no audience) and [`BearerClaims`] (a remote user's
//! identity, bound to one target instance).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::{BEARER_TOKEN_TTL_SECS, CHALLENGE_TTL_SECS, TOKEN_CLOCK_LEEWAY_SECS};
use crate::error::TokenError;
use crate::keys::{verify_signature, InstanceKeypair};

const ALGORITHM: &str = "EdDSA";
const TOKEN_TYPE: &str = "JWT";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Claims every token carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredClaims {
    /// Domain of the signing instance.
    pub iss: String,
    /// Domain of the instance the token is meant for, if restricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

impl RegisteredClaims {
    pub fn new(issuer: &str, audience: Option<&str>, ttl_secs: i64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            iss: issuer.to_string(),
            aud: audience.map(str::to_string),
            iat: now,
            exp: now + ttl_secs,
        }
    }

    fn check_time(&self, now: i64) -> Result<(), TokenError> {
        if now >= self.exp {
            return Err(TokenError::Expired);
        }
        if self.iat > now + TOKEN_CLOCK_LEEWAY_SECS {
            return Err(TokenError::NotYetValid);
        }
        Ok(())
    }
}

/// Access to the registered claims of a claim set.
pub trait Claims {
    fn registered(&self) -> &RegisteredClaims;
}

/// Short-lived proof that the issuer holds its private key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChallengeClaims {
    /// Opaque payload (a domain during handshakes, a JSON body for relays).
    pub data: String,
    #[serde(flatten)]
    pub registered: RegisteredClaims,
}

impl ChallengeClaims {
    pub fn new(issuer: &str, data: &str) -> Self {
        Self {
            data: data.to_string(),
            registered: RegisteredClaims::new(issuer, None, CHALLENGE_TTL_SECS),
        }
    }
}

impl Claims for ChallengeClaims {
    fn registered(&self) -> &RegisteredClaims {
        &self.registered
    }
}

/// Identity of a user on the issuing instance, addressed to one peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BearerClaims {
    /// Numeric user id on the issuing instance, string-encoded.
    pub sub: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Stable identity of the user. Tokens without it are rejected on receipt.
    #[serde(rename = "publicId", default, skip_serializing_if = "Option::is_none")]
    pub public_id: Option<String>,
    #[serde(flatten)]
    pub registered: RegisteredClaims,
}

impl BearerClaims {
    pub fn new(
        issuer: &str,
        audience: &str,
        subject_id: i64,
        name: &str,
        avatar: Option<&str>,
        public_id: &str,
    ) -> Self {
        Self {
            sub: subject_id.to_string(),
            name: name.to_string(),
            avatar: avatar.map(str::to_string),
            public_id: Some(public_id.to_string()),
            registered: RegisteredClaims::new(issuer, Some(audience), BEARER_TOKEN_TTL_SECS),
        }
    }
}

impl Claims for BearerClaims {
    fn registered(&self) -> &RegisteredClaims {
        &self.registered
    }
}

/// Sign a claim set into a compact token.
pub fn sign<C: Serialize>(keypair: &InstanceKeypair, claims: &C) -> Result<String, TokenError> {
    let header = Header {
        alg: ALGORITHM.to_string(),
        typ: TOKEN_TYPE.to_string(),
    };
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{header_b64}.{claims_b64}");

    let signature = keypair.sign(signing_input.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Read the claims without checking the signature.
///
/// Only for routing decisions (e.g. finding which key to verify with); the
/// result must never be trusted on its own.
pub fn decode_unverified<C: DeserializeOwned>(token: &str) -> Result<C, TokenError> {
    let (_, claims_b64, _) = split(token)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|_| TokenError::Malformed)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Verify signature and validity window, returning the claims.
pub fn verify<C: DeserializeOwned + Claims>(
    token: &str,
    key: &VerifyingKey,
) -> Result<C, TokenError> {
    let token = token.trim();
    let (header_b64, claims_b64, signature_b64) = split(token)?;

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| TokenError::Malformed)?;
    let header: Header = serde_json::from_slice(&header_bytes)?;
    if header.alg != ALGORITHM {
        return Err(TokenError::UnsupportedAlgorithm(header.alg));
    }

    let signature_bytes = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| TokenError::Malformed)?;
    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| TokenError::InvalidSignature)?;

    let signing_input = &token[..header_b64.len() + 1 + claims_b64.len()];
    verify_signature(key, signing_input.as_bytes(), &signature)
        .map_err(|_| TokenError::InvalidSignature)?;

    let claims_bytes = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|_| TokenError::Malformed)?;
    let claims: C = serde_json::from_slice(&claims_bytes)?;
    claims.registered().check_time(Utc::now().timestamp())?;

    Ok(claims)
}

fn split(token: &str) -> Result<(&str, &str, &str), TokenError> {
    let mut parts = token.trim().splitn(3, '.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(c), Some(s)) if !h.is_empty() && !c.is_empty() && !s.is_empty() => {
            Ok((h, c, s))
        }
        _ => Err(TokenError::Malformed),
    }
}
