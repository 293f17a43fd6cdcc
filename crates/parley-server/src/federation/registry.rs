//! Known peer instances and the handshake state machine.

use std::sync::Arc;

use parley_shared::protocol::{AcceptRequest, HandshakeRequest, InstanceSummary};
use parley_shared::types::{Direction, InstanceStatus, TrustState};
use parley_store::{Instance, StoreError};
use tracing::{info, warn};

use crate::cors::CorsCache;
use crate::error::ServerError;
use crate::events::{EventBus, FederationEvent};
use crate::federation::keys::KeyAuthority;
use crate::federation::relay::RelayDispatcher;
use crate::state::Store;

/// Trim and sanity-check a peer domain (host with optional port).
pub fn normalize_domain(raw: &str) -> Result<String, ServerError> {
    let domain = raw.trim().trim_end_matches('/');
    if domain.is_empty()
        || domain.contains("://")
        || domain.contains('/')
        || domain.chars().any(char::is_whitespace)
    {
        return Err(ServerError::BadRequest(format!("Invalid domain: {raw}")));
    }
    Ok(domain.to_string())
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str, ServerError> {
    field
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ServerError::BadRequest(format!("Missing required field: {name}")))
}

pub struct InstanceTrustRegistry {
    store: Store,
    keys: Arc<KeyAuthority>,
    relay: Arc<RelayDispatcher>,
    events: EventBus,
    cors: CorsCache,
}

impl InstanceTrustRegistry {
    pub fn new(
        store: Store,
        keys: Arc<KeyAuthority>,
        relay: Arc<RelayDispatcher>,
        events: EventBus,
        cors: CorsCache,
    ) -> Self {
        Self {
            store,
            keys,
            relay,
            events,
            cors,
        }
    }

    pub fn is_enabled(&self) -> Result<bool, ServerError> {
        self.store.with(|db| db.federation_enabled())
    }

    pub fn find(&self, domain: &str) -> Result<Option<Instance>, ServerError> {
        self.store.with(|db| db.find_instance_by_domain(domain))
    }

    fn get(&self, domain: &str) -> Result<Instance, ServerError> {
        self.find(domain)?
            .ok_or_else(|| ServerError::NotFound(format!("Instance {domain}")))
    }

    /// The instance behind `domain`, if we currently trust it.
    pub fn require_active(&self, domain: &str) -> Result<Instance, ServerError> {
        let instance = self
            .find(domain)?
            .ok_or_else(|| ServerError::Forbidden(format!("Unknown instance {domain}")))?;
        if instance.trust.is_blocked() {
            return Err(ServerError::InstanceBlocked);
        }
        if !instance.trust.is_active() {
            return Err(ServerError::Forbidden(format!("Instance {domain} is not trusted")));
        }
        Ok(instance)
    }

    pub fn touch(&self, instance_id: i64) -> Result<(), ServerError> {
        self.store.with(|db| db.touch_instance(instance_id))
    }

    pub fn list(&self) -> Result<Vec<InstanceSummary>, ServerError> {
        let instances = self.store.with(|db| db.list_instances())?;
        Ok(instances.into_iter().map(summarize).collect())
    }

    fn changed(&self, instance: &Instance) {
        self.cors.invalidate();
        self.events.publish(FederationEvent::InstanceUpdated {
            domain: instance.domain.clone(),
            status: instance.status(),
            direction: instance.direction(),
        });
    }

    fn set_trust(&self, instance: &Instance, trust: TrustState) -> Result<Instance, ServerError> {
        let updated = self.store.with(|db| db.set_instance_trust(instance.id, trust))?;
        info!(
            domain = %updated.domain,
            status = %trust.status,
            direction = %trust.direction,
            "instance trust changed"
        );
        self.changed(&updated);
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Inbound protocol
    // -----------------------------------------------------------------------

    /// A peer asks for trust. The signature must come from the advertised key
    /// and that key must be the one the domain itself serves.
    pub async fn receive_request(&self, req: &HandshakeRequest) -> Result<Instance, ServerError> {
        let domain = required(&req.domain, "domain")?;
        let name = required(&req.name, "name")?;
        let public_key = required(&req.public_key, "publicKey")?;
        let signature = required(&req.signature, "signature")?;

        let claims = self
            .keys
            .verify_challenge(signature, public_key)
            .ok_or(ServerError::InvalidSignature)?;
        if claims.data != domain || claims.registered.iss != domain {
            return Err(ServerError::InvalidSignature);
        }

        if let Some(existing) = self.find(domain)? {
            if existing.trust.is_blocked() {
                warn!(domain = %domain, "handshake request from blocked instance");
                return Err(ServerError::InstanceBlocked);
            }
        }

        let info = self.relay.fetch_info(domain).await.map_err(|e| {
            warn!(domain = %domain, error = %e, "reverse verification unreachable");
            ServerError::DomainVerificationFailed(format!("{domain} is unreachable"))
        })?;
        if info.public_key.as_deref() != Some(public_key) {
            warn!(domain = %domain, "reverse verification key mismatch");
            return Err(ServerError::DomainVerificationFailed(format!(
                "{domain} advertises a different key"
            )));
        }

        let existing = match self.find(domain)? {
            Some(existing) => existing,
            None => {
                let created = self.store.with(|db| {
                    let instance = db.insert_instance(
                        domain,
                        Some(name),
                        Some(public_key),
                        TrustState::PENDING_INCOMING,
                        None,
                    )?;
                    db.touch_instance(instance.id)?;
                    db.get_instance(instance.id)
                });
                match created {
                    Ok(instance) => {
                        info!(domain = %domain, "new incoming federation request");
                        self.changed(&instance);
                        return Ok(instance);
                    }
                    // Created concurrently by another request.
                    Err(ServerError::Store(StoreError::Conflict)) => self.get(domain)?,
                    Err(e) => return Err(e),
                }
            }
        };

        if existing.trust.is_blocked() {
            return Err(ServerError::InstanceBlocked);
        }

        let refreshed = self
            .store
            .with(|db| db.refresh_instance(existing.id, Some(name), public_key))?;

        // We had already reached out: both sides want this, collapse to mutual.
        if existing.direction() == Direction::Outgoing {
            return self.set_trust(&refreshed, TrustState::ACTIVE_MUTUAL);
        }

        Ok(refreshed)
    }

    /// A peer tells us it approved us.
    pub fn receive_accept(&self, req: &AcceptRequest) -> Result<Instance, ServerError> {
        let domain = required(&req.domain, "domain")?;
        let signature = required(&req.signature, "signature")?;

        let instance = self.get(domain)?;
        if instance.trust.is_blocked() {
            return Err(ServerError::InstanceBlocked);
        }
        let public_key = instance
            .public_key
            .as_deref()
            .ok_or(ServerError::InvalidSignature)?;
        if instance.trust.awaits_local_approval() {
            warn!(domain = %domain, "accept notice before local approval");
            return Err(ServerError::ApprovalNotYetGranted);
        }

        let claims = self
            .keys
            .verify_challenge(signature, public_key)
            .ok_or(ServerError::InvalidSignature)?;
        if claims.data != domain || claims.registered.iss != domain {
            return Err(ServerError::InvalidSignature);
        }

        self.touch(instance.id)?;
        if instance.trust == TrustState::ACTIVE_MUTUAL {
            return Ok(instance);
        }
        self.set_trust(&instance, TrustState::ACTIVE_MUTUAL)
    }

    // -----------------------------------------------------------------------
    // Local administration
    // -----------------------------------------------------------------------

    /// Approve a peer and notify it in the background.
    pub fn approve(&self, domain: &str) -> Result<Instance, ServerError> {
        let instance = self.get(domain)?;
        if instance.trust.is_blocked() {
            return Err(ServerError::InstanceBlocked);
        }
        let updated = self.set_trust(&instance, TrustState::ACTIVE_MUTUAL)?;
        self.relay.spawn_accept_notice(updated.domain.clone());
        Ok(updated)
    }

    /// Start trusting `domain` from our side and send it a handshake request.
    pub async fn add_outgoing(
        &self,
        raw_domain: &str,
        added_by: Option<i64>,
    ) -> Result<Instance, ServerError> {
        let domain = normalize_domain(raw_domain)?;
        if domain == self.keys.domain() {
            return Err(ServerError::BadRequest("Cannot federate with ourselves".to_string()));
        }

        if let Some(existing) = self.find(&domain)? {
            if existing.trust.is_blocked() {
                return Err(ServerError::InstanceBlocked);
            }
            if existing.trust.awaits_local_approval() {
                // They asked first; adding them is our approval.
                return self.approve(&domain);
            }
            if existing.trust.is_active() {
                return Ok(existing);
            }
        }

        let info = self.relay.fetch_info(&domain).await.map_err(|e| {
            ServerError::DomainVerificationFailed(format!("{domain} is unreachable: {e}"))
        })?;
        let public_key = info.public_key.filter(|k| !k.is_empty()).ok_or_else(|| {
            ServerError::DomainVerificationFailed(format!("{domain} has federation disabled"))
        })?;

        let instance = match self.find(&domain)? {
            Some(existing) => self
                .store
                .with(|db| db.refresh_instance(existing.id, Some(&info.name), &public_key))?,
            None => {
                let created = self.store.with(|db| {
                    db.insert_instance(
                        &domain,
                        Some(&info.name),
                        Some(&public_key),
                        TrustState::PENDING_OUTGOING,
                        added_by,
                    )
                })?;
                self.changed(&created);
                created
            }
        };
        info!(domain = %domain, "sending federation request");

        let response = self.relay.send_handshake_request(&domain).await?;
        if response.status == InstanceStatus::Active {
            // They had already reached out to us.
            let current = self.get(&domain)?;
            if !current.trust.is_active() {
                return self.set_trust(&current, TrustState::ACTIVE_MUTUAL);
            }
            return Ok(current);
        }
        self.get(&instance.domain)
    }

    /// Block a peer and drop every shadow user it owns.
    pub fn block(&self, domain: &str) -> Result<Instance, ServerError> {
        let instance = self.get(domain)?;
        let removed = self.store.with(|db| db.delete_shadow_users(instance.id))?;
        let blocked = self.set_trust(&instance, instance.trust.blocked())?;
        info!(domain = %domain, shadow_users = removed, "instance blocked");
        Ok(blocked)
    }

    /// Forget a peer entirely. The peer is not notified.
    pub fn remove(&self, domain: &str) -> Result<(), ServerError> {
        let instance = self.get(domain)?;
        self.store.with(|db| db.delete_instance(instance.id))?;
        info!(domain = %domain, "instance removed");
        self.cors.invalidate();
        self.events.publish(FederationEvent::InstanceRemoved {
            domain: instance.domain,
        });
        Ok(())
    }

    /// Drop every instance (and with it every shadow user).
    pub fn purge_all(&self) -> Result<usize, ServerError> {
        let removed = self.store.with(|db| db.delete_all_instances())?;
        self.cors.invalidate();
        Ok(removed)
    }

    pub fn enable(&self) -> Result<(), ServerError> {
        self.store.with(|db| db.set_federation_enabled(true))?;
        let key = self.keys.public_key_hex()?;
        info!(public_key = %key, "federation enabled");
        self.cors.invalidate();
        self.events
            .publish(FederationEvent::FederationToggled { enabled: true });
        Ok(())
    }

    /// Turn federation off and drop all trust, shadow users and the keypair,
    /// so re-enabling starts from a fresh root.
    pub fn disable(&self) -> Result<(), ServerError> {
        self.store.with(|db| db.set_federation_enabled(false))?;
        let removed = self.purge_all()?;
        self.keys.clear()?;
        info!(instances = removed, "federation disabled");
        self.events
            .publish(FederationEvent::FederationToggled { enabled: false });
        Ok(())
    }

    /// New keypair. Every peer pinned the old key, so all trust is dropped.
    pub fn rotate_keys(&self) -> Result<String, ServerError> {
        let removed = self.purge_all()?;
        let key = self.keys.regenerate()?.public_key_hex();
        info!(instances = removed, public_key = %key, "instance keys rotated");
        Ok(key)
    }
}

pub fn summarize(instance: Instance) -> InstanceSummary {
    InstanceSummary {
        status: instance.status(),
        direction: instance.direction(),
        domain: instance.domain,
        name: instance.name,
        last_seen_at: instance.last_seen_at,
        created_at: instance.created_at,
    }
}
