//! Signed outbound calls to peer instances.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parley_shared::protocol::{
    paths, AcceptRequest, DmRelayPayload, FriendActionPayload, HandshakeRequest,
    HandshakeResponse, InfoResponse, ReportPayload, FROM_DOMAIN_FIELD, SIGNATURE_FIELD,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::federation::keys::KeyAuthority;

/// Whether `domain` (host with optional port) is a loopback or development
/// host, reached over plain http.
pub fn is_dev_host(domain: &str) -> bool {
    let host = if let Some(rest) = domain.strip_prefix('[') {
        // [v6]:port
        rest.split(']').next().unwrap_or(rest)
    } else if domain.matches(':').count() == 1 {
        domain.split(':').next().unwrap_or(domain)
    } else {
        domain
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }
    let host = host.to_ascii_lowercase();
    host == "localhost" || host.ends_with(".localhost") || host.ends_with(".local")
}

/// `http://` for dev hosts, `https://` otherwise.
pub fn base_url(domain: &str) -> String {
    let scheme = if is_dev_host(domain) { "http" } else { "https" };
    format!("{scheme}://{domain}")
}

pub struct RelayDispatcher {
    keys: Arc<KeyAuthority>,
    http: reqwest::Client,
    instance_name: String,
    accept_retry_delay: Duration,
}

impl RelayDispatcher {
    pub fn new(keys: Arc<KeyAuthority>, http: reqwest::Client, config: &ServerConfig) -> Self {
        Self {
            keys,
            http,
            instance_name: config.instance_name.clone(),
            accept_retry_delay: config.accept_retry_delay,
        }
    }

    /// `GET {peer}/federation/info`, used for reverse verification.
    pub async fn fetch_info(&self, peer: &str) -> Result<InfoResponse, ServerError> {
        let url = format!("{}{}", base_url(peer), paths::INFO);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ServerError::Network(format!(
                "{url} answered {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    /// Sign `payload` and wrap it in the relay envelope.
    pub fn sign_envelope<P: Serialize>(&self, payload: &P) -> Result<Value, ServerError> {
        let mut body = serde_json::to_value(payload)
            .map_err(|e| ServerError::Internal(format!("serialize relay payload: {e}")))?;
        let data = body.to_string();
        let signature = self.keys.sign_challenge(&data)?;

        let object = body
            .as_object_mut()
            .ok_or_else(|| ServerError::Internal("relay payload must be an object".to_string()))?;
        object.insert(
            FROM_DOMAIN_FIELD.to_string(),
            Value::String(self.keys.domain().to_string()),
        );
        object.insert(SIGNATURE_FIELD.to_string(), Value::String(signature));
        Ok(body)
    }

    /// Send a signed relay and decode the answer.
    pub async fn relay_for<P, R>(&self, peer: &str, path: &str, payload: &P) -> Result<R, ServerError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let body = self.sign_envelope(payload)?;
        let url = format!("{}{}", base_url(peer), path);
        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ServerError::Network(format!("{url} answered {status}")));
        }
        Ok(resp.json().await?)
    }

    /// Fire-and-forget relay. Failures are logged and reported as `false`.
    pub async fn relay<P: Serialize>(&self, peer: &str, path: &str, payload: &P) -> bool {
        match self.relay_for::<P, Value>(peer, path, payload).await {
            Ok(_) => {
                debug!(peer = %peer, path, "relay delivered");
                true
            }
            Err(e) => {
                warn!(peer = %peer, path, error = %e, "relay failed");
                false
            }
        }
    }

    /// Ask `peer` to trust us.
    pub async fn send_handshake_request(&self, peer: &str) -> Result<HandshakeResponse, ServerError> {
        let domain = self.keys.domain().to_string();
        let request = HandshakeRequest {
            signature: Some(self.keys.sign_challenge(&domain)?),
            public_key: Some(self.keys.public_key_hex()?),
            name: Some(self.instance_name.clone()),
            domain: Some(domain),
        };
        let url = format!("{}{}", base_url(peer), paths::REQUEST);
        let resp = self.http.post(&url).json(&request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ServerError::Network(format!("{url} answered {status}: {detail}")));
        }
        Ok(resp.json().await?)
    }

    async fn try_accept_notice(&self, peer: &str) -> Result<(), ServerError> {
        let domain = self.keys.domain().to_string();
        let notice = AcceptRequest {
            signature: Some(self.keys.sign_challenge(&domain)?),
            domain: Some(domain),
        };
        let url = format!("{}{}", base_url(peer), paths::ACCEPT);
        let resp = self.http.post(&url).json(&notice).send().await?;
        if !resp.status().is_success() {
            return Err(ServerError::Network(format!(
                "{url} answered {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Tell `peer` we approved it. Retried once after a fixed delay; a
    /// second failure is only logged.
    pub async fn send_accept_notice(&self, peer: &str) -> bool {
        match self.try_accept_notice(peer).await {
            Ok(()) => {
                info!(peer = %peer, "accept notice delivered");
                return true;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "accept notice failed, retrying");
            }
        }

        tokio::time::sleep(self.accept_retry_delay).await;

        match self.try_accept_notice(peer).await {
            Ok(()) => {
                info!(peer = %peer, "accept notice delivered on retry");
                true
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "accept notice failed after retry");
                false
            }
        }
    }

    pub fn spawn_accept_notice(self: &Arc<Self>, peer: String) -> tokio::task::JoinHandle<bool> {
        let relay = self.clone();
        tokio::spawn(async move { relay.send_accept_notice(&peer).await })
    }

    pub async fn send_friend_request(&self, peer: &str, payload: &FriendActionPayload) -> bool {
        self.relay(peer, paths::FRIEND_REQUEST, payload).await
    }

    pub async fn send_friend_accept(&self, peer: &str, payload: &FriendActionPayload) -> bool {
        self.relay(peer, paths::FRIEND_ACCEPT, payload).await
    }

    pub async fn send_friend_remove(&self, peer: &str, payload: &FriendActionPayload) -> bool {
        self.relay(peer, paths::FRIEND_REMOVE, payload).await
    }

    pub async fn send_dm(&self, peer: &str, payload: &DmRelayPayload) -> bool {
        self.relay(peer, paths::DM_RELAY, payload).await
    }

    pub async fn send_report(&self, peer: &str, payload: &ReportPayload) -> bool {
        self.relay(peer, paths::REPORT_USER, payload).await
    }
}
