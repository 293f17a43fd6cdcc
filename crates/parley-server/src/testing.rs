//! Helpers for tests that need a wired instance or a fake peer.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use parley_shared::constants::PROTOCOL_VERSION;
use parley_shared::keys::InstanceKeypair;
use parley_shared::protocol::{paths, HandshakeRequest, InfoResponse};
use parley_shared::token::{self, ChallengeClaims};
use parley_store::Database;
use tempfile::TempDir;

use crate::config::ServerConfig;
use crate::file_store::DiskFileStore;
use crate::state::AppState;

pub struct TestInstance {
    pub state: AppState,
    _dir: TempDir,
}

pub fn test_config(domain: &str, dir: &Path) -> ServerConfig {
    ServerConfig {
        domain: domain.to_string(),
        instance_name: format!("Test {domain}"),
        database_path: dir.join("parley.db"),
        file_storage_path: dir.join("files"),
        admin_token: Some("admin-secret".to_string()),
        http_timeout: Duration::from_secs(3),
        http_connect_timeout: Duration::from_secs(2),
        accept_retry_delay: Duration::from_millis(50),
        allow_private_fetch: true,
        ..ServerConfig::default()
    }
}

/// A wired instance with federation enabled, not listening anywhere.
pub async fn instance(domain: &str) -> TestInstance {
    let dir = TempDir::new().unwrap();
    let config = test_config(domain, dir.path());
    let files = DiskFileStore::new(config.file_storage_path.clone(), config.max_file_size)
        .await
        .unwrap();
    let state = AppState::new(config, Database::open_in_memory().unwrap(), Arc::new(files)).unwrap();
    state.registry.enable().unwrap();
    TestInstance {
        state,
        _dir: dir,
    }
}

pub async fn spawn_router(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A fake peer that only answers `GET /federation/info` with `advertised`.
pub async fn info_peer(advertised: &InstanceKeypair) -> String {
    let public_key = advertised.public_key_hex();
    let router = Router::new().route(
        paths::INFO,
        get(move || {
            let public_key = public_key.clone();
            async move {
                Json(InfoResponse {
                    domain: "peer".to_string(),
                    name: "Peer".to_string(),
                    version: PROTOCOL_VERSION.to_string(),
                    public_key: Some(public_key),
                    federation_enabled: true,
                })
            }
        }),
    );
    spawn_router(router).await.to_string()
}

/// A handshake request for `domain`, self-signed by `keypair`.
pub fn handshake_request(domain: &str, keypair: &InstanceKeypair) -> HandshakeRequest {
    HandshakeRequest {
        domain: Some(domain.to_string()),
        name: Some("Peer".to_string()),
        public_key: Some(keypair.public_key_hex()),
        signature: Some(token::sign(keypair, &ChallengeClaims::new(domain, domain)).unwrap()),
    }
}

/// A challenge over `data` issued by `domain`.
pub fn challenge(keypair: &InstanceKeypair, domain: &str, data: &str) -> String {
    token::sign(keypair, &ChallengeClaims::new(domain, data)).unwrap()
}
