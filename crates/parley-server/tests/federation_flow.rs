//! Two live instances on loopback: handshake, approval, relays and bearer
//! exchange over real HTTP.

use std::sync::Arc;
use std::time::Duration;

use parley_server::api;
use parley_server::config::ServerConfig;
use parley_server::file_store::DiskFileStore;
use parley_server::state::AppState;
use parley_shared::types::{InstanceStatus, TrustState};
use parley_store::{Database, NewUser, User};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;

const ADMIN_TOKEN: &str = "flow-admin";

struct Node {
    state: AppState,
    domain: String,
    _dir: TempDir,
}

impl Node {
    async fn spawn(name: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let domain = listener.local_addr().unwrap().to_string();

        let config = ServerConfig {
            domain: domain.clone(),
            instance_name: name.to_string(),
            database_path: dir.path().join("parley.db"),
            file_storage_path: dir.path().join("files"),
            admin_token: Some(ADMIN_TOKEN.to_string()),
            http_timeout: Duration::from_secs(5),
            accept_retry_delay: Duration::from_millis(100),
            allow_private_fetch: true,
            ..ServerConfig::default()
        };
        let files = Arc::new(
            DiskFileStore::new(config.file_storage_path.clone(), config.max_file_size)
                .await
                .unwrap(),
        );
        let db = Database::open_at(&config.database_path).unwrap();
        let state = AppState::new(config, db, files).unwrap();
        state.registry.enable().unwrap();

        tokio::spawn(api::serve_on(listener, state.clone()));

        Self {
            state,
            domain,
            _dir: dir,
        }
    }

    fn user(&self, handle: &str, name: &str) -> User {
        self.state
            .store
            .with(|db| db.create_user(&NewUser::local(handle, name)))
            .unwrap()
    }

    fn trust_of(&self, domain: &str) -> Option<TrustState> {
        self.state
            .registry
            .find(domain)
            .unwrap()
            .map(|instance| instance.trust)
    }

    async fn admin_post(&self, path: &str, body: Value) -> Value {
        let response = reqwest::Client::new()
            .post(format!("http://{}/admin/federation{path}", self.domain))
            .bearer_auth(ADMIN_TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success(), "{path}: {}", response.status());
        response.json().await.unwrap()
    }
}

async fn wait_for_trust(node: &Node, domain: &str, expected: TrustState) {
    for _ in 0..100 {
        if node.trust_of(domain) == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "{domain} never reached {expected:?}, last seen {:?}",
        node.trust_of(domain)
    );
}

/// Both nodes end up `(active, mutual)` towards each other.
async fn federate(a: &Node, b: &Node) {
    a.state.registry.add_outgoing(&b.domain, None).await.unwrap();
    assert_eq!(a.trust_of(&b.domain), Some(TrustState::PENDING_OUTGOING));
    assert_eq!(b.trust_of(&a.domain), Some(TrustState::PENDING_INCOMING));

    b.state.registry.approve(&a.domain).unwrap();
    assert_eq!(b.trust_of(&a.domain), Some(TrustState::ACTIVE_MUTUAL));
    wait_for_trust(a, &b.domain, TrustState::ACTIVE_MUTUAL).await;
}

#[tokio::test]
async fn test_handshake_then_dm_relay() {
    let a = Node::spawn("Node A").await;
    let b = Node::spawn("Node B").await;
    federate(&a, &b).await;

    let alice = a.user("alice", "Alice");
    let bob = b.user("bob", "Bob");

    let outcome = a
        .admin_post(
            "/relay/dm",
            json!({
                "fromUserId": alice.id,
                "domain": b.domain,
                "publicId": bob.public_id,
                "content": "hello from A",
            }),
        )
        .await;
    assert_eq!(outcome["success"], true);
    assert_eq!(outcome["delivered"], true);

    // B now mirrors alice and holds the message.
    let a_on_b = b.state.registry.find(&a.domain).unwrap().unwrap();
    let shadow = b
        .state
        .store
        .with(|db| db.find_shadow_by_public_id(a_on_b.id, &alice.public_id))
        .unwrap()
        .expect("shadow user for alice");
    assert!(shadow.is_federated);
    assert_eq!(shadow.name, "Alice");
    assert_eq!(shadow.federated_username, Some(alice.id.to_string()));

    let messages = b
        .state
        .store
        .with(|db| {
            let channel = db.find_or_create_dm_channel(shadow.id, bob.id)?;
            db.list_messages(channel.id)
        })
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hello from A");
    assert_eq!(messages[0].author_id, shadow.id);

    // A mirrors bob on its side of the same conversation.
    let b_on_a = a.state.registry.find(&b.domain).unwrap().unwrap();
    let bob_on_a = a
        .state
        .store
        .with(|db| db.find_shadow_by_public_id(b_on_a.id, &bob.public_id))
        .unwrap()
        .expect("shadow user for bob");
    let sent = a
        .state
        .store
        .with(|db| {
            let channel = db.find_or_create_dm_channel(alice.id, bob_on_a.id)?;
            db.list_messages(channel.id)
        })
        .unwrap();
    assert_eq!(sent.len(), 1);
}

#[tokio::test]
async fn test_adding_a_requesting_peer_approves_it() {
    let a = Node::spawn("Node A").await;
    let b = Node::spawn("Node B").await;

    a.state.registry.add_outgoing(&b.domain, None).await.unwrap();
    assert_eq!(b.trust_of(&a.domain), Some(TrustState::PENDING_INCOMING));

    // B reaching out to A is B's approval.
    let instance = b.state.registry.add_outgoing(&a.domain, None).await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::Active);
    wait_for_trust(&a, &b.domain, TrustState::ACTIVE_MUTUAL).await;
}

#[tokio::test]
async fn test_friend_request_roundtrip() {
    let a = Node::spawn("Node A").await;
    let b = Node::spawn("Node B").await;
    federate(&a, &b).await;

    let alice = a.user("alice", "Alice");
    let bob = b.user("bob", "Bob");

    let outcome = a
        .admin_post(
            "/relay/friend-request",
            json!({"fromUserId": alice.id, "domain": b.domain, "publicId": bob.public_id}),
        )
        .await;
    assert_eq!(outcome["delivered"], true);

    let outcome = b
        .admin_post(
            "/relay/friend-accept",
            json!({"fromUserId": bob.id, "domain": a.domain, "publicId": alice.public_id}),
        )
        .await;
    assert_eq!(outcome["delivered"], true);

    let b_on_a = a.state.registry.find(&b.domain).unwrap().unwrap();
    let bob_on_a = a
        .state
        .store
        .with(|db| db.find_shadow_by_public_id(b_on_a.id, &bob.public_id))
        .unwrap()
        .unwrap();
    let friendship = a
        .state
        .store
        .with(|db| db.get_friendship(alice.id, bob_on_a.id))
        .unwrap()
        .unwrap();
    assert_eq!(friendship.status.as_str(), "accepted");
}

#[tokio::test]
async fn test_bearer_exchange_across_instances() {
    let a = Node::spawn("Node A").await;
    let b = Node::spawn("Node B").await;
    federate(&a, &b).await;

    let alice = a.user("alice", "Alice");
    let issued = a
        .admin_post(
            "/tokens",
            json!({"userId": alice.id, "targetDomain": b.domain}),
        )
        .await;
    let token = issued["token"].as_str().unwrap();

    let response = reqwest::Client::new()
        .post(format!("http://{}/federation/auth", b.domain))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    let shadow_id = body["userId"].as_i64().unwrap();

    let shadow = b.state.store.with(|db| db.get_user(shadow_id)).unwrap();
    assert_eq!(shadow.federated_public_id.as_deref(), Some(alice.public_id.as_str()));

    // The token is bound to B; A refuses it.
    let response = reqwest::Client::new()
        .post(format!("http://{}/federation/auth", a.domain))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn test_blocked_peer_cannot_relay() {
    let a = Node::spawn("Node A").await;
    let b = Node::spawn("Node B").await;
    federate(&a, &b).await;

    let alice = a.user("alice", "Alice");
    let bob = b.user("bob", "Bob");
    b.state.registry.block(&a.domain).unwrap();

    // A still trusts B, but B turns every call from A away, starting with
    // the profile lookup.
    let response = reqwest::Client::new()
        .post(format!("http://{}/admin/federation/relay/dm", a.domain))
        .bearer_auth(ADMIN_TOKEN)
        .json(&json!({
            "fromUserId": alice.id,
            "domain": b.domain,
            "publicId": bob.public_id,
            "content": "let me in",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 502);
    let a_on_b = b.state.registry.find(&a.domain).unwrap().unwrap();
    assert!(b
        .state
        .store
        .with(|db| db.list_shadow_users(a_on_b.id))
        .unwrap()
        .is_empty());
}
