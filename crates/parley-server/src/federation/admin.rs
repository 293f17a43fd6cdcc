//! Admin API: federation switch, instance management, and the local action
//! surface the chat backend uses to reach remote users.
//!
//! Every route requires `Authorization: Bearer <ADMIN_TOKEN>`.

use axum::extract::{Path, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parley_shared::protocol::{
    paths, DmRelayPayload, FriendActionPayload, InstanceSummary, ReportPayload, UserInfoRequest,
    UserInfoResponse,
};
use parley_store::{Instance, Report, User};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::federation::registry::{normalize_domain, summarize};
use crate::federation::relay::base_url;
use crate::state::AppState;

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    // Constant-time comparison to prevent timing attacks on admin token.
    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn require_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Request,
    next: Next,
) -> Result<Response, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    Ok(next.run(req).await)
}

fn ensure_enabled(state: &AppState) -> Result<(), ServerError> {
    if state.registry.is_enabled()? {
        Ok(())
    } else {
        Err(ServerError::FederationDisabled)
    }
}

/// Routes nested under `/admin/federation`.
pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/enable", post(enable))
        .route("/disable", post(disable))
        .route("/keys/rotate", post(rotate_keys))
        .route("/instances", get(list_instances).post(add_instance))
        .route("/instances/:domain", delete(remove_instance))
        .route("/instances/:domain/approve", post(approve_instance))
        .route("/instances/:domain/block", post(block_instance))
        .route("/reports", get(list_reports))
        .route("/tokens", post(issue_token))
        .route("/relay/friend-request", post(relay_friend_request))
        .route("/relay/friend-accept", post(relay_friend_accept))
        .route("/relay/friend-remove", post(relay_friend_remove))
        .route("/relay/dm", post(relay_dm))
        .route("/relay/report", post(relay_report))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin))
}

// ─── Federation switch ───

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FederationStatus {
    enabled: bool,
    public_key: Option<String>,
}

async fn enable(State(state): State<AppState>) -> Result<Json<FederationStatus>, ServerError> {
    state.registry.enable()?;
    Ok(Json(FederationStatus {
        enabled: true,
        public_key: Some(state.keys.public_key_hex()?),
    }))
}

async fn disable(State(state): State<AppState>) -> Result<Json<FederationStatus>, ServerError> {
    state.registry.disable()?;
    Ok(Json(FederationStatus {
        enabled: false,
        public_key: None,
    }))
}

async fn rotate_keys(State(state): State<AppState>) -> Result<Json<FederationStatus>, ServerError> {
    ensure_enabled(&state)?;
    let public_key = state.registry.rotate_keys()?;
    Ok(Json(FederationStatus {
        enabled: true,
        public_key: Some(public_key),
    }))
}

// ─── Instances ───

async fn list_instances(
    State(state): State<AppState>,
) -> Result<Json<Vec<InstanceSummary>>, ServerError> {
    Ok(Json(state.registry.list()?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddInstanceRequest {
    domain: String,
    added_by: Option<i64>,
}

async fn add_instance(
    State(state): State<AppState>,
    Json(req): Json<AddInstanceRequest>,
) -> Result<Json<InstanceSummary>, ServerError> {
    ensure_enabled(&state)?;
    let instance = state.registry.add_outgoing(&req.domain, req.added_by).await?;
    Ok(Json(summarize(instance)))
}

async fn approve_instance(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<InstanceSummary>, ServerError> {
    ensure_enabled(&state)?;
    Ok(Json(summarize(state.registry.approve(&domain)?)))
}

async fn block_instance(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<InstanceSummary>, ServerError> {
    Ok(Json(summarize(state.registry.block(&domain)?)))
}

async fn remove_instance(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.registry.remove(&domain)?;
    Ok(Json(serde_json::json!({ "removed": true })))
}

async fn list_reports(State(state): State<AppState>) -> Result<Json<Vec<Report>>, ServerError> {
    Ok(Json(state.store.with(|db| db.list_reports())?))
}

// ─── Bearer tokens ───

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueTokenRequest {
    user_id: i64,
    target_domain: String,
}

#[derive(Serialize)]
struct IssueTokenResponse {
    token: String,
}

async fn issue_token(
    State(state): State<AppState>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<Json<IssueTokenResponse>, ServerError> {
    ensure_enabled(&state)?;
    let target = normalize_domain(&req.target_domain)?;
    state.registry.require_active(&target)?;
    let user = local_user(&state, req.user_id)?;

    let avatar = match user.avatar_id {
        Some(id) => {
            let file = state.store.with(|db| db.get_file(id))?;
            Some(format!(
                "{}{}/{}",
                base_url(&state.config.domain),
                paths::FILES,
                file.name
            ))
        }
        None => None,
    };
    let token = state.tokens.issue_bearer(
        user.id,
        &user.name,
        avatar.as_deref(),
        &user.public_id,
        &target,
    )?;
    info!(user_id = user.id, target = %target, "bearer token issued");
    Ok(Json(IssueTokenResponse { token }))
}

// ─── Outbound relays ───

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayRequest {
    from_user_id: i64,
    domain: String,
    public_id: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Serialize)]
struct RelayOutcome {
    success: bool,
    delivered: bool,
}

impl RelayOutcome {
    fn delivered(delivered: bool) -> Json<Self> {
        Json(Self {
            success: true,
            delivered,
        })
    }
}

/// Both ends of an outbound relay, with the remote side mirrored locally.
struct Parties {
    instance: Instance,
    local: User,
    remote: UserInfoResponse,
    shadow: User,
}

impl Parties {
    fn friend_payload(&self) -> FriendActionPayload {
        FriendActionPayload {
            sender_public_id: Some(self.local.public_id.clone()),
            sender_id: self.local.id,
            sender_name: self.local.name.clone(),
            receiver_public_id: Some(self.remote.public_id.clone()),
        }
    }
}

fn local_user(state: &AppState, id: i64) -> Result<User, ServerError> {
    state
        .store
        .with(|db| db.find_local_user(id))?
        .ok_or_else(|| ServerError::NotFound("User".to_string()))
}

/// Look the remote user up on its home instance and resolve it into a
/// shadow user, so local state can be recorded before relaying.
async fn parties(state: &AppState, req: &RelayRequest) -> Result<Parties, ServerError> {
    ensure_enabled(state)?;
    let domain = normalize_domain(&req.domain)?;
    let instance = state.registry.require_active(&domain)?;
    let local = local_user(state, req.from_user_id)?;

    let lookup = UserInfoRequest {
        public_id: Some(req.public_id.clone()),
        user_id: None,
    };
    let remote: UserInfoResponse = state
        .relay
        .relay_for(&domain, paths::USER_INFO, &lookup)
        .await?;
    if remote.public_id != req.public_id {
        return Err(ServerError::Network(format!(
            "{domain} answered for a different user"
        )));
    }

    let shadow = state
        .resolver
        .resolve(instance.id, remote.id, &remote.name, Some(&remote.public_id))?;
    state
        .resolver
        .spawn_profile_sync(shadow.id, domain, remote.public_id.clone());

    Ok(Parties {
        instance,
        local,
        remote,
        shadow,
    })
}

async fn relay_friend_request(
    State(state): State<AppState>,
    Json(req): Json<RelayRequest>,
) -> Result<Json<RelayOutcome>, ServerError> {
    let p = parties(&state, &req).await?;
    state
        .store
        .with(|db| db.upsert_friend_request(p.local.id, p.shadow.id))?;
    let delivered = state
        .relay
        .send_friend_request(&p.instance.domain, &p.friend_payload())
        .await;
    Ok(RelayOutcome::delivered(delivered))
}

async fn relay_friend_accept(
    State(state): State<AppState>,
    Json(req): Json<RelayRequest>,
) -> Result<Json<RelayOutcome>, ServerError> {
    let p = parties(&state, &req).await?;
    state
        .store
        .with(|db| db.accept_friend_request(p.shadow.id, p.local.id))?
        .ok_or_else(|| ServerError::NotFound("Friend request".to_string()))?;
    let delivered = state
        .relay
        .send_friend_accept(&p.instance.domain, &p.friend_payload())
        .await;
    Ok(RelayOutcome::delivered(delivered))
}

async fn relay_friend_remove(
    State(state): State<AppState>,
    Json(req): Json<RelayRequest>,
) -> Result<Json<RelayOutcome>, ServerError> {
    let p = parties(&state, &req).await?;
    state
        .store
        .with(|db| db.remove_friendship(p.local.id, p.shadow.id))?;
    let delivered = state
        .relay
        .send_friend_remove(&p.instance.domain, &p.friend_payload())
        .await;
    Ok(RelayOutcome::delivered(delivered))
}

async fn relay_dm(
    State(state): State<AppState>,
    Json(req): Json<RelayRequest>,
) -> Result<Json<RelayOutcome>, ServerError> {
    let content = req
        .content
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ServerError::BadRequest("Empty message".to_string()))?
        .to_string();
    let p = parties(&state, &req).await?;

    let message = state.store.with(|db| {
        let channel = db.find_or_create_dm_channel(p.local.id, p.shadow.id)?;
        db.insert_message(channel.id, p.local.id, &content, chrono::Utc::now())
    })?;
    let payload = DmRelayPayload {
        sender_public_id: Some(p.local.public_id.clone()),
        sender_id: p.local.id,
        sender_name: p.local.name.clone(),
        receiver_public_id: Some(p.remote.public_id.clone()),
        content,
        sent_at: Some(message.created_at),
    };
    let delivered = state.relay.send_dm(&p.instance.domain, &payload).await;
    Ok(RelayOutcome::delivered(delivered))
}

async fn relay_report(
    State(state): State<AppState>,
    Json(req): Json<RelayRequest>,
) -> Result<Json<RelayOutcome>, ServerError> {
    let p = parties(&state, &req).await?;
    let payload = ReportPayload {
        reporter_public_id: Some(p.local.public_id.clone()),
        reported_public_id: Some(p.remote.public_id.clone()),
        reason: req.reason.clone().unwrap_or_default(),
    };
    let delivered = state.relay.send_report(&p.instance.domain, &payload).await;
    info!(reporter = p.local.id, reported = p.shadow.id, delivered, "report relayed");
    Ok(RelayOutcome::delivered(delivered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request as HttpRequest, StatusCode};
    use parley_shared::keys::InstanceKeypair;
    use parley_shared::token::{self, BearerClaims};
    use parley_shared::types::TrustState;
    use parley_store::NewUser;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::api::build_router;
    use crate::testing;

    async fn call(
        state: &AppState,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = HttpRequest::builder()
            .method(method)
            .uri(format!("/admin/federation{path}"));
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = build_router(state.clone())
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    const TOKEN: Option<&str> = Some("admin-secret");

    #[tokio::test]
    async fn test_admin_token_required() {
        let node = testing::instance("b.example").await;
        let (status, _) = call(&node.state, "GET", "/instances", None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&node.state, "GET", "/instances", Some("wrong"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) = call(&node.state, "GET", "/instances", TOKEN, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_approve_block_remove() {
        let node = testing::instance("b.example").await;
        let key = InstanceKeypair::generate();
        node.state
            .store
            .with(|db| {
                db.insert_instance(
                    "127.0.0.1:1",
                    None,
                    Some(&key.public_key_hex()),
                    TrustState::PENDING_INCOMING,
                    None,
                )
            })
            .unwrap();

        let (status, body) =
            call(&node.state, "POST", "/instances/127.0.0.1:1/approve", TOKEN, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");
        assert_eq!(body["direction"], "mutual");

        let (status, body) =
            call(&node.state, "POST", "/instances/127.0.0.1:1/block", TOKEN, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "blocked");

        let (status, _) = call(&node.state, "DELETE", "/instances/127.0.0.1:1", TOKEN, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&node.state, "DELETE", "/instances/127.0.0.1:1", TOKEN, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_disable_then_enable_issues_fresh_key() {
        let node = testing::instance("b.example").await;
        let (_, before) = call(&node.state, "POST", "/enable", TOKEN, None).await;

        let (status, body) = call(&node.state, "POST", "/disable", TOKEN, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], false);

        let (status, _) = call(
            &node.state,
            "POST",
            "/instances",
            TOKEN,
            Some(serde_json::json!({"domain": "a.example"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, after) = call(&node.state, "POST", "/enable", TOKEN, None).await;
        assert_ne!(before["publicKey"], after["publicKey"]);
    }

    #[tokio::test]
    async fn test_issued_token_verifies_at_target() {
        let node = testing::instance("b.example").await;
        let peer = InstanceKeypair::generate();
        let user = node
            .state
            .store
            .with(|db| {
                db.insert_instance(
                    "a.example",
                    None,
                    Some(&peer.public_key_hex()),
                    TrustState::ACTIVE_MUTUAL,
                    None,
                )?;
                db.create_user(&NewUser::local("bob", "Bob"))
            })
            .unwrap();

        let (status, body) = call(
            &node.state,
            "POST",
            "/tokens",
            TOKEN,
            Some(serde_json::json!({"userId": user.id, "targetDomain": "a.example"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let issued = body["token"].as_str().unwrap();
        let claims: BearerClaims =
            token::verify(issued, &node.state.keys.keypair().unwrap().verifying_key()).unwrap();
        assert_eq!(claims.registered.iss, "b.example");
        assert_eq!(claims.registered.aud.as_deref(), Some("a.example"));
        assert_eq!(claims.public_id.as_deref(), Some(user.public_id.as_str()));

        let (status, _) = call(
            &node.state,
            "POST",
            "/tokens",
            TOKEN,
            Some(serde_json::json!({"userId": user.id, "targetDomain": "c.example"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_relay_dm_to_untrusted_domain_rejected() {
        let node = testing::instance("b.example").await;
        let user = node
            .state
            .store
            .with(|db| db.create_user(&NewUser::local("bob", "Bob")))
            .unwrap();
        let (status, _) = call(
            &node.state,
            "POST",
            "/relay/dm",
            TOKEN,
            Some(serde_json::json!({
                "fromUserId": user.id,
                "domain": "c.example",
                "publicId": "pub-c",
                "content": "hi",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
