//! The `/federation/*` surface peers talk to.
//!
//! Everything except `GET /federation/info` answers 403 while federation is
//! disabled. Relay endpoints share one preamble ([`verify_relay`]): the
//! sending instance must be active, and the signature must come from its
//! stored key and cover exactly the received payload.

use axum::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, FromRequest, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use parley_shared::constants::PROTOCOL_VERSION;
use parley_shared::protocol::{
    paths, AcceptRequest, AuthExchangeResponse, DmRelayPayload, FederatedServer,
    FriendActionPayload, HandshakeRequest, HandshakeResponse, InfoResponse, ReportPayload,
    ServersResponse, SuccessResponse, UserInfoRequest, UserInfoResponse, FROM_DOMAIN_FIELD,
    SIGNATURE_FIELD,
};
use parley_store::{Instance, User};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ServerError;
use crate::events::FederationEvent;
use crate::state::AppState;

/// JSON body whose rejections use the federation error format.
pub struct FederationJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for FederationJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> ServerError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServerError::PayloadTooLarge
    } else {
        ServerError::InvalidJson(rejection.body_text())
    }
}

async fn require_federation_enabled(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ServerError> {
    if !state.registry.is_enabled()? {
        return Err(ServerError::FederationDisabled);
    }
    Ok(next.run(req).await)
}

pub fn router(state: &AppState) -> Router<AppState> {
    let protected = Router::new()
        .route(paths::REQUEST, post(request))
        .route(paths::ACCEPT, post(accept))
        .route(paths::SERVERS, get(servers))
        .route(paths::USER_INFO, post(user_info))
        .route(paths::FRIEND_REQUEST, post(friend_request))
        .route(paths::FRIEND_ACCEPT, post(friend_accept))
        .route(paths::FRIEND_REMOVE, post(friend_remove))
        .route(paths::DM_RELAY, post(dm_relay))
        .route(paths::REPORT_USER, post(report_user))
        .route(paths::AUTH, post(auth))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_federation_enabled,
        ));

    Router::new()
        .route(paths::INFO, get(info))
        .merge(protected)
        .layer(DefaultBodyLimit::max(state.config.body_limit))
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

async fn info(State(state): State<AppState>) -> Result<Json<InfoResponse>, ServerError> {
    let enabled = state.registry.is_enabled()?;
    let public_key = if enabled {
        Some(state.keys.public_key_hex()?)
    } else {
        None
    };
    Ok(Json(InfoResponse {
        domain: state.config.domain.clone(),
        name: state.config.instance_name.clone(),
        version: PROTOCOL_VERSION.to_string(),
        public_key,
        federation_enabled: enabled,
    }))
}

async fn request(
    State(state): State<AppState>,
    FederationJson(req): FederationJson<HandshakeRequest>,
) -> Result<Json<HandshakeResponse>, ServerError> {
    let instance = state.registry.receive_request(&req).await?;
    Ok(Json(HandshakeResponse {
        success: true,
        status: instance.status(),
    }))
}

async fn accept(
    State(state): State<AppState>,
    FederationJson(req): FederationJson<AcceptRequest>,
) -> Result<Json<SuccessResponse>, ServerError> {
    state.registry.receive_accept(&req)?;
    Ok(Json(SuccessResponse::ok()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServersQuery {
    requester_domain: Option<String>,
}

async fn servers(
    State(state): State<AppState>,
    Query(query): Query<ServersQuery>,
) -> Result<Json<ServersResponse>, ServerError> {
    let domain = query
        .requester_domain
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ServerError::BadRequest("Missing requesterDomain".to_string()))?;
    let instance = state.registry.require_active(&domain)?;
    state.registry.touch(instance.id)?;

    let servers = state
        .store
        .with(|db| db.list_federated_servers())?
        .into_iter()
        .map(|s| FederatedServer {
            id: s.id.to_string(),
            name: s.name,
            description: s.description,
        })
        .collect();
    Ok(Json(ServersResponse { servers }))
}

// ---------------------------------------------------------------------------
// Relays
// ---------------------------------------------------------------------------

/// Authenticate a relay envelope and decode its payload.
pub fn verify_relay<P: DeserializeOwned>(
    state: &AppState,
    mut body: Value,
) -> Result<(Instance, P), ServerError> {
    let object = body
        .as_object_mut()
        .ok_or_else(|| ServerError::BadRequest("Relay body must be an object".to_string()))?;
    let from_domain = take_string(object, FROM_DOMAIN_FIELD)?;
    let signature = take_string(object, SIGNATURE_FIELD)?;

    let instance = state.registry.require_active(&from_domain)?;
    let public_key = instance
        .public_key
        .as_deref()
        .ok_or(ServerError::InvalidSignature)?;
    let claims = state
        .keys
        .verify_challenge(&signature, public_key)
        .ok_or(ServerError::InvalidSignature)?;
    if claims.registered.iss != from_domain {
        return Err(ServerError::InvalidSignature);
    }
    let signed: Value =
        serde_json::from_str(&claims.data).map_err(|_| ServerError::InvalidSignature)?;
    if signed != body {
        debug!(from = %from_domain, "relay payload does not match its signature");
        return Err(ServerError::InvalidSignature);
    }

    state.registry.touch(instance.id)?;
    let payload =
        serde_json::from_value(body).map_err(|e| ServerError::InvalidJson(e.to_string()))?;
    Ok((instance, payload))
}

fn take_string(
    object: &mut serde_json::Map<String, Value>,
    field: &str,
) -> Result<String, ServerError> {
    match object.remove(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        _ => Err(ServerError::BadRequest(format!("Missing required field: {field}"))),
    }
}

fn require_public_id<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, ServerError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ServerError::IdentityIncomplete(format!("{field} is required")))
}

fn local_user_by_public_id(state: &AppState, public_id: &str) -> Result<User, ServerError> {
    state
        .store
        .with(|db| db.find_local_user_by_public_id(public_id))?
        .ok_or_else(|| ServerError::NotFound("User".to_string()))
}

fn sender_name(name: &str) -> &str {
    let name = name.trim();
    if name.is_empty() {
        "Remote user"
    } else {
        name
    }
}

async fn user_info(
    State(state): State<AppState>,
    FederationJson(body): FederationJson<Value>,
) -> Result<Json<UserInfoResponse>, ServerError> {
    let (_, req): (_, UserInfoRequest) = verify_relay(&state, body)?;

    let user = match (req.public_id.as_deref().filter(|p| !p.is_empty()), req.user_id) {
        (Some(public_id), _) => state
            .store
            .with(|db| db.find_local_user_by_public_id(public_id))?,
        (None, Some(id)) => state.store.with(|db| db.find_local_user(id))?,
        (None, None) => {
            return Err(ServerError::BadRequest(
                "publicId or userId is required".to_string(),
            ))
        }
    }
    .ok_or_else(|| ServerError::NotFound("User".to_string()))?;

    let (avatar, banner) = state.store.with(|db| {
        let avatar = user.avatar_id.map(|id| db.get_file(id)).transpose()?;
        let banner = user.banner_id.map(|id| db.get_file(id)).transpose()?;
        Ok((avatar.map(|f| f.name), banner.map(|f| f.name)))
    })?;

    Ok(Json(UserInfoResponse {
        id: user.id,
        public_id: user.public_id,
        name: user.name,
        bio: user.bio,
        banner_color: user.banner_color,
        avatar,
        banner,
        created_at: user.created_at,
    }))
}

async fn friend_request(
    State(state): State<AppState>,
    FederationJson(body): FederationJson<Value>,
) -> Result<Json<SuccessResponse>, ServerError> {
    let (instance, payload): (_, FriendActionPayload) = verify_relay(&state, body)?;
    let sender_pid = require_public_id(&payload.sender_public_id, "senderPublicId")?;
    let receiver_pid = require_public_id(&payload.receiver_public_id, "receiverPublicId")?;

    let receiver = local_user_by_public_id(&state, receiver_pid)?;
    let sender = state.resolver.resolve(
        instance.id,
        payload.sender_id,
        sender_name(&payload.sender_name),
        Some(sender_pid),
    )?;
    let friendship = state
        .store
        .with(|db| db.upsert_friend_request(sender.id, receiver.id))?;

    info!(
        from = %instance.domain,
        sender = sender.id,
        receiver = receiver.id,
        status = friendship.status.as_str(),
        "federated friend request"
    );
    state.events.publish(FederationEvent::FriendRequest {
        user_id: receiver.id,
        from_user_id: sender.id,
    });
    state
        .resolver
        .spawn_profile_sync(sender.id, instance.domain, sender_pid.to_string());
    Ok(Json(SuccessResponse::ok()))
}

/// The remote sender accepted a request our local receiver made earlier.
async fn friend_accept(
    State(state): State<AppState>,
    FederationJson(body): FederationJson<Value>,
) -> Result<Json<SuccessResponse>, ServerError> {
    let (instance, payload): (_, FriendActionPayload) = verify_relay(&state, body)?;
    let sender_pid = require_public_id(&payload.sender_public_id, "senderPublicId")?;
    let receiver_pid = require_public_id(&payload.receiver_public_id, "receiverPublicId")?;

    let receiver = local_user_by_public_id(&state, receiver_pid)?;
    let sender = state.resolver.resolve(
        instance.id,
        payload.sender_id,
        sender_name(&payload.sender_name),
        Some(sender_pid),
    )?;
    state
        .store
        .with(|db| db.accept_friend_request(receiver.id, sender.id))?
        .ok_or_else(|| ServerError::NotFound("Friend request".to_string()))?;

    info!(from = %instance.domain, sender = sender.id, receiver = receiver.id, "federated friend accept");
    state.events.publish(FederationEvent::FriendAccepted {
        user_id: receiver.id,
        from_user_id: sender.id,
    });
    Ok(Json(SuccessResponse::ok()))
}

async fn friend_remove(
    State(state): State<AppState>,
    FederationJson(body): FederationJson<Value>,
) -> Result<Json<SuccessResponse>, ServerError> {
    let (instance, payload): (_, FriendActionPayload) = verify_relay(&state, body)?;
    let sender_pid = require_public_id(&payload.sender_public_id, "senderPublicId")?;
    let receiver_pid = require_public_id(&payload.receiver_public_id, "receiverPublicId")?;

    let receiver = local_user_by_public_id(&state, receiver_pid)?;
    // Nothing to remove if we never saw the sender.
    let Some(sender) = state
        .store
        .with(|db| db.find_shadow_by_public_id(instance.id, sender_pid))?
    else {
        return Ok(Json(SuccessResponse::ok()));
    };

    if state
        .store
        .with(|db| db.remove_friendship(sender.id, receiver.id))?
    {
        info!(from = %instance.domain, sender = sender.id, receiver = receiver.id, "federated friend removal");
        state.events.publish(FederationEvent::FriendRemoved {
            user_id: receiver.id,
            from_user_id: sender.id,
        });
    }
    Ok(Json(SuccessResponse::ok()))
}

async fn dm_relay(
    State(state): State<AppState>,
    FederationJson(body): FederationJson<Value>,
) -> Result<Json<SuccessResponse>, ServerError> {
    let (instance, payload): (_, DmRelayPayload) = verify_relay(&state, body)?;
    let sender_pid = require_public_id(&payload.sender_public_id, "senderPublicId")?;
    let receiver_pid = require_public_id(&payload.receiver_public_id, "receiverPublicId")?;
    if payload.content.trim().is_empty() {
        return Err(ServerError::BadRequest("Empty message".to_string()));
    }

    let receiver = local_user_by_public_id(&state, receiver_pid)?;
    let sender = state.resolver.resolve(
        instance.id,
        payload.sender_id,
        sender_name(&payload.sender_name),
        Some(sender_pid),
    )?;
    let sent_at = payload.sent_at.unwrap_or_else(Utc::now);
    let (channel, message) = state.store.with(|db| {
        let channel = db.find_or_create_dm_channel(sender.id, receiver.id)?;
        let message = db.insert_message(channel.id, sender.id, &payload.content, sent_at)?;
        Ok((channel, message))
    })?;

    debug!(
        from = %instance.domain,
        channel = channel.id,
        message = %message.id,
        "federated direct message"
    );
    state.events.publish(FederationEvent::DirectMessage {
        user_id: receiver.id,
        channel_id: channel.id,
        author_id: sender.id,
    });
    state
        .resolver
        .spawn_profile_sync(sender.id, instance.domain, sender_pid.to_string());
    Ok(Json(SuccessResponse::ok()))
}

async fn report_user(
    State(state): State<AppState>,
    FederationJson(body): FederationJson<Value>,
) -> Result<Json<SuccessResponse>, ServerError> {
    let (instance, payload): (_, ReportPayload) = verify_relay(&state, body)?;
    let reported_pid = require_public_id(&payload.reported_public_id, "reportedPublicId")?;

    let reported = local_user_by_public_id(&state, reported_pid)?;
    let report = state.store.with(|db| {
        db.insert_report(
            &instance.domain,
            payload.reporter_public_id.as_deref(),
            reported.id,
            payload.reason.trim(),
        )
    })?;

    info!(
        from = %instance.domain,
        report = report.id,
        reported = reported.id,
        "federated user report"
    );
    Ok(Json(SuccessResponse::ok()))
}

// ---------------------------------------------------------------------------
// Bearer exchange
// ---------------------------------------------------------------------------

async fn auth(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AuthExchangeResponse>, ServerError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ServerError::Unauthorized("Missing bearer token".to_string()))?;

    let identity = state.tokens.verify_bearer(bearer)?;
    let user = state.resolver.resolve(
        identity.instance_id,
        identity.subject_id,
        sender_name(&identity.name),
        Some(&identity.public_id),
    )?;

    if let Some(avatar) = identity.avatar.filter(|a| !a.is_empty()) {
        state.resolver.spawn_avatar_sync(user.id, avatar);
    }
    state.resolver.spawn_profile_sync(
        user.id,
        identity.issuer_domain.clone(),
        identity.public_id.clone(),
    );

    info!(issuer = %identity.issuer_domain, user_id = user.id, "bearer token exchanged");
    Ok(Json(AuthExchangeResponse {
        user_id: user.id,
        public_id: user.public_id,
        handle: user.handle,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use parley_shared::keys::InstanceKeypair;
    use parley_shared::token::{self, BearerClaims, ChallengeClaims};
    use parley_shared::types::TrustState;
    use parley_store::{FriendshipStatus, NewUser, Server};
    use serde::Serialize;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::api::build_router;
    use crate::testing;

    const PEER: &str = "a.example";

    struct Fixture {
        node: testing::TestInstance,
        peer_key: InstanceKeypair,
        local: User,
    }

    async fn fixture() -> Fixture {
        let node = testing::instance("b.example").await;
        let peer_key = InstanceKeypair::generate();
        let local = node
            .state
            .store
            .with(|db| {
                db.insert_instance(
                    PEER,
                    Some("Peer A"),
                    Some(&peer_key.public_key_hex()),
                    TrustState::ACTIVE_MUTUAL,
                    None,
                )?;
                db.create_user(&NewUser::local("bob", "Bob"))
            })
            .unwrap();
        Fixture {
            node,
            peer_key,
            local,
        }
    }

    fn envelope<P: Serialize>(key: &InstanceKeypair, from: &str, payload: &P) -> Value {
        let mut body = serde_json::to_value(payload).unwrap();
        let signature = token::sign(key, &ChallengeClaims::new(from, &body.to_string())).unwrap();
        let object = body.as_object_mut().unwrap();
        object.insert(FROM_DOMAIN_FIELD.into(), Value::String(from.into()));
        object.insert(SIGNATURE_FIELD.into(), Value::String(signature));
        body
    }

    async fn post_json(state: &AppState, path: &str, body: &Value) -> (StatusCode, Value) {
        let response = build_router(state.clone())
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri(path)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        read(response).await
    }

    async fn read(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn friend_payload(receiver: &User) -> FriendActionPayload {
        FriendActionPayload {
            sender_public_id: Some("pub-alice".into()),
            sender_id: 11,
            sender_name: "alice".into(),
            receiver_public_id: Some(receiver.public_id.clone()),
        }
    }

    #[tokio::test]
    async fn test_info_hides_key_when_disabled() {
        let f = fixture().await;
        let response = build_router(f.node.state.clone())
            .oneshot(HttpRequest::get(paths::INFO).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let (status, body) = read(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["domain"], "b.example");
        assert_eq!(body["federationEnabled"], true);
        assert_eq!(body["publicKey"], f.node.state.keys.public_key_hex().unwrap());

        f.node.state.registry.disable().unwrap();
        let response = build_router(f.node.state.clone())
            .oneshot(HttpRequest::get(paths::INFO).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let (_, body) = read(response).await;
        assert_eq!(body["federationEnabled"], false);
        assert!(body["publicKey"].is_null());
    }

    #[tokio::test]
    async fn test_disabled_federation_rejects_protocol_calls() {
        let f = fixture().await;
        f.node
            .state
            .store
            .with(|db| db.set_federation_enabled(false))
            .unwrap();

        let body = envelope(&f.peer_key, PEER, &friend_payload(&f.local));
        let (status, value) = post_json(&f.node.state, paths::FRIEND_REQUEST, &body).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(value["error"], "Federation not enabled");
    }

    #[tokio::test]
    async fn test_friend_request_creates_shadow_and_request() {
        let f = fixture().await;
        let mut events = f.node.state.events.subscribe();
        let body = envelope(&f.peer_key, PEER, &friend_payload(&f.local));

        let (status, value) = post_json(&f.node.state, paths::FRIEND_REQUEST, &body).await;
        assert_eq!(status, StatusCode::OK, "{value}");
        assert_eq!(value["success"], true);

        let instance = f.node.state.registry.find(PEER).unwrap().unwrap();
        let shadow = f
            .node
            .state
            .store
            .with(|db| db.find_shadow_by_public_id(instance.id, "pub-alice"))
            .unwrap()
            .unwrap();
        assert_eq!(shadow.name, "alice");
        let friendship = f
            .node
            .state
            .store
            .with(|db| db.get_friendship(shadow.id, f.local.id))
            .unwrap()
            .unwrap();
        assert_eq!(friendship.status, FriendshipStatus::Pending);
        assert_eq!(friendship.requester_id, shadow.id);

        let envelope = events.recv().await.unwrap();
        assert_eq!(envelope.topic, format!("user:{}", f.local.id));
    }

    #[tokio::test]
    async fn test_relay_requires_both_public_ids() {
        let f = fixture().await;
        let mut payload = friend_payload(&f.local);
        payload.sender_public_id = None;

        for path in [paths::FRIEND_REQUEST, paths::FRIEND_ACCEPT, paths::FRIEND_REMOVE] {
            let body = envelope(&f.peer_key, PEER, &payload);
            let (status, _) = post_json(&f.node.state, path, &body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{path}");
        }

        let dm = DmRelayPayload {
            sender_public_id: Some("pub-alice".into()),
            sender_id: 11,
            sender_name: "alice".into(),
            receiver_public_id: None,
            content: "hi".into(),
            sent_at: None,
        };
        let (status, _) =
            post_json(&f.node.state, paths::DM_RELAY, &envelope(&f.peer_key, PEER, &dm)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_relay_signature_failures() {
        let f = fixture().await;
        let payload = friend_payload(&f.local);

        // Signed by a key we do not hold for this domain.
        let forged = envelope(&InstanceKeypair::generate(), PEER, &payload);
        let (status, _) = post_json(&f.node.state, paths::FRIEND_REQUEST, &forged).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Valid signature, but the body was changed after signing.
        let mut tampered = envelope(&f.peer_key, PEER, &payload);
        tampered["senderName"] = Value::String("mallory".into());
        let (status, _) = post_json(&f.node.state, paths::FRIEND_REQUEST, &tampered).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Unknown sender instance.
        let stranger = envelope(&f.peer_key, "c.example", &payload);
        let (status, _) = post_json(&f.node.state, paths::FRIEND_REQUEST, &stranger).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Missing envelope fields.
        let bare = serde_json::to_value(&payload).unwrap();
        let (status, _) = post_json(&f.node.state, paths::FRIEND_REQUEST, &bare).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_blocked_instance_rejected_despite_valid_signature() {
        let f = fixture().await;
        f.node.state.registry.block(PEER).unwrap();

        let body = envelope(&f.peer_key, PEER, &friend_payload(&f.local));
        let (status, _) = post_json(&f.node.state, paths::FRIEND_REQUEST, &body).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_receiver_is_not_found() {
        let f = fixture().await;
        let mut payload = friend_payload(&f.local);
        payload.receiver_public_id = Some(Uuid::new_v4().to_string());

        let body = envelope(&f.peer_key, PEER, &payload);
        let (status, _) = post_json(&f.node.state, paths::FRIEND_REQUEST, &body).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_friend_accept_and_remove() {
        let f = fixture().await;
        let instance = f.node.state.registry.find(PEER).unwrap().unwrap();
        let shadow = f
            .node
            .state
            .resolver
            .resolve(instance.id, 11, "alice", Some("pub-alice"))
            .unwrap();
        let payload = friend_payload(&f.local);

        // No outstanding request yet.
        let body = envelope(&f.peer_key, PEER, &payload);
        let (status, _) = post_json(&f.node.state, paths::FRIEND_ACCEPT, &body).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        f.node
            .state
            .store
            .with(|db| db.upsert_friend_request(f.local.id, shadow.id))
            .unwrap();
        let body = envelope(&f.peer_key, PEER, &payload);
        let (status, _) = post_json(&f.node.state, paths::FRIEND_ACCEPT, &body).await;
        assert_eq!(status, StatusCode::OK);
        let friendship = f
            .node
            .state
            .store
            .with(|db| db.get_friendship(f.local.id, shadow.id))
            .unwrap()
            .unwrap();
        assert_eq!(friendship.status, FriendshipStatus::Accepted);

        let body = envelope(&f.peer_key, PEER, &payload);
        let (status, _) = post_json(&f.node.state, paths::FRIEND_REMOVE, &body).await;
        assert_eq!(status, StatusCode::OK);
        assert!(f
            .node
            .state
            .store
            .with(|db| db.get_friendship(f.local.id, shadow.id))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_dm_relay_delivers_into_channel() {
        let f = fixture().await;
        let dm = DmRelayPayload {
            sender_public_id: Some("pub-alice".into()),
            sender_id: 11,
            sender_name: "alice".into(),
            receiver_public_id: Some(f.local.public_id.clone()),
            content: "hello bob".into(),
            sent_at: None,
        };

        for _ in 0..2 {
            let body = envelope(&f.peer_key, PEER, &dm);
            let (status, _) = post_json(&f.node.state, paths::DM_RELAY, &body).await;
            assert_eq!(status, StatusCode::OK);
        }

        let instance = f.node.state.registry.find(PEER).unwrap().unwrap();
        let shadows = f
            .node
            .state
            .store
            .with(|db| db.list_shadow_users(instance.id))
            .unwrap();
        assert_eq!(shadows.len(), 1);
        let channel = f
            .node
            .state
            .store
            .with(|db| db.find_or_create_dm_channel(shadows[0].id, f.local.id))
            .unwrap();
        let messages = f
            .node
            .state
            .store
            .with(|db| db.list_messages(channel.id))
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello bob");
        assert_eq!(messages[0].author_id, shadows[0].id);
    }

    #[tokio::test]
    async fn test_report_user_is_recorded() {
        let f = fixture().await;
        let report = ReportPayload {
            reporter_public_id: Some("pub-alice".into()),
            reported_public_id: Some(f.local.public_id.clone()),
            reason: "spam".into(),
        };
        let body = envelope(&f.peer_key, PEER, &report);
        let (status, _) = post_json(&f.node.state, paths::REPORT_USER, &body).await;
        assert_eq!(status, StatusCode::OK);

        let reports = f.node.state.store.with(|db| db.list_reports()).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].from_domain, PEER);
        assert_eq!(reports[0].reported_user_id, f.local.id);
        assert_eq!(reports[0].reason, "spam");
    }

    #[tokio::test]
    async fn test_user_info_by_public_id() {
        let f = fixture().await;
        let req = UserInfoRequest {
            public_id: Some(f.local.public_id.clone()),
            user_id: None,
        };
        let (status, body) =
            post_json(&f.node.state, paths::USER_INFO, &envelope(&f.peer_key, PEER, &req)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Bob");
        assert_eq!(body["publicId"], f.local.public_id);
        assert!(body["avatar"].is_null());

        let missing = UserInfoRequest::default();
        let (status, _) = post_json(
            &f.node.state,
            paths::USER_INFO,
            &envelope(&f.peer_key, PEER, &missing),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_servers_requires_trusted_requester() {
        let f = fixture().await;
        f.node
            .state
            .store
            .with(|db| {
                db.create_server(&Server {
                    id: Uuid::new_v4(),
                    name: "lobby".into(),
                    description: None,
                    federated: true,
                    created_at: Utc::now(),
                })
            })
            .unwrap();

        let call = |uri: &'static str| {
            let state = f.node.state.clone();
            async move {
                let response = build_router(state)
                    .oneshot(HttpRequest::get(uri).body(Body::empty()).unwrap())
                    .await
                    .unwrap();
                read(response).await
            }
        };

        let (status, body) = call("/federation/servers?requesterDomain=a.example").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["servers"][0]["name"], "lobby");

        let (status, _) = call("/federation/servers").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call("/federation/servers?requesterDomain=c.example").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_oversized_and_invalid_bodies() {
        let f = fixture().await;
        let huge = Value::String("x".repeat(f.node.state.config.body_limit + 1));
        let (status, body) = post_json(&f.node.state, paths::DM_RELAY, &huge).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Payload too large");

        let response = build_router(f.node.state.clone())
            .oneshot(
                HttpRequest::post(paths::REQUEST)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let (status, body) = read(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid JSON"));
    }

    fn bearer(key: &InstanceKeypair, claims: &BearerClaims) -> String {
        token::sign(key, claims).unwrap()
    }

    async fn exchange(state: &AppState, token: &str) -> (StatusCode, Value) {
        let response = build_router(state.clone())
            .oneshot(
                HttpRequest::post(paths::AUTH)
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        read(response).await
    }

    #[tokio::test]
    async fn test_auth_exchange_resolves_shadow() {
        let f = fixture().await;
        let claims = BearerClaims::new(PEER, "b.example", 11, "alice", None, "pub-alice");

        let (status, first) = exchange(&f.node.state, &bearer(&f.peer_key, &claims)).await;
        assert_eq!(status, StatusCode::OK, "{first}");
        let (_, second) = exchange(&f.node.state, &bearer(&f.peer_key, &claims)).await;
        assert_eq!(first["userId"], second["userId"]);
        assert!(first["handle"].as_str().unwrap().starts_with("fed_"));
    }

    #[tokio::test]
    async fn test_auth_exchange_rejects_bad_tokens() {
        let f = fixture().await;

        let wrong_audience = BearerClaims::new(PEER, "c.example", 11, "alice", None, "pub-alice");
        let (status, _) = exchange(&f.node.state, &bearer(&f.peer_key, &wrong_audience)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut no_public_id = BearerClaims::new(PEER, "b.example", 11, "alice", None, "x");
        no_public_id.public_id = None;
        let (status, _) = exchange(&f.node.state, &bearer(&f.peer_key, &no_public_id)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let response = build_router(f.node.state.clone())
            .oneshot(HttpRequest::post(paths::AUTH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
