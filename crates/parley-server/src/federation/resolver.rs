//! Local shadow records for users that live on peer instances.
//!
//! A shadow user is matched by the peer's stable public id first and by the
//! peer's numeric id only as a fallback, so a peer that renumbers its users
//! (or sends `0`) never forks one remote person into two local rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parley_shared::constants::FEDERATED_FILE_PREFIX;
use parley_shared::keys::derive_shadow_handle;
use parley_shared::protocol::{paths, UserInfoRequest, UserInfoResponse};
use parley_store::{NewUser, ShadowLink, User};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ServerError;
use crate::federation::relay::{base_url, RelayDispatcher};
use crate::file_store::{extension_of, is_valid_file_name, FileStorage};
use crate::ssrf::SsrfGuard;
use crate::state::Store;

const SHADOW_CREATE_ATTEMPTS: usize = 4;

fn salted_handle(base: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("{base}_{}", &salt[..8])
}

/// What a profile sync ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Synced too recently; nothing fetched.
    Debounced,
    /// The peer could not be reached or refused; nothing written.
    Unavailable,
    Synced,
}

#[derive(Clone, Copy)]
enum ImageSlot {
    Avatar,
    Banner,
}

impl ImageSlot {
    fn current(self, user: &User) -> Option<i64> {
        match self {
            Self::Avatar => user.avatar_id,
            Self::Banner => user.banner_id,
        }
    }
}

pub struct IdentityResolver {
    store: Store,
    relay: Arc<RelayDispatcher>,
    files: Arc<dyn FileStorage>,
    ssrf: SsrfGuard,
    http: reqwest::Client,
    debounce: Duration,
}

impl IdentityResolver {
    pub fn new(
        store: Store,
        relay: Arc<RelayDispatcher>,
        files: Arc<dyn FileStorage>,
        ssrf: SsrfGuard,
        http: reqwest::Client,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            relay,
            files,
            ssrf,
            http,
            debounce,
        }
    }

    /// Find or create the shadow user for a remote identity.
    pub fn resolve(
        &self,
        instance_id: i64,
        remote_numeric_id: i64,
        name: &str,
        remote_public_id: Option<&str>,
    ) -> Result<User, ServerError> {
        let remote_public_id = remote_public_id.filter(|p| !p.is_empty());
        if remote_numeric_id == 0 && remote_public_id.is_none() {
            return Err(ServerError::IdentityIncomplete(
                "remote user has neither a public id nor a numeric id".to_string(),
            ));
        }

        if let Some(user) = self.lookup(instance_id, remote_numeric_id, name, remote_public_id)? {
            return Ok(user);
        }

        let link = ShadowLink {
            instance_id,
            federated_username: (remote_numeric_id != 0).then(|| remote_numeric_id.to_string()),
            federated_public_id: remote_public_id.map(str::to_string),
        };
        let base_handle = derive_shadow_handle(instance_id, remote_numeric_id, remote_public_id);
        let mut handle = base_handle.clone();
        for _ in 0..SHADOW_CREATE_ATTEMPTS {
            match self
                .store
                .with(|db| db.create_user(&NewUser::shadow(&handle, name, link.clone())))
            {
                Ok(user) => {
                    info!(
                        instance_id,
                        user_id = user.id,
                        handle = %user.handle,
                        "shadow user created"
                    );
                    return Ok(user);
                }
                Err(ServerError::Store(e)) if e.is_conflict() => {
                    // Another request created the same identity first.
                    if let Some(user) =
                        self.lookup(instance_id, remote_numeric_id, name, remote_public_id)?
                    {
                        return Ok(user);
                    }
                    // Only the handle is taken, by a row whose identity has
                    // since moved on.
                    debug!(instance_id, handle = %handle, "shadow handle taken, salting");
                    handle = salted_handle(&base_handle);
                }
                Err(e) => return Err(e),
            }
        }
        Err(ServerError::Internal(format!(
            "no free shadow handle for instance {instance_id}"
        )))
    }

    fn lookup(
        &self,
        instance_id: i64,
        remote_numeric_id: i64,
        name: &str,
        remote_public_id: Option<&str>,
    ) -> Result<Option<User>, ServerError> {
        let username = remote_numeric_id.to_string();

        self.store.with(|db| {
            if let Some(public_id) = remote_public_id {
                if let Some(user) = db.find_shadow_by_public_id(instance_id, public_id)? {
                    if user.name != name {
                        db.set_user_name(user.id, name)?;
                    }
                    if remote_numeric_id != 0
                        && user.federated_username.as_deref() != Some(username.as_str())
                    {
                        db.set_federated_username(user.id, &username)?;
                    }
                    return db.get_user(user.id).map(Some);
                }
            }

            if remote_numeric_id == 0 {
                return Ok(None);
            }

            let Some(user) = db.find_shadow_by_username(instance_id, &username)? else {
                return Ok(None);
            };
            match (user.federated_public_id.as_deref(), remote_public_id) {
                // A different person who once had the same numeric id.
                (Some(existing), Some(given)) if existing != given => return Ok(None),
                (None, Some(given)) => match db.set_federated_public_id(user.id, given) {
                    Ok(()) => {}
                    // A concurrent resolve already recorded this public id.
                    Err(e) if e.is_conflict() => {
                        return db.find_shadow_by_public_id(instance_id, given)
                    }
                    Err(e) => return Err(e),
                },
                _ => {}
            }
            if user.name != name {
                db.set_user_name(user.id, name)?;
            }
            db.get_user(user.id).map(Some)
        })
    }

    /// Refresh a shadow user's profile from its home instance, at most once
    /// per debounce window.
    pub async fn sync_profile(
        &self,
        shadow_id: i64,
        peer: &str,
        remote_public_id: &str,
    ) -> Result<SyncOutcome, ServerError> {
        let window = chrono::Duration::from_std(self.debounce)
            .map_err(|e| ServerError::Internal(format!("debounce window: {e}")))?;
        let claimed_at = Utc::now();
        let (previous, claimed) = self.store.with(|db| {
            let previous = db.get_user(shadow_id)?.profile_synced_at;
            Ok((previous, db.claim_profile_sync(shadow_id, claimed_at, window)?))
        })?;
        if !claimed {
            debug!(shadow_id, "profile sync debounced");
            return Ok(SyncOutcome::Debounced);
        }

        let request = UserInfoRequest {
            public_id: Some(remote_public_id.to_string()),
            user_id: None,
        };
        let profile: UserInfoResponse = match self.relay.relay_for(peer, paths::USER_INFO, &request).await {
            Ok(profile) => profile,
            Err(e) => {
                debug!(shadow_id, peer = %peer, error = %e, "profile fetch failed");
                self.store
                    .with(|db| db.release_profile_sync(shadow_id, claimed_at, previous))?;
                return Ok(SyncOutcome::Unavailable);
            }
        };

        let user = self.store.with(|db| {
            db.set_user_profile(
                shadow_id,
                profile.bio.as_deref(),
                profile.banner_color.as_deref(),
            )?;
            let user = db.get_user(shadow_id)?;
            if user.name != profile.name {
                db.set_user_name(shadow_id, &profile.name)?;
            }
            Ok(user)
        })?;

        self.sync_image(&user, peer, profile.avatar.as_deref(), ImageSlot::Avatar)
            .await;
        self.sync_image(&user, peer, profile.banner.as_deref(), ImageSlot::Banner)
            .await;

        debug!(shadow_id, peer = %peer, "profile synced");
        Ok(SyncOutcome::Synced)
    }

    async fn sync_image(&self, user: &User, peer: &str, remote: Option<&str>, slot: ImageSlot) {
        let Some(remote) = remote.filter(|name| !name.is_empty()) else {
            return;
        };
        if let Err(e) = self.replace_image(user, peer, remote, slot).await {
            warn!(user_id = user.id, peer = %peer, file = %remote, error = %e, "image sync failed");
        }
    }

    async fn replace_image(
        &self,
        user: &User,
        peer: &str,
        remote: &str,
        slot: ImageSlot,
    ) -> Result<(), ServerError> {
        if let Some(current_id) = slot.current(user) {
            let current = self.store.with(|db| db.get_file(current_id))?;
            if current.source_name.as_deref() == Some(remote) {
                return Ok(());
            }
        }
        if !is_valid_file_name(remote) {
            return Err(ServerError::BadRequest(format!("Invalid remote file name: {remote}")));
        }

        let url = format!("{}{}/{}", base_url(peer), paths::FILES, remote);
        let file_id = self.download(&url, Some(remote)).await?;
        self.store.with(|db| match slot {
            ImageSlot::Avatar => db.set_user_avatar(user.id, Some(file_id)),
            ImageSlot::Banner => db.set_user_banner(user.id, Some(file_id)),
        })
    }

    /// Set an avatar from a single URL, unless the user already has one.
    pub async fn sync_avatar_from_url(&self, shadow_id: i64, url: &str) -> Result<bool, ServerError> {
        let user = self.store.with(|db| db.get_user(shadow_id))?;
        if user.avatar_id.is_some() {
            return Ok(false);
        }
        let file_id = self.download(url, None).await?;
        self.store
            .with(|db| db.set_user_avatar(shadow_id, Some(file_id)))?;
        Ok(true)
    }

    /// Fetch `url` into the file store and record it. Returns the file id.
    async fn download(&self, url: &str, source_name: Option<&str>) -> Result<i64, ServerError> {
        let url = self.ssrf.check_url(url).await?;
        let max = self.files.max_size();

        let mut resp = self.http.get(url.clone()).send().await?;
        if !resp.status().is_success() {
            return Err(ServerError::Network(format!("{url} answered {}", resp.status())));
        }
        if resp.content_length().is_some_and(|len| len as usize > max) {
            return Err(ServerError::PayloadTooLarge);
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut data = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            if data.len() + chunk.len() > max {
                return Err(ServerError::PayloadTooLarge);
            }
            data.extend_from_slice(&chunk);
        }

        let extension = source_name
            .or_else(|| url.path_segments().and_then(|mut s| s.next_back()))
            .and_then(extension_of);
        let stored = self
            .files
            .store(&data, FEDERATED_FILE_PREFIX, extension)
            .await?;
        let record = self.store.with(|db| {
            db.insert_file(
                &stored.name,
                source_name,
                content_type.as_deref(),
                stored.size as i64,
            )
        })?;
        debug!(file = %record.name, size = record.size, "federated file stored");
        Ok(record.id)
    }

    /// Run [`sync_profile`](Self::sync_profile) in the background.
    pub fn spawn_profile_sync(self: &Arc<Self>, shadow_id: i64, peer: String, remote_public_id: String) {
        let resolver = self.clone();
        tokio::spawn(async move {
            if let Err(e) = resolver
                .sync_profile(shadow_id, &peer, &remote_public_id)
                .await
            {
                warn!(shadow_id, peer = %peer, error = %e, "profile sync failed");
            }
        });
    }

    pub fn spawn_avatar_sync(self: &Arc<Self>, shadow_id: i64, url: String) {
        let resolver = self.clone();
        tokio::spawn(async move {
            if let Err(e) = resolver.sync_avatar_from_url(shadow_id, &url).await {
                warn!(shadow_id, url = %url, error = %e, "avatar sync failed");
            }
        });
    }
}
