use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::{parse_opt_ts, parse_ts, ts, Database};
use crate::error::{map_read_err, map_write_err, Result, StoreError};
use crate::models::{NewUser, User};

const USER_COLUMNS: &str = "id, public_id, handle, name, bio, banner_color, avatar_id, banner_id, \
                            is_federated, federated_instance_id, federated_username, \
                            federated_public_id, profile_synced_at, created_at, updated_at";

impl Database {
    /// Insert a user. A uniqueness violation (handle, public id, or shadow
    /// identity) is reported as [`StoreError::Conflict`].
    pub fn create_user(&self, user: &NewUser) -> Result<User> {
        let now = ts(&Utc::now());
        let (instance_id, username, federated_public_id) = match &user.shadow {
            Some(link) => (
                Some(link.instance_id),
                link.federated_username.as_deref(),
                link.federated_public_id.as_deref(),
            ),
            None => (None, None, None),
        };
        self.conn()
            .execute(
                "INSERT INTO users (public_id, handle, name, is_federated, federated_instance_id,
                                    federated_username, federated_public_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    user.public_id,
                    user.handle,
                    user.name,
                    user.shadow.is_some() as i32,
                    instance_id,
                    username,
                    federated_public_id,
                    now,
                ],
            )
            .map_err(map_write_err)?;
        self.get_user(self.conn().last_insert_rowid())
    }

    pub fn get_user(&self, id: i64) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                row_to_user,
            )
            .map_err(map_read_err)
    }

    /// Local (non-shadow) user by this instance's public id.
    pub fn find_local_user_by_public_id(&self, public_id: &str) -> Result<Option<User>> {
        self.find_user_where("public_id = ?1 AND is_federated = 0", public_id)
    }

    /// Local (non-shadow) user by numeric id.
    pub fn find_local_user(&self, id: i64) -> Result<Option<User>> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1 AND is_federated = 0"),
                params![id],
                row_to_user,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn find_shadow_by_public_id(
        &self,
        instance_id: i64,
        federated_public_id: &str,
    ) -> Result<Option<User>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users
                     WHERE federated_instance_id = ?1 AND federated_public_id = ?2"
                ),
                params![instance_id, federated_public_id],
                row_to_user,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Legacy lookup by the peer-local numeric id. Oldest row wins if a
    /// public id has been backfilled onto more than one.
    pub fn find_shadow_by_username(
        &self,
        instance_id: i64,
        federated_username: &str,
    ) -> Result<Option<User>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users
                     WHERE federated_instance_id = ?1 AND federated_username = ?2
                     ORDER BY id ASC LIMIT 1"
                ),
                params![instance_id, federated_username],
                row_to_user,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn list_shadow_users(&self, instance_id: i64) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE federated_instance_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![instance_id], row_to_user)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn set_user_name(&self, id: i64, name: &str) -> Result<()> {
        self.update_user(id, "name = ?2", name)
    }

    pub fn set_federated_username(&self, id: i64, username: &str) -> Result<()> {
        self.update_user(id, "federated_username = ?2", username)
    }

    pub fn set_federated_public_id(&self, id: i64, federated_public_id: &str) -> Result<()> {
        self.update_user(id, "federated_public_id = ?2", federated_public_id)
    }

    pub fn set_user_profile(
        &self,
        id: i64,
        bio: Option<&str>,
        banner_color: Option<&str>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET bio = ?2, banner_color = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, bio, banner_color, ts(&Utc::now())],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn set_user_avatar(&self, id: i64, file_id: Option<i64>) -> Result<()> {
        self.update_user(id, "avatar_id = ?2", file_id)
    }

    pub fn set_user_banner(&self, id: i64, file_id: Option<i64>) -> Result<()> {
        self.update_user(id, "banner_id = ?2", file_id)
    }

    /// Claim the right to run a profile sync for `id`.
    ///
    /// Returns `true` and stamps `profile_synced_at = now` when the previous
    /// sync is older than `window` (or never happened). The check and the
    /// stamp are a single statement, so concurrent callers get at most one
    /// `true` per window.
    pub fn claim_profile_sync(&self, id: i64, now: DateTime<Utc>, window: Duration) -> Result<bool> {
        let cutoff = now - window;
        let affected = self.conn().execute(
            "UPDATE users SET profile_synced_at = ?2
             WHERE id = ?1 AND (profile_synced_at IS NULL OR profile_synced_at <= ?3)",
            params![id, ts(&now), ts(&cutoff)],
        )?;
        Ok(affected > 0)
    }

    /// Undo a [`claim_profile_sync`](Self::claim_profile_sync) whose fetch
    /// failed, restoring `previous`. A no-op if someone else has claimed since.
    pub fn release_profile_sync(
        &self,
        id: i64,
        claimed_at: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET profile_synced_at = ?3
             WHERE id = ?1 AND profile_synced_at = ?2",
            params![id, ts(&claimed_at), previous.as_ref().map(ts)],
        )?;
        Ok(())
    }

    pub fn delete_shadow_users(&self, instance_id: i64) -> Result<usize> {
        Ok(self.conn().execute(
            "DELETE FROM users WHERE federated_instance_id = ?1",
            params![instance_id],
        )?)
    }

    fn find_user_where(&self, clause: &str, value: &str) -> Result<Option<User>> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE {clause}"),
                params![value],
                row_to_user,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    fn update_user<V: rusqlite::ToSql>(&self, id: i64, assignment: &str, value: V) -> Result<()> {
        let affected = self
            .conn()
            .execute(
                &format!("UPDATE users SET {assignment}, updated_at = ?3 WHERE id = ?1"),
                params![id, value, ts(&Utc::now())],
            )
            .map_err(map_write_err)?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let is_federated: i32 = row.get(8)?;
    let synced: Option<String> = row.get(12)?;
    let created: String = row.get(13)?;
    let updated: String = row.get(14)?;

    Ok(User {
        id: row.get(0)?,
        public_id: row.get(1)?,
        handle: row.get(2)?,
        name: row.get(3)?,
        bio: row.get(4)?,
        banner_color: row.get(5)?,
        avatar_id: row.get(6)?,
        banner_id: row.get(7)?,
        is_federated: is_federated != 0,
        federated_instance_id: row.get(9)?,
        federated_username: row.get(10)?,
        federated_public_id: row.get(11)?,
        profile_synced_at: parse_opt_ts(12, synced)?,
        created_at: parse_ts(13, &created)?,
        updated_at: parse_ts(14, &updated)?,
    })
}
