//! Friendships, DM channels, direct messages and abuse reports.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::{parse_ts, ts, Database};
use crate::error::{map_read_err, map_write_err, Result, StoreError};
use crate::models::{DirectMessage, DmChannel, Friendship, FriendshipStatus, Report};

const FRIENDSHIP_COLUMNS: &str = "id, requester_id, addressee_id, status, created_at, updated_at";

impl Database {
    // -----------------------------------------------------------------------
    // Friendships
    // -----------------------------------------------------------------------

    /// Record a friend request. If the other side already asked us, the
    /// request accepts theirs instead of creating a second row.
    pub fn upsert_friend_request(&self, requester_id: i64, addressee_id: i64) -> Result<Friendship> {
        if let Some(reverse) = self.get_directed_friendship(addressee_id, requester_id)? {
            if reverse.status == FriendshipStatus::Pending {
                self.set_friendship_status(reverse.id, FriendshipStatus::Accepted)?;
            }
            return self.get_friendship_by_id(reverse.id);
        }

        let now = ts(&Utc::now());
        self.conn()
            .execute(
                "INSERT INTO friendships (requester_id, addressee_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(requester_id, addressee_id) DO NOTHING",
                params![requester_id, addressee_id, FriendshipStatus::Pending.as_str(), now],
            )
            .map_err(map_write_err)?;
        self.get_directed_friendship(requester_id, addressee_id)?
            .ok_or(StoreError::NotFound)
    }

    /// Accept a pending request sent by `requester_id` to `addressee_id`.
    /// Returns `None` when no such request exists.
    pub fn accept_friend_request(
        &self,
        requester_id: i64,
        addressee_id: i64,
    ) -> Result<Option<Friendship>> {
        match self.get_directed_friendship(requester_id, addressee_id)? {
            Some(f) => {
                if f.status == FriendshipStatus::Pending {
                    self.set_friendship_status(f.id, FriendshipStatus::Accepted)?;
                }
                Ok(Some(self.get_friendship_by_id(f.id)?))
            }
            None => Ok(None),
        }
    }

    /// Remove any friendship between the two users, whoever requested it.
    pub fn remove_friendship(&self, a: i64, b: i64) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM friendships
             WHERE (requester_id = ?1 AND addressee_id = ?2)
                OR (requester_id = ?2 AND addressee_id = ?1)",
            params![a, b],
        )?;
        Ok(affected > 0)
    }

    /// Friendship between the two users in either direction.
    pub fn get_friendship(&self, a: i64, b: i64) -> Result<Option<Friendship>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {FRIENDSHIP_COLUMNS} FROM friendships
                     WHERE (requester_id = ?1 AND addressee_id = ?2)
                        OR (requester_id = ?2 AND addressee_id = ?1)
                     LIMIT 1"
                ),
                params![a, b],
                row_to_friendship,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    fn get_directed_friendship(
        &self,
        requester_id: i64,
        addressee_id: i64,
    ) -> Result<Option<Friendship>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {FRIENDSHIP_COLUMNS} FROM friendships
                     WHERE requester_id = ?1 AND addressee_id = ?2"
                ),
                params![requester_id, addressee_id],
                row_to_friendship,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    fn get_friendship_by_id(&self, id: i64) -> Result<Friendship> {
        self.conn()
            .query_row(
                &format!("SELECT {FRIENDSHIP_COLUMNS} FROM friendships WHERE id = ?1"),
                params![id],
                row_to_friendship,
            )
            .map_err(map_read_err)
    }

    fn set_friendship_status(&self, id: i64, status: FriendshipStatus) -> Result<()> {
        self.conn().execute(
            "UPDATE friendships SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), ts(&Utc::now())],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Direct messages
    // -----------------------------------------------------------------------

    pub fn find_or_create_dm_channel(&self, a: i64, b: i64) -> Result<DmChannel> {
        let (user_a, user_b) = if a <= b { (a, b) } else { (b, a) };
        self.conn()
            .execute(
                "INSERT INTO dm_channels (user_a, user_b, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_a, user_b) DO NOTHING",
                params![user_a, user_b, ts(&Utc::now())],
            )
            .map_err(map_write_err)?;
        self.conn()
            .query_row(
                "SELECT id, user_a, user_b, created_at FROM dm_channels
                 WHERE user_a = ?1 AND user_b = ?2",
                params![user_a, user_b],
                |row| {
                    let created: String = row.get(3)?;
                    Ok(DmChannel {
                        id: row.get(0)?,
                        user_a: row.get(1)?,
                        user_b: row.get(2)?,
                        created_at: parse_ts(3, &created)?,
                    })
                },
            )
            .map_err(map_read_err)
    }

    pub fn insert_message(
        &self,
        channel_id: i64,
        author_id: i64,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Result<DirectMessage> {
        let message = DirectMessage {
            id: Uuid::new_v4(),
            channel_id,
            author_id,
            content: content.to_string(),
            created_at,
        };
        self.conn().execute(
            "INSERT INTO messages (id, channel_id, author_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id.to_string(),
                message.channel_id,
                message.author_id,
                message.content,
                ts(&message.created_at),
            ],
        )?;
        Ok(message)
    }

    /// Messages of a channel, oldest first.
    pub fn list_messages(&self, channel_id: i64) -> Result<Vec<DirectMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, channel_id, author_id, content, created_at
             FROM messages WHERE channel_id = ?1
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![channel_id], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    // -----------------------------------------------------------------------
    // Reports
    // -----------------------------------------------------------------------

    pub fn insert_report(
        &self,
        from_domain: &str,
        reporter_public_id: Option<&str>,
        reported_user_id: i64,
        reason: &str,
    ) -> Result<Report> {
        let created_at = Utc::now();
        self.conn().execute(
            "INSERT INTO reports (from_domain, reporter_public_id, reported_user_id, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![from_domain, reporter_public_id, reported_user_id, reason, ts(&created_at)],
        )?;
        Ok(Report {
            id: self.conn().last_insert_rowid(),
            from_domain: from_domain.to_string(),
            reporter_public_id: reporter_public_id.map(str::to_string),
            reported_user_id,
            reason: reason.to_string(),
            created_at,
        })
    }

    pub fn list_reports(&self) -> Result<Vec<Report>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, from_domain, reporter_public_id, reported_user_id, reason, created_at
             FROM reports ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let created: String = row.get(5)?;
            Ok(Report {
                id: row.get(0)?,
                from_domain: row.get(1)?,
                reporter_public_id: row.get(2)?,
                reported_user_id: row.get(3)?,
                reason: row.get(4)?,
                created_at: parse_ts(5, &created)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_friendship(row: &rusqlite::Row<'_>) -> rusqlite::Result<Friendship> {
    let status_str: String = row.get(3)?;
    let status = FriendshipStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown friendship status: {status_str}").into(),
        )
    })?;
    let created: String = row.get(4)?;
    let updated: String = row.get(5)?;

    Ok(Friendship {
        id: row.get(0)?,
        requester_id: row.get(1)?,
        addressee_id: row.get(2)?,
        status,
        created_at: parse_ts(4, &created)?,
        updated_at: parse_ts(5, &updated)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirectMessage> {
    let id_str: String = row.get(0)?;
    let created: String = row.get(4)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(DirectMessage {
        id,
        channel_id: row.get(1)?,
        author_id: row.get(2)?,
        content: row.get(3)?,
        created_at: parse_ts(4, &created)?,
    })
}
