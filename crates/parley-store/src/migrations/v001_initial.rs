//! v001 -- Initial schema creation.
//!
//! Local users, stored files, rooms, settings, and the friend / DM tables.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Files (metadata; bytes live in the file store)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS files (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    name         TEXT NOT NULL UNIQUE,         -- generated storage name
    content_type TEXT,
    size         INTEGER NOT NULL,
    created_at   TEXT NOT NULL                 -- RFC-3339
);

-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id    TEXT NOT NULL UNIQUE,         -- UUID v4, stable identity
    handle       TEXT NOT NULL UNIQUE,
    name         TEXT NOT NULL,
    bio          TEXT,
    banner_color TEXT,
    avatar_id    INTEGER,
    banner_id    INTEGER,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,

    FOREIGN KEY (avatar_id) REFERENCES files(id) ON DELETE SET NULL,
    FOREIGN KEY (banner_id) REFERENCES files(id) ON DELETE SET NULL
);

-- ----------------------------------------------------------------
-- Servers (rooms)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS servers (
    id          TEXT PRIMARY KEY NOT NULL,     -- UUID v4
    name        TEXT NOT NULL,
    description TEXT,
    federated   INTEGER NOT NULL DEFAULT 0,    -- boolean 0/1
    created_at  TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Settings (key/value)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Friendships
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friendships (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    requester_id INTEGER NOT NULL,
    addressee_id INTEGER NOT NULL,
    status       TEXT NOT NULL,                -- pending | accepted
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,

    UNIQUE (requester_id, addressee_id),
    FOREIGN KEY (requester_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (addressee_id) REFERENCES users(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- DM channels: user_a < user_b
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS dm_channels (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_a     INTEGER NOT NULL,
    user_b     INTEGER NOT NULL,
    created_at TEXT NOT NULL,

    UNIQUE (user_a, user_b),
    FOREIGN KEY (user_a) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (user_b) REFERENCES users(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id         TEXT PRIMARY KEY NOT NULL,      -- UUID v4
    channel_id INTEGER NOT NULL,
    author_id  INTEGER NOT NULL,
    content    TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (channel_id) REFERENCES dm_channels(id) ON DELETE CASCADE,
    FOREIGN KEY (author_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_channel_ts
    ON messages(channel_id, created_at DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
