//! v002 -- Federation.
//!
//! Adds peer instances, the local signing key, shadow-user columns on
//! `users`, and abuse reports.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    domain       TEXT NOT NULL UNIQUE,
    name         TEXT,
    public_key   TEXT,                         -- hex-encoded Ed25519 pubkey
    status       TEXT NOT NULL,                -- pending | active | blocked
    direction    TEXT NOT NULL,                -- incoming | outgoing | mutual
    added_by     INTEGER,
    last_seen_at TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,

    CHECK (NOT (status = 'pending' AND direction = 'mutual'))
);

CREATE TABLE IF NOT EXISTS federation_keys (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    public_key TEXT NOT NULL,
    secret_key TEXT NOT NULL,
    created_at TEXT NOT NULL
);

ALTER TABLE users ADD COLUMN is_federated INTEGER NOT NULL DEFAULT 0;
ALTER TABLE users ADD COLUMN federated_instance_id INTEGER
    REFERENCES instances(id) ON DELETE CASCADE;
ALTER TABLE users ADD COLUMN federated_username TEXT;
ALTER TABLE users ADD COLUMN federated_public_id TEXT;
ALTER TABLE users ADD COLUMN profile_synced_at TEXT;

CREATE UNIQUE INDEX IF NOT EXISTS idx_users_fed_public_id
    ON users(federated_instance_id, federated_public_id)
    WHERE federated_public_id IS NOT NULL;

-- Legacy rows are keyed by numeric id only until a public id is backfilled.
CREATE UNIQUE INDEX IF NOT EXISTS idx_users_fed_username
    ON users(federated_instance_id, federated_username)
    WHERE federated_public_id IS NULL AND federated_username IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_users_fed_instance
    ON users(federated_instance_id);

ALTER TABLE files ADD COLUMN source_name TEXT;

CREATE TABLE IF NOT EXISTS reports (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    from_domain        TEXT NOT NULL,
    reporter_public_id TEXT,
    reported_user_id   INTEGER NOT NULL,
    reason             TEXT NOT NULL,
    created_at         TEXT NOT NULL,

    FOREIGN KEY (reported_user_id) REFERENCES users(id) ON DELETE CASCADE
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
