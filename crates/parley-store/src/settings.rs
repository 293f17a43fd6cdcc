use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};

const FEDERATION_ENABLED: &str = "federation_enabled";

impl Database {
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Off until an administrator turns it on.
    pub fn federation_enabled(&self) -> Result<bool> {
        Ok(self.get_setting(FEDERATION_ENABLED)?.as_deref() == Some("true"))
    }

    pub fn set_federation_enabled(&self, enabled: bool) -> Result<()> {
        self.set_setting(FEDERATION_ENABLED, if enabled { "true" } else { "false" })
    }
}
