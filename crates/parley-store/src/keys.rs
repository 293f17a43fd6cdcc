use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::database::{parse_ts, ts, Database};
use crate::error::{Result, StoreError};
use crate::models::KeyMaterial;

impl Database {
    pub fn insert_key_material(&self, public_key: &str, secret_key: &str) -> Result<KeyMaterial> {
        self.conn().execute(
            "INSERT INTO federation_keys (public_key, secret_key, created_at) VALUES (?1, ?2, ?3)",
            params![public_key, secret_key, ts(&Utc::now())],
        )?;
        self.canonical_key_material()?.ok_or(StoreError::NotFound)
    }

    /// The earliest stored keypair. A racing generator may have written more
    /// than one; every reader agrees on this one.
    pub fn canonical_key_material(&self) -> Result<Option<KeyMaterial>> {
        self.conn()
            .query_row(
                "SELECT id, public_key, secret_key, created_at
                 FROM federation_keys ORDER BY id ASC LIMIT 1",
                [],
                |row| {
                    let created: String = row.get(3)?;
                    Ok(KeyMaterial {
                        id: row.get(0)?,
                        public_key: row.get(1)?,
                        secret_key: row.get(2)?,
                        created_at: parse_ts(3, &created)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn delete_key_material(&self) -> Result<usize> {
        Ok(self.conn().execute("DELETE FROM federation_keys", [])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_key_is_canonical() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.canonical_key_material().unwrap().is_none());

        let first = db.insert_key_material("pub1", "sec1").unwrap();
        let second = db.insert_key_material("pub2", "sec2").unwrap();
        assert_eq!(first.public_key, "pub1");
        assert_eq!(second.public_key, "pub1");

        assert_eq!(db.delete_key_material().unwrap(), 2);
        assert!(db.canonical_key_material().unwrap().is_none());
    }
}
