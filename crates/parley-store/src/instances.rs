use chrono::Utc;
use parley_shared::types::{InstanceStatus, TrustState};
use rusqlite::{params, OptionalExtension};

use crate::database::{parse_opt_ts, parse_ts, ts, Database};
use crate::error::{map_read_err, map_write_err, Result, StoreError};
use crate::models::Instance;

const INSTANCE_COLUMNS: &str = "id, domain, name, public_key, status, direction, added_by, \
                                last_seen_at, created_at, updated_at";

impl Database {
    pub fn insert_instance(
        &self,
        domain: &str,
        name: Option<&str>,
        public_key: Option<&str>,
        trust: TrustState,
        added_by: Option<i64>,
    ) -> Result<Instance> {
        let now = ts(&Utc::now());
        self.conn()
            .execute(
                "INSERT INTO instances (domain, name, public_key, status, direction, added_by,
                                        last_seen_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?7)",
                params![
                    domain,
                    name,
                    public_key,
                    trust.status.as_str(),
                    trust.direction.as_str(),
                    added_by,
                    now,
                ],
            )
            .map_err(map_write_err)?;
        self.get_instance(self.conn().last_insert_rowid())
    }

    pub fn get_instance(&self, id: i64) -> Result<Instance> {
        self.conn()
            .query_row(
                &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?1"),
                params![id],
                row_to_instance,
            )
            .map_err(map_read_err)
    }

    pub fn find_instance_by_domain(&self, domain: &str) -> Result<Option<Instance>> {
        self.conn()
            .query_row(
                &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE domain = ?1"),
                params![domain],
                row_to_instance,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn list_instances(&self) -> Result<Vec<Instance>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_instance)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn list_domains_with_status(&self, status: InstanceStatus) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT domain FROM instances WHERE status = ?1 ORDER BY domain ASC")?;
        let rows = stmt.query_map(params![status.as_str()], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn set_instance_trust(&self, id: i64, trust: TrustState) -> Result<Instance> {
        let affected = self.conn().execute(
            "UPDATE instances SET status = ?2, direction = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, trust.status.as_str(), trust.direction.as_str(), ts(&Utc::now())],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_instance(id)
    }

    /// Refresh what a peer told us about itself. Trust state is untouched.
    pub fn refresh_instance(
        &self,
        id: i64,
        name: Option<&str>,
        public_key: &str,
    ) -> Result<Instance> {
        let now = ts(&Utc::now());
        let affected = self.conn().execute(
            "UPDATE instances
             SET name = COALESCE(?2, name), public_key = ?3, last_seen_at = ?4, updated_at = ?4
             WHERE id = ?1",
            params![id, name, public_key, now],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_instance(id)
    }

    pub fn touch_instance(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE instances SET last_seen_at = ?2 WHERE id = ?1",
            params![id, ts(&Utc::now())],
        )?;
        Ok(())
    }

    // ON DELETE CASCADE: shadow users and everything they own go with it
    pub fn delete_instance(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM instances WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn delete_all_instances(&self) -> Result<usize> {
        Ok(self.conn().execute("DELETE FROM instances", [])?)
    }
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<Instance> {
    let status: String = row.get(4)?;
    let direction: String = row.get(5)?;
    let trust = TrustState::parse(&status, &direction).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let last_seen: Option<String> = row.get(7)?;
    let created: String = row.get(8)?;
    let updated: String = row.get(9)?;

    Ok(Instance {
        id: row.get(0)?,
        domain: row.get(1)?,
        name: row.get(2)?,
        public_key: row.get(3)?,
        trust,
        added_by: row.get(6)?,
        last_seen_at: parse_opt_ts(7, last_seen)?,
        created_at: parse_ts(8, &created)?,
        updated_at: parse_ts(9, &updated)?,
    })
}
