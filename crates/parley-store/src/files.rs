use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::database::{parse_ts, ts, Database};
use crate::error::{map_read_err, map_write_err, Result, StoreError};
use crate::models::FileRecord;

const FILE_COLUMNS: &str = "id, name, source_name, content_type, size, created_at";

impl Database {
    pub fn insert_file(
        &self,
        name: &str,
        source_name: Option<&str>,
        content_type: Option<&str>,
        size: i64,
    ) -> Result<FileRecord> {
        self.conn()
            .execute(
                "INSERT INTO files (name, source_name, content_type, size, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, source_name, content_type, size, ts(&Utc::now())],
            )
            .map_err(map_write_err)?;
        self.get_file(self.conn().last_insert_rowid())
    }

    pub fn get_file(&self, id: i64) -> Result<FileRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
                params![id],
                row_to_file,
            )
            .map_err(map_read_err)
    }

    pub fn find_file_by_name(&self, name: &str) -> Result<Option<FileRecord>> {
        self.conn()
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE name = ?1"),
                params![name],
                row_to_file,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let created: String = row.get(5)?;
    Ok(FileRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        source_name: row.get(2)?,
        content_type: row.get(3)?,
        size: row.get(4)?,
        created_at: parse_ts(5, &created)?,
    })
}
