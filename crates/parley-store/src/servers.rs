use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::database::{parse_ts, ts, Database};
use crate::error::{map_read_err, Result, StoreError};
use crate::models::Server;

impl Database {
    pub fn create_server(&self, server: &Server) -> Result<()> {
        self.conn().execute(
            "INSERT INTO servers (id, name, description, federated, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                server.id.to_string(),
                server.name,
                server.description,
                server.federated as i32,
                ts(&server.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_server(&self, id: Uuid) -> Result<Server> {
        self.conn()
            .query_row(
                "SELECT id, name, description, federated, created_at FROM servers WHERE id = ?1",
                params![id.to_string()],
                row_to_server,
            )
            .map_err(map_read_err)
    }

    /// Rooms peers are allowed to discover.
    pub fn list_federated_servers(&self) -> Result<Vec<Server>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, name, description, federated, created_at
             FROM servers WHERE federated = 1 ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], row_to_server)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_server(row: &rusqlite::Row<'_>) -> rusqlite::Result<Server> {
    let id_str: String = row.get(0)?;
    let federated: i32 = row.get(3)?;
    let created_str: String = row.get(4)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at: DateTime<Utc> = parse_ts(4, &created_str)?;

    Ok(Server {
        id,
        name: row.get(1)?,
        description: row.get(2)?,
        federated: federated != 0,
        created_at,
    })
}
