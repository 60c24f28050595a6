//! Routing entries in the `directory` table, shared by every process that
//! opens the database.

use async_trait::async_trait;
use berth_core::directory::{DirectoryResult, ServiceDirectory};
use berth_core::error::{DirectoryError, StoreError};
use berth_core::instance::Kind;
use rusqlite::{OptionalExtension, params};

use crate::{SqliteStore, backend};

#[derive(Clone)]
pub struct SqliteDirectory {
    db: SqliteStore,
}

fn directory_error(err: StoreError) -> DirectoryError {
    DirectoryError::Backend(err.to_string())
}

fn load_of(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

impl SqliteDirectory {
    pub(crate) fn new(db: SqliteStore) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ServiceDirectory for SqliteDirectory {
    async fn register(&self, service: Kind, address: &str) -> DirectoryResult<()> {
        let address = address.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO directory (kind, address, active_load) VALUES (?1, ?2, 0)
                     ON CONFLICT (kind, address) DO NOTHING",
                    params![service.as_str(), address],
                )
                .map_err(backend)?;
                Ok(())
            })
            .await
            .map_err(directory_error)
    }

    async fn increment_load(&self, service: Kind, address: &str) -> DirectoryResult<u64> {
        let address = address.to_string();
        self.db
            .with_conn(move |conn| {
                let tx = conn.transaction().map_err(backend)?;
                tx.execute(
                    "INSERT INTO directory (kind, address, active_load) VALUES (?1, ?2, 1)
                     ON CONFLICT (kind, address) DO UPDATE SET active_load = active_load + 1",
                    params![service.as_str(), address],
                )
                .map_err(backend)?;
                let load: i64 = tx
                    .query_row(
                        "SELECT active_load FROM directory WHERE kind = ?1 AND address = ?2",
                        params![service.as_str(), address],
                        |row| row.get(0),
                    )
                    .map_err(backend)?;
                tx.commit().map_err(backend)?;
                Ok(load_of(load))
            })
            .await
            .map_err(directory_error)
    }

    async fn decrement_load(&self, service: Kind, address: &str) -> DirectoryResult<u64> {
        let key = address.to_string();
        let load = self
            .db
            .with_conn(move |conn| {
                let tx = conn.transaction().map_err(backend)?;
                tx.execute(
                    "UPDATE directory SET active_load = MAX(active_load - 1, 0)
                     WHERE kind = ?1 AND address = ?2",
                    params![service.as_str(), key],
                )
                .map_err(backend)?;
                let load: Option<i64> = tx
                    .query_row(
                        "SELECT active_load FROM directory WHERE kind = ?1 AND address = ?2",
                        params![service.as_str(), key],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(backend)?;
                tx.commit().map_err(backend)?;
                Ok(load)
            })
            .await
            .map_err(directory_error)?;
        load.map(load_of).ok_or_else(|| {
            DirectoryError::Backend(format!("{address} is not registered for {service}"))
        })
    }

    async fn least_loaded(&self, service: Kind) -> DirectoryResult<Option<String>> {
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT address FROM directory WHERE kind = ?1
                     ORDER BY active_load, address LIMIT 1",
                    params![service.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)
            })
            .await
            .map_err(directory_error)
    }

    async fn entries(&self, service: Kind) -> DirectoryResult<Vec<(String, u64)>> {
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT address, active_load FROM directory WHERE kind = ?1
                         ORDER BY address",
                    )
                    .map_err(backend)?;
                let rows = stmt
                    .query_map(params![service.as_str()], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })
                    .map_err(backend)?;
                let mut entries = Vec::new();
                for row in rows {
                    let (address, load) = row.map_err(backend)?;
                    entries.push((address, load_of(load)));
                }
                Ok(entries)
            })
            .await
            .map_err(directory_error)
    }

    async fn relocate(&self, service: Kind, from: &str, to: &str) -> DirectoryResult<bool> {
        let from = from.to_string();
        let to = to.to_string();
        self.db
            .with_conn(move |conn| {
                let tx = conn.transaction().map_err(backend)?;
                let load: Option<i64> = tx
                    .query_row(
                        "SELECT active_load FROM directory WHERE kind = ?1 AND address = ?2",
                        params![service.as_str(), from],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(backend)?;
                let Some(load) = load else {
                    return Ok(false);
                };
                tx.execute(
                    "DELETE FROM directory WHERE kind = ?1 AND address = ?2",
                    params![service.as_str(), from],
                )
                .map_err(backend)?;
                tx.execute(
                    "INSERT INTO directory (kind, address, active_load) VALUES (?1, ?2, ?3)
                     ON CONFLICT (kind, address) DO UPDATE SET active_load = active_load + excluded.active_load",
                    params![service.as_str(), to, load],
                )
                .map_err(backend)?;
                tx.commit().map_err(backend)?;
                Ok(true)
            })
            .await
            .map_err(directory_error)
    }
}
