//! Durable [`MetadataStore`] and [`ServiceDirectory`] backed by one SQLite file.
//!
//! rusqlite is blocking, so every call runs on the blocking pool against a
//! connection shared behind a mutex.
//!
//! [`ServiceDirectory`]: berth_core::ServiceDirectory

mod directory;

pub use directory::SqliteDirectory;

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use berth_core::error::StoreError;
use berth_core::instance::{
    Instance, InstanceFilter, InstancePatch, Kind, Payload, RecordId, ServiceClass,
    StoredInstance,
};
use berth_core::store::{MetadataStore, StoreResult};
use rusqlite::types::Value;
use rusqlite::{Connection, Row, params, params_from_iter};
use tracing::debug;

/// Path that selects a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

const APPLICATION_ID: i32 = 0x6265_7274;

/// Schema migrations; `user_version` holds the count already applied.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE instances (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        class TEXT NOT NULL,
        kind TEXT NOT NULL,
        container_id TEXT NOT NULL,
        host_address TEXT NOT NULL,
        port INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        payload TEXT NOT NULL,
        UNIQUE (name, class)
    );",
    "CREATE INDEX instances_host_address ON instances (host_address);",
    "CREATE TABLE directory (
        kind TEXT NOT NULL,
        address TEXT NOT NULL,
        active_load INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (kind, address)
    );",
];

const COLUMNS: &str = "id, name, class, kind, container_id, host_address, port, created_at, payload";

pub(crate) fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`; [`IN_MEMORY`] opens
    /// a throwaway database.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = if path.as_os_str() == IN_MEMORY {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(backend)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open(IN_MEMORY)
    }

    /// Service directory kept in the same database.
    pub fn directory(&self) -> SqliteDirectory {
        SqliteDirectory::new(self.clone())
    }

    fn from_connection(mut conn: Connection) -> StoreResult<Self> {
        migrate(&mut conn).map_err(backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store task failed: {e}")))?
    }
}

fn migrate(conn: &mut Connection) -> rusqlite::Result<()> {
    let app_id: i32 = conn.query_row("PRAGMA application_id", params![], |row| row.get(0))?;
    if app_id == 0 {
        conn.execute_batch(&format!("PRAGMA application_id = {APPLICATION_ID}"))?;
    }

    let applied: i64 = conn.query_row("PRAGMA user_version", params![], |row| row.get(0))?;
    for (i, migration) in MIGRATIONS.iter().enumerate().skip(applied as usize) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration)?;
        tx.execute_batch(&format!("PRAGMA user_version = {}", i + 1))?;
        tx.commit()?;
        debug!(version = i + 1, "applied metadata migration");
    }
    Ok(())
}

/// `WHERE` clause and its parameters for `filter`.
fn where_clause(filter: &InstanceFilter) -> (String, Vec<Value>) {
    let mut terms = Vec::new();
    let mut values = Vec::new();
    if let Some(name) = &filter.name {
        terms.push("name = ?");
        values.push(Value::Text(name.clone()));
    }
    if let Some(class) = filter.class {
        terms.push("class = ?");
        values.push(Value::Text(class.as_str().into()));
    }
    if let Some(kind) = filter.kind {
        terms.push("kind = ?");
        values.push(Value::Text(kind.as_str().into()));
    }
    if let Some(host) = &filter.host_address {
        terms.push("host_address = ?");
        values.push(Value::Text(host.clone()));
    }
    if terms.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", terms.join(" AND ")), values)
    }
}

struct RawRow {
    id: i64,
    name: String,
    class: String,
    kind: String,
    container_id: String,
    host_address: String,
    port: i64,
    created_at: i64,
    payload: String,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            class: row.get(2)?,
            kind: row.get(3)?,
            container_id: row.get(4)?,
            host_address: row.get(5)?,
            port: row.get(6)?,
            created_at: row.get(7)?,
            payload: row.get(8)?,
        })
    }

    fn decode(self) -> StoreResult<StoredInstance> {
        let id = self.id as u64;
        let corrupt = |reason: String| StoreError::CorruptRecord { id, reason };
        let class: ServiceClass = self.class.parse().map_err(corrupt)?;
        let kind: Kind = self.kind.parse().map_err(corrupt)?;
        let port = u16::try_from(self.port)
            .map_err(|_| corrupt(format!("port {} out of range", self.port)))?;
        let payload: Payload = serde_json::from_str(&self.payload)
            .map_err(|e| corrupt(format!("payload: {e}")))?;
        Ok(StoredInstance {
            id: RecordId(id),
            instance: Instance {
                name: self.name,
                class,
                kind,
                container_id: self.container_id,
                host_address: self.host_address,
                port,
                created_at: self.created_at as u64,
                payload,
            },
        })
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn find(&self, filter: &InstanceFilter) -> StoreResult<Vec<StoredInstance>> {
        let (clause, values) = where_clause(filter);
        self.with_conn(move |conn| {
            let sql = format!("SELECT {COLUMNS} FROM instances{clause} ORDER BY id");
            let mut stmt = conn.prepare(&sql).map_err(backend)?;
            let rows = stmt
                .query_map(params_from_iter(values), RawRow::read)
                .map_err(backend)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(backend)?.decode()?);
            }
            Ok(records)
        })
        .await
    }

    async fn insert(&self, instance: &Instance) -> StoreResult<RecordId> {
        let payload = serde_json::to_string(&instance.payload)?;
        let instance = instance.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO instances
                    (name, class, kind, container_id, host_address, port, created_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    instance.name,
                    instance.class.as_str(),
                    instance.kind.as_str(),
                    instance.container_id,
                    instance.host_address,
                    instance.port,
                    instance.created_at as i64,
                    payload,
                ],
            )
            .map_err(backend)?;
            Ok(RecordId(conn.last_insert_rowid() as u64))
        })
        .await
    }

    async fn update_many(
        &self,
        filter: &InstanceFilter,
        patch: &InstancePatch,
    ) -> StoreResult<u64> {
        if patch.is_empty() {
            return Ok(0);
        }
        let mut sets = Vec::new();
        let mut values = Vec::new();
        if let Some(id) = &patch.container_id {
            sets.push("container_id = ?");
            values.push(Value::Text(id.clone()));
        }
        if let Some(host) = &patch.host_address {
            sets.push("host_address = ?");
            values.push(Value::Text(host.clone()));
        }
        if let Some(port) = patch.port {
            sets.push("port = ?");
            values.push(Value::Integer(i64::from(port)));
        }
        if let Some(payload) = &patch.payload {
            sets.push("payload = ?");
            values.push(Value::Text(serde_json::to_string(payload)?));
        }
        let (clause, filter_values) = where_clause(filter);
        values.extend(filter_values);

        self.with_conn(move |conn| {
            let sql = format!("UPDATE instances SET {}{clause}", sets.join(", "));
            let changed = conn
                .execute(&sql, params_from_iter(values))
                .map_err(backend)?;
            Ok(changed as u64)
        })
        .await
    }

    async fn delete_many(&self, filter: &InstanceFilter) -> StoreResult<u64> {
        let (clause, values) = where_clause(filter);
        self.with_conn(move |conn| {
            let sql = format!("DELETE FROM instances{clause}");
            let removed = conn
                .execute(&sql, params_from_iter(values))
                .map_err(backend)?;
            Ok(removed as u64)
        })
        .await
    }
}
