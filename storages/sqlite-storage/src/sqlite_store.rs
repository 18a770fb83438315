use async_trait::async_trait;
use authcore::codec::{self, Value};
use authcore::store::{
    CredentialBackend, KeyBuilder, PhysicalId, Result, Retention, StoreError, StoredRow,
    StoredValue, now_ms, validate_table_name,
};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_query;
use diesel::sql_types::{BigInt, Text};
use diesel::sqlite::SqliteConnection;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::RwLock;

type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

#[derive(QueryableByName)]
struct AuthRow {
    #[diesel(sql_type = Text)]
    id: String,
    #[diesel(sql_type = Text)]
    value: String,
    #[diesel(sql_type = Text)]
    session: String,
    #[diesel(sql_type = BigInt)]
    timestamp: i64,
}

impl From<AuthRow> for StoredRow {
    fn from(row: AuthRow) -> Self {
        StoredRow {
            id: row.id,
            value: row.value,
            session: row.session,
            timestamp: row.timestamp,
        }
    }
}

#[derive(QueryableByName)]
struct TableName {
    #[diesel(sql_type = Text)]
    name: String,
}

/// Relational credential backend: one table, one row per physical id.
#[derive(Clone)]
pub struct SqliteStore {
    /// `None` once the store has been closed.
    ///
    /// Read lock: concurrent reads (WAL mode allows this).
    /// Write lock: serializes writes to prevent SQLITE_BUSY errors.
    pool: Arc<RwLock<Option<SqlitePool>>>,
    table: Arc<str>,
    retention: Retention,
}

#[derive(Debug, Clone, Copy)]
struct ConnectionOptions;

impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error>
    for ConnectionOptions
{
    fn on_acquire(
        &self,
        conn: &mut SqliteConnection,
    ) -> std::result::Result<(), diesel::r2d2::Error> {
        diesel::sql_query("PRAGMA busy_timeout = 30000;")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;
        diesel::sql_query("PRAGMA synchronous = NORMAL;")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;
        diesel::sql_query("PRAGMA temp_store = memory;")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;
        Ok(())
    }
}

fn db_err(e: diesel::result::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

impl SqliteStore {
    /// Opens a pool on `database_url`. The table is created by
    /// [`CredentialBackend::ensure_schema`].
    pub async fn new(database_url: &str, table_name: &str, retention: Retention) -> Result<Self> {
        validate_table_name(table_name)?;

        let manager = ConnectionManager::<SqliteConnection>::new(database_url);

        // Pool size: Use available parallelism or default to 4
        let pool_size = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4)
            .max(4);

        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(ConnectionOptions))
            .build(manager)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let pool_clone = pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool_clone
                .get()
                .map_err(|e| StoreError::Connection(e.to_string()))?;

            diesel::sql_query("PRAGMA journal_mode = WAL;")
                .execute(&mut conn)
                .map_err(db_err)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Database(e.to_string()))??;

        info!("Opened SQLite credential table {table_name}");

        Ok(Self {
            pool: Arc::new(RwLock::new(Some(pool))),
            table: Arc::from(table_name),
            retention,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Execute a read operation with shared read lock.
    async fn with_read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.pool.read().await;
        let pool = guard.clone().ok_or(StoreError::Closed)?;
        let result = Self::run_blocking(pool, f).await;
        drop(guard);
        result
    }

    /// Execute a write operation with exclusive write lock.
    async fn with_write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.pool.write().await;
        let pool = guard.clone().ok_or(StoreError::Closed)?;
        let result = Self::run_blocking(pool, f).await;
        drop(guard);
        result
    }

    async fn run_blocking<F, T>(pool: SqlitePool, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
    }

    /// Drops every table that is neither this store's table, nor starts with
    /// `keep_prefix`, nor belongs to SQLite or diesel. Returns the dropped names.
    ///
    /// This is destructive and never runs implicitly.
    pub async fn drop_unrelated_tables(&self, keep_prefix: &str) -> Result<Vec<String>> {
        let table = self.table.clone();
        let keep_prefix = keep_prefix.to_string();

        let dropped = self
            .with_write(move |conn| -> Result<Vec<String>> {
                let names = sql_query(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )
                .load::<TableName>(conn)
                .map_err(db_err)?;

                let mut dropped = Vec::new();
                for TableName { name } in names {
                    if name == *table
                        || name.starts_with(keep_prefix.as_str())
                        || name.starts_with("sqlite_")
                        || name.starts_with("__diesel")
                    {
                        continue;
                    }
                    sql_query(format!("DROP TABLE IF EXISTS \"{}\"", name.replace('"', "\"\"")))
                        .execute(conn)
                        .map_err(db_err)?;
                    dropped.push(name);
                }
                Ok(dropped)
            })
            .await?;

        for name in &dropped {
            info!("Dropped unrelated table {name}");
        }
        Ok(dropped)
    }

    fn select_sql(&self, filter: &str) -> String {
        format!(
            "SELECT id, value, session, timestamp FROM \"{}\" WHERE {filter}",
            self.table
        )
    }
}

#[async_trait]
impl CredentialBackend for SqliteStore {
    async fn ensure_schema(&self) -> Result<()> {
        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS \"{0}\" (
                id TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                session TEXT NOT NULL,
                timestamp BIGINT NOT NULL
            )",
            self.table
        );
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS \"{0}_session_timestamp\" ON \"{0}\" (session, timestamp)",
            self.table
        );

        self.with_write(move |conn| -> Result<()> {
            sql_query(create_table)
                .execute(conn)
                .map_err(|e| StoreError::Migration(e.to_string()))?;
            sql_query(create_index)
                .execute(conn)
                .map_err(|e| StoreError::Migration(e.to_string()))?;
            Ok(())
        })
        .await?;

        debug!("Schema ready for table {}", self.table);
        Ok(())
    }

    async fn write(&self, session: &str, id: &PhysicalId, value: &Value) -> Result<()> {
        let document = codec::encode_document(value)?;
        let sql = format!(
            "INSERT INTO \"{}\" (id, value, session, timestamp) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                value = excluded.value,
                session = excluded.session,
                timestamp = excluded.timestamp",
            self.table
        );
        let id = id.as_str().to_string();
        let session = session.to_string();

        self.with_write(move |conn| -> Result<()> {
            sql_query(sql)
                .bind::<Text, _>(id)
                .bind::<Text, _>(document)
                .bind::<Text, _>(session)
                .bind::<BigInt, _>(now_ms())
                .execute(conn)
                .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn read(&self, id: &PhysicalId) -> Result<Option<StoredValue>> {
        let sql = self.select_sql("id = ? AND timestamp >= ?");
        let id = id.as_str().to_string();
        let cutoff = self.retention.cutoff_ms(now_ms());

        let row = self
            .with_read(move |conn| -> Result<Option<AuthRow>> {
                sql_query(sql)
                    .bind::<Text, _>(id)
                    .bind::<BigInt, _>(cutoff)
                    .get_result::<AuthRow>(conn)
                    .optional()
                    .map_err(db_err)
            })
            .await?;

        match row {
            Some(row) => {
                let row = StoredRow::from(row);
                Ok(Some(StoredValue {
                    value: row.decode()?,
                    timestamp: row.timestamp,
                }))
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, id: &PhysicalId) -> Result<()> {
        let sql = format!("DELETE FROM \"{}\" WHERE id = ?", self.table);
        let id = id.as_str().to_string();

        self.with_write(move |conn| -> Result<()> {
            sql_query(sql)
                .bind::<Text, _>(id)
                .execute(conn)
                .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn clear_session(&self, session: &str, keep_creds: bool) -> Result<u64> {
        let session = session.to_string();
        let creds_id = KeyBuilder::new(&session).creds().into_string();
        let table = self.table.clone();

        let deleted = self
            .with_write(move |conn| -> Result<usize> {
                if keep_creds {
                    sql_query(format!(
                        "DELETE FROM \"{table}\" WHERE session = ? AND id <> ?"
                    ))
                    .bind::<Text, _>(session)
                    .bind::<Text, _>(creds_id)
                    .execute(conn)
                    .map_err(db_err)
                } else {
                    sql_query(format!("DELETE FROM \"{table}\" WHERE session = ?"))
                        .bind::<Text, _>(session)
                        .execute(conn)
                        .map_err(db_err)
                }
            })
            .await?;

        Ok(deleted as u64)
    }

    async fn remove_session(&self, session: &str) -> Result<u64> {
        self.clear_session(session, false).await
    }

    async fn purge_expired(&self, session: &str) -> Result<u64> {
        if self.retention.window().is_none() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM \"{}\" WHERE session = ? AND timestamp < ?",
            self.table
        );
        let session = session.to_string();
        let cutoff = self.retention.cutoff_ms(now_ms());

        let deleted = self
            .with_write(move |conn| -> Result<usize> {
                sql_query(sql)
                    .bind::<Text, _>(session)
                    .bind::<BigInt, _>(cutoff)
                    .execute(conn)
                    .map_err(db_err)
            })
            .await?;

        Ok(deleted as u64)
    }

    async fn query(&self, id: &PhysicalId) -> Result<Option<StoredRow>> {
        let sql = self.select_sql("id = ?");
        let id = id.as_str().to_string();

        self.with_read(move |conn| -> Result<Option<StoredRow>> {
            Ok(sql_query(sql)
                .bind::<Text, _>(id)
                .get_result::<AuthRow>(conn)
                .optional()
                .map_err(db_err)?
                .map(StoredRow::from))
        })
        .await
    }

    async fn scan_session(&self, session: &str) -> Result<Vec<StoredRow>> {
        let sql = self.select_sql("session = ? ORDER BY id");
        let session = session.to_string();

        self.with_read(move |conn| -> Result<Vec<StoredRow>> {
            Ok(sql_query(sql)
                .bind::<Text, _>(session)
                .load::<AuthRow>(conn)
                .map_err(db_err)?
                .into_iter()
                .map(StoredRow::from)
                .collect())
        })
        .await
    }

    fn retention(&self) -> Retention {
        self.retention
    }

    async fn close(&self) -> Result<()> {
        if self.pool.write().await.take().is_some() {
            debug!("Closed SQLite pool for table {}", self.table);
        }
        Ok(())
    }
}
