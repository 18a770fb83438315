use async_trait::async_trait;
use authcore::codec::{self, Value};
use authcore::store::{
    CredentialBackend, KeyBuilder, PhysicalId, Result, Retention, StoreError, StoredRow,
    StoredValue, now_ms, validate_table_name,
};
use log::{debug, info, warn};
use redb::{
    Builder, Database, ReadableDatabase, ReadableTable, TableDefinition, TableError,
    backends::InMemoryBackend,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

macro_rules! open_table_or_default {
    ($txn:expr, $table:expr, $default:expr) => {
        match $txn.open_table($table) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok($default),
            Err(e) => return Err(StoreError::Database(e.to_string())),
        }
    };
}

type Documents<'a> = TableDefinition<'a, &'static str, &'static [u8]>;

/// Document body stored under each physical id.
#[derive(Debug, Serialize, Deserialize)]
struct AuthDocument {
    value: String,
    session: String,
    timestamp: i64,
}

impl AuthDocument {
    fn into_row(self, id: &str) -> StoredRow {
        StoredRow {
            id: id.to_string(),
            value: self.value,
            session: self.session,
            timestamp: self.timestamp,
        }
    }
}

fn encode_doc(doc: &AuthDocument) -> Result<Vec<u8>> {
    serde_json::to_vec(doc).map_err(|e| StoreError::Codec(e.into()))
}

fn decode_doc(bytes: &[u8]) -> Result<AuthDocument> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.into()))
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Document credential backend: a single redb table keyed by physical id.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<RwLock<Option<Arc<Database>>>>,
    table: Arc<str>,
    retention: Retention,
}

impl RedbStore {
    pub async fn new<P: AsRef<Path> + Send + 'static>(
        path: P,
        table_name: &str,
        retention: Retention,
    ) -> Result<Self> {
        validate_table_name(table_name)?;
        let path = path.as_ref().to_path_buf();

        let db = tokio::task::spawn_blocking(move || -> Result<Database> {
            Database::create(&path).map_err(|e| StoreError::Connection(e.to_string()))
        })
        .await
        .map_err(db_err)??;

        info!("Opened redb credential collection {table_name}");
        Ok(Self::from_database(db, table_name, retention))
    }

    pub fn in_memory(table_name: &str, retention: Retention) -> Result<Self> {
        validate_table_name(table_name)?;
        let db = Builder::new()
            .create_with_backend(InMemoryBackend::new())
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self::from_database(db, table_name, retention))
    }

    fn from_database(db: Database, table_name: &str, retention: Retention) -> Self {
        Self {
            db: Arc::new(RwLock::new(Some(Arc::new(db)))),
            table: Arc::from(table_name),
            retention,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    async fn handle(&self) -> Result<Arc<Database>> {
        self.db.read().await.clone().ok_or(StoreError::Closed)
    }

    async fn put_document(&self, id: &str, doc: AuthDocument) -> Result<()> {
        let db = self.handle().await?;
        let table = self.table.clone();
        let key = id.to_string();
        let bytes = encode_doc(&doc)?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            let write_txn = db.begin_write().map_err(db_err)?;
            {
                let mut docs = write_txn
                    .open_table(Documents::new(&table))
                    .map_err(db_err)?;
                docs.insert(key.as_str(), bytes.as_slice()).map_err(db_err)?;
            }
            write_txn.commit().map_err(db_err)?;
            Ok(())
        })
        .await
        .map_err(db_err)?
    }

    async fn get_document(&self, id: &str) -> Result<Option<AuthDocument>> {
        let db = self.handle().await?;
        let table = self.table.clone();
        let key = id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<AuthDocument>> {
            let read_txn = db.begin_read().map_err(db_err)?;
            let docs = open_table_or_default!(read_txn, Documents::new(&table), None);

            match docs.get(key.as_str()).map_err(db_err)? {
                Some(guard) => Ok(Some(decode_doc(guard.value())?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(db_err)?
    }

    /// Deletes the documents of `session` for which `doomed` returns true.
    /// Unreadable documents are passed as `None`.
    async fn delete_where<F>(&self, session: &str, doomed: F) -> Result<u64>
    where
        F: Fn(&str, Option<&AuthDocument>) -> bool + Send + 'static,
    {
        let db = self.handle().await?;
        let table = self.table.clone();
        let prefix = KeyBuilder::new(session).prefix().to_string();
        let session = session.to_string();

        tokio::task::spawn_blocking(move || -> Result<u64> {
            let write_txn = db.begin_write().map_err(db_err)?;
            let deleted = {
                let mut docs = write_txn
                    .open_table(Documents::new(&table))
                    .map_err(db_err)?;

                let mut keys = Vec::new();
                for entry in docs.range::<&str>(prefix.as_str()..).map_err(db_err)? {
                    let (key_guard, value_guard) = entry.map_err(db_err)?;
                    let key = key_guard.value();
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    let doc = decode_doc(value_guard.value()).ok();
                    let in_session = doc.as_ref().is_none_or(|doc| doc.session == session);
                    if in_session && doomed(key, doc.as_ref()) {
                        keys.push(key.to_string());
                    }
                }

                for key in &keys {
                    docs.remove(key.as_str()).map_err(db_err)?;
                }
                keys.len() as u64
            };
            write_txn.commit().map_err(db_err)?;
            Ok(deleted)
        })
        .await
        .map_err(db_err)?
    }
}

#[async_trait]
impl CredentialBackend for RedbStore {
    async fn ensure_schema(&self) -> Result<()> {
        let db = self.handle().await?;
        let table = self.table.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let write_txn = db
                .begin_write()
                .map_err(|e| StoreError::Migration(e.to_string()))?;
            write_txn
                .open_table(Documents::new(&table))
                .map_err(|e| StoreError::Migration(e.to_string()))?;
            write_txn
                .commit()
                .map_err(|e| StoreError::Migration(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(db_err)??;

        debug!("Collection {} ready", self.table);
        Ok(())
    }

    async fn write(&self, session: &str, id: &PhysicalId, value: &Value) -> Result<()> {
        let doc = AuthDocument {
            value: codec::encode_document(value)?,
            session: session.to_string(),
            timestamp: now_ms(),
        };
        self.put_document(id.as_str(), doc).await
    }

    async fn read(&self, id: &PhysicalId) -> Result<Option<StoredValue>> {
        let Some(doc) = self.get_document(id.as_str()).await? else {
            return Ok(None);
        };
        if self.retention.is_expired(doc.timestamp, now_ms()) {
            return Ok(None);
        }
        Ok(Some(StoredValue {
            value: codec::decode_document(&doc.value)?,
            timestamp: doc.timestamp,
        }))
    }

    async fn remove(&self, id: &PhysicalId) -> Result<()> {
        let db = self.handle().await?;
        let table = self.table.clone();
        let key = id.as_str().to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let write_txn = db.begin_write().map_err(db_err)?;
            {
                let mut docs = write_txn
                    .open_table(Documents::new(&table))
                    .map_err(db_err)?;
                docs.remove(key.as_str()).map_err(db_err)?;
            }
            write_txn.commit().map_err(db_err)?;
            Ok(())
        })
        .await
        .map_err(db_err)?
    }

    async fn clear_session(&self, session: &str, keep_creds: bool) -> Result<u64> {
        let creds_id = KeyBuilder::new(session).creds().into_string();
        self.delete_where(session, move |key, _| !(keep_creds && key == creds_id))
            .await
    }

    async fn remove_session(&self, session: &str) -> Result<u64> {
        self.clear_session(session, false).await
    }

    async fn purge_expired(&self, session: &str) -> Result<u64> {
        if self.retention.window().is_none() {
            return Ok(0);
        }
        let retention = self.retention;
        let now = now_ms();
        self.delete_where(session, move |_, doc| {
            doc.is_none_or(|doc| retention.is_expired(doc.timestamp, now))
        })
        .await
    }

    async fn query(&self, id: &PhysicalId) -> Result<Option<StoredRow>> {
        Ok(self
            .get_document(id.as_str())
            .await?
            .map(|doc| doc.into_row(id.as_str())))
    }

    async fn scan_session(&self, session: &str) -> Result<Vec<StoredRow>> {
        let db = self.handle().await?;
        let table = self.table.clone();
        let prefix = KeyBuilder::new(session).prefix().to_string();
        let session = session.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<StoredRow>> {
            let read_txn = db.begin_read().map_err(db_err)?;
            let docs = open_table_or_default!(read_txn, Documents::new(&table), Vec::new());

            let mut rows = Vec::new();
            for entry in docs.range::<&str>(prefix.as_str()..).map_err(db_err)? {
                let (key_guard, value_guard) = entry.map_err(db_err)?;
                let key = key_guard.value();
                if !key.starts_with(&prefix) {
                    break;
                }
                let doc = match decode_doc(value_guard.value()) {
                    Ok(doc) => doc,
                    Err(e) => {
                        warn!("Skipping unreadable document {key}: {e}");
                        continue;
                    }
                };
                if doc.session == session {
                    rows.push(doc.into_row(key));
                }
            }
            Ok(rows)
        })
        .await
        .map_err(db_err)?
    }

    fn retention(&self) -> Retention {
        self.retention
    }

    async fn close(&self) -> Result<()> {
        if self.db.write().await.take().is_some() {
            debug!("Closed redb handle for collection {}", self.table);
        }
        Ok(())
    }
}
