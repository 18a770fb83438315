use crate::codec::{self, Value};
use crate::store::error::{Result, StoreError};
use crate::store::expiry::{Retention, now_ms};
use crate::store::keys::{KeyBuilder, PhysicalId};
use crate::store::traits::{CredentialBackend, StoredRow, StoredValue};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// A simple in-memory backend, used by tests and by callers that need no persistence.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    rows: Arc<RwLock<BTreeMap<String, StoredRow>>>,
    retention: Retention,
    closed: Arc<AtomicBool>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Retention) -> Self {
        Self {
            retention,
            ..Self::default()
        }
    }

    /// Inserts a row verbatim, bypassing the codec and the timestamp refresh.
    pub async fn insert_raw(&self, row: StoredRow) {
        self.rows.write().await.insert(row.id.clone(), row);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialBackend for InMemoryBackend {
    async fn ensure_schema(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn write(&self, session: &str, id: &PhysicalId, value: &Value) -> Result<()> {
        self.ensure_open()?;
        let document = codec::encode_document(value)?;
        let row = StoredRow {
            id: id.as_str().to_string(),
            value: document,
            session: session.to_string(),
            timestamp: now_ms(),
        };
        self.rows.write().await.insert(row.id.clone(), row);
        Ok(())
    }

    async fn read(&self, id: &PhysicalId) -> Result<Option<StoredValue>> {
        self.ensure_open()?;
        let rows = self.rows.read().await;
        let Some(row) = rows.get(id.as_str()) else {
            return Ok(None);
        };
        if self.retention.is_expired(row.timestamp, now_ms()) {
            return Ok(None);
        }
        Ok(Some(StoredValue {
            value: row.decode()?,
            timestamp: row.timestamp,
        }))
    }

    async fn remove(&self, id: &PhysicalId) -> Result<()> {
        self.ensure_open()?;
        self.rows.write().await.remove(id.as_str());
        Ok(())
    }

    async fn clear_session(&self, session: &str, keep_creds: bool) -> Result<u64> {
        self.ensure_open()?;
        let creds_id = KeyBuilder::new(session).creds();
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|id, row| {
            row.session != session || (keep_creds && id.as_str() == creds_id.as_str())
        });
        Ok((before - rows.len()) as u64)
    }

    async fn remove_session(&self, session: &str) -> Result<u64> {
        self.clear_session(session, false).await
    }

    async fn purge_expired(&self, session: &str) -> Result<u64> {
        self.ensure_open()?;
        let now = now_ms();
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, row| {
            row.session != session || !self.retention.is_expired(row.timestamp, now)
        });
        Ok((before - rows.len()) as u64)
    }

    async fn query(&self, id: &PhysicalId) -> Result<Option<StoredRow>> {
        self.ensure_open()?;
        Ok(self.rows.read().await.get(id.as_str()).cloned())
    }

    async fn scan_session(&self, session: &str) -> Result<Vec<StoredRow>> {
        self.ensure_open()?;
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.session == session)
            .cloned()
            .collect())
    }

    fn retention(&self) -> Retention {
        self.retention
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.rows.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::signal_data::SignalDataType;
    use std::time::Duration;

    fn keys() -> KeyBuilder {
        KeyBuilder::new("session_")
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let backend = InMemoryBackend::new();
        let id = keys().record(SignalDataType::Session, "x");

        backend.write("session_", &id, &Value::Bytes(vec![1])).await.unwrap();
        backend.write("session_", &id, &Value::Bytes(vec![2])).await.unwrap();

        let loaded = backend.read(&id).await.unwrap().unwrap();
        assert_eq!(loaded.value, Value::Bytes(vec![2]));
        assert_eq!(backend.scan_session("session_").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let backend = InMemoryBackend::new();
        let id = keys().record(SignalDataType::PreKey, "404");
        backend.remove(&id).await.unwrap();
        assert!(backend.read(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_session_keeps_creds_and_other_sessions() {
        let backend = InMemoryBackend::new();
        let ours = keys();
        let theirs = KeyBuilder::new("other");

        backend.write("session_", &ours.creds(), &Value::from("c")).await.unwrap();
        backend
            .write("session_", &ours.record(SignalDataType::Session, "a"), &Value::from("a"))
            .await
            .unwrap();
        backend.write("other", &theirs.creds(), &Value::from("o")).await.unwrap();

        assert_eq!(backend.clear_session("session_", true).await.unwrap(), 1);
        assert!(backend.read(&ours.creds()).await.unwrap().is_some());
        assert!(backend.read(&theirs.creds()).await.unwrap().is_some());

        assert_eq!(backend.remove_session("session_").await.unwrap(), 1);
        assert!(backend.read(&ours.creds()).await.unwrap().is_none());
        assert!(backend.read(&theirs.creds()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_rows_read_as_absent_until_purged() {
        let backend = InMemoryBackend::with_retention(Retention::new(Duration::from_secs(60)));
        let id = keys().record(SignalDataType::Session, "old");

        backend
            .insert_raw(StoredRow {
                id: id.as_str().to_string(),
                value: codec::encode_document(&Value::Bytes(vec![1])).unwrap(),
                session: "session_".to_string(),
                timestamp: now_ms() - 120_000,
            })
            .await;

        assert!(backend.read(&id).await.unwrap().is_none());
        assert!(backend.query(&id).await.unwrap().is_some());

        assert_eq!(backend.purge_expired("session_").await.unwrap(), 1);
        assert!(backend.query(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_backend_rejects_calls() {
        let backend = InMemoryBackend::new();
        backend.close().await.unwrap();
        assert!(matches!(
            backend.read(&keys().creds()).await,
            Err(StoreError::Closed)
        ));
    }
}
