use crate::codec::{self, CodecError, Value};
use crate::store::error::Result;
use crate::store::expiry::Retention;
use crate::store::keys::PhysicalId;
use crate::types::signal_data::{SignalDataSet, SignalDataType, SignalValue};
use async_trait::async_trait;
use std::collections::HashMap;

/// A row exactly as it sits in the backing table or collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub id: String,
    /// Versioned codec document.
    pub value: String,
    pub session: String,
    /// Unix millis of the last write.
    pub timestamp: i64,
}

impl StoredRow {
    pub fn decode(&self) -> std::result::Result<Value, CodecError> {
        codec::decode_document(&self.value)
    }
}

/// A decoded live value together with its last write time.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub value: Value,
    pub timestamp: i64,
}

/// Storage contract shared by the relational and document backends.
///
/// Point operations address rows by [`PhysicalId`]; bulk operations address a
/// session partition. Reads never return rows older than [`Self::retention`].
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Creates the table or collection if needed. Safe to call on every start.
    async fn ensure_schema(&self) -> Result<()>;

    /// Upserts `value` and refreshes the row timestamp.
    async fn write(&self, session: &str, id: &PhysicalId, value: &Value) -> Result<()>;

    async fn read(&self, id: &PhysicalId) -> Result<Option<StoredValue>>;

    /// Deleting an absent id is not an error.
    async fn remove(&self, id: &PhysicalId) -> Result<()>;

    /// Deletes every row of `session`, optionally keeping its creds row.
    async fn clear_session(&self, session: &str, keep_creds: bool) -> Result<u64>;

    async fn remove_session(&self, session: &str) -> Result<u64>;

    /// Physically deletes expired rows of `session`.
    async fn purge_expired(&self, session: &str) -> Result<u64>;

    /// Raw row lookup, expired rows included.
    async fn query(&self, id: &PhysicalId) -> Result<Option<StoredRow>>;

    /// Raw rows of `session`, expired rows included.
    async fn scan_session(&self, session: &str) -> Result<Vec<StoredRow>>;

    fn retention(&self) -> Retention;

    /// Releases the connection handle. Later calls fail with `StoreError::Closed`.
    async fn close(&self) -> Result<()>;
}

/// Key access consumed by the protocol layer.
#[async_trait]
pub trait SignalKeyStore: Send + Sync {
    /// Looks up `ids` of one category. Ids that are missing, expired or
    /// unreadable are left out of the result.
    async fn get(
        &self,
        category: SignalDataType,
        ids: &[String],
    ) -> Result<HashMap<String, SignalValue>>;

    /// Applies every upsert and delete in `data`.
    async fn set(&self, data: SignalDataSet) -> Result<()>;
}
