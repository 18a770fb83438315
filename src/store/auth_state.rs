use crate::config::StoreConfig;
use crate::store::cache::KeyCache;
use crate::store::locks::KeyedLock;
use async_trait::async_trait;
use authcore::codec;
use authcore::signal::{Curve, X25519Curve};
use authcore::store::{
    CredentialBackend, KeyBuilder, LogicalId, PhysicalId, Result, SignalKeyStore, StoreError,
    StoredRow, now_ms,
};
use authcore::types::{AuthenticationCreds, SignalDataSet, SignalDataType, SignalValue};
use futures_util::future::join_all;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;

struct StateInner {
    backend: Arc<dyn CredentialBackend>,
    session: String,
    keys: KeyBuilder,
    locks: KeyedLock,
    cache: KeyCache,
    creds: RwLock<AuthenticationCreds>,
    /// Shared by single-key operations, exclusive for bulk deletes, so a
    /// read or write in flight cannot repopulate the cache after a clear.
    bulk_gate: RwLock<()>,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Credentials plus key access for one session partition.
///
/// Cloning is cheap and every clone shares the same state. Reads and writes
/// of one physical row are serialized through a per-key lock; different rows
/// proceed concurrently.
#[derive(Clone)]
pub struct AuthState {
    inner: Arc<StateInner>,
}

impl AuthState {
    /// Bootstraps the schema, optionally purges expired rows, then loads the
    /// session's credentials or synthesizes fresh ones.
    ///
    /// Synthesized credentials live in memory until [`Self::save_creds`].
    pub async fn open(backend: Arc<dyn CredentialBackend>, config: &StoreConfig) -> Result<Self> {
        Self::open_with_curve(backend, config, &X25519Curve).await
    }

    pub async fn open_with_curve(
        backend: Arc<dyn CredentialBackend>,
        config: &StoreConfig,
        curve: &dyn Curve,
    ) -> Result<Self> {
        config.validate()?;

        backend.ensure_schema().await?;
        if config.purge_on_open {
            let purged = backend.purge_expired(&config.session).await?;
            if purged > 0 {
                debug!(
                    "Purged {purged} expired rows from session {}",
                    config.session
                );
            }
        }

        let keys = KeyBuilder::new(&config.session);
        let locks = KeyedLock::new();
        let creds = {
            let creds_id = keys.creds();
            let _guard = locks.lock(creds_id.as_str()).await;
            load_creds(backend.as_ref(), &creds_id, curve).await?
        };
        let cache = KeyCache::new(config.cache_capacity, backend.retention());

        let state = Self {
            inner: Arc::new(StateInner {
                backend,
                session: config.session.clone(),
                keys,
                locks,
                cache,
                creds: RwLock::new(creds),
                bulk_gate: RwLock::new(()),
                closed: AtomicBool::new(false),
                sweeper: Mutex::new(None),
            }),
        };

        if let Some(interval) = config.sweep_interval {
            let handle = state.spawn_expiry_sweeper(interval);
            *state.inner.sweeper.lock().await = Some(handle);
        }

        Ok(state)
    }

    pub fn session(&self) -> &str {
        &self.inner.session
    }

    pub fn physical_id(&self, id: &LogicalId) -> PhysicalId {
        self.inner.keys.physical_id(id)
    }

    pub fn backend(&self) -> &Arc<dyn CredentialBackend> {
        &self.inner.backend
    }

    /// Snapshot of the in-memory credentials.
    pub async fn creds(&self) -> AuthenticationCreds {
        self.inner.creds.read().await.clone()
    }

    /// Mutates the in-memory credentials. Call [`Self::save_creds`] to persist.
    pub async fn update_creds<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut AuthenticationCreds) -> R,
    {
        let mut creds = self.inner.creds.write().await;
        f(&mut creds)
    }

    /// Writes the in-memory credentials to the session's creds row.
    pub async fn save_creds(&self) -> Result<()> {
        self.ensure_open()?;
        let id = self.inner.keys.creds();
        let _gate = self.inner.bulk_gate.read().await;
        let _guard = self.inner.locks.lock(id.as_str()).await;

        let tree = {
            let creds = self.inner.creds.read().await;
            codec::to_value(&*creds)?
        };
        self.inner
            .backend
            .write(&self.inner.session, &id, &tree)
            .await?;
        debug!("Saved credentials for session {}", self.inner.session);
        Ok(())
    }

    pub async fn get(
        &self,
        category: SignalDataType,
        ids: &[String],
    ) -> Result<HashMap<String, SignalValue>> {
        self.ensure_open()?;
        let reads = ids.iter().map(|id| async move {
            let value = self.inner.read_record(category, id).await;
            (id, value)
        });

        Ok(join_all(reads)
            .await
            .into_iter()
            .filter_map(|(id, value)| value.map(|value| (id.clone(), value)))
            .collect())
    }

    /// Dispatches every mutation concurrently and waits for all of them.
    ///
    /// Mutations run to completion even if this future is dropped. If any of
    /// them fails, the others are still applied and the call returns
    /// [`StoreError::MutationBatch`].
    pub async fn set(&self, data: SignalDataSet) -> Result<()> {
        self.ensure_open()?;
        let total = data.len();

        let tasks: Vec<_> = data
            .into_iter()
            .map(|(category, id, value)| {
                let inner = self.inner.clone();
                tokio::spawn(async move { inner.apply(category, &id, value).await })
            })
            .collect();

        let mut failed = 0;
        let mut first = None;
        for outcome in join_all(tasks).await {
            let outcome = outcome
                .map_err(|e| StoreError::Database(format!("key mutation task failed: {e}")))
                .and_then(|result| result);
            if let Err(e) = outcome {
                failed += 1;
                first.get_or_insert(e);
            }
        }

        match first {
            None => Ok(()),
            Some(first) => {
                warn!("{failed} of {total} key mutations failed: {first}");
                Err(StoreError::MutationBatch {
                    failed,
                    total,
                    first: Box::new(first),
                })
            }
        }
    }

    /// Deletes every key of the session but keeps the creds row and the
    /// in-memory credentials.
    pub async fn clear_keys(&self) -> Result<u64> {
        self.ensure_open()?;
        let _gate = self.inner.bulk_gate.write().await;
        let removed = self
            .inner
            .backend
            .clear_session(&self.inner.session, true)
            .await?;
        self.inner.cache.invalidate_all();
        debug!(
            "Cleared {removed} keys from session {}",
            self.inner.session
        );
        Ok(removed)
    }

    /// Deletes every row of the session, creds included. The in-memory
    /// credentials are left as they are.
    pub async fn clear_all(&self) -> Result<u64> {
        self.ensure_open()?;
        let _gate = self.inner.bulk_gate.write().await;

        let removed = self
            .inner
            .backend
            .remove_session(&self.inner.session)
            .await?;
        self.inner.cache.invalidate_all();
        debug!(
            "Removed {removed} rows of session {}",
            self.inner.session
        );
        Ok(removed)
    }

    /// Raw row lookup, expired rows included.
    pub async fn query(&self, id: &LogicalId) -> Result<Option<StoredRow>> {
        self.ensure_open()?;
        self.inner.backend.query(&self.physical_id(id)).await
    }

    /// Periodically deletes expired rows of this session until the state is
    /// closed or dropped.
    pub fn spawn_expiry_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let state = Arc::downgrade(&self.inner);
        debug!("Expiry sweeper started with interval {interval:?}");

        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let Some(inner) = state.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                match inner.backend.purge_expired(&inner.session).await {
                    Ok(0) => {}
                    Ok(purged) => debug!(
                        "Expiry sweep removed {purged} rows from session {}",
                        inner.session
                    ),
                    Err(StoreError::Closed) => break,
                    Err(e) => error!("Expiry sweep failed for session {}: {e}", inner.session),
                }
            }
        })
    }

    /// Stops the sweeper and releases the backend. Later calls fail with
    /// [`StoreError::Closed`].
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(handle) = self.inner.sweeper.lock().await.take() {
            handle.abort();
        }
        self.inner.cache.invalidate_all();
        self.inner.backend.close().await?;
        debug!("Closed auth state for session {}", self.inner.session);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl StateInner {
    /// Never fails: I/O and decode errors are logged and read as absent.
    async fn read_record(&self, category: SignalDataType, id: &str) -> Option<SignalValue> {
        let pid = self.keys.record(category, id);
        let _gate = self.bulk_gate.read().await;
        let _guard = self.locks.lock(pid.as_str()).await;

        let value = match self.cache.get(pid.as_str()).await {
            Some(value) => value,
            None => match self.backend.read(&pid).await {
                Ok(Some(stored)) => {
                    self.cache
                        .insert(pid.as_str(), stored.value.clone(), stored.timestamp)
                        .await;
                    stored.value
                }
                Ok(None) => return None,
                Err(e) if e.is_corrupt_record() => {
                    warn!("Corrupt {category} record {id}, treating as absent: {e}");
                    return None;
                }
                Err(e) => {
                    warn!("Failed to read {category} record {id}, treating as absent: {e}");
                    return None;
                }
            },
        };

        match SignalValue::from_value(category, &value) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Unexpected {category} record {id}, treating as absent: {e}");
                self.cache.invalidate(pid.as_str()).await;
                None
            }
        }
    }

    async fn apply(
        &self,
        category: SignalDataType,
        id: &str,
        value: Option<SignalValue>,
    ) -> Result<()> {
        let pid = self.keys.record(category, id);
        let _gate = self.bulk_gate.read().await;
        let _guard = self.locks.lock(pid.as_str()).await;

        match value {
            Some(value) => {
                let tree = value.to_value()?;
                let written_at = now_ms();
                if let Err(e) = self.backend.write(&self.session, &pid, &tree).await {
                    self.cache.invalidate(pid.as_str()).await;
                    return Err(e);
                }
                self.cache.insert(pid.as_str(), tree, written_at).await;
            }
            None => {
                let removed = self.backend.remove(&pid).await;
                self.cache.invalidate(pid.as_str()).await;
                removed?;
            }
        }
        Ok(())
    }
}

async fn load_creds(
    backend: &dyn CredentialBackend,
    id: &PhysicalId,
    curve: &dyn Curve,
) -> Result<AuthenticationCreds> {
    match backend.read(id).await {
        Ok(Some(stored)) => match codec::from_value::<AuthenticationCreds>(&stored.value) {
            Ok(creds) => {
                debug!("Loaded credentials from {id}");
                return Ok(creds);
            }
            Err(e) => warn!("Stored credentials at {id} are unreadable, generating new ones: {e}"),
        },
        Ok(None) => debug!("No credentials at {id}, generating new ones"),
        Err(e) if e.is_corrupt_record() => {
            warn!("Stored credentials at {id} are corrupt, generating new ones: {e}")
        }
        Err(e) => return Err(e),
    }
    Ok(AuthenticationCreds::generate(curve)?)
}

#[async_trait]
impl SignalKeyStore for AuthState {
    async fn get(
        &self,
        category: SignalDataType,
        ids: &[String],
    ) -> Result<HashMap<String, SignalValue>> {
        AuthState::get(self, category, ids).await
    }

    async fn set(&self, data: SignalDataSet) -> Result<()> {
        AuthState::set(self, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authcore::codec::Value;
    use authcore::store::{InMemoryBackend, Retention, StoredValue};
    use authcore::signal::KeyPair;
    use std::sync::atomic::AtomicUsize;

    /// Wraps the in-memory backend and fails selected operations.
    #[derive(Clone, Default)]
    struct FlakyBackend {
        inner: InMemoryBackend,
        fail_writes_containing: Option<&'static str>,
        fail_reads: bool,
        key_delay: Option<Duration>,
        writes: Arc<AtomicUsize>,
    }

    impl FlakyBackend {
        async fn pause(&self, id: &PhysicalId) {
            if let Some(delay) = self.key_delay {
                if !id.as_str().ends_with("+creds") {
                    sleep(delay).await;
                }
            }
        }
    }

    #[async_trait]
    impl CredentialBackend for FlakyBackend {
        async fn ensure_schema(&self) -> Result<()> {
            self.inner.ensure_schema().await
        }

        async fn write(&self, session: &str, id: &PhysicalId, value: &Value) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.pause(id).await;
            if let Some(pattern) = self.fail_writes_containing {
                if id.as_str().contains(pattern) {
                    return Err(StoreError::Database(format!("write to {id} refused")));
                }
            }
            self.inner.write(session, id, value).await
        }

        async fn read(&self, id: &PhysicalId) -> Result<Option<StoredValue>> {
            if self.fail_reads {
                return Err(StoreError::Connection("connection reset".to_string()));
            }
            self.pause(id).await;
            self.inner.read(id).await
        }

        async fn remove(&self, id: &PhysicalId) -> Result<()> {
            self.inner.remove(id).await
        }

        async fn clear_session(&self, session: &str, keep_creds: bool) -> Result<u64> {
            self.inner.clear_session(session, keep_creds).await
        }

        async fn remove_session(&self, session: &str) -> Result<u64> {
            self.inner.remove_session(session).await
        }

        async fn purge_expired(&self, session: &str) -> Result<u64> {
            self.inner.purge_expired(session).await
        }

        async fn query(&self, id: &PhysicalId) -> Result<Option<StoredRow>> {
            self.inner.query(id).await
        }

        async fn scan_session(&self, session: &str) -> Result<Vec<StoredRow>> {
            self.inner.scan_session(session).await
        }

        fn retention(&self) -> Retention {
            self.inner.retention()
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    fn config() -> StoreConfig {
        StoreConfig::new("memory")
    }

    async fn open_memory() -> (AuthState, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let state = AuthState::open(Arc::new(backend.clone()), &config())
            .await
            .unwrap();
        (state, backend)
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn test_open_synthesizes_default_creds_without_persisting() {
        let (state, backend) = open_memory().await;
        let creds = state.creds().await;

        assert!(!creds.registered);
        assert_eq!(creds.next_pre_key_id, 1);
        assert_eq!(creds.noise_key.public.len(), 32);
        assert!(backend.scan_session("session_").await.unwrap().is_empty());

        state.save_creds().await.unwrap();
        let reopened = AuthState::open(Arc::new(backend), &config()).await.unwrap();
        assert_eq!(reopened.creds().await, creds);
    }

    #[tokio::test]
    async fn test_updated_creds_survive_reopen() {
        let (state, backend) = open_memory().await;
        state
            .update_creds(|creds| {
                creds.registered = true;
                creds.next_pre_key_id = 31;
            })
            .await;
        state.save_creds().await.unwrap();

        let reopened = AuthState::open(Arc::new(backend), &config()).await.unwrap();
        let creds = reopened.creds().await;
        assert!(creds.registered);
        assert_eq!(creds.next_pre_key_id, 31);
    }

    #[tokio::test]
    async fn test_corrupt_creds_fall_back_to_defaults() {
        let backend = InMemoryBackend::new();
        backend
            .insert_raw(StoredRow {
                id: KeyBuilder::new("session_").creds().into_string(),
                value: "{\"v\":1,\"value\":\"not creds\"}".to_string(),
                session: "session_".to_string(),
                timestamp: now_ms(),
            })
            .await;

        let state = AuthState::open(Arc::new(backend), &config()).await.unwrap();
        assert!(!state.creds().await.registered);
    }

    #[tokio::test]
    async fn test_creds_read_failure_aborts_open() {
        let backend = FlakyBackend {
            fail_reads: true,
            ..Default::default()
        };
        let result = AuthState::open(Arc::new(backend), &config()).await;
        assert!(matches!(result, Err(StoreError::Connection(_))));
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (state, _) = open_memory().await;
        let pre_key = KeyPair {
            public: vec![1; 32],
            private: vec![2; 32],
        };
        state
            .set(
                SignalDataSet::new()
                    .with("1", SignalValue::PreKey(pre_key.clone()))
                    .with("2", SignalValue::PreKey(pre_key.clone()))
                    .with("123.0", SignalValue::Session(vec![7; 16])),
            )
            .await
            .unwrap();

        let found = state
            .get(SignalDataType::PreKey, &ids(&["1", "2", "3"]))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["1"], SignalValue::PreKey(pre_key));
        assert!(!found.contains_key("3"));

        state
            .set(SignalDataSet::new().without(SignalDataType::PreKey, "1"))
            .await
            .unwrap();
        let found = state
            .get(SignalDataType::PreKey, &ids(&["1", "2"]))
            .await
            .unwrap();
        assert_eq!(found.keys().collect::<Vec<_>>(), vec!["2"]);
    }

    #[tokio::test]
    async fn test_get_skips_unreadable_records() {
        let (state, backend) = open_memory().await;
        let keys = KeyBuilder::new("session_");
        backend
            .write(
                "session_",
                &keys.record(SignalDataType::Session, "good"),
                &Value::Bytes(vec![1]),
            )
            .await
            .unwrap();
        backend
            .insert_raw(StoredRow {
                id: keys.record(SignalDataType::Session, "broken").into_string(),
                value: "{{{".to_string(),
                session: "session_".to_string(),
                timestamp: now_ms(),
            })
            .await;
        backend
            .write(
                "session_",
                &keys.record(SignalDataType::Session, "wrong-shape"),
                &Value::from("text"),
            )
            .await
            .unwrap();

        let found = state
            .get(SignalDataType::Session, &ids(&["good", "broken", "wrong-shape"]))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["good"], SignalValue::Session(vec![1]));
    }

    #[tokio::test]
    async fn test_failed_mutation_does_not_cancel_siblings() {
        let backend = FlakyBackend {
            fail_writes_containing: Some("bad"),
            ..Default::default()
        };
        let state = AuthState::open(Arc::new(backend.clone()), &config())
            .await
            .unwrap();

        let err = state
            .set(
                SignalDataSet::new()
                    .with("ok-1", SignalValue::Session(vec![1]))
                    .with("bad", SignalValue::Session(vec![2]))
                    .with("ok-2", SignalValue::Session(vec![3])),
            )
            .await
            .unwrap_err();

        match err {
            StoreError::MutationBatch { failed, total, first } => {
                assert_eq!((failed, total), (1, 3));
                assert!(matches!(*first, StoreError::Database(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.writes.load(Ordering::SeqCst), 3);

        let found = state
            .get(SignalDataType::Session, &ids(&["ok-1", "bad", "ok-2"]))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(!found.contains_key("bad"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_never_tear() {
        let (state, backend) = open_memory().await;
        let candidates: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 64]).collect();

        let writers: Vec<_> = candidates
            .iter()
            .cloned()
            .map(|payload| {
                let state = state.clone();
                tokio::spawn(async move {
                    state
                        .set(SignalDataSet::new().with("peer", SignalValue::SenderKey(payload)))
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let found = state
            .get(SignalDataType::SenderKey, &ids(&["peer"]))
            .await
            .unwrap();
        let SignalValue::SenderKey(stored) = &found["peer"] else {
            panic!("wrong variant");
        };
        assert!(candidates.contains(stored));

        // The cache and the backend agree on the winner.
        let row = backend
            .read(&KeyBuilder::new("session_").record(SignalDataType::SenderKey, "peer"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.value, Value::Bytes(stored.clone()));
    }

    #[tokio::test]
    async fn test_clear_keys_keeps_creds() {
        let (state, _) = open_memory().await;
        state.save_creds().await.unwrap();
        let before = state.creds().await;
        state
            .set(SignalDataSet::new().with("a", SignalValue::LidMapping("1@lid".into())))
            .await
            .unwrap();

        assert_eq!(state.clear_keys().await.unwrap(), 1);
        assert!(
            state
                .get(SignalDataType::LidMapping, &ids(&["a"]))
                .await
                .unwrap()
                .is_empty()
        );
        assert!(state.query(&LogicalId::Creds).await.unwrap().is_some());
        assert_eq!(state.creds().await, before);
    }

    #[tokio::test]
    async fn test_clear_all_removes_creds_row() {
        let (state, _) = open_memory().await;
        state.save_creds().await.unwrap();
        state
            .set(SignalDataSet::new().with("a", SignalValue::DeviceList(vec!["0".into()])))
            .await
            .unwrap();

        assert_eq!(state.clear_all().await.unwrap(), 2);
        assert!(state.query(&LogicalId::Creds).await.unwrap().is_none());
        assert!(
            state
                .get(SignalDataType::DeviceList, &ids(&["a"]))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_expired_rows_read_as_absent() {
        let backend = InMemoryBackend::with_retention(Retention::new(Duration::from_secs(60)));
        let keys = KeyBuilder::new("session_");
        let id = keys.record(SignalDataType::IdentityKey, "peer");
        backend
            .insert_raw(StoredRow {
                id: id.as_str().to_string(),
                value: codec::encode_document(&Value::Bytes(vec![5; 33])).unwrap(),
                session: "session_".to_string(),
                timestamp: now_ms() - 120_000,
            })
            .await;

        let state = AuthState::open(
            Arc::new(backend.clone()),
            &config().with_purge_on_open(false),
        )
        .await
        .unwrap();

        assert!(
            state
                .get(SignalDataType::IdentityKey, &ids(&["peer"]))
                .await
                .unwrap()
                .is_empty()
        );
        let logical = LogicalId::record(SignalDataType::IdentityKey, "peer");
        assert!(state.query(&logical).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_open_purges_expired_rows() {
        let backend = InMemoryBackend::with_retention(Retention::new(Duration::from_secs(60)));
        let id = KeyBuilder::new("session_").record(SignalDataType::TcToken, "x");
        backend
            .insert_raw(StoredRow {
                id: id.as_str().to_string(),
                value: codec::encode_document(&Value::Null).unwrap(),
                session: "session_".to_string(),
                timestamp: now_ms() - 120_000,
            })
            .await;

        AuthState::open(Arc::new(backend.clone()), &config())
            .await
            .unwrap();
        assert!(backend.query(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweeper_purges_in_background() {
        let backend = InMemoryBackend::with_retention(Retention::new(Duration::from_secs(60)));
        let state = AuthState::open(
            Arc::new(backend.clone()),
            &config().with_sweep_interval(Some(Duration::from_millis(10))),
        )
        .await
        .unwrap();

        let id = KeyBuilder::new("session_").record(SignalDataType::Session, "stale");
        backend
            .insert_raw(StoredRow {
                id: id.as_str().to_string(),
                value: codec::encode_document(&Value::Bytes(vec![1])).unwrap(),
                session: "session_".to_string(),
                timestamp: now_ms() - 120_000,
            })
            .await;

        sleep(Duration::from_millis(100)).await;
        assert!(backend.query(&id).await.unwrap().is_none());
        state.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_state_rejects_calls() {
        let (state, _) = open_memory().await;
        state.close().await.unwrap();
        state.close().await.unwrap();

        assert!(matches!(
            state.get(SignalDataType::Session, &ids(&["a"])).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(state.save_creds().await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_usable_through_trait_object() {
        let (state, _) = open_memory().await;
        let store: Arc<dyn SignalKeyStore> = Arc::new(state);
        store
            .set(SignalDataSet::new().with("k", SignalValue::SenderKey(vec![4])))
            .await
            .unwrap();
        let found = store
            .get(SignalDataType::SenderKey, &ids(&["k"]))
            .await
            .unwrap();
        assert_eq!(found["k"], SignalValue::SenderKey(vec![4]));
    }

    async fn open_slow() -> (AuthState, FlakyBackend) {
        let backend = FlakyBackend {
            key_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let state = AuthState::open(Arc::new(backend.clone()), &config())
            .await
            .unwrap();
        (state, backend)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_clear_keys_during_inflight_read_leaves_no_cached_value() {
        let (state, backend) = open_slow().await;
        state
            .set(SignalDataSet::new().with("peer", SignalValue::Session(vec![1, 2, 3])))
            .await
            .unwrap();
        state.inner.cache.invalidate_all();

        let reader = {
            let state = state.clone();
            tokio::spawn(async move {
                state
                    .get(SignalDataType::Session, &ids(&["peer"]))
                    .await
                    .unwrap()
            })
        };
        sleep(Duration::from_millis(20)).await;

        assert_eq!(state.clear_keys().await.unwrap(), 1);
        let seen = reader.await.unwrap();
        assert_eq!(seen["peer"], SignalValue::Session(vec![1, 2, 3]));

        let pid = KeyBuilder::new("session_").record(SignalDataType::Session, "peer");
        assert!(backend.query(&pid).await.unwrap().is_none());
        assert!(
            state
                .get(SignalDataType::Session, &ids(&["peer"]))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_clear_all_during_inflight_write_leaves_no_cached_value() {
        let (state, backend) = open_slow().await;
        state.save_creds().await.unwrap();

        let writer = {
            let state = state.clone();
            tokio::spawn(async move {
                state
                    .set(SignalDataSet::new().with("g1", SignalValue::SenderKey(vec![7; 8])))
                    .await
            })
        };
        sleep(Duration::from_millis(20)).await;

        assert_eq!(state.clear_all().await.unwrap(), 2);
        writer.await.unwrap().unwrap();

        let pid = KeyBuilder::new("session_").record(SignalDataType::SenderKey, "g1");
        assert!(backend.query(&pid).await.unwrap().is_none());
        assert!(state.query(&LogicalId::Creds).await.unwrap().is_none());
        assert!(
            state
                .get(SignalDataType::SenderKey, &ids(&["g1"]))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_open_accepts_retention_beyond_cache_limit() {
        let backend = InMemoryBackend::with_retention(Retention::new(Duration::from_secs(
            40_000_000_000,
        )));
        let state = AuthState::open(
            Arc::new(backend),
            &config().with_retention(Some(Duration::from_secs(40_000_000_000))),
        )
        .await
        .unwrap();
        state
            .set(SignalDataSet::new().with("k", SignalValue::Session(vec![1])))
            .await
            .unwrap();
        let found = state
            .get(SignalDataType::Session, &ids(&["k"]))
            .await
            .unwrap();
        assert_eq!(found["k"], SignalValue::Session(vec![1]));
    }
}
