pub mod auth_state;
pub mod cache;
pub mod locks;

pub use auth_state::AuthState;
pub use authcore::store::*;
pub use cache::KeyCache;
pub use locks::{KeyGuard, KeyedLock};

use crate::config::StoreConfig;
use std::sync::Arc;
use whatsapp_auth_redb_storage::RedbStore;
use whatsapp_auth_sqlite_storage::SqliteStore;

/// Opens an auth state backed by the SQLite table named in `config`.
pub async fn open_sqlite(config: &StoreConfig) -> Result<AuthState> {
    let store = open_sqlite_store(config).await?;
    AuthState::open(store, config).await
}

/// Opens an auth state backed by the redb file at `config.database_url`.
pub async fn open_redb(config: &StoreConfig) -> Result<AuthState> {
    let store = open_redb_store(config).await?;
    AuthState::open(store, config).await
}

pub async fn open_sqlite_store(config: &StoreConfig) -> Result<Arc<SqliteStore>> {
    config.validate()?;
    let store = SqliteStore::new(
        &config.database_url,
        &config.table_name,
        config.retention_policy(),
    )
    .await?;
    Ok(Arc::new(store))
}

pub async fn open_redb_store(config: &StoreConfig) -> Result<Arc<RedbStore>> {
    config.validate()?;
    let store = RedbStore::new(
        config.database_url.clone(),
        &config.table_name,
        config.retention_policy(),
    )
    .await?;
    Ok(Arc::new(store))
}
