use authcore::store::{DEFAULT_RETENTION, Result, Retention, StoreError, validate_table_name};
use std::time::Duration;

pub const DEFAULT_TABLE_NAME: &str = "amiruldev_auth";
pub const DEFAULT_SESSION: &str = "session_";
pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

/// Everything needed to open an auth state over one backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    /// SQLite URL or redb file path.
    pub database_url: String,
    /// Table (SQLite) or collection (redb) holding the rows.
    pub table_name: String,
    /// Session partition tag; several sessions may share one table.
    pub session: String,
    /// `None` disables expiry.
    pub retention: Option<Duration>,
    /// `None` disables the read cache.
    pub cache_capacity: Option<u64>,
    /// Physically delete expired rows of the session on open.
    pub purge_on_open: bool,
    /// Period of the background expiry sweep, if any.
    pub sweep_interval: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "whatsapp-auth.db".to_string(),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            session: DEFAULT_SESSION.to_string(),
            retention: Some(DEFAULT_RETENTION),
            cache_capacity: Some(DEFAULT_CACHE_CAPACITY),
            purge_on_open: true,
            sweep_interval: None,
        }
    }
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: Option<u64>) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_purge_on_open(mut self, purge: bool) -> Self {
        self.purge_on_open = purge;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn retention_policy(&self) -> Retention {
        Retention::from(self.retention)
    }

    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.table_name)?;
        if self.session.is_empty() {
            return Err(StoreError::InvalidConfig(
                "session tag must not be empty".to_string(),
            ));
        }
        if self.database_url.is_empty() {
            return Err(StoreError::InvalidConfig(
                "database url must not be empty".to_string(),
            ));
        }
        if self.sweep_interval == Some(Duration::ZERO) {
            return Err(StoreError::InvalidConfig(
                "sweep interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
