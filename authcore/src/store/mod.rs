pub mod error;
pub mod expiry;
pub mod in_memory;
pub mod keys;
pub mod traits;

pub use error::{Result, StoreError};
pub use expiry::{DEFAULT_RETENTION, Retention, now_ms};
pub use in_memory::InMemoryBackend;
pub use keys::{CREDS_ID, KeyBuilder, LogicalId, PhysicalId, validate_table_name};
pub use traits::{CredentialBackend, SignalKeyStore, StoredRow, StoredValue};
