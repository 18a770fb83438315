//! redb storage backend for whatsapp-auth-store
//!
//! Stores one JSON document per physical id in a single redb table and
//! implements `authcore::store::CredentialBackend`.

mod redb_store;

pub use redb_store::RedbStore;
