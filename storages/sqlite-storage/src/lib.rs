//! SQLite storage backend for whatsapp-auth-store
//!
//! Keeps every session of one store in a single table of `(id, value, session, timestamp)`
//! rows and implements `authcore::store::CredentialBackend` on top of diesel.

mod sqlite_store;

pub use sqlite_store::SqliteStore;
