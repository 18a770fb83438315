//! Core types for persisting messaging authentication state: the storage
//! codec, the record key scheme, the credential data model and the backend
//! contract implemented by the storage crates.

pub mod codec;
pub mod signal;
pub mod store;
pub mod types;
