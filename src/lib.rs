// Re-export core modules so callers only need this crate
pub use authcore::{codec, signal, types};

pub mod config;
pub mod store;

pub use config::StoreConfig;
pub use store::{AuthState, open_redb, open_sqlite};
