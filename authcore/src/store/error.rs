use crate::codec::CodecError;
use crate::signal::CurveError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CurveError),

    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database operation error: {0}")]
    Database(String),

    #[error("Schema bootstrap error: {0}")]
    Migration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{failed} of {total} key mutations failed, first error: {first}")]
    MutationBatch {
        failed: usize,
        total: usize,
        first: Box<StoreError>,
    },

    #[error("Store has been closed")]
    Closed,
}

impl StoreError {
    /// True for a stored payload that could not be decoded.
    pub fn is_corrupt_record(&self) -> bool {
        matches!(self, StoreError::Codec(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
