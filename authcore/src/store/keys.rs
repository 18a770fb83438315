use crate::store::error::{Result, StoreError};
use crate::types::signal_data::SignalDataType;
use std::fmt;

pub const CREDS_ID: &str = "creds";

// `urlencoding::encode` always escapes '+', so it can only appear as a separator.
const SEPARATOR: char = '+';

/// A record identifier independent of how a backend stores it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogicalId {
    Creds,
    Record {
        category: SignalDataType,
        id: String,
    },
}

impl LogicalId {
    pub fn record(category: SignalDataType, id: impl Into<String>) -> Self {
        LogicalId::Record {
            category,
            id: id.into(),
        }
    }

    pub fn is_creds(&self) -> bool {
        matches!(self, LogicalId::Creds)
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalId::Creds => f.write_str(CREDS_ID),
            LogicalId::Record { category, id } => write!(f, "{category}-{id}"),
        }
    }
}

/// Primary key of a stored row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalId(String);

impl PhysicalId {
    /// Wraps a key read back from a backend.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for PhysicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PhysicalId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builds physical ids for one session partition.
///
/// Each component is percent-encoded, which removes `/` and `:` and makes the
/// mapping from `(session, LogicalId)` to [`PhysicalId`] injective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(session: &str) -> Self {
        Self {
            prefix: format!("{}{SEPARATOR}", urlencoding::encode(session)),
        }
    }

    #[inline]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    pub fn creds(&self) -> PhysicalId {
        PhysicalId(format!("{}{CREDS_ID}", self.prefix))
    }

    #[inline]
    pub fn record(&self, category: SignalDataType, id: &str) -> PhysicalId {
        PhysicalId(format!(
            "{}{}{SEPARATOR}{}",
            self.prefix,
            urlencoding::encode(category.as_str()),
            urlencoding::encode(id)
        ))
    }

    pub fn physical_id(&self, logical: &LogicalId) -> PhysicalId {
        match logical {
            LogicalId::Creds => self.creds(),
            LogicalId::Record { category, id } => self.record(*category, id),
        }
    }
}

const MAX_TABLE_NAME_LEN: usize = 64;

/// Table and collection names are spliced into statements, so only plain
/// identifiers are accepted.
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_TABLE_NAME_LEN {
        return Err(StoreError::InvalidConfig(format!(
            "table name must be 1..={MAX_TABLE_NAME_LEN} characters, got {}",
            name.len()
        )));
    }
    if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(StoreError::InvalidConfig(format!(
            "table name {name:?} may only contain ASCII letters, digits and '_'"
        )));
    }
    Ok(())
}
