use thiserror::Error;

use crate::retry::Transient;

/// Errors raised by the registry stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend temporarily unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Returned when deserializing a record with an unexpected schema version.
    #[error("schema mismatch for {entity}: expected {expected}, got {found}")]
    SchemaMismatch {
        entity: &'static str,
        expected: u8,
        found: u8,
    },
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Sled(sled::Error::Io(_)) => true,
            StoreError::Io(_) | StoreError::Unavailable(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_is_permanent() {
        let codec: StoreError = bincode::Error::from(bincode::ErrorKind::SizeLimit).into();
        assert!(!codec.is_transient());
        assert!(StoreError::Unavailable("timeout".into()).is_transient());
        let schema = StoreError::SchemaMismatch {
            entity: "sim",
            expected: 1,
            found: 9,
        };
        assert!(!schema.is_transient());
    }
}
