//! Error types for store operations
//!
//! One enum covers every backend. Absence is never an error: `get_*`
//! operations return `Ok(None)` for missing entities, and `NotFound`
//! is reserved for operations that require an existing target
//! (update, review, end-session).

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// The target of an update-style operation does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A unique constraint would be violated
    #[error("duplicate {field}: {value}")]
    Duplicate { field: &'static str, value: String },

    /// A referenced parent entity does not exist
    #[error("{child} references missing {parent}: {id}")]
    MissingParent {
        child: &'static str,
        parent: &'static str,
        id: Uuid,
    },

    /// Review quality outside the SM-2 domain
    #[error("review quality must be 0-5, got {0}")]
    QualityOutOfRange(u8),

    /// Document rating outside 1-5
    #[error("rating must be 1-5, got {0}")]
    RatingOutOfRange(u8),

    /// The selected backend does not implement this entity kind
    #[error("{entity} are not supported by the {backend} backend; use the sqlite backend")]
    Unsupported {
        entity: &'static str,
        backend: &'static str,
    },

    /// The backend selector did not name a known engine
    #[error("unknown backend {0:?} (expected sqlite, kv, or memory)")]
    UnknownBackend(String),

    /// SQLite database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Key-value store error
    #[error("key-value store error: {0}")]
    Kv(#[from] sled::Error),

    /// Entity blob could not be encoded or decoded
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored identifier is not a valid UUID
    #[error("invalid stored id: {0}")]
    InvalidId(#[from] uuid::Error),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn duplicate(field: &'static str, value: impl ToString) -> Self {
        StoreError::Duplicate {
            field,
            value: value.to_string(),
        }
    }

    pub(crate) fn missing_parent(child: &'static str, parent: &'static str, id: Uuid) -> Self {
        StoreError::MissingParent { child, parent, id }
    }

    /// Whether this error was caused by invalid caller input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StoreError::Duplicate { .. }
                | StoreError::MissingParent { .. }
                | StoreError::QualityOutOfRange(_)
                | StoreError::RatingOutOfRange(_)
        )
    }

    /// Whether this error means an operation target was absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_predicate() {
        assert!(StoreError::duplicate("path", "/tmp/a.pdf").is_validation());
        assert!(StoreError::QualityOutOfRange(9).is_validation());
        assert!(StoreError::missing_parent("annotation", "document", Uuid::new_v4())
            .is_validation());
        assert!(!StoreError::not_found("document", Uuid::new_v4()).is_validation());
    }

    #[test]
    fn test_not_found_display() {
        let id = Uuid::new_v4();
        let err = StoreError::not_found("flashcard", id);
        assert!(err.is_not_found());
        let msg = err.to_string();
        assert!(msg.contains("flashcard not found"));
        assert!(msg.contains(&id.to_string()));
    }

    #[test]
    fn test_unsupported_names_the_alternative() {
        let err = StoreError::Unsupported {
            entity: "tasks",
            backend: "kv",
        };
        let msg = err.to_string();
        assert!(msg.contains("tasks"));
        assert!(msg.contains("kv"));
        assert!(msg.contains("sqlite"));
    }
}
