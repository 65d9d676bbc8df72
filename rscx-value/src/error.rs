//! Value model error types.

use crate::access::Access;
use thiserror::Error;

/// Errors from the value model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("object cannot be modified")]
    ObjectCannotBeModified,

    #[error("access cannot be changed from {from:?} to {to:?}")]
    AccessCannotBeChanged { from: Access, to: Access },

    #[error("cyclic reference cannot be represented in a tree")]
    CyclicReference,

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl ValueError {
    /// Returns an error code suitable for error events.
    pub fn error_code(&self) -> &'static str {
        match self {
            ValueError::ObjectCannotBeModified => "OBJECT_CANNOT_BE_MODIFIED",
            ValueError::AccessCannotBeChanged { .. } => "ACCESS_CANNOT_BE_CHANGED",
            ValueError::CyclicReference => "CYCLIC_REFERENCE",
            ValueError::TypeMismatch { .. } => "TYPE_MISMATCH",
            ValueError::InvalidPath(_) => "INVALID_PATH",
        }
    }
}
