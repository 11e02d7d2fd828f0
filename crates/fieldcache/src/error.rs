//! Error types for the fieldcache crate.
//!
//! Every variant maps onto a stable host-engine return code (see
//! [`CacheError::code`]) so that a transport layer can put these errors on
//! the wire without a lookup table of its own.

use thiserror::Error;

/// Errors returned by cache operations.
///
/// Transient data conditions (no data, stale, unwatched, not supported,
/// not permissioned) are never errors: they are reported as
/// [`SampleStatus`](crate::types::SampleStatus) values on the returned
/// samples instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// A bad parameter was passed to a function.
    #[error("bad parameter: {reason}")]
    BadParam {
        /// What was wrong with the parameter.
        reason: String,
    },

    /// A versioned request carried a version this build does not understand.
    #[error("version mismatch: expected {expected:#x}, got {actual:#x}")]
    VersionMismatch {
        /// The version this build understands.
        expected: u32,
        /// The version supplied by the caller.
        actual: u32,
    },

    /// A name or member was already present.
    #[error("duplicate key: {key}")]
    DuplicateKey {
        /// The duplicated key.
        key: String,
    },

    /// The field identifier is not in the registry.
    #[error("unknown field id: {field_id}")]
    UnknownField {
        /// The unknown field identifier.
        field_id: u16,
    },

    /// A fixed ceiling on live objects or members was reached.
    #[error("max limit reached for {what}: limit {limit}")]
    MaxLimit {
        /// The kind of object that hit its ceiling.
        what: &'static str,
        /// The configured ceiling.
        limit: usize,
    },

    /// An input argument is not large enough.
    #[error("insufficient size: need {needed}, got {provided}")]
    InsufficientSize {
        /// Required size.
        needed: usize,
        /// Supplied size.
        provided: usize,
    },

    /// The resource is referenced by an active watch.
    #[error("{what} is in use by {watches} active watch(es)")]
    InUse {
        /// Description of the resource.
        what: String,
        /// Number of watches referencing it.
        watches: usize,
    },

    /// The (group, field group) pair was never registered as a watch.
    #[error("not watched: group {group}, field group {field_group}")]
    NotWatched {
        /// The entity group handle.
        group: String,
        /// The field group identifier.
        field_group: u32,
    },

    /// The field does not support the requested operation.
    #[error("field {field_id} is unsupported by this api: {reason}")]
    FieldUnsupportedByApi {
        /// The field identifier.
        field_id: u16,
        /// Why the field cannot be used here.
        reason: String,
    },

    /// The operation is not valid on an empty group.
    #[error("group {group} is empty")]
    GroupIsEmpty {
        /// The group handle.
        group: String,
    },

    /// A handle does not refer to a live object.
    #[error("{what} not found: {id}")]
    NotFound {
        /// The kind of object looked up.
        what: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// The status queue has no more records.
    #[error("status queue is empty")]
    EmptyQueue,

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {reason}")]
    Config {
        /// The reason configuration was rejected.
        reason: String,
    },
}

impl CacheError {
    /// Shorthand for a [`CacheError::BadParam`].
    pub fn bad_param(reason: impl Into<String>) -> Self {
        Self::BadParam {
            reason: reason.into(),
        }
    }

    /// Returns the host-engine wire return code for this error.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::BadParam { .. } => -1,
            Self::Config { .. } => -5,
            Self::VersionMismatch { .. } => -12,
            Self::UnknownField { .. } => -13,
            Self::EmptyQueue => -14,
            Self::NotWatched { .. } => -16,
            Self::MaxLimit { .. } => -24,
            Self::DuplicateKey { .. } => -26,
            Self::InsufficientSize { .. } => -31,
            Self::FieldUnsupportedByApi { .. } => -32,
            Self::InUse { .. } => -34,
            Self::GroupIsEmpty { .. } => -35,
            Self::NotFound { .. } => -1,
        }
    }

    /// Returns `true` for resource-limit errors that succeed once the caller
    /// reduces scope or frees resources.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MaxLimit { .. } | Self::InsufficientSize { .. } | Self::InUse { .. }
        )
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn error_display_bad_param() {
        let err = CacheError::bad_param("update frequency must be positive");
        assert_eq!(
            err.to_string(),
            "bad parameter: update frequency must be positive"
        );
    }

    #[test]
    fn error_display_version_mismatch() {
        let err = CacheError::VersionMismatch {
            expected: 0x0100_0040,
            actual: 0x0200_0040,
        };
        assert_eq!(
            err.to_string(),
            "version mismatch: expected 0x1000040, got 0x2000040"
        );
    }

    #[test]
    fn error_display_max_limit() {
        let err = CacheError::MaxLimit {
            what: "entity groups",
            limit: 64,
        };
        assert_eq!(
            err.to_string(),
            "max limit reached for entity groups: limit 64"
        );
    }

    #[test]
    fn error_display_in_use() {
        let err = CacheError::InUse {
            what: "entity group 3".to_string(),
            watches: 2,
        };
        assert_eq!(err.to_string(), "entity group 3 is in use by 2 active watch(es)");
    }

    #[test]
    fn error_display_empty_queue() {
        assert_eq!(CacheError::EmptyQueue.to_string(), "status queue is empty");
    }

    #[test_case(CacheError::bad_param("x"), -1 ; "bad param")]
    #[test_case(CacheError::VersionMismatch { expected: 1, actual: 2 }, -12 ; "version mismatch")]
    #[test_case(CacheError::UnknownField { field_id: 9 }, -13 ; "unknown field")]
    #[test_case(CacheError::MaxLimit { what: "groups", limit: 1 }, -24 ; "max limit")]
    #[test_case(CacheError::DuplicateKey { key: "a".into() }, -26 ; "duplicate key")]
    #[test_case(CacheError::InUse { what: "g".into(), watches: 1 }, -34 ; "in use")]
    #[test_case(CacheError::FieldUnsupportedByApi { field_id: 1, reason: "r".into() }, -32 ; "unsupported by api")]
    fn error_codes_match_wire_contract(err: CacheError, code: i32) {
        assert_eq!(err.code(), code);
    }

    #[test]
    fn resource_limit_errors_are_retryable() {
        assert!(CacheError::MaxLimit { what: "g", limit: 1 }.is_retryable());
        assert!(CacheError::InUse { what: "g".into(), watches: 1 }.is_retryable());
        assert!(!CacheError::bad_param("x").is_retryable());
        assert!(!CacheError::UnknownField { field_id: 1 }.is_retryable());
    }
}
