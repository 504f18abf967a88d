//! Error taxonomy shared by the store, the runtime and the wire protocol.

use serde::{Deserialize, Serialize};

/// Store and runtime errors. Serializable so they cross the socket unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "code", content = "message", rename_all = "snake_case")]
pub enum StateError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    /// Version or phase mismatch. Routine: re-read and reapply.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The requested watch resume point was compacted away.
    #[error("bookmark_expired: {0}")]
    BookmarkExpired(String),
    #[error("invalid_argument: {0}")]
    InvalidArgument(String),
    /// Adapter write outside the controller's declared outputs.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("internal: {0}")]
    Internal(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
}

pub type StateResult<T> = Result<T, StateError>;

impl StateError {
    pub fn is_not_found(&self) -> bool { matches!(self, StateError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StateError::Conflict(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StateError::AlreadyExists(_)) }

    /// Short machine-readable code, used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            StateError::NotFound(_) => "not_found",
            StateError::AlreadyExists(_) => "already_exists",
            StateError::Conflict(_) => "conflict",
            StateError::BookmarkExpired(_) => "bookmark_expired",
            StateError::InvalidArgument(_) => "invalid_argument",
            StateError::Unauthorized(_) => "unauthorized",
            StateError::Internal(_) => "internal",
            StateError::Cancelled(_) => "cancelled",
        }
    }

    /// True when `err` (or anything in its source chain) is a `Conflict`.
    pub fn chain_is_conflict(err: &(dyn std::error::Error + 'static)) -> bool {
        let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(e) = cur {
            if let Some(se) = e.downcast_ref::<StateError>() {
                if se.is_conflict() {
                    return true;
                }
            }
            cur = e.source();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_is_tagged() {
        let e = StateError::Conflict("version mismatch".into());
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["code"], "conflict");
        assert_eq!(v["message"], "version mismatch");
        let back: StateError = serde_json::from_value(v).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn display_carries_code() {
        let e = StateError::NotFound("default/Widget/a".into());
        assert_eq!(e.to_string(), "not_found: default/Widget/a");
        assert_eq!(e.code(), "not_found");
    }
}
