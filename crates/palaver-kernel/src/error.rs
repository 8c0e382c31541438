//! Client-facing error taxonomy.
//!
//! Lower layers keep their own error enums; [`ChatError`] is what a caller
//! of the chat service sees. The `From` impls encode which layer failures
//! map to which class:
//!
//! - storage failures are `Internal` (a missing record is `NotFound`)
//! - backend selection and stream setup failures are `Unavailable`
//! - errors reported inside a running token stream are `Backend`

use crate::balancer::BalancerError;
use crate::inference::InferenceError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChatError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("llm stream error: {0}")]
    Backend(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Stable machine-readable code for the RPC boundary.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::PermissionDenied(_) => "PERMISSION_DENIED",
            ChatError::Unavailable(_) => "UNAVAILABLE",
            ChatError::Backend(_) => "BACKEND_ERROR",
            ChatError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ChatError::NotFound(what),
            other => ChatError::Internal(other.to_string()),
        }
    }
}

impl From<BalancerError> for ChatError {
    fn from(err: BalancerError) -> Self {
        ChatError::Unavailable(format!("select model instance failed: {err}"))
    }
}

impl From<InferenceError> for ChatError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::Receive(msg) => ChatError::Backend(msg),
            other => ChatError::Unavailable(format!("call llm failed: {other}")),
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
