//
// error.rs
//
// Error taxonomy of the dispatcher and its wire encoding
//

use std::borrow::Cow;

use tower_lsp::jsonrpc::{Error, ErrorCode};

use crate::cancel::Cancelled;

/// LSP `ServerNotInitialized`
const SERVER_NOT_INITIALIZED: i64 = -32002;

/// Why a single message could not be handled.
///
/// Every variant becomes the failing request's error response; none of them
/// tears down the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("language server must be initialized")]
    NotInitialized,
    #[error("language server is already initialized")]
    AlreadyInitialized,
    #[error("language server is shutting down")]
    ShuttingDown,
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("method not supported: {0}")]
    MethodNotFound(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("{method}: {message}")]
    Internal { method: String, message: String },
}

impl DispatchError {
    /// Classifies a handler failure. Cancellation stays distinguishable;
    /// anything else is an internal failure tagged with the method name.
    pub fn from_handler(method: &str, err: anyhow::Error) -> Self {
        if err.downcast_ref::<Cancelled>().is_some() {
            return DispatchError::Cancelled;
        }
        DispatchError::Internal {
            method: method.to_string(),
            message: format!("{:#}", err),
        }
    }

    pub fn internal(method: &str, message: impl Into<String>) -> Self {
        DispatchError::Internal {
            method: method.to_string(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled)
    }
}

impl From<Cancelled> for DispatchError {
    fn from(_: Cancelled) -> Self {
        DispatchError::Cancelled
    }
}

impl From<DispatchError> for Error {
    fn from(err: DispatchError) -> Self {
        let code = match &err {
            DispatchError::NotInitialized => ErrorCode::ServerError(SERVER_NOT_INITIALIZED),
            DispatchError::AlreadyInitialized | DispatchError::ShuttingDown => {
                ErrorCode::InvalidRequest
            }
            DispatchError::InvalidParams(_) => ErrorCode::InvalidParams,
            DispatchError::MethodNotFound(_) => ErrorCode::MethodNotFound,
            DispatchError::Cancelled => ErrorCode::RequestCancelled,
            DispatchError::Internal { .. } => ErrorCode::InternalError,
        };
        Error {
            code,
            message: Cow::Owned(err.to_string()),
            data: None,
        }
    }
}
