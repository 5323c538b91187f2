//! RPC error codes and error type.

use std::time::Duration;

use serde_json::Value;

use crate::envelope::ErrorObject;

// ── Reserved JSON-RPC codes ─────────────────────────────────────────

/// Payload is not JSON.
pub const PARSE_ERROR: i64 = -32700;
/// JSON but not a valid envelope.
pub const INVALID_REQUEST: i64 = -32600;
/// No handler registered under the requested name.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Missing or malformed parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Handler failed, panicked, or exceeded its time limit.
pub const INTERNAL_ERROR: i64 = -32603;

// ── Application codes ───────────────────────────────────────────────

/// Identity-bound hub procedure called before `introduce`.
pub const NOT_INTRODUCED: i64 = -32000;
/// Method name already owned by someone else.
pub const METHOD_CONFLICT: i64 = -32001;
/// Correlated call did not settle before its deadline.
pub const CALL_TIMEOUT: i64 = -32002;
/// Connection went away before the call settled.
pub const CONNECTION_CLOSED: i64 = -32003;

/// Failure of a dispatch, an identity check, or a correlated call.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RpcError {
    /// No registry entry under this name.
    #[error("method: {method} not found")]
    MethodNotFound {
        /// Requested method.
        method: String,
    },

    /// Required parameter missing or wrong type.
    #[error("{message}")]
    InvalidParams {
        /// What is wrong.
        message: String,
    },

    /// Handler failure.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },

    /// Caller has not introduced itself to the hub.
    #[error("can't find related client info, introduce yourself first")]
    NotIntroduced,

    /// Registration rejected; the existing entry is kept.
    #[error("method '{method}' is already registered")]
    Conflict {
        /// Contested name.
        method: String,
    },

    /// No response or error arrived in time.
    #[error("call to '{method}' timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// Method that was called.
        method: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The connection carrying the call closed first.
    #[error("connection closed before '{method}' settled")]
    Closed {
        /// Method that was called.
        method: String,
    },

    /// Error envelope returned by the remote side, passed through verbatim.
    #[error("{}", .0.message)]
    Remote(ErrorObject),

    /// Handler-defined failure with an arbitrary code.
    #[error("{message}")]
    Application {
        /// Machine-readable code.
        code: i64,
        /// Human-readable message.
        message: String,
        /// Optional structured details.
        data: Option<Value>,
    },
}

impl RpcError {
    /// Shorthand for [`RpcError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for [`RpcError::InvalidParams`].
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Numeric JSON-RPC code for this variant.
    pub fn code(&self) -> i64 {
        match self {
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::NotIntroduced => NOT_INTRODUCED,
            Self::Conflict { .. } => METHOD_CONFLICT,
            Self::Timeout { .. } => CALL_TIMEOUT,
            Self::Closed { .. } => CONNECTION_CLOSED,
            Self::Remote(error) => error.code,
            Self::Application { code, .. } => *code,
        }
    }

    /// Label used for the `error_type` metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MethodNotFound { .. } => "method_not_found",
            Self::InvalidParams { .. } => "invalid_params",
            Self::Internal { .. } => "internal",
            Self::NotIntroduced => "not_introduced",
            Self::Conflict { .. } => "conflict",
            Self::Timeout { .. } => "timeout",
            Self::Closed { .. } => "closed",
            Self::Remote(_) => "remote",
            Self::Application { .. } => "application",
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            Self::Remote(error) => error.clone(),
            Self::Application { code, message, data } => ErrorObject {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            _ => ErrorObject::new(self.code(), self.to_string()),
        }
    }
}

impl From<ErrorObject> for RpcError {
    fn from(error: ErrorObject) -> Self {
        Self::Remote(error)
    }
}
