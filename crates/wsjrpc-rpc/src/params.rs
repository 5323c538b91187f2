//! Parameter extraction helpers for handlers.

use serde_json::Value;

use crate::errors::RpcError;

/// Extract a required parameter from the params object.
pub fn require_param<'a>(params: Option<&'a Value>, key: &str) -> Result<&'a Value, RpcError> {
    params
        .and_then(|p| p.get(key))
        .filter(|v| !v.is_null())
        .ok_or_else(|| RpcError::invalid_params(format!("{key} is required")))
}

/// Extract a required, non-empty string parameter.
pub fn require_str(params: Option<&Value>, key: &str) -> Result<String, RpcError> {
    let value = require_param(params, key)?
        .as_str()
        .ok_or_else(|| RpcError::invalid_params(format!("{key} must be a string")))?;
    if value.is_empty() {
        return Err(RpcError::invalid_params(format!("{key} is required")));
    }
    Ok(value.to_owned())
}

/// Extract an optional string parameter; wrong types are ignored.
pub fn optional_str(params: Option<&Value>, key: &str) -> Option<String> {
    params
        .and_then(|p| p.get(key))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}
