//! JSON-RPC 2.0 envelopes and the text codec.
//!
//! An inbound payload is either one JSON object or a non-empty array of
//! them. Each object is classified by which members it carries:
//!
//! | `id` | `method` | `result` | `error` | kind |
//! |------|----------|----------|---------|------|
//! | yes  | yes      |          |         | request |
//! | no   | yes      |          |         | notification |
//! | yes  | no       | yes      |         | response |
//! | yes  | no       |          | yes     | error |
//!
//! Anything else is a [`DecodeError`]. Classification works on the raw
//! object rather than through `Option` fields so that `"result": null` is
//! still recognised as a response.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::errors::{INVALID_REQUEST, PARSE_ERROR};

/// Protocol version stamped on every outbound envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier. Numbers are what this crate issues; strings are
/// accepted from foreign peers and echoed back unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl RequestId {
    /// The numeric value, if this is a numeric id.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(_) => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::String(s) => Value::String(s.clone()),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// The `error` member of an error envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Build an error body without data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    fn to_value(&self) -> Value {
        let mut entries = vec![
            ("code", Value::from(self.code)),
            ("message", Value::String(self.message.clone())),
        ];
        if let Some(data) = &self.data {
            entries.push(("data", data.clone()));
        }
        object(entries)
    }
}

/// One wire message unit.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// A call expecting exactly one response or error.
    Request {
        /// Correlation id, unique among the issuer's pending calls.
        id: RequestId,
        /// Method name, bare or `<peer>.<local>`.
        method: String,
        /// Call parameters.
        params: Option<Value>,
    },
    /// Successful completion of a request.
    Response {
        /// Id of the originating request.
        id: RequestId,
        /// Handler return value; an absent value is an explicit `null`.
        result: Value,
    },
    /// Failed completion of a request.
    Error {
        /// Id of the originating request.
        id: RequestId,
        /// Error body.
        error: ErrorObject,
    },
    /// Fire-and-forget message; never answered.
    Notification {
        /// Event or method name.
        method: String,
        /// Event payload.
        params: Option<Value>,
    },
}

impl Envelope {
    /// Build a request envelope.
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Build a response envelope.
    pub fn response(id: RequestId, result: Value) -> Self {
        Self::Response { id, result }
    }

    /// Build an error envelope.
    pub fn error(id: RequestId, error: ErrorObject) -> Self {
        Self::Error { id, error }
    }

    /// Build a notification envelope.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    /// The correlation id, absent only for notifications.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } | Self::Error { id, .. } => {
                Some(id)
            }
            Self::Notification { .. } => None,
        }
    }

    /// The method name of requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } | Self::Error { .. } => None,
        }
    }

    /// Short kind label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Error { .. } => "error",
            Self::Notification { .. } => "notification",
        }
    }

    /// Structured form with the protocol version stamped.
    pub fn to_value(&self) -> Value {
        let version = ("jsonrpc", Value::from(JSONRPC_VERSION));
        match self {
            Self::Request { id, method, params } => {
                let mut entries = vec![
                    version,
                    ("id", id.to_value()),
                    ("method", Value::String(method.clone())),
                ];
                if let Some(params) = params {
                    entries.push(("params", params.clone()));
                }
                object(entries)
            }
            Self::Response { id, result } => {
                object(vec![version, ("id", id.to_value()), ("result", result.clone())])
            }
            Self::Error { id, error } => {
                object(vec![version, ("id", id.to_value()), ("error", error.to_value())])
            }
            Self::Notification { method, params } => {
                let mut entries = vec![version, ("method", Value::String(method.clone()))];
                if let Some(params) = params {
                    entries.push(("params", params.clone()));
                }
                object(entries)
            }
        }
    }
}

fn object(entries: Vec<(&str, Value)>) -> Value {
    Value::Object(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect::<Map<String, Value>>(),
    )
}

/// Why an inbound payload could not be turned into envelopes.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload is not JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A batch member or the payload is not an object.
    #[error("envelope must be a JSON object")]
    NotAnObject,
    /// `[]`.
    #[error("empty batch")]
    EmptyBatch,
    /// `jsonrpc` present with a value other than `"2.0"`.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),
    /// `id` is neither an integer nor a string.
    #[error("invalid id {0}")]
    InvalidId(Value),
    /// `method` is not a string.
    #[error("method must be a string")]
    InvalidMethod,
    /// `error` does not have `code` and `message`.
    #[error("invalid error object: {0}")]
    InvalidErrorObject(serde_json::Error),
    /// Members do not identify exactly one envelope kind.
    #[error("unrecognised envelope: {0}")]
    Ambiguous(&'static str),
}

impl DecodeError {
    /// JSON-RPC code a strict server would answer with.
    pub fn code(&self) -> i64 {
        match self {
            Self::Json(_) => PARSE_ERROR,
            _ => INVALID_REQUEST,
        }
    }
}

/// A decoded payload.
#[derive(Debug)]
pub enum Frame {
    /// A single envelope.
    Single(Envelope),
    /// A batch; members decode independently.
    Batch(Vec<Result<Envelope, DecodeError>>),
}

impl Frame {
    /// Flatten into per-envelope results, preserving order.
    pub fn into_envelopes(self) -> Vec<Result<Envelope, DecodeError>> {
        match self {
            Self::Single(envelope) => vec![Ok(envelope)],
            Self::Batch(items) => items,
        }
    }
}

/// Serialize one envelope.
pub fn encode(envelope: &Envelope) -> String {
    envelope.to_value().to_string()
}

/// Serialize several envelopes as a batch array.
pub fn encode_batch(envelopes: &[Envelope]) -> String {
    Value::Array(envelopes.iter().map(Envelope::to_value).collect()).to_string()
}

/// Parse a text payload into a single envelope or a batch.
pub fn decode(raw: &str) -> Result<Frame, DecodeError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Array(items) if items.is_empty() => Err(DecodeError::EmptyBatch),
        Value::Array(items) => Ok(Frame::Batch(items.into_iter().map(decode_value).collect())),
        other => decode_value(other).map(Frame::Single),
    }
}

/// Classify one JSON value as an envelope.
pub fn decode_value(value: Value) -> Result<Envelope, DecodeError> {
    let Value::Object(mut map) = value else {
        return Err(DecodeError::NotAnObject);
    };

    match map.remove("jsonrpc") {
        None => {}
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => return Err(DecodeError::UnsupportedVersion(other.to_string())),
    }

    let id = match map.remove("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(RequestId::String(s)),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(n) => Some(RequestId::Number(n)),
            None => return Err(DecodeError::InvalidId(Value::Number(n))),
        },
        Some(other) => return Err(DecodeError::InvalidId(other)),
    };

    let method = match map.remove("method") {
        None => None,
        Some(Value::String(m)) => Some(m),
        Some(_) => return Err(DecodeError::InvalidMethod),
    };

    let params = map.remove("params");
    let result = map.remove("result");
    let error = map.remove("error");

    match (id, method, result, error) {
        (Some(id), Some(method), None, None) => Ok(Envelope::Request { id, method, params }),
        (None, Some(method), None, None) => Ok(Envelope::Notification { method, params }),
        (Some(id), None, Some(result), None) => Ok(Envelope::Response { id, result }),
        (Some(id), None, None, Some(error)) => {
            let error = serde_json::from_value(error).map_err(DecodeError::InvalidErrorObject)?;
            Ok(Envelope::Error { id, error })
        }
        (_, Some(_), _, _) => Err(DecodeError::Ambiguous("method alongside result or error")),
        (None, None, _, _) => Err(DecodeError::Ambiguous("neither id nor method")),
        (Some(_), None, Some(_), Some(_)) => Err(DecodeError::Ambiguous("both result and error")),
        (Some(_), None, None, None) => {
            Err(DecodeError::Ambiguous("id without method, result, or error"))
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn single(raw: &str) -> Envelope {
        match decode(raw).unwrap() {
            Frame::Single(e) => e,
            Frame::Batch(_) => panic!("expected a single envelope"),
        }
    }

    // ── classification ──────────────────────────────────────────────

    #[test]
    fn decode_request() {
        let env = single(r#"{"jsonrpc":"2.0","id":1,"method":"greet","params":{"name":"x"}}"#);
        assert_eq!(env, Envelope::request(1, "greet", Some(json!({"name": "x"}))));
    }

    #[test]
    fn decode_notification_has_no_id() {
        let env = single(r#"{"jsonrpc":"2.0","method":"hello","params":[1]}"#);
        assert_eq!(env.id(), None);
        assert_eq!(env.method(), Some("hello"));
        assert_eq!(env.kind(), "notification");
    }

    #[test]
    fn decode_response_with_null_result() {
        let env = single(r#"{"jsonrpc":"2.0","id":4,"result":null}"#);
        assert_eq!(env, Envelope::response(RequestId::Number(4), Value::Null));
    }

    #[test]
    fn decode_error_with_data() {
        let env = single(
            r#"{"jsonrpc":"2.0","id":"abc","error":{"code":-32601,"message":"nope","data":{"m":"x"}}}"#,
        );
        assert_matches!(env, Envelope::Error { id, error } => {
            assert_eq!(id, RequestId::from("abc"));
            assert_eq!(error.code, -32601);
            assert_eq!(error.data, Some(json!({"m": "x"})));
        });
    }

    #[test]
    fn missing_version_is_accepted() {
        let env = single(r#"{"id":2,"method":"list"}"#);
        assert_eq!(env, Envelope::request(2, "list", None));
    }

    #[test]
    fn null_id_counts_as_absent() {
        let env = single(r#"{"jsonrpc":"2.0","id":null,"method":"tick"}"#);
        assert_eq!(env, Envelope::notification("tick", None));
    }

    // ── rejection ───────────────────────────────────────────────────

    #[test]
    fn malformed_json_is_parse_error() {
        let err = decode("{not json").unwrap_err();
        assert_matches!(err, DecodeError::Json(_));
        assert_eq!(err.code(), PARSE_ERROR);
    }

    #[test]
    fn non_object_rejected() {
        assert_matches!(decode("42"), Err(DecodeError::NotAnObject));
    }

    #[test]
    fn wrong_version_rejected() {
        assert_matches!(
            decode(r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#),
            Err(DecodeError::UnsupportedVersion(v)) if v == "\"1.0\""
        );
    }

    #[test]
    fn fractional_id_rejected() {
        assert_matches!(
            decode(r#"{"jsonrpc":"2.0","id":1.5,"result":true}"#),
            Err(DecodeError::InvalidId(_))
        );
    }

    #[test]
    fn ambiguous_shapes_rejected() {
        for raw in [
            r#"{"jsonrpc":"2.0","id":1,"method":"x","result":1}"#,
            r#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"m"}}"#,
            r#"{"jsonrpc":"2.0","id":1}"#,
            r#"{"jsonrpc":"2.0","result":1}"#,
        ] {
            let err = decode(raw).unwrap_err();
            assert_matches!(err, DecodeError::Ambiguous(_), "{raw}");
            assert_eq!(err.code(), INVALID_REQUEST);
        }
    }

    #[test]
    fn error_without_message_rejected() {
        assert_matches!(
            decode(r#"{"jsonrpc":"2.0","id":1,"error":{"code":1}}"#),
            Err(DecodeError::InvalidErrorObject(_))
        );
    }

    #[test]
    fn non_string_method_rejected() {
        assert_matches!(
            decode(r#"{"jsonrpc":"2.0","id":1,"method":7}"#),
            Err(DecodeError::InvalidMethod)
        );
    }

    // ── batches ─────────────────────────────────────────────────────

    #[test]
    fn batch_members_decode_independently() {
        let frame = decode(r#"[{"jsonrpc":"2.0","method":"a"}, 5, {"jsonrpc":"2.0","id":1,"result":2}]"#)
            .unwrap();
        let items = frame.into_envelopes();
        assert_eq!(items.len(), 3);
        assert_matches!(&items[0], Ok(Envelope::Notification { method, .. }) if method == "a");
        assert_matches!(&items[1], Err(DecodeError::NotAnObject));
        assert_matches!(&items[2], Ok(Envelope::Response { .. }));
    }

    #[test]
    fn empty_batch_rejected() {
        assert_matches!(decode("[]"), Err(DecodeError::EmptyBatch));
    }

    // ── encoding ────────────────────────────────────────────────────

    #[test]
    fn encode_stamps_version_and_keeps_null_result() {
        let raw = encode(&Envelope::response(RequestId::Number(9), Value::Null));
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 9);
        assert!(value.as_object().unwrap().contains_key("result"));
        assert!(value["result"].is_null());
    }

    #[test]
    fn notification_never_carries_id() {
        let value = Envelope::notification("hello", Some(json!({"a": 1}))).to_value();
        assert!(value.get("id").is_none());
        assert_eq!(value["params"]["a"], 1);
    }

    #[test]
    fn request_without_params_omits_member() {
        let value = Envelope::request(3, "list", None).to_value();
        assert!(value.get("params").is_none());
    }

    #[test]
    fn every_kind_survives_encode_decode() {
        let envelopes = [
            Envelope::request(1, "deviceA.greet", Some(json!({"name": "x"}))),
            Envelope::response(RequestId::from("r-1"), json!("hello x")),
            Envelope::error(
                RequestId::Number(2),
                ErrorObject::new(-32603, "boom").with_data(json!([1, 2])),
            ),
            Envelope::notification("hello", Some(json!(["a", "b"]))),
        ];
        for envelope in &envelopes {
            assert_eq!(&single(&encode(envelope)), envelope);
        }

        let batch = decode(&encode_batch(&envelopes)).unwrap().into_envelopes();
        let decoded: Vec<Envelope> = batch.into_iter().map(Result::unwrap).collect();
        assert_eq!(decoded, envelopes);
    }

    #[test]
    fn request_id_display() {
        assert_eq!(RequestId::Number(5).to_string(), "5");
        assert_eq!(RequestId::from("a").to_string(), "\"a\"");
        assert_eq!(RequestId::Number(5).as_number(), Some(5));
        assert_eq!(RequestId::from("a").as_number(), None);
    }
}
