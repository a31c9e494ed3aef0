//! Swap request and response messages
//!
//! One [`Request`] arrives per attach; one or two [`Response`]s go back.
//! Messages travel as JSON inside length-delimited frames (see
//! [`crate::transport`]).

use crate::host::HostError;
use serde::{Deserialize, Serialize};

/// New bytecode for one class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDefinition {
    /// Binary class name, e.g. `com/example/Foo`
    pub name: String,
    /// Replacement class bytes
    #[serde(default)]
    pub bytecode: Vec<u8>,
}

/// Classes to redefine, forwarded to the host untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub classes: Vec<ClassDefinition>,
}

impl ChangeSet {
    /// Number of classes in the set
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// A swap request from the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Application package owning the target process
    pub package_name: String,
    /// Defer the swap until the host signals an activity restart
    #[serde(default)]
    pub restart_activity: bool,
    /// Classes to swap
    #[serde(default)]
    pub change_set: ChangeSet,
}

impl Request {
    /// Decode a request from frame bytes
    ///
    /// # Errors
    /// Returns [`DecodeError`] if the bytes are not a well-formed request
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let request: Self = serde_json::from_slice(bytes)?;
        if request.package_name.trim().is_empty() {
            return Err(DecodeError::MissingPackageName);
        }
        if !is_plain_package_name(&request.package_name) {
            return Err(DecodeError::InvalidPackageName(request.package_name));
        }
        Ok(request)
    }

    /// Encode this request into frame bytes
    ///
    /// # Errors
    /// Returns the serializer error; not expected for well-formed values
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A package name names one directory entry: no separators, no `..`
fn is_plain_package_name(name: &str) -> bool {
    name != "."
        && !name.contains("..")
        && !name.contains(['/', '\\', '\0'])
}

/// Outcome reported to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Swap applied
    Ok,
    /// Swap rejected; see the error detail
    Error,
    /// Swap deferred; a second response follows on the same connection
    NeedActivityRestart,
}

impl Status {
    /// Whether another response follows this one
    #[must_use]
    pub const fn is_interim(self) -> bool {
        matches!(self, Self::NeedActivityRestart)
    }
}

/// Structured failure report attached to [`Status::Error`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Failure class, e.g. `UNSUPPORTED_CHANGE`
    pub kind: String,
    /// Human-readable description
    pub message: String,
}

impl ErrorDetail {
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&HostError> for ErrorDetail {
    fn from(err: &HostError) -> Self {
        Self {
            kind: err.code.as_str().to_string(),
            message: err.message.clone(),
        }
    }
}

/// A response frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub pid: u32,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
}

impl Response {
    #[must_use]
    pub const fn ok(pid: u32) -> Self {
        Self {
            pid,
            status: Status::Ok,
            error_detail: None,
        }
    }

    #[must_use]
    pub const fn error(pid: u32, detail: ErrorDetail) -> Self {
        Self {
            pid,
            status: Status::Error,
            error_detail: Some(detail),
        }
    }

    #[must_use]
    pub const fn need_restart(pid: u32) -> Self {
        Self {
            pid,
            status: Status::NeedActivityRestart,
            error_detail: None,
        }
    }

    /// Encode this response into frame bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode a response from frame bytes (controller side)
    ///
    /// # Errors
    /// Returns [`DecodeError`] if the bytes are not a well-formed response
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Malformed message
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Zero-length frame
    #[error("empty message")]
    Empty,

    /// Bytes are not a valid message
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Request names no package
    #[error("request has no package name")]
    MissingPackageName,

    /// Package name could address a path outside the application directory
    #[error("invalid package name: {0:?}")]
    InvalidPackageName(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostErrorCode;

    #[test]
    fn decode_minimal_request_defaults() {
        let req = Request::decode(br#"{"package_name":"com.example"}"#).unwrap();
        assert_eq!(req.package_name, "com.example");
        assert!(!req.restart_activity);
        assert!(req.change_set.is_empty());
    }

    #[test]
    fn decode_full_request() {
        let bytes = br#"{
            "package_name": "com.example",
            "restart_activity": true,
            "change_set": {"classes": [{"name": "com/example/A", "bytecode": [202, 254]}]}
        }"#;
        let req = Request::decode(bytes).unwrap();
        assert!(req.restart_activity);
        assert_eq!(req.change_set.len(), 1);
        assert_eq!(req.change_set.classes[0].bytecode, vec![0xca, 0xfe]);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Request::decode(b"\x00\x01nope"), Err(DecodeError::Malformed(_))));
        assert!(matches!(Request::decode(b""), Err(DecodeError::Empty)));
        assert!(matches!(
            Request::decode(br#"{"package_name":"  "}"#),
            Err(DecodeError::MissingPackageName)
        ));
    }

    #[test]
    fn decode_rejects_path_like_package_names() {
        for name in ["/tmp/elsewhere", "../com.example", "com/example", "..", ".", "com..example", "a\\b"] {
            let bytes = serde_json::to_vec(&serde_json::json!({ "package_name": name })).unwrap();
            assert!(
                matches!(Request::decode(&bytes), Err(DecodeError::InvalidPackageName(n)) if n == name),
                "{name}"
            );
        }
        assert!(Request::decode(br#"{"package_name":"com.example.app_2"}"#).is_ok());
    }

    #[test]
    fn status_wire_names() {
        let json = String::from_utf8(Response::need_restart(7).encode()).unwrap();
        assert!(json.contains("\"NEED_ACTIVITY_RESTART\""));
        assert!(!json.contains("error_detail"));
    }

    #[test]
    fn error_response_carries_host_detail() {
        let err = HostError::new(HostErrorCode::UnsupportedChange, "method added");
        let resp = Response::error(42, ErrorDetail::from(&err));
        let decoded = Response::decode(&resp.encode()).unwrap();
        assert_eq!(decoded.status, Status::Error);
        let detail = decoded.error_detail.unwrap();
        assert_eq!(detail.kind, "UNSUPPORTED_CHANGE");
        assert_eq!(detail.message, "method added");
    }
}
