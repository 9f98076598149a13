//! Wire format and document codec.
//!
//! Every frame exchanged after the handshake is UTF-8 JSON:
//! ```text
//! server → client (first frame)   full document      {"x":1}
//! client → server                  JSON Patch array   [{"op":"add","path":"/y","value":2}]
//! server → clients (fan-out)       same bytes as received
//! ```
//!
//! There are no message types: the first frame a client sees is the
//! snapshot, every later frame is a patch.

use json_patch::Patch;
use serde_json::{Map, Value};

/// Canonical state of one project.
pub type Document = Value;

/// URL prefix connections are routed under.
pub const ROUTE_PREFIX: &str = "/ws/";

/// A fresh project document: `{}`.
pub fn empty_document() -> Document {
    Value::Object(Map::new())
}

/// Decode raw frame bytes as an RFC 6902 patch.
pub fn decode_patch(raw: &[u8]) -> Result<Patch, ProtocolError> {
    serde_json::from_slice(raw).map_err(|e| ProtocolError::InvalidPatch(e.to_string()))
}

/// Apply a patch to the document.
///
/// Either every operation applies or the document is left untouched.
pub fn apply_patch(doc: &mut Document, patch: &Patch) -> Result<(), ProtocolError> {
    json_patch::patch(doc, &patch.0).map_err(|e| ProtocolError::PatchRejected(e.to_string()))
}

/// Serialize a document for storage or the initial sync frame.
pub fn encode_document(doc: &Document) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(doc).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

/// Parse a stored document.
pub fn decode_document(bytes: &[u8]) -> Result<Document, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::InvalidDocument(e.to_string()))
}

/// Extract the project id from a request path of the form `/ws/{projectId}`.
///
/// Only the first segment after the prefix is used, so `/ws/a/b` routes to `a`.
pub fn project_id_from_path(path: &str) -> Result<&str, ProtocolError> {
    let rest = path
        .strip_prefix(ROUTE_PREFIX)
        .ok_or(ProtocolError::MissingProjectId)?;
    if rest.is_empty() {
        return Err(ProtocolError::MissingProjectId);
    }
    match rest.split('/').next() {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(ProtocolError::InvalidProjectId),
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Frame is not a JSON Patch array
    InvalidPatch(String),
    /// Patch decoded but could not be applied (failed `test`, missing path, ...)
    PatchRejected(String),
    /// Stored bytes are not a JSON document
    InvalidDocument(String),
    SerializationError(String),
    /// Request path has no `/ws/{projectId}` segment
    MissingProjectId,
    /// First path segment after the prefix is empty
    InvalidProjectId,
    ConnectionClosed,
    /// Client is offline and its queue has no room left
    OfflineQueueFull,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPatch(e) => write!(f, "Invalid JSON patch: {e}"),
            Self::PatchRejected(e) => write!(f, "Patch rejected: {e}"),
            Self::InvalidDocument(e) => write!(f, "Invalid document: {e}"),
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::MissingProjectId => {
                write!(f, "Project ID is required in URL path: /ws/{{projectId}}")
            }
            Self::InvalidProjectId => write!(f, "Invalid project ID"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::OfflineQueueFull => write!(f, "Offline queue full"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_document_is_object() {
        assert_eq!(empty_document(), json!({}));
        assert_eq!(encode_document(&empty_document()).unwrap(), b"{}");
    }

    #[test]
    fn test_decode_valid_patch() {
        let patch = decode_patch(br#"[{"op":"add","path":"/x","value":1}]"#).unwrap();
        assert_eq!(patch.0.len(), 1);
    }

    #[test]
    fn test_decode_empty_patch() {
        let patch = decode_patch(b"[]").unwrap();
        assert!(patch.0.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_patch(b"not-json"), Err(ProtocolError::InvalidPatch(_))));
        // Valid JSON, but not a patch array
        assert!(matches!(decode_patch(br#"{"op":"add"}"#), Err(ProtocolError::InvalidPatch(_))));
        assert!(matches!(
            decode_patch(br#"[{"op":"explode","path":"/x"}]"#),
            Err(ProtocolError::InvalidPatch(_))
        ));
    }

    #[test]
    fn test_apply_add_and_replace() {
        let mut doc = json!({});
        let patch = decode_patch(
            br#"[{"op":"add","path":"/x","value":1},{"op":"replace","path":"/x","value":2}]"#,
        )
        .unwrap();
        apply_patch(&mut doc, &patch).unwrap();
        assert_eq!(doc, json!({"x": 2}));
    }

    #[test]
    fn test_apply_move_copy_remove() {
        let mut doc = json!({"a": {"b": 1}, "list": [1, 2]});
        let patch = decode_patch(
            br#"[
                {"op":"copy","from":"/a/b","path":"/c"},
                {"op":"move","from":"/a","path":"/moved"},
                {"op":"remove","path":"/list/0"}
            ]"#,
        )
        .unwrap();
        apply_patch(&mut doc, &patch).unwrap();
        assert_eq!(doc, json!({"c": 1, "moved": {"b": 1}, "list": [2]}));
    }

    #[test]
    fn test_failed_apply_leaves_document_unchanged() {
        let mut doc = json!({"x": 1});
        // First op would succeed, the failing test op must roll it back
        let patch = decode_patch(
            br#"[{"op":"add","path":"/y","value":2},{"op":"test","path":"/x","value":99}]"#,
        )
        .unwrap();
        let result = apply_patch(&mut doc, &patch);
        assert!(matches!(result, Err(ProtocolError::PatchRejected(_))));
        assert_eq!(doc, json!({"x": 1}));
    }

    #[test]
    fn test_apply_missing_path_rejected() {
        let mut doc = json!({});
        let patch = decode_patch(br#"[{"op":"remove","path":"/nope"}]"#).unwrap();
        assert!(apply_patch(&mut doc, &patch).is_err());
        assert_eq!(doc, json!({}));
    }

    #[test]
    fn test_decode_document_errors() {
        assert_eq!(decode_document(br#"{"a":[1]}"#).unwrap(), json!({"a": [1]}));
        assert!(matches!(decode_document(b"{"), Err(ProtocolError::InvalidDocument(_))));
    }

    #[test]
    fn test_route_project_id() {
        assert_eq!(project_id_from_path("/ws/alpha"), Ok("alpha"));
        assert_eq!(project_id_from_path("/ws/alpha/extra"), Ok("alpha"));
        assert_eq!(project_id_from_path("/ws/"), Err(ProtocolError::MissingProjectId));
        assert_eq!(project_id_from_path("/ws"), Err(ProtocolError::MissingProjectId));
        assert_eq!(project_id_from_path("/other/alpha"), Err(ProtocolError::MissingProjectId));
        assert_eq!(project_id_from_path("/ws//alpha"), Err(ProtocolError::InvalidProjectId));
    }

    #[test]
    fn test_protocol_error_display() {
        assert!(ProtocolError::MissingProjectId.to_string().contains("/ws/{projectId}"));
        assert!(ProtocolError::InvalidPatch("x".into()).to_string().contains("Invalid JSON patch"));
    }
}
