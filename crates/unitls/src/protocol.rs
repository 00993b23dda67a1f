//
// protocol.rs
//
// Method table and parameter decoding
//

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_lsp::jsonrpc::Id;
use tower_lsp::lsp_types::*;

use crate::error::DispatchError;
use crate::service::{DocumentEvent, Query};

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED: &str = "initialized";
pub const SHUTDOWN: &str = "shutdown";
pub const EXIT: &str = "exit";
pub const CANCEL_REQUEST: &str = "$/cancelRequest";

pub const HOVER: &str = "textDocument/hover";
pub const DEFINITION: &str = "textDocument/definition";
pub const TYPE_DEFINITION: &str = "textDocument/typeDefinition";
pub const XDEFINITION: &str = "textDocument/xdefinition";
pub const COMPLETION: &str = "textDocument/completion";
pub const REFERENCES: &str = "textDocument/references";
pub const IMPLEMENTATION: &str = "textDocument/implementation";
pub const DOCUMENT_SYMBOL: &str = "textDocument/documentSymbol";
pub const SIGNATURE_HELP: &str = "textDocument/signatureHelp";
pub const FORMATTING: &str = "textDocument/formatting";
pub const RANGE_FORMATTING: &str = "textDocument/rangeFormatting";
pub const RENAME: &str = "textDocument/rename";
pub const CODE_ACTION: &str = "textDocument/codeAction";
pub const WORKSPACE_SYMBOL: &str = "workspace/symbol";
pub const XREFERENCES: &str = "workspace/xreferences";

pub const DID_OPEN: &str = "textDocument/didOpen";
pub const DID_CHANGE: &str = "textDocument/didChange";
pub const DID_CLOSE: &str = "textDocument/didClose";
pub const DID_SAVE: &str = "textDocument/didSave";

pub const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";

/// How the dispatcher schedules a method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// initialize, initialized, shutdown, exit
    Lifecycle,
    /// Document mutations, applied in receipt order
    Mutation,
    /// Read-only queries, eligible for concurrent execution
    Read,
    Cancel,
    Unknown,
}

pub fn classify(method: &str) -> MethodKind {
    match method {
        INITIALIZE | INITIALIZED | SHUTDOWN | EXIT => MethodKind::Lifecycle,
        DID_OPEN | DID_CHANGE | DID_CLOSE | DID_SAVE => MethodKind::Mutation,
        HOVER | DEFINITION | TYPE_DEFINITION | XDEFINITION | COMPLETION | REFERENCES
        | IMPLEMENTATION | DOCUMENT_SYMBOL | SIGNATURE_HELP | FORMATTING | RANGE_FORMATTING
        | RENAME | CODE_ACTION | WORKSPACE_SYMBOL | XREFERENCES => MethodKind::Read,
        CANCEL_REQUEST => MethodKind::Cancel,
        _ => MethodKind::Unknown,
    }
}

/// Parameters of `workspace/xreferences`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceReferencesParams {
    /// Partial symbol descriptor to match against
    pub query: Value,
    #[serde(default)]
    pub hints: Option<Value>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Decodes required params. Absent or `null` params and decode failures are
/// both `InvalidParams`.
pub fn decode<T: DeserializeOwned>(params: Option<Value>) -> Result<T, DispatchError> {
    match params {
        None | Some(Value::Null) => Err(DispatchError::InvalidParams("missing params".to_string())),
        Some(value) => {
            serde_json::from_value(value).map_err(|e| DispatchError::InvalidParams(e.to_string()))
        }
    }
}

/// Decodes the params of a read method into a typed query.
pub fn decode_query(method: &str, params: Option<Value>) -> Result<Query, DispatchError> {
    let query = match method {
        HOVER => Query::Hover(decode(params)?),
        DEFINITION => Query::Definition(decode(params)?),
        TYPE_DEFINITION => Query::TypeDefinition(decode(params)?),
        XDEFINITION => Query::XDefinition(decode(params)?),
        COMPLETION => Query::Completion(decode(params)?),
        REFERENCES => Query::References(decode(params)?),
        IMPLEMENTATION => Query::Implementation(decode(params)?),
        DOCUMENT_SYMBOL => Query::DocumentSymbol(decode(params)?),
        SIGNATURE_HELP => Query::SignatureHelp(decode(params)?),
        FORMATTING => Query::Formatting(decode(params)?),
        RANGE_FORMATTING => Query::RangeFormatting(decode(params)?),
        RENAME => Query::Rename(decode(params)?),
        CODE_ACTION => Query::CodeAction(decode(params)?),
        WORKSPACE_SYMBOL => Query::WorkspaceSymbol(decode(params)?),
        XREFERENCES => Query::WorkspaceReferences(decode(params)?),
        other => return Err(DispatchError::MethodNotFound(other.to_string())),
    };
    Ok(query)
}

/// Decodes the params of a document mutation.
pub fn decode_event(method: &str, params: Option<Value>) -> Result<DocumentEvent, DispatchError> {
    let event = match method {
        DID_OPEN => DocumentEvent::Opened(decode(params)?),
        DID_CHANGE => DocumentEvent::Changed(decode(params)?),
        DID_CLOSE => DocumentEvent::Closed(decode(params)?),
        DID_SAVE => DocumentEvent::Saved(decode(params)?),
        other => return Err(DispatchError::MethodNotFound(other.to_string())),
    };
    Ok(event)
}

/// `$/cancelRequest` params. Decoded straight into a JSON-RPC id so that
/// numeric ids keep their full 64-bit range.
#[derive(Debug, Deserialize)]
struct CancelTarget {
    id: Id,
}

/// Extracts the target of a `$/cancelRequest`, if well formed.
pub fn cancel_target(params: Option<Value>) -> Option<Id> {
    params
        .and_then(|p| serde_json::from_value::<CancelTarget>(p).ok())
        .map(|p| p.id)
        .filter(|id| *id != Id::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify() {
        assert_eq!(classify("initialize"), MethodKind::Lifecycle);
        assert_eq!(classify("textDocument/didChange"), MethodKind::Mutation);
        assert_eq!(classify("textDocument/codeAction"), MethodKind::Read);
        assert_eq!(classify("workspace/xreferences"), MethodKind::Read);
        assert_eq!(classify("$/cancelRequest"), MethodKind::Cancel);
        assert_eq!(classify("$/progress"), MethodKind::Unknown);
        assert_eq!(classify("foo/bar"), MethodKind::Unknown);
    }

    #[test]
    fn test_missing_params_are_invalid() {
        let err = decode_query(HOVER, None).unwrap_err();
        assert_eq!(err, DispatchError::InvalidParams("missing params".to_string()));
        let err = decode_query(HOVER, Some(Value::Null)).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidParams(_)));
    }

    #[test]
    fn test_decode_failure_carries_message() {
        let err = decode_query(HOVER, Some(json!({ "textDocument": 3 }))).unwrap_err();
        match err {
            DispatchError::InvalidParams(message) => assert!(!message.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_hover() {
        let params = json!({
            "textDocument": { "uri": "file:///ws/a.go" },
            "position": { "line": 1, "character": 2 }
        });
        match decode_query(HOVER, Some(params)).unwrap() {
            Query::Hover(p) => {
                assert_eq!(p.text_document_position_params.position.line, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_xreferences() {
        let params = json!({ "query": { "name": "Foo" }, "limit": 5 });
        match decode_query(XREFERENCES, Some(params)).unwrap() {
            Query::WorkspaceReferences(p) => {
                assert_eq!(p.limit, Some(5));
                assert!(p.hints.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cancel_target() {
        assert_eq!(cancel_target(Some(json!({ "id": 4 }))), Some(Id::Number(4)));
        assert_eq!(
            cancel_target(Some(json!({ "id": "x" }))),
            Some(Id::String("x".to_string()))
        );
        // Ids past the i32 range still resolve
        assert_eq!(
            cancel_target(Some(json!({ "id": 5_000_000_000i64 }))),
            Some(Id::Number(5_000_000_000))
        );
        assert_eq!(cancel_target(Some(json!({ "id": null }))), None);
        assert_eq!(cancel_target(Some(json!({ "nope": 1 }))), None);
        assert_eq!(cancel_target(None), None);
    }
}
