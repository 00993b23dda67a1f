//
// service.rs
//
// Language-service seam and the reference graph-backed implementation
//

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tower_lsp::lsp_types::*;

use crate::cache::CompilationUnit;
use crate::cancel::{Cancelled, RequestScope};
use crate::config::Config;
use crate::protocol::{self, WorkspaceReferencesParams};
use crate::transport::Client;
use crate::workspace::Workspace;

/// A decoded read-only query
#[derive(Debug, Clone)]
pub enum Query {
    Hover(HoverParams),
    Definition(GotoDefinitionParams),
    TypeDefinition(GotoDefinitionParams),
    XDefinition(TextDocumentPositionParams),
    Completion(CompletionParams),
    References(ReferenceParams),
    Implementation(GotoDefinitionParams),
    DocumentSymbol(DocumentSymbolParams),
    SignatureHelp(SignatureHelpParams),
    Formatting(DocumentFormattingParams),
    RangeFormatting(DocumentRangeFormattingParams),
    Rename(RenameParams),
    CodeAction(CodeActionParams),
    WorkspaceSymbol(WorkspaceSymbolParams),
    WorkspaceReferences(WorkspaceReferencesParams),
}

impl Query {
    pub fn method(&self) -> &'static str {
        match self {
            Query::Hover(_) => protocol::HOVER,
            Query::Definition(_) => protocol::DEFINITION,
            Query::TypeDefinition(_) => protocol::TYPE_DEFINITION,
            Query::XDefinition(_) => protocol::XDEFINITION,
            Query::Completion(_) => protocol::COMPLETION,
            Query::References(_) => protocol::REFERENCES,
            Query::Implementation(_) => protocol::IMPLEMENTATION,
            Query::DocumentSymbol(_) => protocol::DOCUMENT_SYMBOL,
            Query::SignatureHelp(_) => protocol::SIGNATURE_HELP,
            Query::Formatting(_) => protocol::FORMATTING,
            Query::RangeFormatting(_) => protocol::RANGE_FORMATTING,
            Query::Rename(_) => protocol::RENAME,
            Query::CodeAction(_) => protocol::CODE_ACTION,
            Query::WorkspaceSymbol(_) => protocol::WORKSPACE_SYMBOL,
            Query::WorkspaceReferences(_) => protocol::XREFERENCES,
        }
    }
}

/// A decoded document mutation
#[derive(Debug, Clone)]
pub enum DocumentEvent {
    Opened(DidOpenTextDocumentParams),
    Changed(DidChangeTextDocumentParams),
    Closed(DidCloseTextDocumentParams),
    Saved(DidSaveTextDocumentParams),
}

impl DocumentEvent {
    pub fn uri(&self) -> &Url {
        match self {
            DocumentEvent::Opened(p) => &p.text_document.uri,
            DocumentEvent::Changed(p) => &p.text_document.uri,
            DocumentEvent::Closed(p) => &p.text_document.uri,
            DocumentEvent::Saved(p) => &p.text_document.uri,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            DocumentEvent::Opened(_) => protocol::DID_OPEN,
            DocumentEvent::Changed(_) => protocol::DID_CHANGE,
            DocumentEvent::Closed(_) => protocol::DID_CLOSE,
            DocumentEvent::Saved(_) => protocol::DID_SAVE,
        }
    }
}

/// What a handler can reach while answering one message.
///
/// Dropping the context drops its request scope, which deregisters the
/// request from the cancellation registry.
pub struct QueryContext {
    pub scope: RequestScope,
    pub workspace: Arc<Workspace>,
    pub config: Arc<Config>,
    pub client: Client,
}

impl QueryContext {
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        self.scope.checkpoint()
    }

    /// Resolves a `file://` URI to the unit that owns it.
    pub async fn unit_for(&self, uri: &Url) -> anyhow::Result<Option<Arc<CompilationUnit>>> {
        let Some(path) = file_path(uri) else {
            return Ok(None);
        };
        self.workspace.unit_for_file(&path, &self.scope).await
    }
}

pub fn file_path(uri: &Url) -> Option<PathBuf> {
    if uri.scheme() != "file" {
        return None;
    }
    uri.to_file_path().ok()
}

/// Computes query answers. Semantics live behind this trait; the dispatcher
/// only schedules, supervises and encodes.
#[async_trait]
pub trait LanguageService: Send + Sync {
    /// Answers a read-only query. `Ok(Value::Null)` is a valid empty answer.
    async fn query(&self, ctx: &QueryContext, query: Query) -> anyhow::Result<Value>;

    /// Called inline, in receipt order, after the cache has dropped the unit
    /// owning the document.
    async fn document_changed(&self, _ctx: &QueryContext, _event: &DocumentEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn diagnostics(&self, _ctx: &QueryContext, _uri: &Url) -> anyhow::Result<Vec<Diagnostic>> {
        Ok(Vec::new())
    }
}

/// Answers the queries that need nothing beyond the unit graph.
#[derive(Debug, Default, Clone)]
pub struct GraphService;

impl GraphService {
    pub fn new() -> Self {
        Self
    }

    async fn workspace_symbol(
        &self,
        ctx: &QueryContext,
        params: &WorkspaceSymbolParams,
    ) -> anyhow::Result<Value> {
        let cache = ctx.workspace.searchable(&ctx.scope).await?;
        let needle = params.query.to_lowercase();
        let limit = ctx.config.workspace_symbol_limit;
        let mut symbols = Vec::new();

        let result = cache.walk(
            |unit| {
                ctx.checkpoint()?;
                if symbols.len() >= limit {
                    return Err(WalkStop::Full);
                }
                let matches = needle.is_empty()
                    || unit.name().to_lowercase().contains(&needle)
                    || unit.path().to_lowercase().contains(&needle);
                if matches {
                    if let Some(symbol) = unit_symbol(unit) {
                        symbols.push(symbol);
                    }
                }
                Ok(())
            },
            ctx.workspace.rank_prefixes(),
        );
        match result {
            Ok(()) | Err(WalkStop::Full) => {}
            Err(WalkStop::Cancelled(c)) => return Err(c.into()),
        }
        Ok(serde_json::to_value(symbols)?)
    }

    async fn hover(&self, ctx: &QueryContext, params: &HoverParams) -> anyhow::Result<Value> {
        let uri = &params.text_document_position_params.text_document.uri;
        let Some(unit) = ctx.unit_for(uri).await? else {
            return Ok(Value::Null);
        };
        ctx.checkpoint()?;

        let mut text = format!("unit `{}`\n\n{}", unit.name(), unit.path());
        let deps = ctx.workspace.cache().dependencies(&unit);
        if !deps.is_empty() {
            text.push_str("\n\nimports:");
            for dep in deps {
                text.push_str(&format!("\n- {}", dep.path()));
            }
        }
        let hover = Hover {
            contents: HoverContents::Markup(MarkupContent {
                kind: MarkupKind::Markdown,
                value: text,
            }),
            range: None,
        };
        Ok(serde_json::to_value(hover)?)
    }

    async fn document_symbol(
        &self,
        ctx: &QueryContext,
        params: &DocumentSymbolParams,
    ) -> anyhow::Result<Value> {
        let Some(unit) = ctx.unit_for(&params.text_document.uri).await? else {
            return Ok(Value::Null);
        };
        let symbols: Vec<_> = unit_symbol(&unit).into_iter().collect();
        Ok(serde_json::to_value(DocumentSymbolResponse::Flat(symbols))?)
    }
}

enum WalkStop {
    Full,
    Cancelled(Cancelled),
}

impl From<Cancelled> for WalkStop {
    fn from(c: Cancelled) -> Self {
        WalkStop::Cancelled(c)
    }
}

#[allow(deprecated)]
fn unit_symbol(unit: &CompilationUnit) -> Option<SymbolInformation> {
    let uri = Url::from_file_path(unit.primary_file()?).ok()?;
    Some(SymbolInformation {
        name: unit.name().to_string(),
        kind: SymbolKind::PACKAGE,
        tags: None,
        deprecated: None,
        location: Location {
            uri,
            range: Range::default(),
        },
        container_name: Some(unit.path().to_string()),
    })
}

#[async_trait]
impl LanguageService for GraphService {
    async fn query(&self, ctx: &QueryContext, query: Query) -> anyhow::Result<Value> {
        ctx.checkpoint()?;
        match &query {
            Query::WorkspaceSymbol(params) => self.workspace_symbol(ctx, params).await,
            Query::Hover(params) => self.hover(ctx, params).await,
            Query::DocumentSymbol(params) => self.document_symbol(ctx, params).await,
            other => {
                log::trace!("{} is not answered by the graph service", other.method());
                Ok(Value::Null)
            }
        }
    }
}
