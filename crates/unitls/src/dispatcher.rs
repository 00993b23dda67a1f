//
// dispatcher.rs
//
// Routes inbound messages: lifecycle gating, scheduling, supervision
//

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tower_lsp::jsonrpc::{Id, Request, Response};
use tower_lsp::lsp_types::{InitializeParams, Url};

use crate::cancel::RequestScope;
use crate::config::{DiagnosticsStyle, DispatchMode};
use crate::error::DispatchError;
use crate::protocol::{self, MethodKind};
use crate::service::{self, DocumentEvent, LanguageService, Query, QueryContext};
use crate::session::{Session, World};
use crate::transport::Client;

/// Whether the receive loop keeps reading after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Dispatcher {
    session: Arc<Session>,
    service: Arc<dyn LanguageService>,
    client: Client,
    mode: DispatchMode,
}

impl Dispatcher {
    pub fn new(session: Arc<Session>, service: Arc<dyn LanguageService>, client: Client) -> Self {
        let mode = session.options().dispatch_mode;
        Self {
            session,
            service,
            client,
            mode,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Handles one inbound message.
    ///
    /// Lifecycle messages, document mutations and cancellations complete
    /// before this returns. Reads are spawned in concurrent mode, so their
    /// responses may arrive later and in any order.
    pub async fn handle(&self, request: Request) -> Flow {
        let (method, id, params) = request.into_parts();
        match id {
            Some(id) => self.handle_request(&method, id, params).await,
            None => self.handle_notification(&method, params).await,
        }
    }

    async fn handle_request(&self, method: &str, id: Id, params: Option<Value>) -> Flow {
        let scope = self.session.registry().register(id.clone());

        match method {
            protocol::INITIALIZE => {
                let result = self.initialize(params, scope).await;
                respond(&self.client, id, method, result);
                return Flow::Continue;
            }
            protocol::SHUTDOWN => {
                let result = self.session.shutdown().map(|()| Value::Null);
                respond(&self.client, id, method, result);
                return Flow::Continue;
            }
            protocol::EXIT => {
                self.session.exit();
                respond(&self.client, id, method, Ok(Value::Null));
                return Flow::Exit;
            }
            _ => {}
        }

        let world = match self.session.ready() {
            Ok(world) => world,
            Err(e) => {
                respond(&self.client, id, method, Err(e));
                return Flow::Continue;
            }
        };

        match protocol::classify(method) {
            MethodKind::Read => match protocol::decode_query(method, params) {
                Ok(query) => {
                    let ctx = self.context(world, scope);
                    let job = run_query(self.service.clone(), ctx, query, id);
                    self.schedule(job).await;
                }
                Err(e) => respond(&self.client, id, method, Err(e)),
            },
            MethodKind::Mutation => {
                let result = self
                    .apply_mutation(world, method, params, scope)
                    .await
                    .map(|()| Value::Null);
                respond(&self.client, id, method, result);
            }
            MethodKind::Cancel => {
                self.cancel(params);
                respond(&self.client, id, method, Ok(Value::Null));
            }
            MethodKind::Lifecycle => respond(&self.client, id, method, Ok(Value::Null)),
            MethodKind::Unknown => respond(
                &self.client,
                id,
                method,
                Err(DispatchError::MethodNotFound(method.to_string())),
            ),
        }
        Flow::Continue
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) -> Flow {
        match method {
            protocol::EXIT => {
                self.session.exit();
                return Flow::Exit;
            }
            protocol::INITIALIZED => {
                match self.session.ready() {
                    Ok(_) => log::info!("Client initialized"),
                    Err(e) => log::warn!("initialized: {}", e),
                }
                return Flow::Continue;
            }
            _ => {}
        }

        let kind = protocol::classify(method);
        if kind == MethodKind::Unknown && method.starts_with("$/") {
            return Flow::Continue;
        }
        let world = match self.session.ready() {
            Ok(world) => world,
            Err(e) => {
                log::warn!("Dropping {} notification: {}", method, e);
                return Flow::Continue;
            }
        };

        match kind {
            MethodKind::Cancel => self.cancel(params),
            MethodKind::Mutation => {
                if let Err(e) = self
                    .apply_mutation(world, method, params, RequestScope::detached())
                    .await
                {
                    log_failure(method, &e);
                }
            }
            MethodKind::Read | MethodKind::Lifecycle => {
                log::warn!("{} sent as a notification; ignoring", method);
            }
            MethodKind::Unknown => log::warn!("Ignoring unknown notification {}", method),
        }
        Flow::Continue
    }

    /// Builds the world, runs the eager workspace load under supervision,
    /// then publishes the world.
    ///
    /// This runs inline, so the receive loop waits for the eager load and a
    /// `$/cancelRequest` naming `initialize` is only read after it finishes.
    /// The scope is still honored by loaders that check it.
    async fn initialize(
        &self,
        params: Option<Value>,
        scope: RequestScope,
    ) -> Result<Value, DispatchError> {
        let params = protocol::decode::<InitializeParams>(params)?;
        let world = self.session.prepare(params)?;

        let workspace = world.workspace.clone();
        supervise(protocol::INITIALIZE, async move {
            let added = workspace.populate(&scope).await?;
            Ok(Value::from(added))
        })
        .await?;

        let result = self.session.commit(world)?;
        encode(protocol::INITIALIZE, result)
    }

    fn context(&self, world: &World, scope: RequestScope) -> QueryContext {
        QueryContext {
            scope,
            workspace: world.workspace.clone(),
            config: world.config.clone(),
            client: self.client.clone(),
        }
    }

    async fn schedule<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.mode {
            DispatchMode::Concurrent => {
                tokio::spawn(job);
            }
            DispatchMode::Serial => job.await,
        }
    }

    fn cancel(&self, params: Option<Value>) {
        let Some(id) = protocol::cancel_target(params) else {
            return;
        };
        if self.session.registry().cancel(&id) {
            log::debug!("Cancelled request {}", id);
        }
    }

    /// Applies a document mutation inline: the owning unit is evicted, the
    /// service is notified, and diagnostics are scheduled per the configured
    /// style.
    async fn apply_mutation(
        &self,
        world: &World,
        method: &str,
        params: Option<Value>,
        scope: RequestScope,
    ) -> Result<(), DispatchError> {
        let event = protocol::decode_event(method, params)?;
        if let Some(path) = service::file_path(event.uri()) {
            world.workspace.invalidate_file(&path);
        }

        let publish = should_publish(world.config.diagnostics_style, &event);
        let uri = event.uri().clone();
        let version = match &event {
            DocumentEvent::Opened(p) => Some(p.text_document.version),
            DocumentEvent::Changed(p) => Some(p.text_document.version),
            DocumentEvent::Closed(_) | DocumentEvent::Saved(_) => None,
        };

        let service = self.service.clone();
        let ctx = self.context(world, scope);
        supervise(event.method(), async move {
            service.document_changed(&ctx, &event).await?;
            Ok(Value::Null)
        })
        .await?;

        if publish {
            let ctx = self.context(world, RequestScope::detached());
            let job = publish_diagnostics(self.service.clone(), ctx, uri, version);
            self.schedule(job).await;
        }
        Ok(())
    }
}

fn should_publish(style: DiagnosticsStyle, event: &DocumentEvent) -> bool {
    match (style, event) {
        (DiagnosticsStyle::None, _) => false,
        (_, DocumentEvent::Opened(_)) => true,
        (DiagnosticsStyle::Instant, DocumentEvent::Changed(_)) => true,
        (DiagnosticsStyle::OnSave, DocumentEvent::Saved(_)) => true,
        _ => false,
    }
}

async fn run_query(service: Arc<dyn LanguageService>, ctx: QueryContext, query: Query, id: Id) {
    let method = query.method();
    let client = ctx.client.clone();
    let result = supervise(method, async move { service.query(&ctx, query).await }).await;
    respond(&client, id, method, result);
}

async fn publish_diagnostics(
    service: Arc<dyn LanguageService>,
    ctx: QueryContext,
    uri: Url,
    version: Option<i32>,
) {
    let result = supervise(protocol::PUBLISH_DIAGNOSTICS, async move {
        let diagnostics = service.diagnostics(&ctx, &uri).await?;
        ctx.checkpoint()?;
        ctx.client.publish_diagnostics(uri, diagnostics, version);
        Ok(Value::Null)
    })
    .await;
    if let Err(e) = result {
        log_failure(protocol::PUBLISH_DIAGNOSTICS, &e);
    }
}

/// Runs `work` in its own task so a panic is contained to this message.
async fn supervise<F>(method: &str, work: F) -> Result<Value, DispatchError>
where
    F: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DispatchError::from_handler(method, e)),
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            Err(DispatchError::internal(method, format!("panic: {}", message)))
        }
        Err(_) => Err(DispatchError::Cancelled),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn encode<T: serde::Serialize>(method: &str, value: T) -> Result<Value, DispatchError> {
    serde_json::to_value(value).map_err(|e| DispatchError::internal(method, e.to_string()))
}

fn log_failure(method: &str, err: &DispatchError) {
    match err {
        DispatchError::Cancelled => log::debug!("{} cancelled", method),
        DispatchError::Internal { .. } => log::error!("{}", err),
        _ => log::warn!("{} failed: {}", method, err),
    }
}

fn respond(client: &Client, id: Id, method: &str, result: Result<Value, DispatchError>) {
    let response = match result {
        Ok(value) => Response::from_ok(id, value),
        Err(e) => {
            log_failure(method, &e);
            Response::from_error(id, e.into())
        }
    };
    client.send_response(response);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::UnitGraph;
    use crate::config::ServerOptions;
    use crate::loader::{Loader, LoaderContext, LoaderFactory};
    use crate::session::Lifecycle;
    use crate::transport::Outgoing;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::Path;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tower_lsp::jsonrpc::ErrorCode;

    struct EmptyLoader;

    #[async_trait]
    impl Loader for EmptyLoader {
        async fn load_file(&self, _: &Path, _: &RequestScope) -> anyhow::Result<UnitGraph> {
            Ok(UnitGraph::new())
        }

        async fn load_workspace(&self, _: &RequestScope) -> anyhow::Result<UnitGraph> {
            Ok(UnitGraph::new())
        }
    }

    /// Records the order in which mutations arrive; panics on hover.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LanguageService for Recorder {
        async fn query(&self, _ctx: &QueryContext, query: Query) -> anyhow::Result<Value> {
            match query {
                Query::Hover(_) => panic!("hover exploded"),
                Query::WorkspaceSymbol(p) => Ok(json!(p.query)),
                _ => Ok(Value::Null),
            }
        }

        async fn document_changed(&self, _ctx: &QueryContext, event: &DocumentEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event.method().to_string());
            Ok(())
        }
    }

    struct PanickingLoader;

    #[async_trait]
    impl Loader for PanickingLoader {
        async fn load_file(&self, _: &Path, _: &RequestScope) -> anyhow::Result<UnitGraph> {
            Ok(UnitGraph::new())
        }

        async fn load_workspace(&self, _: &RequestScope) -> anyhow::Result<UnitGraph> {
            panic!("workspace scan exploded")
        }
    }

    fn dispatcher(mode: DispatchMode) -> (Dispatcher, Arc<Recorder>, UnboundedReceiver<Outgoing>) {
        let factory = |_: LoaderContext| -> Arc<dyn Loader> { Arc::new(EmptyLoader) };
        dispatcher_with(mode, Arc::new(factory))
    }

    fn dispatcher_with(
        mode: DispatchMode,
        loaders: Arc<dyn LoaderFactory>,
    ) -> (Dispatcher, Arc<Recorder>, UnboundedReceiver<Outgoing>) {
        let options = ServerOptions {
            dispatch_mode: mode,
            ..ServerOptions::default()
        };
        let session = Arc::new(Session::new(options, loaders));
        let recorder = Arc::new(Recorder::default());
        let (client, rx) = Client::new();
        (Dispatcher::new(session, recorder.clone(), client), recorder, rx)
    }

    fn request(id: i64, method: &'static str, params: Value) -> Request {
        Request::build(method).id(id).params(params).finish()
    }

    async fn response(rx: &mut UnboundedReceiver<Outgoing>) -> Response {
        loop {
            match rx.recv().await.unwrap() {
                Outgoing::Response(response) => return response,
                Outgoing::Notification(_) => continue,
            }
        }
    }

    async fn initialize(dispatcher: &Dispatcher, rx: &mut UnboundedReceiver<Outgoing>) {
        dispatcher.handle(request(0, "initialize", json!({ "capabilities": {} }))).await;
        assert!(response(rx).await.is_ok());
    }

    fn error_code(response: &Response) -> ErrorCode {
        response.error().map(|e| e.code).unwrap()
    }

    #[tokio::test]
    async fn test_gating_before_initialize() {
        let (dispatcher, _, mut rx) = dispatcher(DispatchMode::Serial);
        dispatcher
            .handle(request(1, "workspace/symbol", json!({ "query": "" })))
            .await;
        let resp = response(&mut rx).await;
        assert_eq!(error_code(&resp).code(), -32002);
        // Unknown methods are gated too
        dispatcher.handle(request(2, "foo/bar", json!({}))).await;
        assert_eq!(error_code(&response(&mut rx).await).code(), -32002);
    }

    #[tokio::test]
    async fn test_initialize_requires_params() {
        let (dispatcher, _, mut rx) = dispatcher(DispatchMode::Serial);
        dispatcher
            .handle(Request::build("initialize").id(1).finish())
            .await;
        assert_eq!(error_code(&response(&mut rx).await), ErrorCode::InvalidParams);
        assert!(dispatcher.session().world().is_none());
    }

    #[tokio::test]
    async fn test_eager_load_panic_fails_initialize() {
        let factory = |_: LoaderContext| -> Arc<dyn Loader> { Arc::new(PanickingLoader) };
        let (dispatcher, _, mut rx) = dispatcher_with(DispatchMode::Serial, Arc::new(factory));

        let params = json!({
            "capabilities": {},
            "initializationOptions": { "globalCacheStyle": "always" }
        });
        assert_eq!(dispatcher.handle(request(1, "initialize", params)).await, Flow::Continue);
        let resp = response(&mut rx).await;
        let error = resp.error().unwrap();
        assert_eq!(error.code, ErrorCode::InternalError);
        assert!(error.message.starts_with("initialize: panic"));
        assert_eq!(dispatcher.session().state(), Lifecycle::Uninitialized);
        assert!(dispatcher.session().registry().is_empty());

        // Without eager loading the retry succeeds
        dispatcher
            .handle(request(2, "initialize", json!({ "capabilities": {} })))
            .await;
        assert!(response(&mut rx).await.is_ok());
        assert_eq!(dispatcher.session().state(), Lifecycle::Initialized);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (dispatcher, _, mut rx) = dispatcher(DispatchMode::Serial);
        initialize(&dispatcher, &mut rx).await;
        dispatcher.handle(request(1, "foo/bar", json!({}))).await;
        let resp = response(&mut rx).await;
        let error = resp.error().unwrap();
        assert_eq!(error.code, ErrorCode::MethodNotFound);
        assert_eq!(error.message, "method not supported: foo/bar");
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let (dispatcher, _, mut rx) = dispatcher(DispatchMode::Concurrent);
        initialize(&dispatcher, &mut rx).await;

        let hover = json!({
            "textDocument": { "uri": "file:///ws/a.go" },
            "position": { "line": 0, "character": 0 }
        });
        dispatcher.handle(request(1, "textDocument/hover", hover)).await;
        let resp = response(&mut rx).await;
        let error = resp.error().unwrap();
        assert_eq!(error.code, ErrorCode::InternalError);
        assert!(error.message.contains("textDocument/hover"));

        dispatcher
            .handle(request(2, "workspace/symbol", json!({ "query": "x" })))
            .await;
        let resp = response(&mut rx).await;
        assert_eq!(resp.result(), Some(&json!("x")));
        assert!(dispatcher.session().registry().is_empty());
    }

    #[tokio::test]
    async fn test_mutations_apply_in_receipt_order() {
        let (dispatcher, recorder, mut rx) = dispatcher(DispatchMode::Concurrent);
        initialize(&dispatcher, &mut rx).await;

        let doc = json!({ "uri": "file:///ws/a.go", "languageId": "go", "version": 1, "text": "" });
        let notes = vec![
            Request::build("textDocument/didOpen")
                .params(json!({ "textDocument": doc }))
                .finish(),
            Request::build("textDocument/didChange")
                .params(json!({
                    "textDocument": { "uri": "file:///ws/a.go", "version": 2 },
                    "contentChanges": [{ "text": "package a" }]
                }))
                .finish(),
            Request::build("textDocument/didSave")
                .params(json!({ "textDocument": { "uri": "file:///ws/a.go" } }))
                .finish(),
            Request::build("textDocument/didClose")
                .params(json!({ "textDocument": { "uri": "file:///ws/a.go" } }))
                .finish(),
        ];
        for note in notes {
            assert_eq!(dispatcher.handle(note).await, Flow::Continue);
        }
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                "textDocument/didOpen",
                "textDocument/didChange",
                "textDocument/didSave",
                "textDocument/didClose"
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_noop() {
        let (dispatcher, _, mut rx) = dispatcher(DispatchMode::Serial);
        initialize(&dispatcher, &mut rx).await;
        let cancel = Request::build("$/cancelRequest")
            .params(json!({ "id": 99 }))
            .finish();
        assert_eq!(dispatcher.handle(cancel).await, Flow::Continue);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_then_exit() {
        let (dispatcher, _, mut rx) = dispatcher(DispatchMode::Serial);
        initialize(&dispatcher, &mut rx).await;

        dispatcher.handle(Request::build("shutdown").id(1).finish()).await;
        assert_eq!(response(&mut rx).await.result(), Some(&Value::Null));
        dispatcher.handle(Request::build("shutdown").id(2).finish()).await;
        assert_eq!(response(&mut rx).await.result(), Some(&Value::Null));

        dispatcher
            .handle(request(3, "workspace/symbol", json!({ "query": "" })))
            .await;
        assert_eq!(error_code(&response(&mut rx).await), ErrorCode::InvalidRequest);

        let flow = dispatcher.handle(Request::build("exit").finish()).await;
        assert_eq!(flow, Flow::Exit);
    }

    #[test]
    fn test_should_publish() {
        let saved = DocumentEvent::Saved(serde_json::from_value(
            json!({ "textDocument": { "uri": "file:///a.go" } }),
        ).unwrap());
        assert!(should_publish(DiagnosticsStyle::OnSave, &saved));
        assert!(!should_publish(DiagnosticsStyle::Instant, &saved));
        assert!(!should_publish(DiagnosticsStyle::None, &saved));
    }
}
