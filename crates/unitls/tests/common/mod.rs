// common/mod.rs - Shared harness for the integration tests: a server task
// serving one end of an in-memory duplex pipe.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tower_lsp::lsp_types::{TextDocumentContentChangeEvent, Url};

use unitls::config::ServerOptions;
use unitls::loader::LoaderFactory;
use unitls::service::{DocumentEvent, LanguageService, Query, QueryContext};
use unitls::transport::{self, read_message};
use unitls::Session;

pub struct Harness {
    writer: WriteHalf<DuplexStream>,
    reader: BufReader<ReadHalf<DuplexStream>>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    pub fn start(
        options: ServerOptions,
        loaders: Arc<dyn LoaderFactory>,
        service: Arc<dyn LanguageService>,
    ) -> Self {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (server_in, server_out) = tokio::io::split(server);
        let (client_in, client_out) = tokio::io::split(client);
        let session = Arc::new(Session::new(options, loaders));
        let server = tokio::spawn(transport::serve(server_in, server_out, session, service));
        Self {
            writer: client_out,
            reader: BufReader::new(client_in),
            server,
        }
    }

    pub async fn send_raw(&mut self, body: &str) {
        let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        self.send_bytes(frame.as_bytes()).await;
    }

    /// Writes bytes to the server unframed.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    pub async fn request(&mut self, id: i64, method: &str, params: Value) {
        let message = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        self.send_raw(&message.to_string()).await;
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        let message = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.send_raw(&message.to_string()).await;
    }

    pub async fn recv(&mut self) -> Value {
        let body = read_message(&mut self.reader).await.unwrap().unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    /// Next response, skipping server notifications.
    pub async fn response(&mut self) -> Value {
        loop {
            let message = self.recv().await;
            if message.get("method").is_none() {
                return message;
            }
        }
    }

    pub async fn initialize(&mut self, options: Value) -> Value {
        self.request(0, "initialize", json!({ "capabilities": {}, "initializationOptions": options }))
            .await;
        let response = self.response().await;
        assert!(response.get("error").is_none(), "initialize failed: {}", response);
        self.notify("initialized", json!({})).await;
        response
    }

    /// Closes the client end without sending `exit`.
    pub async fn hang_up(self) -> anyhow::Result<()> {
        let Harness {
            writer,
            reader,
            server,
        } = self;
        drop(writer);
        drop(reader);
        server.await.unwrap()
    }

    /// Sends `exit` and waits for the server loop to finish.
    pub async fn exit(mut self) -> anyhow::Result<()> {
        self.notify("exit", Value::Null).await;
        self.server.await.unwrap()
    }
}

pub fn error_code(response: &Value) -> i64 {
    response["error"]["code"].as_i64().unwrap()
}

/// Test service: keeps an overlay of open documents and exposes a few
/// controllable behaviors through `workspace/symbol` queries.
#[derive(Default)]
pub struct ScriptedService {
    overlay: Mutex<HashMap<Url, String>>,
    pub gate: Arc<Notify>,
}

#[async_trait]
impl LanguageService for ScriptedService {
    async fn query(&self, ctx: &QueryContext, query: Query) -> anyhow::Result<Value> {
        match query {
            Query::Hover(p) => {
                let uri = p.text_document_position_params.text_document.uri;
                let text = self.overlay.lock().unwrap().get(&uri).cloned();
                Ok(json!(text))
            }
            Query::Definition(_) => panic!("definition exploded"),
            Query::WorkspaceSymbol(p) => match p.query.as_str() {
                "block" => {
                    ctx.scope.token().cancelled().await;
                    ctx.checkpoint()?;
                    Ok(Value::Null)
                }
                "slow" => {
                    self.gate.notified().await;
                    Ok(json!("slow"))
                }
                "nap" => {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(json!("nap"))
                }
                other => Ok(json!(other)),
            },
            _ => Ok(Value::Null),
        }
    }

    async fn document_changed(&self, _ctx: &QueryContext, event: &DocumentEvent) -> anyhow::Result<()> {
        let mut overlay = self.overlay.lock().unwrap();
        match event {
            DocumentEvent::Opened(p) => {
                overlay.insert(p.text_document.uri.clone(), p.text_document.text.clone());
            }
            DocumentEvent::Changed(p) => {
                if let Some(TextDocumentContentChangeEvent { text, .. }) = p.content_changes.last() {
                    overlay.insert(p.text_document.uri.clone(), text.clone());
                }
            }
            DocumentEvent::Closed(p) => {
                overlay.remove(&p.text_document.uri);
            }
            DocumentEvent::Saved(_) => {}
        }
        Ok(())
    }
}
