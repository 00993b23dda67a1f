//
// transport.rs
//
// Content-Length framed JSON-RPC over an async byte stream
//

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tower_lsp::jsonrpc::{Error, Id, Request, Response};
use tower_lsp::lsp_types::notification::{Notification, PublishDiagnostics};
use tower_lsp::lsp_types::{Diagnostic, PublishDiagnosticsParams, Url};

use crate::dispatcher::{Dispatcher, Flow};
use crate::service::LanguageService;
use crate::session::Session;

/// A message the server writes to the client
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    Response(Response),
    Notification(Request),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response(Response),
    Request(Request),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("missing Content-Length header")]
    MissingLength,
    #[error("invalid Content-Length header: {0}")]
    InvalidLength(String),
}

/// Cloneable handle for sending messages to the client.
///
/// Sends never block; a writer task drains the queue in order.
#[derive(Debug, Clone)]
pub struct Client {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Client {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, message: Outgoing) {
        if self.tx.send(message).is_err() {
            log::debug!("Dropping outgoing message: connection closed");
        }
    }

    pub fn send_response(&self, response: Response) {
        self.send(Outgoing::Response(response));
    }

    pub fn send_notification<N: Notification>(&self, params: N::Params) {
        match serde_json::to_value(params) {
            Ok(params) => self.send(Outgoing::Notification(
                Request::build(N::METHOD).params(params).finish(),
            )),
            Err(e) => log::error!("Failed to encode {} params: {}", N::METHOD, e),
        }
    }

    pub fn publish_diagnostics(&self, uri: Url, diagnostics: Vec<Diagnostic>, version: Option<i32>) {
        self.send_notification::<PublishDiagnostics>(PublishDiagnosticsParams {
            uri,
            diagnostics,
            version,
        });
    }
}

/// Largest body `read_message` will allocate for.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Reads one framed message body. `Ok(None)` on a clean EOF.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<Result<usize, String>> = None;
    let mut saw_header = false;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let header = line.trim();
        if header.is_empty() {
            if !saw_header {
                // Tolerate stray blank lines between frames
                continue;
            }
            break;
        }
        saw_header = true;
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(value.parse().map_err(|_| value.to_string()));
            }
        }
    }

    let length = match content_length {
        Some(Ok(length)) if length > MAX_MESSAGE_BYTES => {
            return Err(FrameError::InvalidLength(format!(
                "{} exceeds the {} byte limit",
                length, MAX_MESSAGE_BYTES
            )))
        }
        Some(Ok(length)) => length,
        Some(Err(value)) => return Err(FrameError::InvalidLength(value)),
        None => return Err(FrameError::MissingLength),
    };
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_message<W>(writer: &mut W, message: &Outgoing) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(message)?;
    let frame = format!("Content-Length: {}\r\n\r\n{}", json.len(), json);
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await
}

async fn write_loop<W>(mut output: W, mut rx: mpsc::UnboundedReceiver<Outgoing>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        write_message(&mut output, &message).await?;
    }
    Ok(())
}

fn parse_error(message: impl std::fmt::Display) -> Response {
    let mut error = Error::parse_error();
    error.message = format!("{}: {}", error.message, message).into();
    Response::from_error(Id::Null, error)
}

/// Serves one connection until `exit` or EOF.
///
/// Returns once every queued response has been written.
pub async fn serve<I, O>(
    input: I,
    output: O,
    session: Arc<Session>,
    service: Arc<dyn LanguageService>,
) -> anyhow::Result<()>
where
    I: AsyncRead + Send + Unpin,
    O: AsyncWrite + Send + Unpin + 'static,
{
    let (client, rx) = Client::new();
    let writer = tokio::spawn(write_loop(output, rx));
    let dispatcher = Dispatcher::new(session.clone(), service, client.clone());
    let mut reader = BufReader::new(input);

    let result = loop {
        match read_message(&mut reader).await {
            Ok(None) => {
                log::info!("Client closed the connection");
                break Ok(());
            }
            Ok(Some(body)) => match serde_json::from_slice::<Incoming>(&body) {
                Ok(Incoming::Request(request)) => {
                    if dispatcher.handle(request).await == Flow::Exit {
                        break Ok(());
                    }
                }
                Ok(Incoming::Response(response)) => {
                    log::debug!("Ignoring client response for id {}", response.id());
                }
                Err(e) => {
                    log::warn!("Malformed message: {}", e);
                    client.send_response(parse_error(e));
                }
            },
            Err(FrameError::Io(e)) => break Err(e),
            Err(e) => {
                log::warn!("Malformed frame: {}", e);
                client.send_response(parse_error(e));
            }
        }
    };

    session.registry().cancel_all();
    drop(dispatcher);
    drop(client);
    writer.await??;
    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_read_frames() {
        let input = b"Content-Length: 2\r\n\r\n{}\r\ncontent-length: 4\r\nContent-Type: x\r\n\r\nnull";
        let mut reader = BufReader::new(&input[..]);
        assert_eq!(read_message(&mut reader).await.unwrap().unwrap(), b"{}");
        assert_eq!(read_message(&mut reader).await.unwrap().unwrap(), b"null");
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_length() {
        let input = b"Content-Type: x\r\n\r\n";
        let mut reader = BufReader::new(&input[..]);
        assert!(matches!(
            read_message(&mut reader).await,
            Err(FrameError::MissingLength)
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let input = b"Content-Length: 1000000000000\r\n\r\n{}";
        let mut reader = BufReader::new(&input[..]);
        assert!(matches!(
            read_message(&mut reader).await,
            Err(FrameError::InvalidLength(_))
        ));
    }

    #[tokio::test]
    async fn test_write_frame() {
        let mut out = Vec::new();
        let message = Outgoing::Response(Response::from_ok(Id::Number(1), json!(null)));
        write_message(&mut out, &message).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(header, format!("Content-Length: {}", body.len()));
        let value: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(value, json!({ "jsonrpc": "2.0", "id": 1, "result": null }));
    }

    #[tokio::test]
    async fn test_client_publishes_diagnostics() {
        let (client, mut rx) = Client::new();
        let uri = Url::parse("file:///ws/a.go").unwrap();
        client.publish_diagnostics(uri.clone(), Vec::new(), Some(3));
        match rx.recv().await.unwrap() {
            Outgoing::Notification(request) => {
                assert_eq!(request.method(), "textDocument/publishDiagnostics");
                assert!(request.id().is_none());
                assert_eq!(request.params().unwrap()["version"], json!(3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_incoming_discriminates_responses() {
        let response: Incoming =
            serde_json::from_value(json!({ "jsonrpc": "2.0", "id": 1, "result": 5 })).unwrap();
        assert!(matches!(response, Incoming::Response(_)));
        let request: Incoming = serde_json::from_value(
            json!({ "jsonrpc": "2.0", "id": 1, "method": "shutdown" }),
        )
        .unwrap();
        assert!(matches!(request, Incoming::Request(_)));
    }
}
