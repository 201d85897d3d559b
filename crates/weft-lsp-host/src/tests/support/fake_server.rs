//! In-memory language server speaking the wire protocol over a duplex pipe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use lsp_types::{
    CompletionOptions, Diagnostic, HoverProviderCapability, OneOf, Range, ServerCapabilities,
    TextDocumentSyncCapability, TextDocumentSyncKind, Uri,
};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};

use super::{apply_change, eventually};
use crate::channel::{ProcessChannel, Termination};
use crate::protocol::{FrameDecoder, INTERNAL_ERROR, encode_frame};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Scripted behaviour of a [`FakeServer`].
#[derive(Debug, Clone)]
pub struct FakeServerScript {
    /// Capabilities returned from `initialize`.
    pub capabilities: ServerCapabilities,
    /// Answer `initialize` with an error.
    pub fail_initialize: bool,
    /// Never answer the listed request methods.
    pub silent_methods: Vec<String>,
    /// Fixed results for the listed request methods.
    pub canned: Vec<(String, Value)>,
}

impl Default for FakeServerScript {
    fn default() -> Self {
        Self {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::INCREMENTAL,
                )),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                completion_provider: Some(CompletionOptions::default()),
                definition_provider: Some(OneOf::Left(true)),
                references_provider: Some(OneOf::Left(true)),
                ..ServerCapabilities::default()
            },
            fail_initialize: false,
            silent_methods: Vec::new(),
            canned: Vec::new(),
        }
    }
}

impl FakeServerScript {
    /// Advertises `kind` as the document sync mode.
    pub fn with_sync(mut self, kind: TextDocumentSyncKind) -> Self {
        self.capabilities.text_document_sync = Some(TextDocumentSyncCapability::Kind(kind));
        self
    }

    /// Advertises no references support.
    pub fn without_references(mut self) -> Self {
        self.capabilities.references_provider = None;
        self
    }

    /// Rejects `initialize`.
    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Never answers `method`.
    pub fn silent(mut self, method: &str) -> Self {
        self.silent_methods.push(String::from(method));
        self
    }

    /// Answers `method` with `result`.
    pub fn answering(mut self, method: &str, result: Value) -> Self {
        self.canned.push((String::from(method), result));
        self
    }

    /// Never answers `shutdown`.
    pub fn hanging_on_shutdown(self) -> Self {
        self.silent("shutdown")
    }
}

enum Outbound {
    Message(Value),
    Raw(Vec<u8>),
    Crash,
}

#[derive(Default)]
struct Recorded {
    received: Vec<Value>,
    documents: HashMap<String, String>,
    hovers: u32,
}

/// Handle to a running fake server.
#[derive(Clone)]
pub struct FakeServer {
    recorded: Arc<Mutex<Recorded>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    termination: watch::Receiver<Option<Termination>>,
}

impl FakeServer {
    /// Starts a fake server and returns the client end of its channel.
    pub fn start(script: FakeServerScript) -> (ProcessChannel, Self) {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let (client_reader, client_writer) = tokio::io::split(client);
        let (server_reader, server_writer) = tokio::io::split(server);
        let channel = ProcessChannel::from_streams(None, client_reader, client_writer);

        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let (outbound, commands) = mpsc::unbounded_channel();
        tokio::spawn(serve(
            script,
            Arc::clone(&recorded),
            server_reader,
            server_writer,
            commands,
        ));

        let handle = Self {
            recorded,
            outbound,
            termination: channel.termination(),
        };
        (channel, handle)
    }

    /// Every message the server received, in order.
    pub fn received(&self) -> Vec<Value> {
        self.lock().received.clone()
    }

    /// Methods of every request and notification received, in order.
    pub fn methods(&self) -> Vec<String> {
        self.lock()
            .received
            .iter()
            .filter_map(|message| message.get("method").and_then(Value::as_str))
            .map(String::from)
            .collect()
    }

    /// Parameters of every message received for `method`.
    pub fn params_of(&self, method: &str) -> Vec<Value> {
        self.lock()
            .received
            .iter()
            .filter(|message| message.get("method").and_then(Value::as_str) == Some(method))
            .map(|message| message.get("params").cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Number of messages received for `method`.
    pub fn count(&self, method: &str) -> usize {
        self.params_of(method).len()
    }

    /// Replies the client sent to server-initiated requests.
    pub fn responses(&self) -> Vec<Value> {
        self.lock()
            .received
            .iter()
            .filter(|message| message.get("method").is_none())
            .cloned()
            .collect()
    }

    /// Number of hover requests answered.
    pub fn hovers(&self) -> u32 {
        self.lock().hovers
    }

    /// The server's mirror of a document, rebuilt from the sync
    /// notifications it received.
    pub fn document_text(&self, uri: &Uri) -> Option<String> {
        self.lock().documents.get(uri.as_str()).cloned()
    }

    /// Whether the client side of the channel has terminated.
    pub fn channel_terminated(&self) -> bool {
        self.termination.borrow().is_some()
    }

    /// Waits until at least `count` messages for `method` arrived.
    pub async fn wait_for(&self, method: &str, count: usize) -> bool {
        eventually(|| self.count(method) >= count).await
    }

    /// Waits until the client has answered `count` server requests.
    pub async fn wait_for_responses(&self, count: usize) -> bool {
        eventually(|| self.responses().len() >= count).await
    }

    /// Pushes `textDocument/publishDiagnostics`.
    pub fn publish_diagnostics(&self, uri: &Uri, version: Option<i32>, diagnostics: &[Diagnostic]) {
        self.send(Outbound::Message(json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": uri.as_str(),
                "version": version,
                "diagnostics": diagnostics,
            },
        })));
    }

    /// Sends a server-initiated request.
    pub fn request(&self, id: i64, method: &str, params: Value) {
        self.send(Outbound::Message(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })));
    }

    /// Sends a notification.
    pub fn notify(&self, method: &str, params: Value) {
        self.send(Outbound::Message(json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        })));
    }

    /// Sends a well-framed payload that is not JSON.
    pub fn send_garbage(&self) {
        self.send(Outbound::Raw(encode_frame(b"{not json")));
    }

    /// Writes `bytes` to the client unframed.
    pub fn send_raw(&self, bytes: &[u8]) {
        self.send(Outbound::Raw(bytes.to_vec()));
    }

    /// Drops both pipe ends as if the process died.
    pub fn crash(&self) {
        self.send(Outbound::Crash);
    }

    fn send(&self, outbound: Outbound) {
        self.outbound
            .send(outbound)
            .unwrap_or_else(|_| panic!("fake server task has stopped"));
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().expect("fake server lock poisoned")
    }
}

async fn serve(
    script: FakeServerScript,
    recorded: Arc<Mutex<Recorded>>,
    mut reader: ReadHalf<DuplexStream>,
    mut writer: WriteHalf<DuplexStream>,
    mut commands: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buffer = vec![0_u8; 8 * 1024];
    loop {
        tokio::select! {
            read = reader.read(&mut buffer) => {
                let count = match read {
                    Ok(0) | Err(_) => return,
                    Ok(count) => count,
                };
                decoder.push(&buffer[..count]);
                while let Ok(Some(frame)) = decoder.next_frame() {
                    let message: Value =
                        serde_json::from_slice(&frame).expect("client sent invalid JSON");
                    let exit = message.get("method").and_then(Value::as_str) == Some("exit");
                    let reply = handle(&script, &recorded, message);
                    if let Some(reply) = reply
                        && write_message(&mut writer, &reply).await.is_err()
                    {
                        return;
                    }
                    if exit {
                        return;
                    }
                }
            }
            Some(command) = commands.recv() => {
                let written = match command {
                    Outbound::Message(message) => write_message(&mut writer, &message).await,
                    Outbound::Raw(bytes) => writer.write_all(&bytes).await,
                    Outbound::Crash => return,
                };
                if written.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_message(writer: &mut WriteHalf<DuplexStream>, message: &Value) -> std::io::Result<()> {
    let payload = serde_json::to_vec(message).expect("serialisable message");
    writer.write_all(&encode_frame(&payload)).await
}

fn handle(script: &FakeServerScript, recorded: &Mutex<Recorded>, message: Value) -> Option<Value> {
    let mut recorded = recorded.lock().expect("fake server lock poisoned");
    recorded.received.push(message.clone());

    let method = message.get("method").and_then(Value::as_str)?;
    let params = message.get("params").cloned().unwrap_or(Value::Null);
    let Some(id) = message.get("id").cloned() else {
        track_document(&mut recorded, method, &params);
        return None;
    };

    if script.silent_methods.iter().any(|silent| silent == method) {
        return None;
    }
    let canned = script
        .canned
        .iter()
        .find(|(name, _)| name == method)
        .map(|(_, result)| result.clone());
    if let Some(result) = canned {
        return Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }));
    }
    let result = match method {
        "initialize" if script.fail_initialize => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": INTERNAL_ERROR, "message": "initialize refused" },
            }));
        }
        "initialize" => json!({
            "capabilities": script.capabilities,
            "serverInfo": { "name": "fake" },
        }),
        "textDocument/hover" => {
            recorded.hovers += 1;
            json!({ "contents": { "kind": "plaintext", "value": format!("hover {}", recorded.hovers) } })
        }
        "textDocument/completion" | "textDocument/references" => json!([]),
        _ => Value::Null,
    };
    Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

fn track_document(recorded: &mut Recorded, method: &str, params: &Value) {
    let uri = params
        .pointer("/textDocument/uri")
        .and_then(Value::as_str)
        .map(String::from);
    let Some(uri) = uri else {
        return;
    };
    match method {
        "textDocument/didOpen" => {
            let text = params
                .pointer("/textDocument/text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            recorded.documents.insert(uri, String::from(text));
        }
        "textDocument/didChange" => {
            let changes = params
                .get("contentChanges")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let text = recorded.documents.entry(uri).or_default();
            for change in changes {
                let replacement = change.get("text").and_then(Value::as_str).unwrap_or_default();
                match change.get("range") {
                    Some(range) => {
                        let range: Range =
                            serde_json::from_value(range.clone()).expect("valid range");
                        apply_change(text, range, replacement);
                    }
                    None => *text = String::from(replacement),
                }
            }
        }
        "textDocument/didClose" => {
            recorded.documents.remove(&uri);
        }
        _ => {}
    }
}
