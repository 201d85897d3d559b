//! One running language server: handshake, document sync and requests.
//!
//! A [`ServerInstance`] is created by [`ServerInstance::start`], which owns
//! the initialize handshake. Once `Ready`, the instance forwards typed
//! requests and notifications, tracks open documents and caches responses
//! per document version. It never restarts itself; a dead instance is
//! replaced by the registry.

mod connection;
mod state;

use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lsp_types::notification::{
    DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument, Exit, Initialized,
    Notification,
};
use lsp_types::request::{
    Completion, GotoDefinition, HoverRequest, Initialize, References, Request, Shutdown,
};
use lsp_types::{
    ClientCapabilities, ClientInfo, CompletionClientCapabilities, CompletionParams,
    CompletionResponse, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DynamicRegistrationClientCapabilities, GotoCapability,
    GotoDefinitionParams, GotoDefinitionResponse, Hover, HoverClientCapabilities, HoverParams,
    InitializeParams, InitializeResult, InitializedParams, Location, MarkupKind,
    PartialResultParams, Position, PublishDiagnosticsClientCapabilities, ReferenceContext,
    ReferenceParams, ServerCapabilities, TextDocumentClientCapabilities,
    TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem,
    TextDocumentPositionParams, TextDocumentSyncClientCapabilities, Uri,
    VersionedTextDocumentIdentifier, WindowClientCapabilities, WorkDoneProgressParams,
    WorkspaceClientCapabilities, WorkspaceFolder,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use weft_config::{CapabilityMatrix, Config};

pub use self::state::LifecycleState;
use self::connection::{Connection, read_loop};
use crate::cache::{CacheKey, RequestKind, ResponseCache};
use crate::capability::{CapabilityKind, CapabilitySummary, DocumentSync, ServerCapabilitySet};
use crate::channel::{ChannelError, ProcessChannel};
use crate::coordinator::PendingEdit;
use crate::documents::{DocumentTable, EditorDocument};
use crate::errors::{HostOperation, LspHostError};
use crate::events::EventStream;
use crate::language::{Language, ServerKey};
use crate::protocol::{JsonRpcResponse, RequestId};
use crate::uri::path_to_uri;

/// Log target for instance operations.
pub(crate) const INSTANCE_TARGET: &str = "weft_lsp_host::instance";

const CLIENT_NAME: &str = "weft";

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique, monotonically increasing instance identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    fn next() -> Self {
        Self(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw identifier value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "#{}", self.0)
    }
}

/// Timeouts and sizes an instance is started with.
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    /// Budget for the `initialize` round trip.
    pub initialize_timeout: Duration,
    /// Budget for each ordinary request.
    pub request_timeout: Duration,
    /// Budget for each step of a graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Response cache capacity.
    pub cache_capacity: NonZeroUsize,
    /// Largest frame body accepted from the server.
    pub max_frame_bytes: usize,
    /// Capability overrides applied after negotiation.
    pub overrides: CapabilityMatrix,
}

impl InstanceOptions {
    /// Extracts instance options from the host configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            initialize_timeout: config.timings.initialize_timeout(),
            request_timeout: config.timings.request_timeout(),
            shutdown_timeout: config.timings.shutdown_timeout(),
            cache_capacity: config.limits.cache_capacity(),
            max_frame_bytes: config.limits.max_frame_bytes,
            overrides: config.capabilities.clone(),
        }
    }
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A handshaken language server bound to one [`ServerKey`].
pub struct ServerInstance {
    id: InstanceId,
    key: ServerKey,
    connection: Arc<Connection>,
    capabilities: ServerCapabilities,
    capability_set: ServerCapabilitySet,
    summary: CapabilitySummary,
    documents: DocumentTable,
    cache: ResponseCache,
    options: InstanceOptions,
}

impl fmt::Debug for ServerInstance {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ServerInstance")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl ServerInstance {
    /// Runs the initialize handshake over `channel` and returns the ready
    /// instance with the stream of server-initiated events.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LspHostError::SpawnFailure`] when the server exits, answers
    /// `initialize` with an error or does not answer in time. The channel is
    /// killed before returning.
    pub async fn start(
        key: ServerKey,
        channel: ProcessChannel,
        options: InstanceOptions,
    ) -> Result<(Arc<Self>, EventStream), LspHostError> {
        Self::start_shared(key, Arc::new(channel), options).await
    }

    /// As [`Self::start`], for callers that keep a handle on the channel so
    /// they can kill it while the handshake is in flight.
    pub(crate) async fn start_shared(
        key: ServerKey,
        channel: Arc<ProcessChannel>,
        options: InstanceOptions,
    ) -> Result<(Arc<Self>, EventStream), LspHostError> {
        let Some(output) = channel.take_output() else {
            channel.force_kill();
            return Err(LspHostError::spawn_failure(
                key.language().clone(),
                "channel output was already taken",
            ));
        };

        let connection = Arc::new(Connection::new(Arc::clone(&channel)));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(
            Arc::clone(&connection),
            output,
            events_tx,
            options.max_frame_bytes,
        ));

        debug!(
            target: INSTANCE_TARGET,
            key = %key,
            pid = ?channel.pid(),
            "starting language server handshake"
        );

        let capabilities = match handshake(&connection, &key, options.initialize_timeout).await {
            Ok(capabilities) => capabilities,
            Err(error) => {
                warn!(
                    target: INSTANCE_TARGET,
                    key = %key,
                    operation = %HostOperation::Initialise,
                    error = %error,
                    "language server handshake failed"
                );
                channel.force_kill();
                connection.state.terminate();
                return Err(LspHostError::spawn_failure(
                    key.language().clone(),
                    error.to_string(),
                ));
            }
        };

        let capability_set = ServerCapabilitySet::from_capabilities(&capabilities);
        let summary = CapabilitySummary::resolve(key.language(), capability_set, &options.overrides);
        let instance = Arc::new(Self {
            id: InstanceId::next(),
            key,
            connection,
            capabilities,
            capability_set,
            summary,
            documents: DocumentTable::new(),
            cache: ResponseCache::new(options.cache_capacity),
            options,
        });

        debug!(
            target: INSTANCE_TARGET,
            key = %instance.key,
            id = %instance.id,
            sync = ?instance.document_sync(),
            "language server ready"
        );
        Ok((instance, EventStream::new(events_rx)))
    }

    /// Sends a typed request and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns [`LspHostError::NotReady`] outside the `Ready` state,
    /// [`LspHostError::Timeout`] when the request budget elapses and
    /// [`LspHostError::Server`] when the server answers with an error.
    pub async fn request<R: Request>(&self, params: R::Params) -> Result<R::Result, LspHostError> {
        self.ensure_ready()?;
        let params = params_value(serde_json::to_value(params)?);
        let value = self
            .connection
            .call(R::METHOD, params, self.options.request_timeout)
            .await
            .inspect_err(|error| {
                debug!(
                    target: INSTANCE_TARGET,
                    method = R::METHOD,
                    operation = %HostOperation::Request,
                    error = %error,
                    "request failed"
                );
            })?;
        decode_result(R::METHOD, value)
    }

    /// Sends a typed notification.
    ///
    /// # Errors
    ///
    /// Returns [`LspHostError::NotReady`] outside the `Ready` state and
    /// [`LspHostError::Transport`] when the write fails.
    pub async fn notify<N: Notification>(&self, params: N::Params) -> Result<(), LspHostError> {
        self.ensure_ready()?;
        let params = params_value(serde_json::to_value(params)?);
        self.connection.notify(N::METHOD, params).await
    }

    /// Tracks `document` at version 0 and sends `didOpen`.
    ///
    /// Returns `false` without sending anything when the document is already
    /// open on this instance.
    ///
    /// # Errors
    ///
    /// Fails when the instance is not ready or the notification cannot be
    /// written; the document is left untracked in that case.
    pub async fn open_document(
        &self,
        document: &Arc<dyn EditorDocument>,
    ) -> Result<bool, LspHostError> {
        self.ensure_ready()?;
        if !self.documents.track(document) {
            trace!(target: INSTANCE_TARGET, uri = document.uri().as_str(), "document already open");
            return Ok(false);
        }

        let uri = document.uri();
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem::new(
                uri.clone(),
                document.language_id(),
                0,
                document.text(),
            ),
        };
        if let Err(error) = self.notify::<DidOpenTextDocument>(params).await {
            debug!(
                target: INSTANCE_TARGET,
                uri = uri.as_str(),
                operation = %HostOperation::DidOpen,
                error = %error,
                "untracking document after failed open"
            );
            self.documents.untrack(&uri);
            return Err(error);
        }
        debug!(target: INSTANCE_TARGET, key = %self.key, uri = uri.as_str(), "document opened");
        Ok(true)
    }

    /// Untracks the document, drops its cached responses and sends
    /// `didClose`. Closing an untracked document does nothing.
    ///
    /// # Errors
    ///
    /// Fails when the notification cannot be sent.
    pub async fn close_document(&self, uri: &Uri) -> Result<(), LspHostError> {
        if !self.documents.untrack(uri) {
            return Ok(());
        }
        self.cache.invalidate_document(uri);
        self.notify::<DidCloseTextDocument>(DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier::new(uri.clone()),
        })
        .await?;
        debug!(target: INSTANCE_TARGET, key = %self.key, uri = uri.as_str(), "document closed");
        Ok(())
    }

    /// Sends one `didChange` carrying `edits` in order as `version`.
    ///
    /// Incremental servers receive the ranges, full-sync servers receive the
    /// document's current text, and servers without sync receive nothing.
    /// Responses are cached against `version` only once it has been written.
    ///
    /// # Errors
    ///
    /// Fails when the instance is not ready or the write fails.
    pub async fn apply_document_changes(
        &self,
        uri: &Uri,
        version: i32,
        edits: Vec<PendingEdit>,
    ) -> Result<(), LspHostError> {
        if edits.is_empty() {
            return Ok(());
        }
        self.ensure_ready()?;
        self.cache.invalidate_document(uri);

        let content_changes = match self.document_sync() {
            DocumentSync::None => {
                trace!(target: INSTANCE_TARGET, uri = uri.as_str(), "server does not sync documents");
                self.documents.mark_synced(uri, version);
                return Ok(());
            }
            DocumentSync::Incremental => edits
                .into_iter()
                .map(|edit| TextDocumentContentChangeEvent {
                    range: Some(edit.range),
                    range_length: None,
                    text: edit.text,
                })
                .collect(),
            DocumentSync::Full => {
                let Some(document) = self.documents.document(uri) else {
                    debug!(target: INSTANCE_TARGET, uri = uri.as_str(), "document handle is gone");
                    return Ok(());
                };
                vec![TextDocumentContentChangeEvent {
                    range: None,
                    range_length: None,
                    text: document.text(),
                }]
            }
        };

        trace!(
            target: INSTANCE_TARGET,
            uri = uri.as_str(),
            version,
            changes = content_changes.len(),
            "sending document changes"
        );
        self.notify::<DidChangeTextDocument>(DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier::new(uri.clone(), version),
            content_changes,
        })
        .await?;
        self.documents.mark_synced(uri, version);
        Ok(())
    }

    /// Hover information at `position`, served from the cache when the
    /// document has not changed since the last identical request.
    ///
    /// # Errors
    ///
    /// Returns [`LspHostError::CapabilityUnavailable`] when hover is
    /// disabled, otherwise as [`Self::request`].
    pub async fn hover(&self, uri: &Uri, position: Position) -> Result<Option<Hover>, LspHostError> {
        self.require(CapabilityKind::Hover)?;
        let params = HoverParams {
            text_document_position_params: position_params(uri, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.cached::<HoverRequest>(CacheKey::at_position(uri.clone(), RequestKind::Hover, position), params)
            .await
    }

    /// Completion items at `position`, cached like [`Self::hover`].
    ///
    /// # Errors
    ///
    /// As [`Self::hover`].
    pub async fn completion(
        &self,
        uri: &Uri,
        position: Position,
    ) -> Result<Option<CompletionResponse>, LspHostError> {
        self.require(CapabilityKind::Completion)?;
        let params = CompletionParams {
            text_document_position: position_params(uri, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: None,
        };
        self.cached::<Completion>(
            CacheKey::at_position(uri.clone(), RequestKind::Completion, position),
            params,
        )
        .await
    }

    /// Definition of the symbol at `position`.
    ///
    /// # Errors
    ///
    /// As [`Self::hover`].
    pub async fn goto_definition(
        &self,
        uri: &Uri,
        position: Position,
    ) -> Result<Option<GotoDefinitionResponse>, LspHostError> {
        self.require(CapabilityKind::Definition)?;
        self.request::<GotoDefinition>(GotoDefinitionParams {
            text_document_position_params: position_params(uri, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        })
        .await
    }

    /// References to the symbol at `position`.
    ///
    /// # Errors
    ///
    /// As [`Self::hover`].
    pub async fn references(
        &self,
        uri: &Uri,
        position: Position,
        include_declaration: bool,
    ) -> Result<Option<Vec<Location>>, LspHostError> {
        self.require(CapabilityKind::References)?;
        self.request::<References>(ReferenceParams {
            text_document_position: position_params(uri, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: ReferenceContext {
                include_declaration,
            },
        })
        .await
    }

    /// Graceful shutdown: `shutdown`, `exit`, then wait for the process.
    ///
    /// Each step is bounded by the shutdown timeout. Shutting down a
    /// terminated instance succeeds immediately.
    ///
    /// # Errors
    ///
    /// Returns [`LspHostError::Timeout`] when a step overruns; the caller
    /// decides whether to [`Self::force_kill`].
    pub async fn shutdown(&self) -> Result<(), LspHostError> {
        let state = self.state();
        if state == LifecycleState::Terminated {
            return Ok(());
        }
        if !self
            .connection
            .state
            .transition(LifecycleState::Ready, LifecycleState::ShuttingDown)
        {
            return Err(LspHostError::not_ready(self.state()));
        }

        let timeout = self.options.shutdown_timeout;
        debug!(target: INSTANCE_TARGET, key = %self.key, id = %self.id, "shutting down language server");
        self.connection.call(Shutdown::METHOD, None, timeout).await?;
        self.connection.notify(Exit::METHOD, None).await?;
        self.connection.channel.close_input().await;

        let termination = tokio::time::timeout(timeout, self.connection.channel.terminated())
            .await
            .map_err(|_| LspHostError::timeout(Exit::METHOD, timeout))?;
        self.connection.state.terminate();
        debug!(
            target: INSTANCE_TARGET,
            key = %self.key,
            termination = %termination,
            "language server stopped"
        );
        Ok(())
    }

    /// Kills the process without ceremony and marks the instance terminated.
    pub fn force_kill(&self) {
        debug!(target: INSTANCE_TARGET, key = %self.key, pid = ?self.pid(), "force killing language server");
        self.connection.channel.force_kill();
        self.connection.state.terminate();
    }

    /// Answers a server-initiated request.
    ///
    /// # Errors
    ///
    /// Fails when the reply cannot be written.
    pub async fn reply(&self, id: RequestId, result: Value) -> Result<(), LspHostError> {
        self.connection
            .respond(&JsonRpcResponse::success(id, result))
            .await
    }

    /// Rejects a server-initiated request.
    ///
    /// # Errors
    ///
    /// Fails when the reply cannot be written.
    pub async fn reply_error(
        &self,
        id: RequestId,
        code: i64,
        message: impl Into<String>,
    ) -> Result<(), LspHostError> {
        self.connection
            .respond(&JsonRpcResponse::failure(id, code, message))
            .await
    }

    /// Unique identifier of this instance.
    #[must_use]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Key the instance serves.
    #[must_use]
    pub fn key(&self) -> &ServerKey {
        &self.key
    }

    /// Language the instance serves.
    #[must_use]
    pub fn language(&self) -> &Language {
        self.key.language()
    }

    /// Project root the instance serves.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.key.root()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.connection.state.load()
    }

    /// OS process id, absent for in-memory channels.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.connection.channel.pid()
    }

    /// Capabilities the server advertised during the handshake.
    #[must_use]
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    /// Capabilities after applying configured overrides.
    #[must_use]
    pub fn capability_summary(&self) -> &CapabilitySummary {
        &self.summary
    }

    /// Negotiated document sync kind.
    #[must_use]
    pub fn document_sync(&self) -> DocumentSync {
        self.capability_set.document_sync()
    }

    /// Documents open on this instance.
    #[must_use]
    pub fn documents(&self) -> &DocumentTable {
        &self.documents
    }

    /// Response cache of this instance.
    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Options the instance was started with.
    #[must_use]
    pub fn options(&self) -> &InstanceOptions {
        &self.options
    }

    /// Whether the instance can still serve requests.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state() != LifecycleState::Terminated && !self.connection.channel.is_terminated()
    }

    fn ensure_ready(&self) -> Result<(), LspHostError> {
        match self.state() {
            LifecycleState::Ready if self.connection.channel.is_terminated() => {
                Err(LspHostError::from(ChannelError::Closed))
            }
            LifecycleState::Ready => Ok(()),
            state => Err(LspHostError::not_ready(state)),
        }
    }

    fn require(&self, capability: CapabilityKind) -> Result<(), LspHostError> {
        let state = self.summary.state(capability);
        if state.enabled {
            Ok(())
        } else {
            Err(LspHostError::capability_unavailable(
                self.language().clone(),
                capability,
                state.source,
            ))
        }
    }

    async fn cached<R>(&self, key: CacheKey, params: R::Params) -> Result<R::Result, LspHostError>
    where
        R: Request,
        R::Result: Clone,
    {
        // Only a version the server has already received is safe to cache
        // against, and only if no newer one was allocated meanwhile.
        let version = self.documents.settled_version(key.uri());
        if let Some(hit) = version.and_then(|version| self.cache.get::<R::Result>(&key, version)) {
            trace!(target: INSTANCE_TARGET, method = R::METHOD, "response cache hit");
            return Ok(hit);
        }

        let result = self.request::<R>(params).await?;
        if let Some(version) = version
            && self.documents.settled_version(key.uri()) == Some(version)
        {
            self.cache.set(key, version, result.clone());
        }
        Ok(result)
    }
}

async fn handshake(
    connection: &Connection,
    key: &ServerKey,
    timeout: Duration,
) -> Result<ServerCapabilities, LspHostError> {
    if !connection
        .state
        .transition(LifecycleState::Uninitialized, LifecycleState::Initializing)
    {
        return Err(LspHostError::not_ready(connection.state.load()));
    }

    let root = path_to_uri(key.root())?;
    let params = InitializeParams {
        process_id: Some(std::process::id()),
        capabilities: client_capabilities(),
        workspace_folders: Some(vec![WorkspaceFolder {
            uri: root,
            name: key.root().display().to_string(),
        }]),
        client_info: Some(ClientInfo {
            name: String::from(CLIENT_NAME),
            version: Some(String::from(env!("CARGO_PKG_VERSION"))),
        }),
        ..InitializeParams::default()
    };

    let value = connection
        .call(Initialize::METHOD, Some(serde_json::to_value(params)?), timeout)
        .await?;
    let result: InitializeResult = decode_result(Initialize::METHOD, value)?;

    connection
        .notify(
            Initialized::METHOD,
            Some(serde_json::to_value(InitializedParams {})?),
        )
        .await?;

    if connection
        .state
        .transition(LifecycleState::Initializing, LifecycleState::Ready)
    {
        Ok(result.capabilities)
    } else {
        Err(LspHostError::from(ChannelError::Closed))
    }
}

fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            apply_edit: Some(true),
            configuration: Some(true),
            workspace_folders: Some(true),
            ..WorkspaceClientCapabilities::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                dynamic_registration: Some(false),
                ..TextDocumentSyncClientCapabilities::default()
            }),
            hover: Some(HoverClientCapabilities {
                dynamic_registration: Some(false),
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
            }),
            completion: Some(CompletionClientCapabilities::default()),
            definition: Some(GotoCapability {
                dynamic_registration: Some(false),
                link_support: Some(true),
            }),
            references: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(false),
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
                version_support: Some(true),
                ..PublishDiagnosticsClientCapabilities::default()
            }),
            ..TextDocumentClientCapabilities::default()
        }),
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            ..WindowClientCapabilities::default()
        }),
        ..ClientCapabilities::default()
    }
}

fn position_params(uri: &Uri, position: Position) -> TextDocumentPositionParams {
    TextDocumentPositionParams::new(TextDocumentIdentifier::new(uri.clone()), position)
}

fn decode_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, LspHostError> {
    serde_json::from_value(value)
        .map_err(|error| LspHostError::protocol(format!("unexpected {method} result: {error}")))
}

fn params_value(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        other => Some(other),
    }
}
