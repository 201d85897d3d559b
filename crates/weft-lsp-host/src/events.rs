//! Messages a server sends on its own initiative, and the host-facing sink
//! that receives their effects.

use lsp_types::notification::{self as lsp_notification, Notification};
use lsp_types::request::{self as lsp_request, Request};
use lsp_types::{
    ApplyWorkspaceEditParams, ConfigurationParams, Diagnostic, LogMessageParams, ProgressParams,
    PublishDiagnosticsParams, RegistrationParams, ShowMessageParams, UnregistrationParams, Uri,
    WorkDoneProgressCreateParams, WorkspaceEdit,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::language::Language;
use crate::protocol::RequestId;

/// Notification pushed by a server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotification {
    /// `textDocument/publishDiagnostics`.
    PublishDiagnostics(PublishDiagnosticsParams),
    /// `window/logMessage`.
    LogMessage(LogMessageParams),
    /// `window/showMessage`.
    ShowMessage(ShowMessageParams),
    /// `$/progress`.
    Progress(ProgressParams),
    /// Anything the host does not interpret.
    Unknown {
        /// Method name.
        method: String,
        /// Raw parameters.
        params: Option<Value>,
    },
}

/// Request sent by a server that expects a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerRequest {
    /// `workspace/applyEdit`.
    ApplyWorkspaceEdit(ApplyWorkspaceEditParams),
    /// `workspace/configuration`.
    WorkspaceConfiguration(ConfigurationParams),
    /// `window/workDoneProgress/create`.
    WorkDoneProgressCreate(WorkDoneProgressCreateParams),
    /// `client/registerCapability`.
    RegisterCapability(RegistrationParams),
    /// `client/unregisterCapability`.
    UnregisterCapability(UnregistrationParams),
    /// Anything the host does not interpret.
    Unknown {
        /// Method name.
        method: String,
        /// Raw parameters.
        params: Option<Value>,
    },
}

/// One item of a server's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A notification.
    Notification(ServerNotification),
    /// A request awaiting [`crate::ServerInstance::reply`].
    Request {
        /// Identifier to answer with.
        id: RequestId,
        /// Decoded request.
        request: ServerRequest,
    },
    /// A frame or payload the host could not interpret.
    ProtocolError(String),
}

impl ServerEvent {
    pub(crate) fn notification(method: String, params: Option<Value>) -> Self {
        let decoded = if method == lsp_notification::PublishDiagnostics::METHOD {
            decode(&method, params).map(ServerNotification::PublishDiagnostics)
        } else if method == lsp_notification::LogMessage::METHOD {
            decode(&method, params).map(ServerNotification::LogMessage)
        } else if method == lsp_notification::ShowMessage::METHOD {
            decode(&method, params).map(ServerNotification::ShowMessage)
        } else if method == lsp_notification::Progress::METHOD {
            decode(&method, params).map(ServerNotification::Progress)
        } else {
            Ok(ServerNotification::Unknown { method, params })
        };
        match decoded {
            Ok(notification) => Self::Notification(notification),
            Err(message) => Self::ProtocolError(message),
        }
    }

    pub(crate) fn request(id: RequestId, method: String, params: Option<Value>) -> Self {
        let decoded = if method == lsp_request::ApplyWorkspaceEdit::METHOD {
            decode(&method, params).map(ServerRequest::ApplyWorkspaceEdit)
        } else if method == lsp_request::WorkspaceConfiguration::METHOD {
            decode(&method, params).map(ServerRequest::WorkspaceConfiguration)
        } else if method == lsp_request::WorkDoneProgressCreate::METHOD {
            decode(&method, params).map(ServerRequest::WorkDoneProgressCreate)
        } else if method == lsp_request::RegisterCapability::METHOD {
            decode(&method, params).map(ServerRequest::RegisterCapability)
        } else if method == lsp_request::UnregisterCapability::METHOD {
            decode(&method, params).map(ServerRequest::UnregisterCapability)
        } else {
            Ok(ServerRequest::Unknown { method, params })
        };
        match decoded {
            Ok(request) => Self::Request { id, request },
            Err(message) => Self::ProtocolError(message),
        }
    }
}

fn decode<P: DeserializeOwned>(method: &str, params: Option<Value>) -> Result<P, String> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|error| format!("invalid params for {method}: {error}"))
}

/// Unbounded, ordered stream of a server's events. Ends when the server's
/// output ends.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<ServerEvent>,
}

impl EventStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<ServerEvent>) -> Self {
        Self { receiver }
    }

    /// Waits for the next event; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<ServerEvent> {
        self.receiver.recv().await
    }

    /// Returns an already queued event without waiting.
    pub fn try_next(&mut self) -> Option<ServerEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Outbound effects of server events, implemented by the embedding editor.
///
/// Callbacks run on the host's listener tasks and should return quickly.
pub trait HostEvents: Send + Sync {
    /// A server published diagnostics for `uri`.
    fn diagnostics_updated(&self, uri: &Uri, version: Option<i32>, diagnostics: Vec<Diagnostic>);

    /// The server for `language` failed to start or died.
    fn server_unavailable(&self, language: &Language, reason: &str);

    /// A server asked the editor to apply `edit`. Returns whether it was
    /// applied. The default rejects every edit.
    fn apply_workspace_edit(&self, edit: &WorkspaceEdit) -> bool {
        let _ = edit;
        false
    }
}
