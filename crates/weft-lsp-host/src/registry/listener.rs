//! Per-instance task that drains server events for the lifetime of the
//! instance.

use std::sync::{Arc, Weak};

use lsp_types::{ApplyWorkspaceEditResponse, MessageType};
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use super::{Inner, REGISTRY_TARGET};
use crate::errors::{HostOperation, LspHostError};
use crate::events::{EventStream, HostEvents, ServerEvent, ServerNotification, ServerRequest};
use crate::instance::ServerInstance;
use crate::protocol::{METHOD_NOT_FOUND, RequestId};

pub(super) struct ListenerContext {
    pub(super) registry: Weak<Inner>,
    pub(super) events: Arc<dyn HostEvents>,
    pub(super) max_protocol_errors: u32,
}

pub(super) async fn listen(
    context: ListenerContext,
    instance: Arc<ServerInstance>,
    mut events: EventStream,
) {
    let mut consecutive_errors: u32 = 0;
    while let Some(event) = events.next().await {
        match event {
            ServerEvent::Notification(notification) => {
                consecutive_errors = 0;
                forward_notification(context.events.as_ref(), &instance, notification);
            }
            ServerEvent::Request { id, request } => {
                consecutive_errors = 0;
                answer(context.events.as_ref(), &instance, id, request).await;
            }
            ServerEvent::ProtocolError(message) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                warn!(
                    target: REGISTRY_TARGET,
                    key = %instance.key(),
                    consecutive = consecutive_errors,
                    detail = %message,
                    "protocol error from language server"
                );
                if consecutive_errors > context.max_protocol_errors && instance.is_alive() {
                    warn!(
                        target: REGISTRY_TARGET,
                        key = %instance.key(),
                        "too many consecutive protocol errors, tearing down"
                    );
                    instance.force_kill();
                }
            }
        }
    }

    trace!(target: REGISTRY_TARGET, key = %instance.key(), "event stream ended");
    if let Some(registry) = context.registry.upgrade() {
        registry.instance_exited(&instance).await;
    }
}

fn forward_notification(
    sink: &dyn HostEvents,
    instance: &ServerInstance,
    notification: ServerNotification,
) {
    match notification {
        ServerNotification::PublishDiagnostics(params) => {
            trace!(
                target: REGISTRY_TARGET,
                uri = params.uri.as_str(),
                version = ?params.version,
                count = params.diagnostics.len(),
                "diagnostics published"
            );
            sink.diagnostics_updated(&params.uri, params.version, params.diagnostics);
        }
        ServerNotification::LogMessage(params) => {
            log_server_message(instance, params.typ, &params.message, "log");
        }
        ServerNotification::ShowMessage(params) => {
            log_server_message(instance, params.typ, &params.message, "show");
        }
        ServerNotification::Progress(params) => {
            trace!(target: REGISTRY_TARGET, key = %instance.key(), token = ?params.token, "progress");
        }
        ServerNotification::Unknown { method, .. } => {
            trace!(target: REGISTRY_TARGET, key = %instance.key(), method = %method, "dropping unknown notification");
        }
    }
}

fn log_server_message(instance: &ServerInstance, kind: MessageType, message: &str, channel: &str) {
    let language = instance.language().as_str();
    match kind {
        MessageType::ERROR => error!(target: REGISTRY_TARGET, language, channel, "{message}"),
        MessageType::WARNING => warn!(target: REGISTRY_TARGET, language, channel, "{message}"),
        MessageType::INFO => info!(target: REGISTRY_TARGET, language, channel, "{message}"),
        _ => debug!(target: REGISTRY_TARGET, language, channel, "{message}"),
    }
}

async fn answer(sink: &dyn HostEvents, instance: &ServerInstance, id: RequestId, request: ServerRequest) {
    let outcome = match request {
        ServerRequest::ApplyWorkspaceEdit(params) => {
            let applied = sink.apply_workspace_edit(&params.edit);
            let response = ApplyWorkspaceEditResponse {
                applied,
                failure_reason: (!applied).then(|| String::from("edit rejected by the editor")),
                failed_change: None,
            };
            reply_with(instance, id, serde_json::to_value(response)).await
        }
        ServerRequest::WorkspaceConfiguration(params) => {
            let items = vec![Value::Null; params.items.len()];
            instance.reply(id, Value::Array(items)).await
        }
        ServerRequest::WorkDoneProgressCreate(_)
        | ServerRequest::RegisterCapability(_)
        | ServerRequest::UnregisterCapability(_) => instance.reply(id, Value::Null).await,
        ServerRequest::Unknown { method, .. } => {
            debug!(target: REGISTRY_TARGET, key = %instance.key(), method = %method, "rejecting unknown request");
            instance
                .reply_error(id, METHOD_NOT_FOUND, format!("method not found: {method}"))
                .await
        }
    };

    if let Err(error) = outcome {
        debug!(
            target: REGISTRY_TARGET,
            key = %instance.key(),
            operation = %HostOperation::Reply,
            error = %error,
            "failed to answer server request"
        );
    }
}

async fn reply_with(
    instance: &ServerInstance,
    id: RequestId,
    result: Result<Value, serde_json::Error>,
) -> Result<(), LspHostError> {
    instance.reply(id, result?).await
}
