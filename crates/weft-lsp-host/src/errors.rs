//! Error types surfaced by the LSP host.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::capability::{CapabilityKind, CapabilitySource};
use crate::channel::ChannelError;
use crate::instance::LifecycleState;
use crate::language::{Language, LanguageParseError, ServerKey};

/// Operation being executed when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOperation {
    /// Server initialisation handshake.
    Initialise,
    /// `textDocument/didOpen` notification.
    DidOpen,
    /// `textDocument/didChange` notification.
    DidChange,
    /// `textDocument/didClose` notification.
    DidClose,
    /// A request issued on behalf of the editor.
    Request,
    /// Reply to a server-initiated request.
    Reply,
    /// Graceful `shutdown` / `exit` sequence.
    Shutdown,
}

impl fmt::Display for HostOperation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initialise => "initialisation",
            Self::DidOpen => "didOpen",
            Self::DidChange => "didChange",
            Self::DidClose => "didClose",
            Self::Request => "request",
            Self::Reply => "reply",
            Self::Shutdown => "shutdown",
        };
        formatter.write_str(label)
    }
}

/// Errors returned by the host.
///
/// Every variant is cheap to clone so that a single start-up outcome can be
/// handed to each caller waiting on the same server.
#[derive(Debug, Clone, Error)]
pub enum LspHostError {
    /// The server could not be launched or failed its handshake.
    #[error("language server for {language} failed to start: {reason}")]
    SpawnFailure {
        /// Language whose server failed.
        language: Language,
        /// What went wrong.
        reason: String,
    },

    /// Writing to or reading from the server failed.
    #[error("transport failure: {source}")]
    Transport {
        /// Channel error.
        #[from]
        source: ChannelError,
    },

    /// The instance is not accepting traffic.
    #[error("language server is not ready (state: {state})")]
    NotReady {
        /// State at the time of the call.
        state: LifecycleState,
    },

    /// The server sent something the host could not interpret.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the offending message.
        message: String,
    },

    /// The server answered with a JSON-RPC error.
    #[error("server returned error: {message} (code: {code})")]
    Server {
        /// The JSON-RPC error code.
        code: i64,
        /// The error message from the server.
        message: String,
    },

    /// No response arrived in time.
    #[error("{method} timed out after {timeout:?}")]
    Timeout {
        /// Method or step that timed out.
        method: String,
        /// Budget that elapsed.
        timeout: Duration,
    },

    /// A capability is disabled by overrides or missing server support.
    #[error("capability {capability:?} for {language} is unavailable: {reason}")]
    CapabilityUnavailable {
        /// Language associated with the capability.
        language: Language,
        /// Capability that was requested.
        capability: CapabilityKind,
        /// Why the capability is not available.
        reason: CapabilitySource,
    },

    /// No launch entry exists for the language.
    #[error("no language server is configured for '{language}'")]
    UnknownLanguage {
        /// Language requested by the caller.
        language: Language,
    },

    /// A document reported a language identifier that cannot be used.
    #[error(transparent)]
    InvalidLanguage(#[from] LanguageParseError),

    /// A project root could not be expressed as a `file://` URI.
    #[error("project root {path} cannot be converted to a URI")]
    InvalidRoot {
        /// Offending path.
        path: PathBuf,
    },

    /// The server was stopped while it was still starting.
    #[error("language server {key} was stopped")]
    Stopped {
        /// Key of the stopped server.
        key: ServerKey,
    },

    /// Encoding or decoding a message failed.
    #[error("JSON codec error: {source}")]
    Codec {
        /// Underlying serde error.
        #[source]
        source: Arc<serde_json::Error>,
    },
}

impl LspHostError {
    pub(crate) fn spawn_failure(language: Language, reason: impl Into<String>) -> Self {
        Self::SpawnFailure {
            language,
            reason: reason.into(),
        }
    }

    pub(crate) fn not_ready(state: LifecycleState) -> Self {
        Self::NotReady { state }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn timeout(method: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            method: method.into(),
            timeout,
        }
    }

    pub(crate) fn unknown(language: Language) -> Self {
        Self::UnknownLanguage { language }
    }

    pub(crate) fn capability_unavailable(
        language: Language,
        capability: CapabilityKind,
        reason: CapabilitySource,
    ) -> Self {
        Self::CapabilityUnavailable {
            language,
            capability,
            reason,
        }
    }

    pub(crate) fn stopped(key: ServerKey) -> Self {
        Self::Stopped { key }
    }

    pub(crate) fn codec(source: serde_json::Error) -> Self {
        Self::Codec {
            source: Arc::new(source),
        }
    }
}

impl From<serde_json::Error> for LspHostError {
    fn from(source: serde_json::Error) -> Self {
        Self::codec(source)
    }
}
