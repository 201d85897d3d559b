//! Errors raised by the process channel.

use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

/// Failures to start or talk to a language server process.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The executable could not be found.
    #[error("language server binary not found: {command}")]
    BinaryNotFound {
        /// The command that was not found.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The process could not be started for another reason.
    #[error("failed to spawn language server '{command}': {source}")]
    Spawn {
        /// The command being started.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The channel has terminated or its input was closed.
    #[error("language server channel is closed")]
    Closed,

    /// Writing to the server failed.
    #[error("I/O error on language server channel: {source}")]
    Io {
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

impl ChannelError {
    pub(crate) fn spawn(command: &Path, source: io::Error) -> Self {
        let command = command.display().to_string();
        if source.kind() == io::ErrorKind::NotFound {
            Self::BinaryNotFound {
                command,
                source: Arc::new(source),
            }
        } else {
            Self::Spawn {
                command,
                source: Arc::new(source),
            }
        }
    }

    pub(crate) fn missing_pipe(command: &Path, pipe: &str) -> Self {
        Self::Spawn {
            command: command.display().to_string(),
            source: Arc::new(io::Error::other(format!("{pipe} was not captured"))),
        }
    }

    pub(crate) fn io(source: io::Error) -> Self {
        Self::Io {
            source: Arc::new(source),
        }
    }
}
