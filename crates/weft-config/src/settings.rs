//! Layered settings resolved by `ortho_config`.
//!
//! [`HostSettings`] is the flat, command-line friendly view of [`Config`]:
//! every field may come from built-in defaults, a TOML file named by
//! `--config-path` or `WEFT_CONFIG_PATH`, `WEFT_*` environment variables or
//! command-line flags, with later layers winning. Unset fields leave the
//! corresponding [`Config`] value untouched.
//!
//! [`Config`]: crate::Config

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::{CapabilityDirective, normalise_key};
use crate::logging::LogFormat;
use crate::ServerLaunch;

/// Flat settings merged from defaults, file, environment and CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "WEFT")]
pub struct HostSettings {
    /// Replaces the log filter directives.
    pub log_filter: Option<String>,
    /// Replaces the log output format.
    pub log_format: Option<LogFormat>,
    /// Replaces the drain quantum, in milliseconds.
    pub drain_quantum_ms: Option<u64>,
    /// Replaces the shutdown step budget, in milliseconds.
    pub shutdown_timeout_ms: Option<u64>,
    /// Replaces the handshake budget, in milliseconds.
    pub initialize_timeout_ms: Option<u64>,
    /// Replaces the request budget, in milliseconds.
    pub request_timeout_ms: Option<u64>,
    /// Replaces the early-drain queue length.
    pub max_pending_edits: Option<usize>,
    /// Replaces the per-server cache capacity.
    pub cache_capacity: Option<usize>,
    /// Replaces the consecutive protocol error allowance.
    pub max_protocol_errors: Option<u32>,
    /// Replaces the largest accepted frame body, in bytes.
    pub max_frame_bytes: Option<usize>,
    /// Launch entries such as `python=pyrefly lsp`.
    #[serde(default)]
    #[ortho_config(merge_strategy = "append")]
    pub servers: Vec<ServerSpec>,
    /// Overrides such as `python:hover=deny`.
    #[serde(default)]
    #[ortho_config(merge_strategy = "append")]
    pub capability_overrides: Vec<CapabilityDirective>,
}

/// Failure to read a `language=command [args...]` launch entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServerSpecParseError {
    /// No `=` between language and command.
    #[error("server entry '{0}' has no '=' after the language")]
    MissingCommand(String),
    /// The language or the command was blank.
    #[error("server entry '{0}' needs both a language and a command")]
    Empty(String),
}

/// One launch entry in `language=command [args...]` form.
///
/// Arguments are split on whitespace; entries needing quoting or extra
/// environment belong in [`Config::servers`](crate::Config::servers).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerSpec {
    /// Normalised language key.
    pub language: String,
    /// Executable and arguments.
    pub launch: ServerLaunch,
}

impl FromStr for ServerSpec {
    type Err = ServerSpecParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let entry = input.trim();
        let (language, command_line) = entry
            .split_once('=')
            .ok_or_else(|| ServerSpecParseError::MissingCommand(entry.to_owned()))?;
        let language = normalise_key(language);
        let mut words = command_line.split_whitespace();
        let command = words
            .next()
            .filter(|_| !language.is_empty())
            .ok_or_else(|| ServerSpecParseError::Empty(entry.to_owned()))?;
        Ok(Self {
            language,
            launch: ServerLaunch::new(PathBuf::from(command)).with_args(words),
        })
    }
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}={}", self.language, self.launch.command.display())?;
        for arg in &self.launch.args {
            write!(formatter, " {arg}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for ServerSpec {
    type Error = ServerSpecParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServerSpec> for String {
    fn from(spec: ServerSpec) -> Self {
        spec.to_string()
    }
}
