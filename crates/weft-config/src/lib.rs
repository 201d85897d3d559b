//! Read-only configuration for the Weft language-server host.
//!
//! A [`Config`] names the server to launch for each language, the capability
//! overrides applied after negotiation, the timing and queue limits that bound
//! the host's background work, and the log settings used by the telemetry
//! bootstrap. The host only ever reads it, typically through an `Arc<Config>`.
#![deny(missing_docs)]

mod capability;
mod defaults;
mod logging;
mod settings;

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Read;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use capability::{
    CapabilityDirective, CapabilityDirectiveParseError, CapabilityMatrix, CapabilityOverride,
};
pub use defaults::{
    DEFAULT_CACHE_CAPACITY, DEFAULT_DRAIN_QUANTUM_MS, DEFAULT_INITIALIZE_TIMEOUT_MS,
    DEFAULT_LOG_FILTER, DEFAULT_MAX_FRAME_BYTES, DEFAULT_MAX_PENDING_EDITS,
    DEFAULT_MAX_PROTOCOL_ERRORS, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_SHUTDOWN_TIMEOUT_MS,
    default_servers,
};
pub use logging::{LogFormat, LogFormatParseError, LogSettings};
pub use settings::{HostSettings, ServerSpec, ServerSpecParseError};

/// How to start the language server for one language.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerLaunch {
    /// Executable path or a bare name resolved through `PATH`.
    #[serde(default)]
    pub command: PathBuf,
    /// Arguments passed after the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Variables set on top of the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ServerLaunch {
    /// Launch entry running `command` with no arguments.
    #[must_use]
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Replaces the argument list.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds one environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Timeouts and cadences, stored in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Timings {
    /// Interval between content coordinator drain cycles.
    pub drain_quantum_ms: u64,
    /// Budget for each step of a graceful shutdown.
    pub shutdown_timeout_ms: u64,
    /// Budget for the `initialize` handshake.
    pub initialize_timeout_ms: u64,
    /// Budget for ordinary requests.
    pub request_timeout_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            drain_quantum_ms: DEFAULT_DRAIN_QUANTUM_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            initialize_timeout_ms: DEFAULT_INITIALIZE_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl Timings {
    /// Drain interval as a [`Duration`].
    #[must_use]
    pub fn drain_quantum(&self) -> Duration {
        Duration::from_millis(self.drain_quantum_ms)
    }

    /// Shutdown step budget as a [`Duration`].
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Handshake budget as a [`Duration`].
    #[must_use]
    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    /// Request budget as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Size bounds on per-server and per-document state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Limits {
    /// Queue length that triggers an early drain.
    pub max_pending_edits: usize,
    /// Response cache entries kept per server.
    pub cache_capacity: usize,
    /// Consecutive protocol errors tolerated before teardown.
    pub max_protocol_errors: u32,
    /// Largest frame body accepted from a server, in bytes.
    pub max_frame_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_pending_edits: DEFAULT_MAX_PENDING_EDITS,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_protocol_errors: DEFAULT_MAX_PROTOCOL_ERRORS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Limits {
    /// Cache capacity in the form `lru` expects.
    ///
    /// Falls back to the default when the configured value is zero.
    #[must_use]
    pub fn cache_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.cache_capacity)
            .or_else(|| NonZeroUsize::new(DEFAULT_CACHE_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN)
    }
}

/// Errors raised while loading or validating a [`Config`].
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// The document was not valid JSON or did not match the schema.
    #[error("failed to parse configuration: {source}")]
    Parse {
        /// Underlying decoder error.
        #[source]
        source: Arc<serde_json::Error>,
    },
    /// A server table key was blank.
    #[error("server table contains an empty language key")]
    EmptyLanguage,
    /// A server entry had no executable.
    #[error("server for '{language}' has an empty command")]
    EmptyCommand {
        /// Language whose entry is incomplete.
        language: String,
    },
    /// A limit or cadence that must be positive was zero.
    #[error("configuration value '{field}' must be greater than zero")]
    Zero {
        /// Dotted path of the offending field.
        field: &'static str,
    },
    /// The layered file, environment and CLI sources could not be merged.
    #[error("failed to load layered configuration: {0}")]
    Load(#[source] Arc<OrthoError>),
}

/// Host configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Launch entries keyed by normalised language identifier.
    pub servers: BTreeMap<String, ServerLaunch>,
    /// Overrides applied on top of negotiated server capabilities.
    pub capabilities: CapabilityMatrix,
    /// Timeouts and drain cadence.
    pub timings: Timings,
    /// Queue and cache bounds.
    pub limits: Limits,
    /// Subscriber settings.
    pub logging: LogSettings,
}

impl Config {
    /// Parses a JSON document and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed input and the validation
    /// errors documented on [`Config::validate`].
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(input).map_err(ConfigError::parse)?;
        config.normalised()
    }

    /// Reads a JSON document from `reader` and validates the result.
    ///
    /// # Errors
    ///
    /// As for [`Config::from_json_str`]; I/O failures surface as
    /// [`ConfigError::Parse`].
    pub fn from_json_reader(reader: impl Read) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_reader(reader).map_err(ConfigError::parse)?;
        config.normalised()
    }

    /// Adds the built-in launch entries for languages that have none.
    #[must_use]
    pub fn with_default_servers(mut self) -> Self {
        for (language, launch) in default_servers() {
            self.servers.entry(language).or_insert(launch);
        }
        self
    }

    /// Registers or replaces the launch entry for `language`.
    #[must_use]
    pub fn with_server(mut self, language: &str, launch: ServerLaunch) -> Self {
        self.servers
            .insert(capability::normalise_key(language), launch);
        self
    }

    /// Resolves the layered settings from the process arguments and
    /// environment, then applies them over the built-in launch table.
    ///
    /// # Errors
    ///
    /// As for [`Config::load_from_iter`].
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_iter(std::env::args_os())
    }

    /// Resolves [`HostSettings`] from `args`, `WEFT_*` variables and the
    /// file named by `--config-path` or `WEFT_CONFIG_PATH`, then applies
    /// them over the built-in launch table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] when a layer fails to parse, and the
    /// validation errors documented on [`Config::validate`].
    pub fn load_from_iter<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let settings = HostSettings::load_from_iter(args).map_err(ConfigError::Load)?;
        Self::default().with_default_servers().with_settings(settings)
    }

    /// Applies every field `settings` sets and validates the result.
    ///
    /// Launch entries replace configured ones for the same language and
    /// capability directives are recorded in order.
    ///
    /// # Errors
    ///
    /// Returns the validation errors documented on [`Config::validate`].
    pub fn with_settings(mut self, settings: HostSettings) -> Result<Self, ConfigError> {
        let HostSettings {
            log_filter,
            log_format,
            drain_quantum_ms,
            shutdown_timeout_ms,
            initialize_timeout_ms,
            request_timeout_ms,
            max_pending_edits,
            cache_capacity,
            max_protocol_errors,
            max_frame_bytes,
            servers,
            capability_overrides,
        } = settings;

        if let Some(filter) = log_filter.filter(|value| !value.trim().is_empty()) {
            self.logging.filter = filter;
        }
        replace(&mut self.logging.format, log_format);
        replace(&mut self.timings.drain_quantum_ms, drain_quantum_ms);
        replace(&mut self.timings.shutdown_timeout_ms, shutdown_timeout_ms);
        replace(&mut self.timings.initialize_timeout_ms, initialize_timeout_ms);
        replace(&mut self.timings.request_timeout_ms, request_timeout_ms);
        replace(&mut self.limits.max_pending_edits, max_pending_edits);
        replace(&mut self.limits.cache_capacity, cache_capacity);
        replace(&mut self.limits.max_protocol_errors, max_protocol_errors);
        replace(&mut self.limits.max_frame_bytes, max_frame_bytes);
        for spec in servers {
            self.servers.insert(spec.language, spec.launch);
        }
        self.capabilities.apply(&capability_overrides);

        self.validate()?;
        Ok(self)
    }

    /// Returns the launch entry for `language`, matching case-insensitively.
    #[must_use]
    pub fn launch_for(&self, language: &str) -> Option<&ServerLaunch> {
        self.servers.get(&capability::normalise_key(language))
    }

    /// Checks the invariants the host relies on.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::EmptyLanguage`] for a blank server key.
    /// - [`ConfigError::EmptyCommand`] for a launch entry without executable.
    /// - [`ConfigError::Zero`] when the drain quantum, the pending edit bound,
    ///   the cache capacity or the frame size bound is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (language, launch) in &self.servers {
            if language.trim().is_empty() {
                return Err(ConfigError::EmptyLanguage);
            }
            if launch.command.as_os_str().is_empty() {
                return Err(ConfigError::EmptyCommand {
                    language: language.clone(),
                });
            }
        }
        if self.timings.drain_quantum_ms == 0 {
            return Err(ConfigError::Zero {
                field: "timings.drain_quantum_ms",
            });
        }
        if self.limits.max_pending_edits == 0 {
            return Err(ConfigError::Zero {
                field: "limits.max_pending_edits",
            });
        }
        if self.limits.cache_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "limits.cache_capacity",
            });
        }
        if self.limits.max_frame_bytes == 0 {
            return Err(ConfigError::Zero {
                field: "limits.max_frame_bytes",
            });
        }
        Ok(())
    }

    fn normalised(mut self) -> Result<Self, ConfigError> {
        let servers = std::mem::take(&mut self.servers);
        for (language, launch) in servers {
            let key = capability::normalise_key(&language);
            if key.is_empty() {
                return Err(ConfigError::EmptyLanguage);
            }
            self.servers.insert(key, launch);
        }
        self.capabilities.normalise();
        self.validate()?;
        Ok(self)
    }
}

fn replace<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

impl ConfigError {
    fn parse(source: serde_json::Error) -> Self {
        Self::Parse {
            source: Arc::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Seek, SeekFrom, Write};

    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn sample_json() -> &'static str {
        r#"{
            "servers": {
                "Python": { "command": "/opt/pyrefly", "args": ["lsp"], "env": { "RUST_LOG": "warn" } }
            },
            "timings": { "drain_quantum_ms": 100 },
            "logging": { "format": "compact" }
        }"#
    }

    #[rstest]
    fn parses_and_normalises_server_keys(sample_json: &str) {
        let config = Config::from_json_str(sample_json).expect("config should parse");

        let launch = config.launch_for("PYTHON").expect("python entry");
        assert_eq!(launch.command, PathBuf::from("/opt/pyrefly"));
        assert_eq!(launch.args, vec![String::from("lsp")]);
        assert_eq!(launch.env.get("RUST_LOG").map(String::as_str), Some("warn"));
        assert_eq!(config.timings.drain_quantum(), Duration::from_millis(100));
        assert_eq!(config.timings.shutdown_timeout_ms, DEFAULT_SHUTDOWN_TIMEOUT_MS);
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert_eq!(config.logging.filter, DEFAULT_LOG_FILTER);
    }

    #[rstest]
    fn reads_from_a_file(sample_json: &str) {
        let mut file = tempfile::tempfile().expect("temp file");
        file.write_all(sample_json.as_bytes()).expect("write config");
        file.seek(SeekFrom::Start(0)).expect("rewind");

        let config = Config::from_json_reader(file).expect("config should parse");
        assert!(config.launch_for("python").is_some());
    }

    #[rstest]
    #[case(r#"{"servers": {"rust": {"args": []}}}"#)]
    #[case(r#"{"servers": {"rust": {"command": ""}}}"#)]
    fn empty_commands_fail_fast(#[case] input: &str) {
        let error = Config::from_json_str(input).expect_err("empty command must be rejected");
        assert!(matches!(error, ConfigError::EmptyCommand { language } if language == "rust"));
    }

    #[rstest]
    #[case(r#"{"timings": {"drain_quantum_ms": 0}}"#, "timings.drain_quantum_ms")]
    #[case(r#"{"limits": {"cache_capacity": 0}}"#, "limits.cache_capacity")]
    #[case(r#"{"limits": {"max_pending_edits": 0}}"#, "limits.max_pending_edits")]
    fn zero_bounds_are_rejected(#[case] input: &str, #[case] expected: &str) {
        let error = Config::from_json_str(input).expect_err("zero must be rejected");
        assert!(matches!(error, ConfigError::Zero { field } if field == expected));
    }

    #[rstest]
    fn malformed_json_is_a_parse_error() {
        let error = Config::from_json_str("{ servers: ").expect_err("must fail");
        assert!(matches!(error, ConfigError::Parse { .. }));
    }

    #[rstest]
    fn default_servers_do_not_replace_configured_entries() {
        let config = Config::default()
            .with_server("Rust", ServerLaunch::new("/custom/ra"))
            .with_default_servers();

        assert_eq!(
            config.launch_for("rust").map(|launch| launch.command.clone()),
            Some(PathBuf::from("/custom/ra"))
        );
        let python = config.launch_for("python").expect("default python entry");
        assert_eq!(python.command, PathBuf::from("pyrefly"));
        assert_eq!(python.args, vec![String::from("lsp")]);
        assert!(config.launch_for("typescript").is_some());
    }

    #[rstest]
    fn settings_replace_only_the_fields_they_set() {
        let settings = HostSettings {
            log_filter: Some(String::from("debug")),
            log_format: Some(LogFormat::Compact),
            drain_quantum_ms: Some(40),
            servers: vec!["python=/opt/pyrefly lsp".parse().expect("valid entry")],
            capability_overrides: vec!["python:hover=deny".parse().expect("valid directive")],
            ..HostSettings::default()
        };
        let config = Config::default()
            .with_default_servers()
            .with_settings(settings)
            .expect("settings should apply");

        assert_eq!(config.logging.filter, "debug");
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert_eq!(config.timings.drain_quantum(), Duration::from_millis(40));
        assert_eq!(config.timings.shutdown_timeout_ms, DEFAULT_SHUTDOWN_TIMEOUT_MS);
        assert_eq!(
            config.launch_for("python").map(|launch| launch.command.clone()),
            Some(PathBuf::from("/opt/pyrefly"))
        );
        assert!(config.launch_for("rust").is_some());
        assert_eq!(
            config.capabilities.override_for("python", "hover"),
            Some(CapabilityOverride::Deny)
        );
    }

    #[rstest]
    #[case(HostSettings { drain_quantum_ms: Some(0), ..HostSettings::default() }, "timings.drain_quantum_ms")]
    #[case(HostSettings { max_frame_bytes: Some(0), ..HostSettings::default() }, "limits.max_frame_bytes")]
    fn settings_are_validated(#[case] settings: HostSettings, #[case] expected: &str) {
        let error = Config::default()
            .with_settings(settings)
            .expect_err("zero must be rejected");
        assert!(matches!(error, ConfigError::Zero { field } if field == expected));
    }

    #[rstest]
    fn zero_cache_capacity_falls_back_to_default() {
        let limits = Limits {
            cache_capacity: 0,
            ..Limits::default()
        };
        assert_eq!(limits.cache_capacity().get(), DEFAULT_CACHE_CAPACITY);
    }
}
