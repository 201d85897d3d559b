//! Tracing bootstrap for applications embedding the host.
//!
//! The host only emits `tracing` events under `weft_lsp_host::*` targets and
//! never installs a subscriber on its own. Embedders without a subscriber of
//! their own can call [`initialise`] to get stderr output shaped by
//! [`LogSettings`].

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::UtcTime;
use weft_config::{Config, LogFormat, LogSettings};

static INSTALLED: OnceCell<TelemetryHandle> = OnceCell::new();

/// Describes the subscriber that is in effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryHandle {
    settings: LogSettings,
}

impl TelemetryHandle {
    /// Output encoding of the installed subscriber.
    #[must_use]
    pub fn format(&self) -> LogFormat {
        self.settings.format
    }

    /// Filter directives of the installed subscriber.
    #[must_use]
    pub fn filter(&self) -> &str {
        &self.settings.filter
    }
}

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Failed to install the tracing subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the global tracing subscriber described by `config.logging`.
///
/// Only the first successful call installs anything. Later calls return the
/// handle of the subscriber already in effect, whatever `config` says.
///
/// # Examples
///
/// ```rust,no_run
/// use weft_config::Config;
/// use weft_lsp_host::telemetry;
///
/// # fn main() -> Result<(), weft_lsp_host::telemetry::TelemetryError> {
/// let handle = telemetry::initialise(&Config::default())?;
/// assert_eq!(handle.filter(), "info");
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] for an unparseable filter and
/// [`TelemetryError::Subscriber`] when the application already installed
/// a different global subscriber.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    INSTALLED
        .get_or_try_init(|| {
            let subscriber = build_subscriber(&config.logging)?;
            tracing::subscriber::set_global_default(subscriber)
                .map_err(TelemetryError::Subscriber)?;
            Ok(TelemetryHandle {
                settings: config.logging.clone(),
            })
        })
        .cloned()
}

/// Builds the stderr subscriber for `settings` without installing it, for
/// use with [`tracing::subscriber::with_default`].
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] for an unparseable filter.
pub fn build_subscriber(
    settings: &LogSettings,
) -> Result<Box<dyn Subscriber + Send + Sync>, TelemetryError> {
    let filter = parse_filter(&settings.filter)?;
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_timer(UtcTime::rfc_3339());

    Ok(match settings.format {
        LogFormat::Json => Box::new(builder.json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    })
}

fn parse_filter(directives: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(directives).map_err(|error| TelemetryError::Filter(error.to_string()))
}
