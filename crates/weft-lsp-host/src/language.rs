//! Language identifiers and the per-project server key.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

/// Normalised language identifier such as `python` or `rust`.
///
/// The set is open: any identifier with a launch entry in the configuration
/// can be served.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Language(Arc<str>);

impl Language {
    /// Returns the lower-case identifier used for configuration lookups.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Language {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Errors raised when parsing language identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("language identifier '{0}' is empty")]
pub struct LanguageParseError(String);

impl LanguageParseError {
    /// Returns the input that failed to parse.
    #[must_use]
    pub fn input(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for Language {
    type Err = LanguageParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalised = input.trim().to_ascii_lowercase();
        if normalised.is_empty() {
            return Err(LanguageParseError(input.to_owned()));
        }
        Ok(Self(Arc::from(normalised)))
    }
}

/// Identity of one server instance: a language within a project root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerKey {
    language: Language,
    root: PathBuf,
}

impl ServerKey {
    /// Builds a key for `language` under `root`.
    #[must_use]
    pub fn new(language: Language, root: impl Into<PathBuf>) -> Self {
        Self {
            language,
            root: root.into(),
        }
    }

    /// Language served by the instance.
    #[must_use]
    pub fn language(&self) -> &Language {
        &self.language
    }

    /// Project root the instance was started in.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}@{}", self.language, self.root.display())
    }
}
