//! Per-language capability overrides layered over what a server advertises.
//!
//! Keys are matched after trimming and lower-casing, so `Python` and
//! ` python ` name the same language.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// What to do with a capability once the server has advertised its support.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum CapabilityOverride {
    /// Treat the capability as present even when the server omits it.
    Force,
    /// Refuse the capability even when the server offers it.
    Deny,
    /// Trust the server's advertisement.
    #[default]
    Allow,
}

/// Failure to read a `language:capability=override` directive.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityDirectiveParseError {
    /// No `:` between language and capability.
    #[error("capability directive '{0}' has no language prefix")]
    MissingLanguage(String),
    /// No `=` before the override.
    #[error("capability directive '{0}' has no override")]
    MissingOverride(String),
    /// The override was not one of `force`, `deny` or `allow`.
    #[error("capability directive uses unknown override '{0}'")]
    UnknownOverride(String),
}

/// One `language:capability=override` entry, as written on the command line,
/// in `WEFT_CAPABILITY_OVERRIDES` or in a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityDirective {
    /// Language the override applies to.
    pub language: String,
    /// Capability key such as `hover` or `references`.
    pub capability: String,
    /// Override to record.
    pub directive: CapabilityOverride,
}

impl CapabilityDirective {
    /// Creates a directive with normalised keys.
    #[must_use]
    pub fn new(language: &str, capability: &str, directive: CapabilityOverride) -> Self {
        Self {
            language: normalise_key(language),
            capability: normalise_key(capability),
            directive,
        }
    }
}

impl fmt::Display for CapabilityDirective {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}={}", self.language, self.capability, self.directive)
    }
}

impl FromStr for CapabilityDirective {
    type Err = CapabilityDirectiveParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let segment = input.trim();
        let (language, rest) = segment
            .split_once(':')
            .ok_or_else(|| CapabilityDirectiveParseError::MissingLanguage(segment.to_owned()))?;
        let (capability, directive) = rest
            .split_once('=')
            .ok_or_else(|| CapabilityDirectiveParseError::MissingOverride(segment.to_owned()))?;
        let directive = CapabilityOverride::from_str(directive.trim()).map_err(|_| {
            CapabilityDirectiveParseError::UnknownOverride(directive.trim().to_owned())
        })?;
        Ok(Self::new(language, capability, directive))
    }
}

impl TryFrom<String> for CapabilityDirective {
    type Error = CapabilityDirectiveParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CapabilityDirective> for String {
    fn from(directive: CapabilityDirective) -> Self {
        directive.to_string()
    }
}

/// Overrides for every configured language.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct CapabilityMatrix {
    languages: BTreeMap<String, BTreeMap<String, CapabilityOverride>>,
}

impl CapabilityMatrix {
    /// Records `directive` for `capability` on `language`, replacing any
    /// earlier entry.
    pub fn set_override(&mut self, language: &str, capability: &str, directive: CapabilityOverride) {
        self.languages
            .entry(normalise_key(language))
            .or_default()
            .insert(normalise_key(capability), directive);
    }

    /// Looks up the override for `capability` on `language`.
    #[must_use]
    pub fn override_for(&self, language: &str, capability: &str) -> Option<CapabilityOverride> {
        self.languages
            .get(&normalise_key(language))
            .and_then(|overrides| overrides.get(&normalise_key(capability)))
            .copied()
    }

    /// Records every directive in order, so later entries win.
    pub fn apply<'a, I>(&mut self, directives: I)
    where
        I: IntoIterator<Item = &'a CapabilityDirective>,
    {
        for directive in directives {
            self.set_override(&directive.language, &directive.capability, directive.directive);
        }
    }

    pub(crate) fn normalise(&mut self) {
        let languages = std::mem::take(&mut self.languages);
        for (language, overrides) in languages {
            for (capability, directive) in overrides {
                self.set_override(&language, &capability, directive);
            }
        }
    }
}

pub(crate) fn normalise_key(key: &str) -> String {
    key.trim().to_lowercase()
}
