//! Capability modelling and resolution.

use std::collections::BTreeMap;
use std::fmt;

use lsp_types::{
    HoverProviderCapability, OneOf, ServerCapabilities, TextDocumentSyncCapability,
    TextDocumentSyncKind,
};
use weft_config::{CapabilityMatrix, CapabilityOverride};

use crate::language::Language;

/// LSP feature gated by negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CapabilityKind {
    /// `textDocument/hover`.
    Hover,
    /// `textDocument/completion`.
    Completion,
    /// `textDocument/definition`.
    Definition,
    /// `textDocument/references`.
    References,
}

impl CapabilityKind {
    /// Every gated capability.
    pub const ALL: [Self; 4] = [
        Self::Hover,
        Self::Completion,
        Self::Definition,
        Self::References,
    ];

    /// Returns the capability key used for overrides.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::Hover => "hover",
            Self::Completion => "completion",
            Self::Definition => "definition",
            Self::References => "references",
        }
    }
}

/// How a server wants document content delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentSync {
    /// The server does not want `didChange` at all.
    None,
    /// Every change carries the whole document.
    Full,
    /// Changes carry ranges and replacement text.
    Incremental,
}

impl DocumentSync {
    fn from_capability(capability: Option<&TextDocumentSyncCapability>) -> Self {
        let kind = match capability {
            Some(TextDocumentSyncCapability::Kind(kind)) => Some(*kind),
            Some(TextDocumentSyncCapability::Options(options)) => options.change,
            None => None,
        };
        match kind {
            Some(TextDocumentSyncKind::FULL) => Self::Full,
            Some(TextDocumentSyncKind::INCREMENTAL) => Self::Incremental,
            _ => Self::None,
        }
    }
}

/// Subset of the server's advertised capabilities the host acts upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerCapabilitySet {
    hover: bool,
    completion: bool,
    definition: bool,
    references: bool,
    sync: DocumentSync,
}

impl ServerCapabilitySet {
    /// Extracts the host-relevant flags from an `initialize` result.
    #[must_use]
    pub fn from_capabilities(capabilities: &ServerCapabilities) -> Self {
        Self {
            hover: match &capabilities.hover_provider {
                Some(HoverProviderCapability::Simple(enabled)) => *enabled,
                Some(HoverProviderCapability::Options(_)) => true,
                None => false,
            },
            completion: capabilities.completion_provider.is_some(),
            definition: one_of_enabled(capabilities.definition_provider.as_ref()),
            references: one_of_enabled(capabilities.references_provider.as_ref()),
            sync: DocumentSync::from_capability(capabilities.text_document_sync.as_ref()),
        }
    }

    /// Whether the server advertised `capability`.
    #[must_use]
    pub fn supports(self, capability: CapabilityKind) -> bool {
        match capability {
            CapabilityKind::Hover => self.hover,
            CapabilityKind::Completion => self.completion,
            CapabilityKind::Definition => self.definition,
            CapabilityKind::References => self.references,
        }
    }

    /// Content delivery mode for `didChange`.
    #[must_use]
    pub fn document_sync(self) -> DocumentSync {
        self.sync
    }
}

fn one_of_enabled<T>(provider: Option<&OneOf<bool, T>>) -> bool {
    match provider {
        Some(OneOf::Left(enabled)) => *enabled,
        Some(OneOf::Right(_)) => true,
        None => false,
    }
}

/// Provenance for a capability's availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilitySource {
    /// Provided directly by the language server.
    ServerAdvertised,
    /// Enabled by a force override.
    ForcedOverride,
    /// Disabled by an explicit deny override.
    DeniedOverride,
    /// Unavailable because the server does not support it.
    MissingOnServer,
}

impl fmt::Display for CapabilitySource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ServerAdvertised => "advertised by server",
            Self::ForcedOverride => "forced by override",
            Self::DeniedOverride => "denied by override",
            Self::MissingOnServer => "missing from server",
        };
        formatter.write_str(label)
    }
}

/// Effective state for a single capability after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityState {
    /// Capability kind being described.
    pub kind: CapabilityKind,
    /// Whether the capability is usable.
    pub enabled: bool,
    /// Why the capability is (un)available.
    pub source: CapabilitySource,
}

/// Negotiated capabilities of one server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySummary {
    language: Language,
    states: BTreeMap<CapabilityKind, CapabilityState>,
}

impl CapabilitySummary {
    /// Resolves every [`CapabilityKind`] against the server's advertisement
    /// and the configured overrides. Overrides win.
    #[must_use]
    pub fn resolve(
        language: &Language,
        advertised: ServerCapabilitySet,
        overrides: &CapabilityMatrix,
    ) -> Self {
        let states = CapabilityKind::ALL
            .into_iter()
            .map(|kind| (kind, resolve_state(language, kind, advertised, overrides)))
            .collect();
        Self {
            language: language.clone(),
            states,
        }
    }

    /// Returns the language associated with this summary.
    #[must_use]
    pub fn language(&self) -> &Language {
        &self.language
    }

    /// Returns the state for the requested capability.
    #[must_use]
    pub fn state(&self, capability: CapabilityKind) -> CapabilityState {
        self.states
            .get(&capability)
            .copied()
            .unwrap_or(CapabilityState {
                kind: capability,
                enabled: false,
                source: CapabilitySource::MissingOnServer,
            })
    }

    /// Returns an iterator over all resolved capability states.
    pub fn states(&self) -> impl Iterator<Item = CapabilityState> + '_ {
        self.states.values().copied()
    }
}

fn resolve_state(
    language: &Language,
    kind: CapabilityKind,
    advertised: ServerCapabilitySet,
    overrides: &CapabilityMatrix,
) -> CapabilityState {
    let (enabled, source) = match overrides.override_for(language.as_str(), kind.key()) {
        Some(CapabilityOverride::Force) => (true, CapabilitySource::ForcedOverride),
        Some(CapabilityOverride::Deny) => (false, CapabilitySource::DeniedOverride),
        None | Some(CapabilityOverride::Allow) if advertised.supports(kind) => {
            (true, CapabilitySource::ServerAdvertised)
        }
        None | Some(CapabilityOverride::Allow) => (false, CapabilitySource::MissingOnServer),
    };
    CapabilityState {
        kind,
        enabled,
        source,
    }
}
