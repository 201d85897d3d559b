//! Language server orchestration for an editor host.
#![deny(missing_docs)]
//!
//! The crate launches one language server per (language, project root),
//! performs the LSP handshake, keeps the server's view of open documents in
//! sync with the editor and routes server-initiated messages back to the
//! editor through [`HostEvents`]. Edits are batched per document by a
//! [`ContentCoordinator`] so that a burst of keystrokes reaches the server
//! as a single versioned `didChange`.
//!
//! [`ServerRegistry`] is the entry point. It is constructed explicitly with
//! a [`weft_config::Config`], a [`Launcher`] and a [`HostEvents`] sink, and
//! is cheap to clone.

mod cache;
mod capability;
mod channel;
mod coordinator;
mod documents;
mod errors;
mod events;
mod instance;
mod language;
pub mod protocol;
mod registry;
pub mod telemetry;
mod uri;

pub use cache::{CacheKey, RequestKind, ResponseCache};
pub use capability::{
    CapabilityKind, CapabilitySource, CapabilityState, CapabilitySummary, DocumentSync,
    ServerCapabilitySet,
};
pub use channel::{ChannelError, ProcessChannel, Termination};
pub use coordinator::{ContentCoordinator, CoordinatorOptions, PendingEdit};
pub use documents::{DocumentTable, EditorDocument};
pub use errors::{HostOperation, LspHostError};
pub use events::{EventStream, HostEvents, ServerEvent, ServerNotification, ServerRequest};
pub use instance::{InstanceId, InstanceOptions, LifecycleState, ServerInstance};
pub use language::{Language, LanguageParseError, ServerKey};
pub use registry::{Launcher, ProcessLauncher, ServerRegistry};
pub use uri::path_to_uri;

#[cfg(test)]
mod tests;
