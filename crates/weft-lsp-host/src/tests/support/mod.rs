//! Shared fixtures and helpers for host tests.

mod fake_server;
mod launcher;
mod world;

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lsp_types::{Diagnostic, Position, Range, Uri, WorkspaceEdit};
use rstest::fixture;

use crate::documents::EditorDocument;
use crate::events::HostEvents;
use crate::language::Language;

pub use fake_server::{FakeServer, FakeServerScript};
pub use launcher::{TestLauncher, fake_config};
pub use world::TestWorld;

/// How long polling helpers wait before giving up.
pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Common URI used by host tests.
#[fixture]
pub fn sample_uri() -> Uri {
    Uri::from_str("file:///workspace/a.py").expect("invalid test URI")
}

/// Builds a `file://` URI for `path`.
pub fn uri(path: &str) -> Uri {
    Uri::from_str(&format!("file://{path}")).expect("invalid test URI")
}

/// Range on a single line.
pub fn span(line: u32, start: u32, end: u32) -> Range {
    Range::new(Position::new(line, start), Position::new(line, end))
}

/// Editor-side document backed by a string.
pub struct TextDocument {
    uri: Uri,
    language_id: String,
    text: Mutex<String>,
}

impl TextDocument {
    /// Creates a shared document.
    pub fn shared(uri: Uri, language_id: &str, text: &str) -> Arc<Self> {
        Arc::new(Self {
            uri,
            language_id: String::from(language_id),
            text: Mutex::new(String::from(text)),
        })
    }

    /// Applies a local edit the way an editor buffer would.
    pub fn apply(&self, range: Range, text: &str) {
        let mut current = self.text.lock().expect("document lock poisoned");
        apply_change(&mut current, range, text);
    }
}

impl EditorDocument for TextDocument {
    fn uri(&self) -> Uri {
        self.uri.clone()
    }

    fn language_id(&self) -> String {
        self.language_id.clone()
    }

    fn text(&self) -> String {
        self.text.lock().expect("document lock poisoned").clone()
    }
}

/// Replaces `range` in `text` with `replacement`. Positions count
/// characters, which matches UTF-16 units for the ASCII used in tests.
pub fn apply_change(text: &mut String, range: Range, replacement: &str) {
    let start = offset_of(text, range.start);
    let end = offset_of(text, range.end).max(start);
    text.replace_range(start..end, replacement);
}

fn offset_of(text: &str, position: Position) -> usize {
    let mut offset = 0;
    for (index, line) in text.split_inclusive('\n').enumerate() {
        if index == position.line as usize {
            let column = line
                .char_indices()
                .nth(position.character as usize)
                .map_or(line.len(), |(column, _)| column);
            return offset + column;
        }
        offset += line.len();
    }
    offset
}

/// Diagnostics delivered to the host.
#[derive(Debug, Clone)]
pub struct PublishedDiagnostics {
    /// Document the diagnostics belong to.
    pub uri: Uri,
    /// Version reported by the server.
    pub version: Option<i32>,
    /// Reported diagnostics.
    pub diagnostics: Vec<Diagnostic>,
}

/// [`HostEvents`] sink that records everything it receives.
#[derive(Default)]
pub struct RecordingEvents {
    diagnostics: Mutex<Vec<PublishedDiagnostics>>,
    unavailable: Mutex<Vec<(Language, String)>>,
    edits: Mutex<Vec<WorkspaceEdit>>,
    accept_edits: bool,
}

impl RecordingEvents {
    /// Sink that accepts workspace edits.
    pub fn accepting_edits() -> Self {
        Self {
            accept_edits: true,
            ..Self::default()
        }
    }

    /// Diagnostics received so far.
    pub fn diagnostics(&self) -> Vec<PublishedDiagnostics> {
        self.diagnostics.lock().expect("events lock poisoned").clone()
    }

    /// `server_unavailable` reports received so far.
    pub fn unavailable(&self) -> Vec<(Language, String)> {
        self.unavailable.lock().expect("events lock poisoned").clone()
    }

    /// Workspace edits offered by servers.
    pub fn edits(&self) -> Vec<WorkspaceEdit> {
        self.edits.lock().expect("events lock poisoned").clone()
    }
}

impl HostEvents for RecordingEvents {
    fn diagnostics_updated(&self, uri: &Uri, version: Option<i32>, diagnostics: Vec<Diagnostic>) {
        self.diagnostics
            .lock()
            .expect("events lock poisoned")
            .push(PublishedDiagnostics {
                uri: uri.clone(),
                version,
                diagnostics,
            });
    }

    fn server_unavailable(&self, language: &Language, reason: &str) {
        self.unavailable
            .lock()
            .expect("events lock poisoned")
            .push((language.clone(), String::from(reason)));
    }

    fn apply_workspace_edit(&self, edit: &WorkspaceEdit) -> bool {
        self.edits
            .lock()
            .expect("events lock poisoned")
            .push(edit.clone());
        self.accept_edits
    }
}

/// Polls `condition` until it holds or [`WAIT_LIMIT`] elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
