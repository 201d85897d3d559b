//! Per-instance table of open documents and their protocol versions.
//!
//! The table holds only weak references to editor documents: the editor owns
//! them, and a document whose handle has died is treated as closed and pruned
//! the next time it is looked up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use lsp_types::Uri;

/// Boundary to the editor's in-memory document model.
pub trait EditorDocument: Send + Sync {
    /// Identity of the document on the wire.
    fn uri(&self) -> Uri;

    /// LSP language identifier, such as `python`.
    fn language_id(&self) -> String;

    /// Snapshot of the current content.
    fn text(&self) -> String;
}

struct TrackedDocument {
    version: i32,
    synced: i32,
    handle: Weak<dyn EditorDocument>,
}

impl TrackedDocument {
    fn is_live(&self) -> bool {
        self.handle.strong_count() > 0
    }
}

/// Open documents of one server instance.
#[derive(Default)]
pub struct DocumentTable {
    entries: Mutex<HashMap<Uri, TrackedDocument>>,
}

impl DocumentTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `document` at version 0.
    ///
    /// Returns `false`, leaving the entry untouched, when the document is
    /// already tracked with a live handle.
    pub fn track(&self, document: &Arc<dyn EditorDocument>) -> bool {
        let uri = document.uri();
        let mut entries = self.lock();
        if entries.get(&uri).is_some_and(TrackedDocument::is_live) {
            return false;
        }
        entries.insert(
            uri,
            TrackedDocument {
                version: 0,
                synced: 0,
                handle: Arc::downgrade(document),
            },
        );
        true
    }

    /// Returns the editor document behind `uri` while it is alive.
    pub fn document(&self, uri: &Uri) -> Option<Arc<dyn EditorDocument>> {
        let mut entries = self.lock();
        let handle = entries.get(uri)?.handle.upgrade();
        if handle.is_none() {
            entries.remove(uri);
        }
        handle
    }

    /// Stops tracking `uri`. Returns whether an entry was removed.
    pub fn untrack(&self, uri: &Uri) -> bool {
        self.lock().remove(uri).is_some()
    }

    /// Increments and returns the version of `uri`.
    ///
    /// Only the document's content coordinator allocates versions.
    pub fn next_version(&self, uri: &Uri) -> Option<i32> {
        let mut entries = self.lock();
        let entry = live_entry(&mut entries, uri)?;
        entry.version = entry.version.saturating_add(1);
        Some(entry.version)
    }

    /// Current version of `uri`.
    pub fn version(&self, uri: &Uri) -> Option<i32> {
        let mut entries = self.lock();
        live_entry(&mut entries, uri).map(|entry| entry.version)
    }

    /// Records that the server has been sent the content of `version`.
    pub fn mark_synced(&self, uri: &Uri, version: i32) {
        let mut entries = self.lock();
        if let Some(entry) = live_entry(&mut entries, uri) {
            entry.synced = entry.synced.max(version.min(entry.version));
        }
    }

    /// Version of `uri` when the server's copy matches it, or `None` while a
    /// newer version is still being sent.
    pub fn settled_version(&self, uri: &Uri) -> Option<i32> {
        let mut entries = self.lock();
        live_entry(&mut entries, uri)
            .filter(|entry| entry.synced == entry.version)
            .map(|entry| entry.version)
    }

    /// Number of tracked entries, including ones not yet pruned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// URIs of documents whose handles are alive.
    #[must_use]
    pub fn uris(&self) -> Vec<Uri> {
        self.lock()
            .iter()
            .filter(|(_, entry)| entry.is_live())
            .map(|(uri, _)| uri.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uri, TrackedDocument>> {
        self.entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

fn live_entry<'a>(
    entries: &'a mut HashMap<Uri, TrackedDocument>,
    uri: &Uri,
) -> Option<&'a mut TrackedDocument> {
    if !entries.get(uri)?.is_live() {
        entries.remove(uri);
        return None;
    }
    entries.get_mut(uri)
}

impl std::fmt::Debug for DocumentTable {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DocumentTable")
            .field("tracked", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::tests::support::{TextDocument, sample_uri};

    #[fixture]
    fn document() -> Arc<dyn EditorDocument> {
        TextDocument::shared(sample_uri(), "python", "print(1)\n")
    }

    #[rstest]
    fn tracking_is_idempotent(document: Arc<dyn EditorDocument>) {
        let table = DocumentTable::new();

        assert!(table.track(&document));
        assert_eq!(table.next_version(&sample_uri()), Some(1));
        assert!(!table.track(&document));
        assert_eq!(table.version(&sample_uri()), Some(1));
    }

    #[rstest]
    fn versions_increase_without_gaps(document: Arc<dyn EditorDocument>) {
        let table = DocumentTable::new();
        table.track(&document);

        let versions: Vec<_> = (0..4)
            .filter_map(|_| table.next_version(&sample_uri()))
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[rstest]
    fn allocated_versions_settle_once_synced(document: Arc<dyn EditorDocument>) {
        let table = DocumentTable::new();
        table.track(&document);
        assert_eq!(table.settled_version(&sample_uri()), Some(0));

        let first = table.next_version(&sample_uri()).expect("tracked");
        let second = table.next_version(&sample_uri()).expect("tracked");
        assert_eq!(table.settled_version(&sample_uri()), None);

        table.mark_synced(&sample_uri(), first);
        assert_eq!(table.settled_version(&sample_uri()), None);
        table.mark_synced(&sample_uri(), second);
        assert_eq!(table.settled_version(&sample_uri()), Some(2));
        table.mark_synced(&sample_uri(), first);
        assert_eq!(table.settled_version(&sample_uri()), Some(2));
    }

    #[rstest]
    fn dead_handles_read_as_absent_and_are_pruned() {
        let table = DocumentTable::new();
        let document: Arc<dyn EditorDocument> =
            TextDocument::shared(sample_uri(), "python", "x = 1\n");
        table.track(&document);
        drop(document);

        assert_eq!(table.len(), 1);
        assert!(table.uris().is_empty());
        assert!(table.document(&sample_uri()).is_none());
        assert!(table.is_empty());
        assert_eq!(table.next_version(&sample_uri()), None);
    }

    #[rstest]
    fn retracking_a_dead_entry_restarts_at_zero() {
        let table = DocumentTable::new();
        let first: Arc<dyn EditorDocument> =
            TextDocument::shared(sample_uri(), "python", "");
        table.track(&first);
        table.next_version(&sample_uri());
        drop(first);

        let second: Arc<dyn EditorDocument> =
            TextDocument::shared(sample_uri(), "python", "");
        assert!(table.track(&second));
        assert_eq!(table.version(&sample_uri()), Some(0));
    }

    #[rstest]
    fn untracking_missing_entries_is_a_no_op(document: Arc<dyn EditorDocument>) {
        let table = DocumentTable::new();
        assert!(!table.untrack(&sample_uri()));

        table.track(&document);
        assert!(table.untrack(&sample_uri()));
        assert_eq!(table.version(&sample_uri()), None);
    }
}
