//! Version-tagged response cache owned by one server instance.
//!
//! Entries remember the document version their request was issued against
//! and are only served for that exact version. Values are type-erased so one
//! cache can hold hover, completion and any other response type.

use std::any::Any;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use lsp_types::{Position, Uri};

/// Request family a cached response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// `textDocument/hover`.
    Hover,
    /// `textDocument/completion`.
    Completion,
    /// Any other request, named by its method.
    Method(&'static str),
}

/// Lookup key: document, request family and an optional discriminator such
/// as the cursor position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    uri: Uri,
    kind: RequestKind,
    discriminator: Option<String>,
}

impl CacheKey {
    /// Builds a key.
    #[must_use]
    pub fn new(uri: Uri, kind: RequestKind, discriminator: Option<String>) -> Self {
        Self {
            uri,
            kind,
            discriminator,
        }
    }

    /// Builds a key discriminated by a cursor position.
    #[must_use]
    pub fn at_position(uri: Uri, kind: RequestKind, position: Position) -> Self {
        Self::new(
            uri,
            kind,
            Some(format!("{}:{}", position.line, position.character)),
        )
    }

    /// Document the entry belongs to.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }
}

struct CacheEntry {
    version: i32,
    value: Arc<dyn Any + Send + Sync>,
}

/// Bounded LRU of responses keyed by [`CacheKey`].
pub struct ResponseCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl ResponseCache {
    /// Creates a cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the value stored for `key` if it was recorded at `version` and
    /// has type `T`.
    pub fn get<T: Clone + 'static>(&self, key: &CacheKey, version: i32) -> Option<T> {
        let mut entries = self.lock();
        let entry = entries.get(key)?;
        if entry.version != version {
            entries.pop(key);
            return None;
        }
        entry.value.downcast_ref::<T>().cloned()
    }

    /// Stores `value` for `key` as computed against `version`.
    pub fn set<T: Send + Sync + 'static>(&self, key: CacheKey, version: i32, value: T) {
        self.lock().put(
            key,
            CacheEntry {
                version,
                value: Arc::new(value),
            },
        );
    }

    /// Drops the entry for `key`. Returns whether one existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.lock().pop(key).is_some()
    }

    /// Drops every entry for `uri` and returns how many were removed.
    pub fn invalidate_document(&self, uri: &Uri) -> usize {
        let mut entries = self.lock();
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| key.uri() == uri)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        stale.len()
    }

    /// Drops everything.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResponseCache")
            .field("len", &self.len())
            .finish()
    }
}
