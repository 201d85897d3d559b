//! Per-document edit batching.
//!
//! Editors push one [`PendingEdit`] per keystroke. A [`ContentCoordinator`]
//! queues them and, once per drain quantum, sends everything queued as a
//! single versioned `didChange`. Only the coordinator allocates versions for
//! its document, so `didChange` notifications for a document leave in order.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lsp_types::{Range, Uri};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, trace, warn};
use weft_config::Config;

use crate::errors::HostOperation;
use crate::instance::ServerInstance;

/// Log target for coordinator operations.
pub(crate) const COORDINATOR_TARGET: &str = "weft_lsp_host::coordinator";

static NEXT_EDIT_SEQ: AtomicU64 = AtomicU64::new(0);

/// One local edit, expressed in the server's coordinates before the
/// editor applied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEdit {
    pub(crate) uri: Uri,
    pub(crate) range: Range,
    pub(crate) text: String,
    seq: u64,
}

impl PendingEdit {
    /// Captures an edit replacing `range` with `text`.
    #[must_use]
    pub fn new(uri: Uri, range: Range, text: impl Into<String>) -> Self {
        Self {
            uri,
            range,
            text: text.into(),
            seq: NEXT_EDIT_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Document the edit applies to.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Replaced range.
    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    /// Inserted text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Arrival order across all documents.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

const MIN_QUANTUM: Duration = Duration::from_millis(1);

/// Drain cadence and backpressure threshold.
///
/// Zero values are raised to the smallest usable ones when a coordinator
/// starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Interval between drain cycles.
    pub quantum: Duration,
    /// Queue length that triggers an immediate drain.
    pub max_pending_edits: usize,
}

impl CoordinatorOptions {
    /// Extracts coordinator options from the host configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            quantum: config.timings.drain_quantum(),
            max_pending_edits: config.limits.max_pending_edits,
        }
    }
}

impl CoordinatorOptions {
    fn clamped(self) -> Self {
        Self {
            quantum: self.quantum.max(MIN_QUANTUM),
            max_pending_edits: self.max_pending_edits.max(1),
        }
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Default)]
struct Queue {
    edits: Vec<PendingEdit>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Handle to the draining task of one open document.
pub struct ContentCoordinator {
    uri: Uri,
    shared: Arc<Shared>,
    max_pending_edits: usize,
    task: Option<JoinHandle<()>>,
}

impl ContentCoordinator {
    /// Starts the draining task for `uri` on `instance`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(instance: Arc<ServerInstance>, uri: Uri, options: CoordinatorOptions) -> Self {
        let options = options.clamped();
        let shared = Arc::new(Shared::default());
        let task = tokio::spawn(drain(
            instance,
            uri.clone(),
            Arc::clone(&shared),
            options.quantum,
        ));
        Self {
            uri,
            shared,
            max_pending_edits: options.max_pending_edits,
            task: Some(task),
        }
    }

    /// Queues an edit. Never blocks; wakes the drainer early once the queue
    /// reaches the backpressure threshold. Edits pushed after
    /// [`Self::flush_and_stop`] are discarded.
    pub fn push(&self, edit: PendingEdit) {
        let mut queue = self.shared.lock();
        if queue.closed {
            trace!(target: COORDINATOR_TARGET, uri = self.uri.as_str(), "discarding edit after close");
            return;
        }
        queue.edits.push(edit);
        let saturated = queue.edits.len() >= self.max_pending_edits;
        drop(queue);
        if saturated {
            debug!(target: COORDINATOR_TARGET, uri = self.uri.as_str(), "edit queue saturated, draining early");
            self.shared.wake.notify_one();
        }
    }

    /// Number of queued edits.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.lock().edits.len()
    }

    /// Document this coordinator serves.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Sends whatever is queued as a final batch and stops the task.
    pub async fn flush_and_stop(mut self) {
        self.shared.lock().closed = true;
        self.shared.wake.notify_one();
        if let Some(task) = self.task.take()
            && let Err(error) = task.await
        {
            warn!(target: COORDINATOR_TARGET, uri = self.uri.as_str(), error = %error, "drain task failed");
        }
    }

    /// Stops the task and discards queued edits without sending them.
    pub fn cancel(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let mut queue = self.shared.lock();
        queue.closed = true;
        queue.edits.clear();
    }
}

impl Drop for ContentCoordinator {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn drain(instance: Arc<ServerInstance>, uri: Uri, shared: Arc<Shared>, quantum: Duration) {
    let mut ticker = interval_at(Instant::now() + quantum, quantum);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = shared.wake.notified() => {}
        }

        let (edits, closed) = {
            let mut queue = shared.lock();
            (mem::take(&mut queue.edits), queue.closed)
        };

        if !edits.is_empty() {
            send_batch(&instance, &uri, edits).await;
        }
        if closed {
            trace!(target: COORDINATOR_TARGET, uri = uri.as_str(), "drain task stopped");
            break;
        }
    }
}

async fn send_batch(instance: &ServerInstance, uri: &Uri, edits: Vec<PendingEdit>) {
    let Some(version) = instance.documents().next_version(uri) else {
        debug!(target: COORDINATOR_TARGET, uri = uri.as_str(), "document no longer tracked, dropping batch");
        return;
    };
    let count = edits.len();
    trace!(target: COORDINATOR_TARGET, uri = uri.as_str(), version, count, "draining edits");
    if let Err(error) = instance.apply_document_changes(uri, version, edits).await {
        warn!(
            target: COORDINATOR_TARGET,
            uri = uri.as_str(),
            version,
            count,
            operation = %HostOperation::DidChange,
            error = %error,
            "failed to send document changes"
        );
    }
}
