//! Owner of every running server instance, keyed by language and project.
//!
//! The registry starts servers lazily on first use, routes editor document
//! events to the right instance and tears instances down when a project
//! closes. Starting happens in a detached task so a caller that gives up
//! waiting cannot leave a key stuck in the starting state.

mod launcher;
mod listener;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use lsp_types::{Range, Uri};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use weft_config::{Config, ServerLaunch};

pub use self::launcher::{Launcher, ProcessLauncher};
use self::listener::{ListenerContext, listen};
use crate::coordinator::{ContentCoordinator, CoordinatorOptions, PendingEdit};
use crate::documents::EditorDocument;
use crate::errors::{HostOperation, LspHostError};
use crate::events::{EventStream, HostEvents};
use crate::instance::{InstanceId, InstanceOptions, ServerInstance};
use crate::language::{Language, ServerKey};

/// Log target for registry operations.
pub(crate) const REGISTRY_TARGET: &str = "weft_lsp_host::registry";

type StartOutcome = Option<Result<Arc<ServerInstance>, LspHostError>>;

enum Slot {
    Starting {
        attempt: u64,
        outcome: watch::Receiver<StartOutcome>,
        abandon: watch::Sender<bool>,
    },
    Running(Running),
}

impl Slot {
    /// Kills whatever the slot holds without a graceful shutdown.
    fn kill(self) {
        match self {
            Self::Starting { abandon, .. } => {
                abandon.send_replace(true);
            }
            Self::Running(running) => {
                running.listener.abort();
                running.instance.force_kill();
            }
        }
    }
}

struct Running {
    instance: Arc<ServerInstance>,
    listener: JoinHandle<()>,
}

struct OpenDocument {
    key: ServerKey,
    coordinator: ContentCoordinator,
}

struct Inner {
    config: RwLock<Arc<Config>>,
    launcher: Arc<dyn Launcher>,
    events: Arc<dyn HostEvents>,
    servers: AsyncMutex<HashMap<ServerKey, Slot>>,
    retiring: Mutex<HashMap<InstanceId, Arc<ServerInstance>>>,
    documents: Mutex<HashMap<Uri, OpenDocument>>,
    attempts: AtomicU64,
}

impl Inner {
    fn config(&self) -> Arc<Config> {
        let config = self
            .config
            .read()
            .unwrap_or_else(|poison| poison.into_inner());
        Arc::clone(&*config)
    }

    fn retiring(&self) -> MutexGuard<'_, HashMap<InstanceId, Arc<ServerInstance>>> {
        self.retiring
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn documents(&self) -> MutexGuard<'_, HashMap<Uri, OpenDocument>> {
        self.documents
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn detach_documents(&self, key: &ServerKey) -> Vec<ContentCoordinator> {
        let mut documents = self.documents();
        let uris: Vec<Uri> = documents
            .iter()
            .filter(|(_, open)| &open.key == key)
            .map(|(uri, _)| uri.clone())
            .collect();
        uris.iter()
            .filter_map(|uri| documents.remove(uri))
            .map(|open| open.coordinator)
            .collect()
    }

    fn forget_document(&self, uri: &Uri, key: &ServerKey) {
        let mut documents = self.documents();
        if documents.get(uri).is_some_and(|open| &open.key == key)
            && let Some(open) = documents.remove(uri)
        {
            open.coordinator.cancel();
        }
    }

    async fn running(&self, key: &ServerKey) -> Option<Arc<ServerInstance>> {
        match self.servers.lock().await.get(key) {
            Some(Slot::Running(running)) => Some(Arc::clone(&running.instance)),
            _ => None,
        }
    }

    /// Stores a finished start if its claim on the key is still current.
    async fn settle_start(
        self: &Arc<Self>,
        key: &ServerKey,
        attempt: u64,
        result: Result<(Arc<ServerInstance>, EventStream), LspHostError>,
    ) -> Result<Arc<ServerInstance>, LspHostError> {
        let mut servers = self.servers.lock().await;
        let claimed = matches!(
            servers.get(key),
            Some(Slot::Starting { attempt: current, .. }) if *current == attempt
        );

        match result {
            Ok((instance, events)) if claimed => {
                let context = ListenerContext {
                    registry: Arc::downgrade(self),
                    events: Arc::clone(&self.events),
                    max_protocol_errors: self.config().limits.max_protocol_errors,
                };
                let listener = tokio::spawn(listen(context, Arc::clone(&instance), events));
                servers.insert(
                    key.clone(),
                    Slot::Running(Running {
                        instance: Arc::clone(&instance),
                        listener,
                    }),
                );
                info!(
                    target: REGISTRY_TARGET,
                    language = %key.language(),
                    root = %key.root().display(),
                    pid = ?instance.pid(),
                    id = %instance.id(),
                    "language server started"
                );
                Ok(instance)
            }
            Ok((instance, _)) => {
                drop(servers);
                debug!(target: REGISTRY_TARGET, key = %key, "server stopped while starting");
                instance.force_kill();
                Err(LspHostError::stopped(key.clone()))
            }
            Err(error) if !claimed => {
                drop(servers);
                debug!(target: REGISTRY_TARGET, key = %key, error = %error, "abandoned start finished");
                Err(error)
            }
            Err(error) => {
                servers.remove(key);
                drop(servers);
                warn!(
                    target: REGISTRY_TARGET,
                    language = %key.language(),
                    root = %key.root().display(),
                    error = %error,
                    "language server failed to start"
                );
                self.events
                    .server_unavailable(key.language(), &error.to_string());
                Err(error)
            }
        }
    }

    /// Cleans up after an instance whose event stream ended on its own.
    async fn instance_exited(&self, instance: &ServerInstance) {
        let removed = {
            let mut servers = self.servers.lock().await;
            let current = matches!(
                servers.get(instance.key()),
                Some(Slot::Running(running)) if running.instance.id() == instance.id()
            );
            if current {
                servers.remove(instance.key())
            } else {
                None
            }
        };
        if removed.is_none() {
            return;
        }

        instance.force_kill();
        for coordinator in self.detach_documents(instance.key()) {
            coordinator.cancel();
        }
        let reason = format!("language server {} exited", instance.key());
        warn!(
            target: REGISTRY_TARGET,
            language = %instance.language(),
            root = %instance.root().display(),
            id = %instance.id(),
            "language server exited unexpectedly"
        );
        self.events.server_unavailable(instance.language(), &reason);
    }
}

/// Shared handle to the set of running language servers.
///
/// Cloning is cheap; every clone refers to the same servers.
#[derive(Clone)]
pub struct ServerRegistry {
    inner: Arc<Inner>,
}

impl ServerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(config: Arc<Config>, launcher: Arc<dyn Launcher>, events: Arc<dyn HostEvents>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                launcher,
                events,
                servers: AsyncMutex::new(HashMap::new()),
                retiring: Mutex::new(HashMap::new()),
                documents: Mutex::new(HashMap::new()),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a registry that spawns servers as OS processes.
    #[must_use]
    pub fn with_process_launcher(config: Arc<Config>, events: Arc<dyn HostEvents>) -> Self {
        Self::new(config, Arc::new(ProcessLauncher), events)
    }

    /// Configuration used for the next start.
    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        self.inner.config()
    }

    /// Replaces the configuration. Running servers keep the settings they
    /// were started with; later starts and newly opened documents use
    /// `config`.
    pub fn set_config(&self, config: Arc<Config>) {
        let mut current = self
            .inner
            .config
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        *current = config;
    }

    /// Returns the live instance for `language` in `root`, starting one if
    /// needed. Concurrent callers for the same key share a single start.
    ///
    /// # Errors
    ///
    /// Returns [`LspHostError::UnknownLanguage`] when no launch entry
    /// exists, [`LspHostError::SpawnFailure`] when the start fails and
    /// [`LspHostError::Stopped`] when the key was stopped mid-start.
    pub async fn ensure_started(
        &self,
        language: &Language,
        root: &Path,
    ) -> Result<Arc<ServerInstance>, LspHostError> {
        let config = self.inner.config();
        let Some(launch) = config.launch_for(language.as_str()).cloned() else {
            debug!(target: REGISTRY_TARGET, language = %language, "no launch entry for language");
            self.inner
                .events
                .server_unavailable(language, "no language server is configured");
            return Err(LspHostError::unknown(language.clone()));
        };
        let key = ServerKey::new(language.clone(), root);

        let mut outcome = {
            let mut servers = self.inner.servers.lock().await;
            let waiting = match servers.get(&key) {
                Some(Slot::Running(running)) if running.instance.is_alive() => {
                    return Ok(Arc::clone(&running.instance));
                }
                Some(Slot::Starting { outcome, .. }) => Some(outcome.clone()),
                _ => None,
            };
            match waiting {
                Some(outcome) => outcome,
                None => {
                    let options = InstanceOptions::from_config(&config);
                    self.claim(&mut servers, key.clone(), launch, options)
                }
            }
        };

        match outcome.wait_for(Option::is_some).await {
            Ok(settled) => settled
                .clone()
                .unwrap_or_else(|| Err(LspHostError::stopped(key.clone()))),
            Err(_) => Err(LspHostError::stopped(key)),
        }
    }

    fn claim(
        &self,
        servers: &mut HashMap<ServerKey, Slot>,
        key: ServerKey,
        launch: ServerLaunch,
        options: InstanceOptions,
    ) -> watch::Receiver<StartOutcome> {
        if let Some(Slot::Running(dead)) = servers.remove(&key) {
            debug!(target: REGISTRY_TARGET, key = %key, id = %dead.instance.id(), "replacing dead instance");
            dead.listener.abort();
            for coordinator in self.inner.detach_documents(&key) {
                coordinator.cancel();
            }
        }

        let attempt = self.inner.attempts.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        let (abandon, abandoned) = watch::channel(false);
        servers.insert(
            key.clone(),
            Slot::Starting {
                attempt,
                outcome: receiver.clone(),
                abandon,
            },
        );
        debug!(target: REGISTRY_TARGET, key = %key, attempt, "starting language server");
        let task = StartTask {
            inner: Arc::clone(&self.inner),
            key,
            launch,
            options,
            attempt,
            abandoned,
        };
        tokio::spawn(task.run(sender));
        receiver
    }

    /// Stops the server for `language` in `root`. Returns whether one was
    /// registered.
    pub async fn stop(&self, language: &Language, root: &Path) -> bool {
        let key = ServerKey::new(language.clone(), root);
        let removed = self.inner.servers.lock().await.remove(&key);
        match removed {
            Some(slot) => {
                retire(Arc::clone(&self.inner), key, slot).await;
                true
            }
            None => false,
        }
    }

    /// Stops every server of the project at `root` concurrently. Returns the
    /// number of servers stopped.
    pub async fn stop_all_in(&self, root: &Path) -> usize {
        let drained: Vec<(ServerKey, Slot)> = {
            let mut servers = self.inner.servers.lock().await;
            let keys: Vec<ServerKey> = servers
                .keys()
                .filter(|key| key.root() == root)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|key| servers.remove_entry(key))
                .collect()
        };
        self.retire_all(drained).await
    }

    /// Stops every server concurrently. Returns the number stopped.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<(ServerKey, Slot)> =
            self.inner.servers.lock().await.drain().collect();
        self.retire_all(drained).await
    }

    async fn retire_all(&self, drained: Vec<(ServerKey, Slot)>) -> usize {
        let count = drained.len();
        let mut tasks = JoinSet::new();
        for (key, slot) in drained {
            tasks.spawn(retire(Arc::clone(&self.inner), key, slot));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                warn!(target: REGISTRY_TARGET, error = %error, "shutdown task failed");
            }
        }
        count
    }

    /// Kills every tracked process at once, including servers that are in
    /// the middle of a graceful shutdown, and forgets all state.
    pub async fn kill_all(&self) {
        let drained: Vec<Slot> = self
            .inner
            .servers
            .lock()
            .await
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in drained {
            slot.kill();
        }

        let retiring: Vec<Arc<ServerInstance>> =
            self.inner.retiring().drain().map(|(_, instance)| instance).collect();
        for instance in retiring {
            instance.force_kill();
        }

        let documents: Vec<OpenDocument> =
            self.inner.documents().drain().map(|(_, open)| open).collect();
        for open in documents {
            open.coordinator.cancel();
        }
        info!(target: REGISTRY_TARGET, "killed all language servers");
    }

    /// Routes a newly opened editor document to its server, starting the
    /// server if needed, and begins coordinating its edits.
    ///
    /// # Errors
    ///
    /// Fails when the document's language is unusable, the server cannot be
    /// started or `didOpen` cannot be sent. A server stopped while the
    /// document was being opened yields [`LspHostError::Stopped`].
    pub async fn document_opened(
        &self,
        document: Arc<dyn EditorDocument>,
        root: &Path,
    ) -> Result<Arc<ServerInstance>, LspHostError> {
        let language: Language = document.language_id().parse()?;
        let instance = self.ensure_started(&language, root).await?;
        if !instance.open_document(&document).await? {
            return Ok(instance);
        }

        let uri = document.uri();
        let coordinator = ContentCoordinator::spawn(
            Arc::clone(&instance),
            uri.clone(),
            CoordinatorOptions::from_config(&self.inner.config()),
        );
        let previous = self.inner.documents().insert(
            uri.clone(),
            OpenDocument {
                key: instance.key().clone(),
                coordinator,
            },
        );
        if let Some(previous) = previous {
            previous.coordinator.cancel();
        }

        // A stop that removed the slot before the insert has already
        // detached this server's documents, so the entry would leak.
        let current = self.inner.running(instance.key()).await;
        let registered = current.is_some_and(|current| Arc::ptr_eq(&current, &instance));
        if !registered || !instance.is_alive() {
            self.inner.forget_document(&uri, instance.key());
            return Err(LspHostError::stopped(instance.key().clone()));
        }
        Ok(instance)
    }

    /// Queues an edit for an open document. Returns `false` for documents
    /// the registry does not know.
    pub fn document_edited(&self, uri: &Uri, range: Range, text: impl Into<String>) -> bool {
        let documents = self.inner.documents();
        let Some(open) = documents.get(uri) else {
            debug!(target: REGISTRY_TARGET, uri = uri.as_str(), "edit for unknown document");
            return false;
        };
        open.coordinator.push(PendingEdit::new(uri.clone(), range, text));
        true
    }

    /// Flushes pending edits for the document and closes it on its server.
    /// Unknown documents are ignored.
    ///
    /// # Errors
    ///
    /// Fails when `didClose` cannot be sent.
    pub async fn document_closed(&self, uri: &Uri) -> Result<(), LspHostError> {
        let removed = self.inner.documents().remove(uri);
        let Some(open) = removed else {
            debug!(target: REGISTRY_TARGET, uri = uri.as_str(), "close for unknown document");
            return Ok(());
        };

        open.coordinator.flush_and_stop().await;
        let Some(instance) = self.inner.running(&open.key).await else {
            return Ok(());
        };
        instance.close_document(uri).await.inspect_err(|error| {
            debug!(
                target: REGISTRY_TARGET,
                uri = uri.as_str(),
                operation = %HostOperation::DidClose,
                error = %error,
                "closing document failed"
            );
        })
    }

    /// Instance currently running for `language` in `root`.
    pub async fn instance(&self, language: &Language, root: &Path) -> Option<Arc<ServerInstance>> {
        self.inner
            .running(&ServerKey::new(language.clone(), root))
            .await
    }

    /// Keys with a running or starting server.
    pub async fn keys(&self) -> Vec<ServerKey> {
        self.inner.servers.lock().await.keys().cloned().collect()
    }

    /// Number of running or starting servers.
    pub async fn len(&self) -> usize {
        self.inner.servers.lock().await.len()
    }

    /// Whether no server is running or starting.
    pub async fn is_empty(&self) -> bool {
        self.inner.servers.lock().await.is_empty()
    }

    /// Number of servers in the middle of a graceful shutdown.
    #[must_use]
    pub fn retiring(&self) -> usize {
        self.inner.retiring().len()
    }

    /// Coordinator queue length for an open document.
    #[must_use]
    pub fn pending_edits(&self, uri: &Uri) -> Option<usize> {
        self.inner
            .documents()
            .get(uri)
            .map(|open| open.coordinator.pending())
    }
}

struct StartTask {
    inner: Arc<Inner>,
    key: ServerKey,
    launch: ServerLaunch,
    options: InstanceOptions,
    attempt: u64,
    abandoned: watch::Receiver<bool>,
}

impl StartTask {
    async fn run(mut self, outcome: watch::Sender<StartOutcome>) {
        let result = self.launch_and_handshake().await;
        let settled = self.inner.settle_start(&self.key, self.attempt, result).await;
        outcome.send_replace(Some(settled));
    }

    /// Launches and handshakes, killing the launched process as soon as the
    /// slot is stopped or dropped.
    async fn launch_and_handshake(
        &mut self,
    ) -> Result<(Arc<ServerInstance>, EventStream), LspHostError> {
        let launched = tokio::select! {
            launched = self.inner.launcher.launch(&self.key, &self.launch) => launched,
            _ = self.abandoned.wait_for(|abandoned| *abandoned) => {
                return Err(LspHostError::stopped(self.key.clone()));
            }
        };
        let channel = Arc::new(launched.map_err(|error| {
            LspHostError::spawn_failure(self.key.language().clone(), error.to_string())
        })?);

        tokio::select! {
            started = ServerInstance::start_shared(
                self.key.clone(),
                Arc::clone(&channel),
                self.options.clone(),
            ) => started,
            _ = self.abandoned.wait_for(|abandoned| *abandoned) => {
                debug!(
                    target: REGISTRY_TARGET,
                    key = %self.key,
                    pid = ?channel.pid(),
                    "killing server stopped mid-handshake"
                );
                channel.force_kill();
                Err(LspHostError::stopped(self.key.clone()))
            }
        }
    }
}

async fn retire(inner: Arc<Inner>, key: ServerKey, slot: Slot) {
    for coordinator in inner.detach_documents(&key) {
        coordinator.cancel();
    }
    let (instance, listener) = match slot {
        Slot::Running(Running { instance, listener }) => (instance, listener),
        starting @ Slot::Starting { .. } => {
            debug!(target: REGISTRY_TARGET, key = %key, "stopped server that was still starting");
            starting.kill();
            return;
        }
    };
    listener.abort();
    inner.retiring().insert(instance.id(), Arc::clone(&instance));

    let timeout = instance.options().shutdown_timeout;
    match tokio::time::timeout(timeout, instance.shutdown()).await {
        Ok(Ok(())) => {
            debug!(target: REGISTRY_TARGET, key = %key, "language server shut down");
        }
        Ok(Err(error)) => {
            warn!(
                target: REGISTRY_TARGET,
                key = %key,
                operation = %HostOperation::Shutdown,
                error = %error,
                "graceful shutdown failed, killing"
            );
            instance.force_kill();
        }
        Err(_) => {
            warn!(target: REGISTRY_TARGET, key = %key, ?timeout, "graceful shutdown timed out, killing");
            instance.force_kill();
        }
    }
    inner.retiring().remove(&instance.id());
}
