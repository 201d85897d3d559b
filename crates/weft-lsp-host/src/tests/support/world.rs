//! BDD test world wrapping a registry, its fake servers and a runtime.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use lsp_types::{Range, Uri};
use tempfile::TempDir;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use weft_config::Config;

use super::fake_server::FakeServer;
use super::launcher::TestLauncher;
use super::{RecordingEvents, TextDocument, eventually};
use crate::documents::EditorDocument;
use crate::errors::LspHostError;
use crate::events::HostEvents;
use crate::instance::ServerInstance;
use crate::language::Language;
use crate::registry::{Launcher, ServerRegistry};
use crate::uri::path_to_uri;

/// Shared state exercised by BDD step implementations.
pub struct TestWorld {
    runtime: Runtime,
    root: TempDir,
    /// Launcher backing the registry.
    pub launcher: Arc<TestLauncher>,
    /// Host event sink.
    pub events: Arc<RecordingEvents>,
    /// Registry under test.
    pub registry: ServerRegistry,
    documents: HashMap<Uri, Arc<TextDocument>>,
    background: Option<JoinHandle<usize>>,
    /// Last instance returned by the registry.
    pub instance: Option<Arc<ServerInstance>>,
    /// Last error observed while exercising the registry.
    pub last_error: Option<LspHostError>,
}

impl TestWorld {
    /// Builds a world around a fresh registry.
    pub fn new(config: Config, launcher: TestLauncher) -> Self {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("failed to build runtime");
        let root = TempDir::new().expect("failed to create project root");
        let launcher = Arc::new(launcher);
        let events = Arc::new(RecordingEvents::default());
        let registry = ServerRegistry::new(
            Arc::new(config),
            Arc::clone(&launcher) as Arc<dyn Launcher>,
            Arc::clone(&events) as Arc<dyn HostEvents>,
        );
        Self {
            runtime,
            root,
            launcher,
            events,
            registry,
            documents: HashMap::new(),
            background: None,
            instance: None,
            last_error: None,
        }
    }

    /// Project root shared by every server in the world.
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Runs `future` to completion on the world's runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Starts the server for `language`, recording the outcome.
    pub fn start(&mut self, language: &str) {
        let language = Language::from_str(language).expect("valid language");
        let outcome = self.block_on(self.registry.ensure_started(&language, self.root.path()));
        self.record(outcome);
    }

    /// Opens `name` under the project root with `text`.
    pub fn open(&mut self, name: &str, language: &str, text: &str) -> Uri {
        let uri = path_to_uri(&self.root.path().join(name)).expect("valid document path");
        let document = TextDocument::shared(uri.clone(), language, text);
        let outcome = self.block_on(
            self.registry
                .document_opened(Arc::clone(&document) as Arc<dyn EditorDocument>, self.root.path()),
        );
        self.documents.insert(uri.clone(), document);
        self.record(outcome);
        uri
    }

    /// Applies an edit to the local document and forwards it.
    pub fn edit(&self, uri: &Uri, range: Range, text: &str) {
        self.document(uri).apply(range, text);
        assert!(self.registry.document_edited(uri, range, text));
    }

    /// Closes a document.
    pub fn close(&mut self, uri: &Uri) {
        let outcome = self.block_on(self.registry.document_closed(uri));
        if let Err(error) = outcome {
            self.last_error = Some(error);
        }
    }

    /// Local editor document for `uri`.
    pub fn document(&self, uri: &Uri) -> Arc<TextDocument> {
        Arc::clone(self.documents.get(uri).expect("document was never opened"))
    }

    /// Most recent fake server for `language`.
    pub fn server(&self, language: &str) -> FakeServer {
        self.launcher
            .server(language)
            .expect("no fake server launched for language")
    }

    /// Begins stopping every server of the project without waiting.
    pub fn stop_project_in_background(&mut self) {
        let registry = self.registry.clone();
        let root = self.root.path().to_path_buf();
        self.background = Some(
            self.runtime
                .spawn(async move { registry.stop_all_in(&root).await }),
        );
    }

    /// Waits until a server is part-way through graceful shutdown.
    pub fn wait_until_retiring(&self) -> bool {
        let registry = self.registry.clone();
        self.block_on(eventually(|| registry.retiring() > 0))
    }

    /// Kills everything, then waits for any background stop to finish.
    pub fn kill_all(&mut self) {
        self.block_on(self.registry.kill_all());
        if let Some(background) = self.background.take() {
            self.block_on(background).expect("background stop panicked");
        }
    }

    /// Number of servers the registry tracks.
    pub fn server_count(&self) -> usize {
        self.block_on(self.registry.len())
    }

    fn record(&mut self, outcome: Result<Arc<ServerInstance>, LspHostError>) {
        match outcome {
            Ok(instance) => {
                self.instance = Some(instance);
                self.last_error = None;
            }
            Err(error) => self.last_error = Some(error),
        }
    }
}
