//! Launcher that serves `fake-*` commands from memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use weft_config::{Config, ServerLaunch};

use super::fake_server::{FakeServer, FakeServerScript};
use crate::channel::{ChannelError, ProcessChannel};
use crate::language::ServerKey;
use crate::registry::Launcher;

const FAKE_PREFIX: &str = "fake-";

/// Serves commands named `fake-<language>` with a [`FakeServer`] and spawns
/// anything else as a real process.
#[derive(Default)]
pub struct TestLauncher {
    scripts: Mutex<HashMap<String, FakeServerScript>>,
    servers: Mutex<Vec<(ServerKey, FakeServer)>>,
    launches: AtomicUsize,
    delay: Option<Duration>,
}

impl TestLauncher {
    /// Launcher with default scripts for every language.
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds every launch for `delay` before starting the server.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Uses `script` for servers of `language`.
    pub fn script(&self, language: &str, script: FakeServerScript) {
        self.scripts
            .lock()
            .expect("launcher lock poisoned")
            .insert(String::from(language), script);
    }

    /// Number of launch attempts, real or fake.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Most recently launched fake server for `language`.
    pub fn server(&self, language: &str) -> Option<FakeServer> {
        self.servers
            .lock()
            .expect("launcher lock poisoned")
            .iter()
            .rev()
            .find(|(key, _)| key.language().as_str() == language)
            .map(|(_, server)| server.clone())
    }

    /// Every fake server launched so far.
    pub fn servers(&self) -> Vec<FakeServer> {
        self.servers
            .lock()
            .expect("launcher lock poisoned")
            .iter()
            .map(|(_, server)| server.clone())
            .collect()
    }
}

#[async_trait]
impl Launcher for TestLauncher {
    async fn launch(
        &self,
        key: &ServerKey,
        launch: &ServerLaunch,
    ) -> Result<ProcessChannel, ChannelError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let is_fake = launch
            .command
            .to_str()
            .is_some_and(|command| command.starts_with(FAKE_PREFIX));
        if !is_fake {
            return ProcessChannel::spawn(launch, key.root());
        }

        let script = self
            .scripts
            .lock()
            .expect("launcher lock poisoned")
            .get(key.language().as_str())
            .cloned()
            .unwrap_or_default();
        let (channel, server) = FakeServer::start(script);
        self.servers
            .lock()
            .expect("launcher lock poisoned")
            .push((key.clone(), server));
        Ok(channel)
    }
}

/// Configuration serving each of `languages` from a fake server, with
/// short timings suitable for tests.
pub fn fake_config(languages: &[&str]) -> Config {
    let mut config = languages.iter().fold(Config::default(), |config, language| {
        config.with_server(language, ServerLaunch::new(format!("{FAKE_PREFIX}{language}")))
    });
    config.timings.drain_quantum_ms = 100;
    config.timings.shutdown_timeout_ms = 300;
    config.timings.initialize_timeout_ms = 2_000;
    config.timings.request_timeout_ms = 2_000;
    config
}
