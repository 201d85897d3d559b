//! Seam that turns a launch entry into a live channel.

use async_trait::async_trait;
use weft_config::ServerLaunch;

use crate::channel::{ChannelError, ProcessChannel};
use crate::language::ServerKey;

/// Produces the channel a new instance talks over.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Starts the server described by `launch` for `key`.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] when the server cannot be started.
    async fn launch(
        &self,
        key: &ServerKey,
        launch: &ServerLaunch,
    ) -> Result<ProcessChannel, ChannelError>;
}

/// Spawns language servers as OS processes rooted at the project directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        key: &ServerKey,
        launch: &ServerLaunch,
    ) -> Result<ProcessChannel, ChannelError> {
        ProcessChannel::spawn(launch, key.root())
    }
}
