//! Child process plumbing for one language server.
//!
//! A [`ProcessChannel`] owns the server's stdio. Bytes written through
//! [`ProcessChannel::write`] reach stdin in call order; stdout arrives as an
//! ordered stream of chunks; stderr is logged and otherwise ignored. The
//! channel reports termination exactly once through a `watch` receiver.

mod error;
#[cfg(unix)]
mod signal;

use std::fmt;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::debug;
use weft_config::ServerLaunch;

pub use error::ChannelError;

/// Log target for channel operations.
pub(crate) const CHANNEL_TARGET: &str = "weft_lsp_host::channel";

const READ_CHUNK_BYTES: usize = 8 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How a channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The process exited with a status code.
    Exited {
        /// Exit code reported by the OS.
        code: i32,
    },
    /// The process was ended by a signal.
    Signalled {
        /// Platform description of the signal.
        description: String,
    },
    /// An in-memory channel reached end of stream or was killed.
    Disconnected,
    /// The exit status could not be collected.
    WaitFailed {
        /// Error reported while waiting.
        message: String,
    },
}

impl Termination {
    fn from_status(status: io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => match status.code() {
                Some(code) => Self::Exited { code },
                None => Self::Signalled {
                    description: status.to_string(),
                },
            },
            Err(error) => Self::WaitFailed {
                message: error.to_string(),
            },
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code } => write!(formatter, "exited with code {code}"),
            Self::Signalled { description } => write!(formatter, "terminated ({description})"),
            Self::Disconnected => formatter.write_str("disconnected"),
            Self::WaitFailed { message } => write!(formatter, "wait failed: {message}"),
        }
    }
}

/// Byte pipe to a running language server.
pub struct ProcessChannel {
    pid: Option<u32>,
    input: AsyncMutex<Option<BoxedWriter>>,
    output: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    termination: watch::Receiver<Option<Termination>>,
    kill_switch: watch::Sender<bool>,
}

impl ProcessChannel {
    /// Starts `launch` in `working_dir` with piped stdio.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::BinaryNotFound`] when the executable does not
    /// exist and [`ChannelError::Spawn`] for any other start-up failure,
    /// including a missing working directory.
    pub fn spawn(launch: &ServerLaunch, working_dir: &Path) -> Result<Self, ChannelError> {
        if !working_dir.is_dir() {
            return Err(ChannelError::Spawn {
                command: launch.command.display().to_string(),
                source: Arc::new(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("working directory {} does not exist", working_dir.display()),
                )),
            });
        }

        debug!(
            target: CHANNEL_TARGET,
            command = %launch.command.display(),
            args = ?launch.args,
            root = %working_dir.display(),
            "spawning language server process"
        );

        let mut child = Command::new(&launch.command)
            .args(&launch.args)
            .envs(&launch.env)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ChannelError::spawn(&launch.command, source))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ChannelError::missing_pipe(&launch.command, "stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChannelError::missing_pipe(&launch.command, "stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ChannelError::missing_pipe(&launch.command, "stderr"))?;
        let pid = child.id();

        debug!(target: CHANNEL_TARGET, pid = ?pid, "language server process spawned");

        let (kill_switch, _) = watch::channel(false);
        let (termination_tx, termination) = watch::channel(None);
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        tokio::spawn(pump_output(stdout, output_tx, kill_switch.subscribe()));
        tokio::spawn(drain_stderr(stderr, pid));
        tokio::spawn(wait_for_exit(child, pid, termination_tx, kill_switch.subscribe()));

        Ok(Self::assemble(pid, Box::new(stdin), output_rx, termination, kill_switch))
    }

    /// Builds a channel over arbitrary stream halves, such as the two ends of
    /// [`tokio::io::duplex`].
    ///
    /// The channel terminates with [`Termination::Disconnected`] when `reader`
    /// reaches end of stream or the channel is killed.
    #[must_use]
    pub fn from_streams<R, W>(pid: Option<u32>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (kill_switch, _) = watch::channel(false);
        let (termination_tx, termination) = watch::channel(None);
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let kill = kill_switch.subscribe();

        tokio::spawn(async move {
            pump_output(reader, output_tx, kill).await;
            settle(&termination_tx, Termination::Disconnected);
        });

        Self::assemble(pid, Box::new(writer), output_rx, termination, kill_switch)
    }

    fn assemble(
        pid: Option<u32>,
        writer: BoxedWriter,
        output: mpsc::UnboundedReceiver<Vec<u8>>,
        termination: watch::Receiver<Option<Termination>>,
        kill_switch: watch::Sender<bool>,
    ) -> Self {
        Self {
            pid,
            input: AsyncMutex::new(Some(writer)),
            output: Mutex::new(Some(output)),
            termination,
            kill_switch,
        }
    }

    /// Native process id, when the channel wraps an OS process.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Writes `bytes` to the server's input and flushes.
    ///
    /// Concurrent writers are serialised, so each call's bytes stay
    /// contiguous.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] after termination or once the input
    /// has been closed, and [`ChannelError::Io`] when the write fails; a
    /// failed write closes the input.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        let mut input = self.input.lock().await;
        if self.is_terminated() {
            *input = None;
            return Err(ChannelError::Closed);
        }
        let Some(writer) = input.as_mut() else {
            return Err(ChannelError::Closed);
        };
        if let Err(error) = write_and_flush(writer, bytes).await {
            *input = None;
            return Err(ChannelError::io(error));
        }
        Ok(())
    }

    /// Drops the server's input so it observes end of stream.
    pub async fn close_input(&self) {
        self.input.lock().await.take();
    }

    /// Hands out the ordered stream of output chunks. Only the first call
    /// returns `Some`.
    pub fn take_output(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.output
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take()
    }

    /// Receiver that changes from `None` to `Some` once, when the channel ends.
    #[must_use]
    pub fn termination(&self) -> watch::Receiver<Option<Termination>> {
        self.termination.clone()
    }

    /// Whether the channel has already ended.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.termination.borrow().is_some()
    }

    /// Waits until the channel ends and reports how.
    pub async fn terminated(&self) -> Termination {
        let mut receiver = self.termination.clone();
        match receiver.wait_for(Option::is_some).await {
            Ok(state) => state.clone().unwrap_or(Termination::Disconnected),
            Err(_) => Termination::Disconnected,
        }
    }

    /// Kills the server without ceremony.
    ///
    /// On unix the process receives `SIGKILL` straight away; the waiter task
    /// then reaps it. In-memory channels stop delivering output.
    pub fn force_kill(&self) {
        if let Some(pid) = self.pid.filter(|_| !self.is_terminated()) {
            signal_kill(pid);
        }
        self.kill_switch.send_replace(true);
    }
}

#[cfg(unix)]
fn signal_kill(pid: u32) {
    signal::kill_process(pid);
}

#[cfg(not(unix))]
fn signal_kill(_pid: u32) {}

impl fmt::Debug for ProcessChannel {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ProcessChannel")
            .field("pid", &self.pid)
            .field("termination", &*self.termination.borrow())
            .finish_non_exhaustive()
    }
}

async fn write_and_flush(writer: &mut BoxedWriter, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

fn settle(termination: &watch::Sender<Option<Termination>>, outcome: Termination) {
    termination.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(outcome);
        true
    });
}

/// Resolves once the kill switch trips or the channel is dropped.
async fn killed(kill: &mut watch::Receiver<bool>) {
    let _ = kill.wait_for(|killed| *killed).await;
}

async fn pump_output<R>(
    mut reader: R,
    output: mpsc::UnboundedSender<Vec<u8>>,
    mut kill: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0_u8; READ_CHUNK_BYTES];
    loop {
        let read = tokio::select! {
            read = reader.read(&mut buffer) => read,
            () = killed(&mut kill) => break,
        };
        match read {
            Ok(0) => break,
            Ok(count) => {
                if output.send(buffer[..count].to_vec()).is_err() {
                    break;
                }
            }
            Err(error) => {
                debug!(target: CHANNEL_TARGET, error = %error, "reading server output failed");
                break;
            }
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: CHANNEL_TARGET, pid = ?pid, line = %line, "server stderr");
    }
}

async fn wait_for_exit(
    mut child: Child,
    pid: Option<u32>,
    termination: watch::Sender<Option<Termination>>,
    mut kill: watch::Receiver<bool>,
) {
    let natural = tokio::select! {
        status = child.wait() => Some(status),
        () = killed(&mut kill) => None,
    };
    let status = match natural {
        Some(status) => status,
        None => {
            if let Err(error) = child.start_kill() {
                debug!(target: CHANNEL_TARGET, pid = ?pid, error = %error, "start_kill failed");
            }
            child.wait().await
        }
    };
    let outcome = Termination::from_status(status);
    debug!(
        target: CHANNEL_TARGET,
        pid = ?pid,
        termination = %outcome,
        "language server process ended"
    );
    settle(&termination, outcome);
}
