//! Direct process signalling used when a server must die immediately.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::CHANNEL_TARGET;

/// Sends `SIGKILL` to `pid`. A process that is already gone is not an error.
pub(super) fn kill_process(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        warn!(target: CHANNEL_TARGET, pid, "process id does not fit a native pid");
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(target: CHANNEL_TARGET, pid, "sent SIGKILL to language server"),
        Err(Errno::ESRCH) => debug!(target: CHANNEL_TARGET, pid, "language server already gone"),
        Err(error) => warn!(
            target: CHANNEL_TARGET,
            pid,
            error = %error,
            "failed to signal language server"
        ),
    }
}
