//! Lifecycle state shared between an instance and its reader task.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a server instance. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    /// Process launched, handshake not begun.
    Uninitialized,
    /// `initialize` sent, awaiting the result.
    Initializing,
    /// Handshake complete; requests and notifications flow.
    Ready,
    /// `shutdown` sent.
    ShuttingDown,
    /// The process has ended or was killed.
    Terminated,
}

impl LifecycleState {
    const fn to_raw(self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::Initializing => 1,
            Self::Ready => 2,
            Self::ShuttingDown => 3,
            Self::Terminated => 4,
        }
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::ShuttingDown,
            _ => Self::Terminated,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting down",
            Self::Terminated => "terminated",
        };
        formatter.write_str(label)
    }
}

#[derive(Debug)]
pub(crate) struct AtomicLifecycle(AtomicU8);

impl AtomicLifecycle {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Uninitialized.to_raw()))
    }

    pub(crate) fn load(&self) -> LifecycleState {
        LifecycleState::from_raw(self.0.load(Ordering::SeqCst))
    }

    /// Moves from `from` to `to`; fails if another transition got there first.
    pub(crate) fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.0
            .compare_exchange(from.to_raw(), to.to_raw(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn terminate(&self) {
        self.0
            .store(LifecycleState::Terminated.to_raw(), Ordering::SeqCst);
    }
}
