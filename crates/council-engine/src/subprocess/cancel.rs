//! Cooperative cancellation for the process runner.
//!
//! A one-shot flag (published through a `watch` channel so waiters wake up
//! immediately) plus the process group of the child currently in flight.
//! `request` may be called from any thread at any time. A request stays
//! pending until an execution reports `Aborted` for it or the owner clears
//! it explicitly; it is never dropped silently.

use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;
use tracing::debug;

/// Cancellation state owned by one `ProcessRunner`.
#[derive(Debug)]
pub struct CancelState {
    requested: watch::Sender<bool>,
    /// Process group id of the active child, if any.
    active_group: Mutex<Option<u32>>,
}

impl Default for CancelState {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelState {
    pub fn new() -> Self {
        let (requested, _) = watch::channel(false);
        Self {
            requested,
            active_group: Mutex::new(None),
        }
    }

    /// Set the flag and signal the active process group, if there is one.
    /// Idempotent.
    pub fn request(&self) {
        self.requested.send_replace(true);
        let active = *self
            .active_group
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pgid) = active {
            debug!(pgid, "Cancellation requested, terminating active process group");
            if let Err(e) = signal_group(pgid, GroupSignal::Terminate) {
                debug!(pgid, error = %e, "Failed to signal process group");
            }
        }
    }

    pub fn is_requested(&self) -> bool {
        *self.requested.borrow()
    }

    pub(crate) fn reset(&self) {
        self.requested.send_replace(false);
    }

    /// Resolves once cancellation has been requested.
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.requested.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    pub(crate) fn set_active(&self, pgid: Option<u32>) {
        *self
            .active_group
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = pgid;
    }
}

/// Registers a child's process group for the lifetime of the guard.
pub(crate) struct ActiveChildGuard<'a> {
    state: &'a CancelState,
}

impl<'a> ActiveChildGuard<'a> {
    pub(crate) fn new(state: &'a CancelState, pgid: Option<u32>) -> Self {
        state.set_active(pgid);
        Self { state }
    }
}

impl Drop for ActiveChildGuard<'_> {
    fn drop(&mut self) {
        self.state.set_active(None);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupSignal {
    Terminate,
    Kill,
}

/// Send a signal to every process in group `pgid`.
#[cfg(unix)]
pub(crate) fn signal_group(pgid: u32, signal: GroupSignal) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "process group id out of range")
    })?;
    let signal = match signal {
        GroupSignal::Terminate => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg(2) only takes plain integers; pgid comes from a child we
    // spawned as the leader of its own process group.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::killpg(pgid, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pgid: u32, _signal: GroupSignal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process groups are not supported on this platform",
    ))
}
