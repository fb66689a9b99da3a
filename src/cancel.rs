use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use crate::error::{Result, TiiError};

/// Write half of the cancellation pipe, safe to use from the signal handler
/// thread.
#[derive(Debug)]
pub struct CancelTrigger(UnixStream);

/// Read half of the cancellation pipe, watched by the relay loop.
#[derive(Debug)]
pub struct CancelWatch(UnixStream);

/// Create a connected trigger/watch pair.
pub fn cancel_pair() -> Result<(CancelTrigger, CancelWatch)> {
    let (trigger, watch) = UnixStream::pair()?;
    trigger.set_nonblocking(true)?;
    Ok((CancelTrigger(trigger), CancelWatch(watch)))
}

impl CancelTrigger {
    /// Ask the session to wind down. Repeated calls are harmless.
    pub fn cancel(&self) {
        match (&self.0).write(&[1]) {
            Ok(_) => {}
            // A full pipe already holds a pending cancellation
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!(error = %e, "failed to signal cancellation"),
        }
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(CancelTrigger(self.0.try_clone()?))
    }
}

impl AsFd for CancelWatch {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Route SIGINT, SIGTERM and SIGHUP into `trigger`.
///
/// Only one handler can be installed per process.
pub fn install_signal_handler(trigger: CancelTrigger) -> Result<()> {
    ctrlc::set_handler(move || {
        tracing::debug!("termination signal received");
        trigger.cancel();
    })
    .map_err(|e| TiiError::Signal(format!("Failed to set signal handler: {}", e)))
}
