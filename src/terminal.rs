use std::io::IsTerminal;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

use nix::pty::Winsize;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};

use crate::error::{Result, TiiError};

/// Attributes of the controlling terminal as they were before the session.
#[derive(Debug, Clone)]
pub struct TerminalSnapshot {
    pub termios: Termios,
    pub window_size: Winsize,
}

/// Owns the terminal mode for the duration of a session.
///
/// Restores the captured attributes exactly once, either through
/// [`TerminalGuard::restore`] or on drop.
pub struct TerminalGuard {
    fd: Option<OwnedFd>,
    snapshot: Option<TerminalSnapshot>,
    raw: bool,
}

impl TerminalGuard {
    /// Capture `fd` if it is a terminal. Anything else yields a
    /// non-interactive guard whose operations are no-ops.
    pub fn capture<F: AsFd>(fd: F) -> Result<Self> {
        let fd = fd.as_fd();
        if !fd.is_terminal() {
            return Ok(Self::non_interactive());
        }

        let owned = fd.try_clone_to_owned()?;
        let termios = tcgetattr(&owned).map_err(|e| {
            TiiError::Terminal(format!("Failed to get terminal attributes: {}", e))
        })?;
        let window_size = get_window_size(owned.as_raw_fd())?;

        Ok(TerminalGuard {
            fd: Some(owned),
            snapshot: Some(TerminalSnapshot {
                termios,
                window_size,
            }),
            raw: false,
        })
    }

    pub fn non_interactive() -> Self {
        TerminalGuard {
            fd: None,
            snapshot: None,
            raw: false,
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn snapshot(&self) -> Option<&TerminalSnapshot> {
        self.snapshot.as_ref()
    }

    /// Switch to raw mode with echo off, discarding pending I/O.
    pub fn enter_raw(&mut self) -> Result<()> {
        let (Some(fd), Some(snapshot)) = (&self.fd, &self.snapshot) else {
            return Ok(());
        };

        let mut raw = snapshot.termios.clone();
        cfmakeraw(&mut raw);
        raw.local_flags.remove(LocalFlags::ECHO);

        tcsetattr(fd, SetArg::TCSAFLUSH, &raw)
            .map_err(|e| TiiError::Terminal(format!("Failed to set raw mode: {}", e)))?;
        self.raw = true;
        Ok(())
    }

    /// Put the captured attributes back. Later calls do nothing.
    pub fn restore(&mut self) -> Result<()> {
        if !self.raw {
            return Ok(());
        }
        self.raw = false;

        let (Some(fd), Some(snapshot)) = (&self.fd, &self.snapshot) else {
            return Ok(());
        };
        tcsetattr(fd, SetArg::TCSAFLUSH, &snapshot.termios)
            .map_err(|e| TiiError::Terminal(format!("Failed to restore terminal: {}", e)))
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            tracing::warn!(error = %e, "terminal restore failed");
        }
    }
}

fn get_window_size(fd: RawFd) -> Result<Winsize> {
    let mut winsize = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: TIOCGWINSZ fills a winsize struct we own
    if unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as _, &mut winsize) } < 0 {
        return Err(TiiError::Terminal(format!(
            "Failed to get window size: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(winsize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;
    use nix::sys::termios::{InputFlags, OutputFlags};

    fn assert_same_mode(a: &Termios, b: &Termios) {
        assert_eq!(a.input_flags, b.input_flags);
        assert_eq!(a.output_flags, b.output_flags);
        assert_eq!(a.control_flags, b.control_flags);
        assert_eq!(a.local_flags, b.local_flags);
    }

    #[test]
    fn test_regular_file_is_not_interactive() {
        let file = tempfile::tempfile().unwrap();
        let mut guard = TerminalGuard::capture(&file).unwrap();
        assert!(!guard.is_interactive());
        assert!(guard.enter_raw().is_ok());
        assert!(guard.restore().is_ok());
    }

    #[test]
    fn test_capture_reads_window_size() {
        let size = Winsize {
            ws_row: 33,
            ws_col: 101,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(&size, None).unwrap();
        let guard = TerminalGuard::capture(&pty.slave).unwrap();

        let snapshot = guard.snapshot().unwrap();
        assert_eq!(snapshot.window_size.ws_row, 33);
        assert_eq!(snapshot.window_size.ws_col, 101);
    }

    #[test]
    fn test_raw_mode_and_restore() {
        let pty = openpty(None, None).unwrap();
        let before = tcgetattr(&pty.slave).unwrap();

        let mut guard = TerminalGuard::capture(&pty.slave).unwrap();
        guard.enter_raw().unwrap();

        let raw = tcgetattr(&pty.slave).unwrap();
        assert!(!raw.local_flags.contains(LocalFlags::ECHO));
        assert!(!raw.local_flags.contains(LocalFlags::ICANON));
        assert!(!raw.input_flags.contains(InputFlags::ICRNL));
        assert!(!raw.output_flags.contains(OutputFlags::OPOST));

        guard.restore().unwrap();
        assert_same_mode(&tcgetattr(&pty.slave).unwrap(), &before);
    }

    #[test]
    fn test_drop_restores() {
        let pty = openpty(None, None).unwrap();
        let before = tcgetattr(&pty.slave).unwrap();

        {
            let mut guard = TerminalGuard::capture(&pty.slave).unwrap();
            guard.enter_raw().unwrap();
        }

        assert_same_mode(&tcgetattr(&pty.slave).unwrap(), &before);
    }

    #[test]
    fn test_restore_runs_once() {
        let pty = openpty(None, None).unwrap();
        let mut guard = TerminalGuard::capture(&pty.slave).unwrap();
        guard.enter_raw().unwrap();
        guard.restore().unwrap();

        // Someone else changes the mode after we are done; a second restore
        // must not clobber it.
        let mut changed = tcgetattr(&pty.slave).unwrap();
        changed.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(&pty.slave, SetArg::TCSANOW, &changed).unwrap();

        guard.restore().unwrap();
        drop(guard);
        let after = tcgetattr(&pty.slave).unwrap();
        assert!(!after.local_flags.contains(LocalFlags::ECHO));
    }
}
