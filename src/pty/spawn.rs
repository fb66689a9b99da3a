use std::ffi::CString;
use std::ptr;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::openpty;
use nix::errno::Errno;
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, fork, getpid, getppid, setsid, ForkResult, Pid};

use crate::error::{Result, TiiError};
use crate::terminal::TerminalSnapshot;

/// How long shutdown waits for a child that is already on its way out.
pub const REAP_GRACE: Duration = Duration::from_millis(200);
const REAP_POLL: Duration = Duration::from_millis(10);

/// Status the child exits with when exec fails.
pub const EXEC_FAILURE_STATUS: i32 = 1;

/// A program running on the slave side of a fresh pty.
pub struct PtySession {
    pub master: File,
    pub child: PtyChild,
}

/// Wait/kill handle for the child. The relay never sees the pid.
#[derive(Debug)]
pub struct PtyChild {
    pid: Pid,
    program: String,
    reaped: bool,
}

/// How the child ended, as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    Exited(i32),
    Signaled(Signal),
    /// Still running at shutdown and killed by us.
    Killed,
}

impl ChildOutcome {
    /// Exit status for the server process.
    pub fn exit_code(&self) -> i32 {
        match self {
            ChildOutcome::Exited(code) => *code,
            ChildOutcome::Signaled(signal) => *signal as i32,
            ChildOutcome::Killed => 1,
        }
    }
}

impl PtySession {
    /// Open a pty pair and run `argv` on its slave side.
    ///
    /// With a snapshot the slave starts with the same attributes and window
    /// size as our own terminal, otherwise the system defaults apply.
    pub fn spawn(argv: &[String], snapshot: Option<&TerminalSnapshot>) -> Result<Self> {
        let program = argv
            .first()
            .ok_or_else(|| TiiError::Spawn("no program given".to_string()))?
            .clone();

        // Everything the child needs is allocated before fork
        let args = argv
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TiiError::Spawn(format!("invalid argument: {}", e)))?;
        let mut arg_ptrs: Vec<*const libc::c_char> =
            args.iter().map(|arg| arg.as_ptr()).collect();
        arg_ptrs.push(ptr::null());
        let failure_prefix = format!("tii: {}: ", program).into_bytes();
        let server = getpid();

        let pty = openpty(
            snapshot.map(|s| &s.window_size),
            snapshot.map(|s| &s.termios),
        )
        .map_err(|e| TiiError::Pty(format!("openpty failed: {}", e)))?;
        fcntl(pty.master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;

        match unsafe { fork() }.map_err(|e| TiiError::Spawn(format!("fork failed: {}", e)))? {
            ForkResult::Parent { child } => {
                // Close slave in parent
                drop(pty.slave);
                tracing::info!(pid = child.as_raw(), %program, "spawned child on pty");

                Ok(PtySession {
                    master: File::from(pty.master),
                    child: PtyChild {
                        pid: child,
                        program,
                        reaped: false,
                    },
                })
            }
            ForkResult::Child => {
                exec_on_slave(&pty.master, pty.slave, &arg_ptrs, &failure_prefix, server)
            }
        }
    }
}

/// Child side of the fork. Only returns by exec or by exiting.
fn exec_on_slave(
    master: &OwnedFd,
    slave: OwnedFd,
    args: &[*const libc::c_char],
    failure_prefix: &[u8],
    server: Pid,
) -> ! {
    let _ = close(master.as_raw_fd());
    let slave_fd = slave.as_raw_fd();

    let error = match attach_controlling_terminal(slave_fd).and_then(|()| reset_signals()) {
        Ok(()) => {
            // args is NULL-terminated and backed by CStrings that outlive the call
            unsafe { libc::execvp(args[0], args.as_ptr()) };
            Errno::last()
        }
        Err(e) => e,
    };

    // stderr is the pty by now (or still ours if attaching failed)
    let message = error.desc().as_bytes();
    unsafe {
        libc::write(2, failure_prefix.as_ptr().cast(), failure_prefix.len());
        libc::write(2, message.as_ptr().cast(), message.len());
        libc::write(2, b"\r\n".as_ptr().cast(), 2);
    }

    // Tell the server to shut down instead of waiting on a child that never ran
    if getppid() == server {
        let _ = kill(server, Signal::SIGTERM);
    }
    unsafe { libc::_exit(EXEC_FAILURE_STATUS) }
}

fn attach_controlling_terminal(slave_fd: RawFd) -> nix::Result<()> {
    // Create new session
    setsid()?;

    // Make slave the controlling terminal
    if unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) } < 0 {
        return Err(nix::Error::last());
    }

    // Duplicate slave to stdin/stdout/stderr
    dup2(slave_fd, libc::STDIN_FILENO)?;
    dup2(slave_fd, libc::STDOUT_FILENO)?;
    dup2(slave_fd, libc::STDERR_FILENO)?;

    // Close original slave
    if slave_fd > libc::STDERR_FILENO {
        let _ = close(slave_fd);
    }
    Ok(())
}

// We run with SIGPIPE ignored and exec keeps ignored dispositions
fn reset_signals() -> nix::Result<()> {
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) }.map(drop)
}

impl PtyChild {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Non-blocking check for the child's exit.
    pub fn try_wait(&mut self) -> Result<Option<ChildOutcome>> {
        if self.reaped {
            return Err(TiiError::Spawn("child already reaped".to_string()));
        }

        let outcome = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::Exited(_, code) => Some(ChildOutcome::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ChildOutcome::Signaled(signal)),
            _ => None,
        };
        if outcome.is_some() {
            self.reaped = true;
        }
        Ok(outcome)
    }

    /// Force the child down and reap it.
    pub fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        kill(self.pid, Signal::SIGKILL)
            .map_err(|e| TiiError::Spawn(format!("Failed to kill process: {}", e)))?;
        waitpid(self.pid, None)?;
        self.reaped = true;
        Ok(())
    }

    /// Collect the child's outcome once the relay is done.
    ///
    /// A child that exits within `grace` keeps its own status. One that is
    /// still running afterwards is killed.
    pub fn finish(&mut self, grace: Duration) -> Result<ChildOutcome> {
        let deadline = Instant::now() + grace;
        loop {
            if let Some(outcome) = self.try_wait()? {
                return Ok(outcome);
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(REAP_POLL);
        }

        self.kill()?;
        tracing::info!(pid = self.pid.as_raw(), program = %self.program, "child killed");
        Ok(ChildOutcome::Killed)
    }
}

impl Drop for PtyChild {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.kill();
        }
    }
}
