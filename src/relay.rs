use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{tcgetattr, LocalFlags, SpecialCharacterIndices};

use crate::cancel::CancelWatch;
use crate::error::{Result, TiiError};

/// Bytes moved per read on any descriptor.
pub const DEFAULT_BUFFER_SIZE: usize = 16384;

/// Anything the relay can wait on and read from.
pub trait Source: Read + AsFd {}
impl<T: Read + AsFd> Source for T {}

/// A descriptor the relay both reads from and writes to.
pub trait Channel: Read + Write + AsFd {}
impl<T: Read + Write + AsFd> Channel for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Running,
    /// Stdin reached end-of-file; the other descriptors are still serviced.
    StdinClosed,
    Terminated,
}

/// Why the relay loop stopped.
#[derive(Debug)]
pub enum Ending {
    /// The network peer closed the connection.
    PeerClosed,
    /// The pty slave side went away, usually because the child exited.
    ChildHungUp,
    /// A termination signal arrived.
    Cancelled,
    Failed(TiiError),
}

#[derive(Debug, Default)]
struct Readiness {
    cancel: bool,
    network: bool,
    input: bool,
    pty: bool,
}

/// Byte pump between the network and the local side of a session.
///
/// On the client, stdin goes to the network and the network goes to
/// `output`. On the server, both the network and stdin feed the pty master,
/// and whatever the pty produces is copied to the network and to `output`.
pub struct Relay {
    network: Box<dyn Channel>,
    input: Option<Box<dyn Source>>,
    pty: Option<Box<dyn Channel>>,
    output: Box<dyn Write>,
    cancel: Option<CancelWatch>,
    state: RelayState,
    buffer: Vec<u8>,
}

impl Relay {
    pub fn client(
        network: impl Channel + 'static,
        input: impl Source + 'static,
        output: impl Write + 'static,
    ) -> Self {
        Relay {
            network: Box::new(network),
            input: Some(Box::new(input)),
            pty: None,
            output: Box::new(output),
            cancel: None,
            state: RelayState::Running,
            buffer: vec![0u8; DEFAULT_BUFFER_SIZE],
        }
    }

    pub fn server(
        network: impl Channel + 'static,
        pty_master: impl Channel + 'static,
        input: impl Source + 'static,
        output: impl Write + 'static,
    ) -> Self {
        let mut relay = Self::client(network, input, output);
        relay.pty = Some(Box::new(pty_master));
        relay
    }

    /// Stop the loop as soon as `watch` becomes readable.
    pub fn with_cancel(mut self, watch: CancelWatch) -> Self {
        self.cancel = Some(watch);
        self
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Run until the peer closes, the child hangs up, a signal arrives or an
    /// I/O error occurs.
    pub fn run(&mut self) -> Ending {
        if self.state == RelayState::Terminated {
            return Ending::Failed(TiiError::Relay("relay already terminated".to_string()));
        }

        let ending = loop {
            match self.step() {
                Ok(None) => continue,
                Ok(Some(ending)) => break ending,
                Err(e) => break Ending::Failed(e),
            }
        };

        self.state = RelayState::Terminated;
        tracing::debug!(?ending, "relay finished");
        ending
    }

    fn step(&mut self) -> Result<Option<Ending>> {
        let ready = self.wait()?;

        if ready.cancel {
            return Ok(Some(Ending::Cancelled));
        }
        if ready.network {
            if let Some(ending) = self.service_network()? {
                return Ok(Some(ending));
            }
        }
        if ready.input {
            self.service_input()?;
        }
        if ready.pty {
            if let Some(ending) = self.service_pty()? {
                return Ok(Some(ending));
            }
        }
        Ok(None)
    }

    /// Block until at least one monitored descriptor is ready.
    fn wait(&self) -> Result<Readiness> {
        let mut fds = Vec::with_capacity(4);
        let network_at = slot(&mut fds, self.network.as_fd());
        let input_at = match &self.input {
            Some(input) => slot(&mut fds, input.as_fd()),
            None => None,
        };
        let pty_at = match &self.pty {
            Some(pty) => slot(&mut fds, pty.as_fd()),
            None => None,
        };
        let cancel_at = match &self.cancel {
            Some(watch) => slot(&mut fds, watch.as_fd()),
            None => None,
        };

        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(TiiError::Relay(format!("poll: {}", e))),
            }
        }

        // Hang-ups and errors are reported by the read that follows
        let wanted =
            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;
        let is_ready = |at: Option<usize>| {
            at.and_then(|i| fds[i].revents())
                .is_some_and(|revents| revents.intersects(wanted))
        };

        Ok(Readiness {
            cancel: is_ready(cancel_at),
            network: is_ready(network_at),
            input: is_ready(input_at),
            pty: is_ready(pty_at),
        })
    }

    fn service_network(&mut self) -> Result<Option<Ending>> {
        let n = read_retrying(&mut *self.network, &mut self.buffer)
            .map_err(|e| TiiError::Relay(format!("network read: {}", e)))?;
        if n == 0 {
            return Ok(Some(Ending::PeerClosed));
        }

        let data = &self.buffer[..n];
        match &mut self.pty {
            Some(pty) => pty
                .write_all(data)
                .map_err(|e| TiiError::Relay(format!("pty write: {}", e)))?,
            None => {
                self.output
                    .write_all(data)
                    .and_then(|_| self.output.flush())
                    .map_err(|e| TiiError::Relay(format!("output write: {}", e)))?;
            }
        }
        Ok(None)
    }

    fn service_input(&mut self) -> Result<()> {
        let Some(input) = self.input.as_mut() else {
            return Ok(());
        };

        let n = read_retrying(&mut **input, &mut self.buffer)
            .map_err(|e| TiiError::Relay(format!("stdin read: {}", e)))?;
        if n == 0 {
            return self.close_input();
        }

        let data = &self.buffer[..n];
        let forwarded = match &mut self.pty {
            Some(pty) => pty.write_all(data),
            None => self.network.write_all(data),
        };
        forwarded.map_err(|e| TiiError::Relay(format!("stdin forward: {}", e)))
    }

    /// Stdin hit end-of-file: stop watching it for good. A pty in canonical
    /// mode gets its EOF character so the child's pending read returns.
    fn close_input(&mut self) -> Result<()> {
        self.input = None;
        self.state = RelayState::StdinClosed;
        tracing::debug!("stdin closed");

        let Some(pty) = self.pty.as_mut() else {
            return Ok(());
        };
        let Ok(termios) = tcgetattr(pty.as_fd()) else {
            return Ok(());
        };
        if termios.local_flags.contains(LocalFlags::ICANON) {
            let eof = termios.control_chars[SpecialCharacterIndices::VEOF as usize];
            pty.write_all(&[eof])
                .map_err(|e| TiiError::Relay(format!("pty write: {}", e)))?;
        }
        Ok(())
    }

    fn service_pty(&mut self) -> Result<Option<Ending>> {
        let Some(pty) = self.pty.as_mut() else {
            return Ok(None);
        };

        let n = match read_retrying(&mut **pty, &mut self.buffer) {
            Ok(0) => return Ok(Some(Ending::ChildHungUp)),
            Ok(n) => n,
            // Linux reports a closed slave side as EIO on the master
            Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                return Ok(Some(Ending::ChildHungUp))
            }
            Err(e) => return Err(TiiError::Relay(format!("pty read: {}", e))),
        };

        let data = &self.buffer[..n];
        self.output
            .write_all(data)
            .and_then(|_| self.output.flush())
            .map_err(|e| TiiError::Relay(format!("output write: {}", e)))?;
        self.network
            .write_all(data)
            .map_err(|e| TiiError::Relay(format!("network write: {}", e)))?;
        Ok(None)
    }
}

fn slot<'fd>(fds: &mut Vec<PollFd<'fd>>, fd: BorrowedFd<'fd>) -> Option<usize> {
    fds.push(PollFd::new(fd, PollFlags::POLLIN));
    Some(fds.len() - 1)
}

fn read_retrying<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match source.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}
