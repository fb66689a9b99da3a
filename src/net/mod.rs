// Connection setup: active connect for the client, single-accept for the server
mod connect;
mod listen;

use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};

pub use connect::{connect_with_backoff, Backoff};
pub use listen::{bind_single, SingleListener};

pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(4);

/// New IPv4 stream socket that is not inherited across exec.
fn new_stream_socket() -> nix::Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )?;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(fd)
}
