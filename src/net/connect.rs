use std::iter::Peekable;
use std::net::{SocketAddrV4, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd};
use std::thread;
use std::time::Duration;

use nix::sys::socket::{connect, setsockopt, sockopt, SockaddrIn};

use super::{new_stream_socket, DEFAULT_BACKOFF_CAP, DEFAULT_BACKOFF_INITIAL};
use crate::config::Endpoint;
use crate::error::{Result, TiiError};

/// Exponential backoff schedule for connection attempts.
///
/// Yields one delay per attempt, starting at `initial` and doubling until the
/// next value would exceed `cap`. The first attempt is always yielded, so a
/// schedule never produces zero attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Option<Duration>,
    cap: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Backoff {
            next: Some(initial),
            cap,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_CAP)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next.take()?;
        let doubled = current.saturating_mul(2);
        if doubled <= self.cap && !doubled.is_zero() {
            self.next = Some(doubled);
        }
        Some(current)
    }
}

/// Connect to the first reachable candidate of `endpoint`.
///
/// Every candidate gets the full backoff schedule. A fresh socket is used per
/// attempt, with `SO_KEEPALIVE` set before connecting.
pub fn connect_with_backoff(endpoint: &Endpoint, backoff: &Backoff) -> Result<TcpStream> {
    let candidates = endpoint.resolve()?;

    for candidate in candidates {
        match connect_candidate(candidate, backoff.clone().peekable()) {
            Ok(stream) => {
                tracing::info!(%candidate, "connected");
                return Ok(stream);
            }
            Err(e) => {
                eprintln!("connect {}: {}", candidate, e);
            }
        }
    }

    Err(TiiError::Connect {
        addr: endpoint.to_string(),
    })
}

fn connect_candidate(
    candidate: SocketAddrV4,
    mut delays: Peekable<Backoff>,
) -> std::result::Result<TcpStream, nix::Error> {
    let mut last_error = nix::Error::ECONNREFUSED;

    while let Some(delay) = delays.next() {
        match try_connect(candidate) {
            Ok(fd) => return Ok(TcpStream::from(fd)),
            Err(e) => {
                tracing::debug!(%candidate, error = %e, "connect attempt failed");
                last_error = e;
            }
        }

        if delays.peek().is_some() {
            thread::sleep(delay);
        }
    }

    Err(last_error)
}

fn try_connect(candidate: SocketAddrV4) -> std::result::Result<OwnedFd, nix::Error> {
    let fd = new_stream_socket()?;
    setsockopt(&fd, sockopt::KeepAlive, &true)?;
    connect(fd.as_raw_fd(), &SockaddrIn::from(candidate))?;
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn test_default_schedule() {
        let delays: Vec<u64> = Backoff::default().map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4]);
    }

    #[test]
    fn test_delays_double_and_respect_cap() {
        let cap = Duration::from_millis(1000);
        let delays: Vec<Duration> = Backoff::new(Duration::from_millis(10), cap).collect();

        assert!(!delays.is_empty());
        for pair in delays.windows(2) {
            assert_eq!(pair[1], pair[0] * 2);
        }
        assert!(delays.iter().all(|d| *d <= cap));
        assert_eq!(delays.last().copied(), Some(Duration::from_millis(640)));
    }

    #[test]
    fn test_initial_above_cap_still_attempts_once() {
        let delays: Vec<Duration> =
            Backoff::new(Duration::from_secs(8), Duration::from_secs(4)).collect();
        assert_eq!(delays, vec![Duration::from_secs(8)]);
    }

    #[test]
    fn test_zero_initial_terminates() {
        let delays: Vec<Duration> = Backoff::new(Duration::ZERO, Duration::from_secs(4)).collect();
        assert_eq!(delays, vec![Duration::ZERO]);
    }

    #[test]
    fn test_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::parse(&format!("127.0.0.1:{}", port)).unwrap();

        let stream = connect_with_backoff(&endpoint, &Backoff::default()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        assert_eq!(stream.local_addr().unwrap(), accepted.peer_addr().unwrap());
        assert!(nix::sys::socket::getsockopt(&stream, sockopt::KeepAlive).unwrap());
    }

    #[test]
    fn test_connect_gives_up_within_bound() {
        // Grab a free port and release it so nothing is listening there.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = Endpoint::parse(&format!("127.0.0.1:{}", port)).unwrap();
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(40));

        let started = Instant::now();
        let err = connect_with_backoff(&endpoint, &backoff).unwrap_err();

        assert!(matches!(err, TiiError::Connect { .. }));
        assert!(err.to_string().contains(&format!("127.0.0.1:{}", port)));
        // Sleeps of 10ms and 20ms between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
