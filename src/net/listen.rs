use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::socket::{bind, listen, setsockopt, sockopt, Backlog, SockaddrIn};

use super::new_stream_socket;
use crate::config::Endpoint;
use crate::error::{Result, TiiError};

/// A listening socket that hands out exactly one connection.
#[derive(Debug)]
pub struct SingleListener {
    listener: TcpListener,
    endpoint: Endpoint,
}

/// Bind and listen on `endpoint` with a backlog of one.
///
/// An empty or `*` host binds every local IPv4 address. Candidates are tried
/// in resolver order and the first successful bind wins.
pub fn bind_single(endpoint: &Endpoint) -> Result<SingleListener> {
    let candidates = endpoint.resolve()?;
    let mut last_reason = String::from("no candidate address");

    for candidate in candidates {
        let fd = new_stream_socket().map_err(|e| TiiError::Bind {
            addr: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        // Lets a restarted server bind while the old socket sits in TIME_WAIT
        setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(|e| TiiError::Bind {
            addr: candidate.to_string(),
            reason: format!("setsockopt SO_REUSEADDR: {}", e),
        })?;

        if let Err(e) = bind(fd.as_raw_fd(), &SockaddrIn::from(candidate)) {
            tracing::debug!(%candidate, error = %e, "bind failed");
            last_reason = e.to_string();
            continue;
        }

        return start_listening(fd, candidate, endpoint);
    }

    Err(TiiError::Bind {
        addr: endpoint.to_string(),
        reason: last_reason,
    })
}

fn start_listening(
    fd: OwnedFd,
    candidate: SocketAddrV4,
    endpoint: &Endpoint,
) -> Result<SingleListener> {
    let listen_error = |reason: String| TiiError::Listen {
        addr: candidate.to_string(),
        reason,
    };

    let backlog = Backlog::new(1).map_err(|e| listen_error(e.to_string()))?;
    listen(&fd, backlog).map_err(|e| listen_error(e.to_string()))?;

    let listener = TcpListener::from(fd);
    tracing::info!(%candidate, "listening");

    Ok(SingleListener {
        listener,
        endpoint: endpoint.clone(),
    })
}

impl SingleListener {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Human readable description of where we listen, printed at startup.
    pub fn describe(&self) -> Result<String> {
        let local = self.local_addr()?;
        let host = if self.endpoint.is_wildcard() {
            "*"
        } else {
            self.endpoint.host.as_str()
        };
        Ok(format!(
            "Listening on host \"{}\" ({}), port {}",
            host,
            local.ip(),
            local.port()
        ))
    }

    /// Accept one peer and close the listening socket.
    ///
    /// No further client can connect for the rest of the process lifetime.
    pub fn accept_one(self) -> Result<(TcpStream, SocketAddr)> {
        let addr = self.endpoint.to_string();
        let accepted = loop {
            match self.listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(TiiError::Accept {
                        addr,
                        reason: e.to_string(),
                    })
                }
            }
        };
        drop(self.listener);

        tracing::info!(peer = %accepted.1, "accepted connection");
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_specific_host_binds_that_host() {
        let endpoint = Endpoint::parse("127.0.0.1:0").unwrap();
        let listener = bind_single(&endpoint).unwrap();
        let local = listener.local_addr().unwrap();
        assert_eq!(local.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_wildcard_binds_any_address() {
        let endpoint = Endpoint::parse("*:0").unwrap();
        let listener = bind_single(&endpoint).unwrap();
        assert_eq!(listener.local_addr().unwrap().ip(), Ipv4Addr::UNSPECIFIED);
        assert!(listener.describe().unwrap().contains("(0.0.0.0)"));
    }

    #[test]
    fn test_reuse_addr_is_set() {
        let endpoint = Endpoint::parse("127.0.0.1:0").unwrap();
        let listener = bind_single(&endpoint).unwrap();
        assert!(nix::sys::socket::getsockopt(&listener.listener, sockopt::ReuseAddr).unwrap());
    }

    #[test]
    fn test_accept_one_closes_listener() {
        let endpoint = Endpoint::parse("127.0.0.1:0").unwrap();
        let listener = bind_single(&endpoint).unwrap();
        let local = listener.local_addr().unwrap();

        let client = TcpStream::connect(local).unwrap();
        let (server, peer) = listener.accept_one().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
        assert_eq!(server.local_addr().unwrap(), local);

        // The listening socket is gone, so a second connection is refused.
        assert!(TcpStream::connect(local).is_err());
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let endpoint = Endpoint::parse(&format!("127.0.0.1:{}", port)).unwrap();

        let err = bind_single(&endpoint).unwrap_err();
        assert!(matches!(err, TiiError::Bind { .. }));
        assert_eq!(err.exit_code(), crate::error::EXIT_UNAVAILABLE);
    }
}
