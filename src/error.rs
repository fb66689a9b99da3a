use std::io;
use thiserror::Error;

/// Exit status for configuration problems (sysexits `EX_CONFIG`).
pub const EXIT_CONFIG: i32 = 78;
/// Exit status when the connection could not be set up (sysexits `EX_UNAVAILABLE`).
pub const EXIT_UNAVAILABLE: i32 = 69;

#[derive(Error, Debug)]
pub enum TiiError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Could not connect, tried {addr}")]
    Connect { addr: String },

    #[error("Could not bind, tried {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Failed to listen on {addr}: {reason}")]
    Listen { addr: String, reason: String },

    #[error("Failed to accept on {addr}: {reason}")]
    Accept { addr: String, reason: String },

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Terminal error: {0}")]
    Terminal(String),

    #[error("Signal error: {0}")]
    Signal(String),
}

pub type Result<T> = std::result::Result<T, TiiError>;

impl TiiError {
    /// Process exit status reported for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            TiiError::Config(_) => EXIT_CONFIG,
            TiiError::Connect { .. }
            | TiiError::Bind { .. }
            | TiiError::Listen { .. }
            | TiiError::Accept { .. } => EXIT_UNAVAILABLE,
            _ => 1,
        }
    }
}

impl From<nix::Error> for TiiError {
    fn from(err: nix::Error) -> Self {
        TiiError::Pty(err.to_string())
    }
}
