pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod net;
pub mod pty;
pub mod relay;
pub mod session;
pub mod terminal;


pub use config::Endpoint;
pub use error::{Result, TiiError};
pub use net::Backoff;
pub use pty::{ChildOutcome, PtySession};
pub use relay::{Ending, Relay};
pub use terminal::TerminalGuard;
