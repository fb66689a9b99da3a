// Module declarations
pub mod client;
pub mod server;

use tii::{Endpoint, Result};

// Re-export commonly used items for convenience
pub use client::handle_connect;
pub use server::handle_serve;

/// Endpoint from `--addr` if given, otherwise from the environment.
fn resolve_endpoint(addr: Option<String>) -> Result<Endpoint> {
    match addr {
        Some(addr) => Endpoint::parse(&addr),
        None => Endpoint::from_env(),
    }
}
