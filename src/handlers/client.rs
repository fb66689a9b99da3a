use std::time::Duration;

use tii::net::{Backoff, DEFAULT_BACKOFF_INITIAL};
use tii::session::run_client;

use super::resolve_endpoint;

/// Connects to the server and relays this terminal until it goes away
pub fn handle_connect(addr: Option<String>, retry_cap: u64) -> i32 {
    let backoff = Backoff::new(DEFAULT_BACKOFF_INITIAL, Duration::from_secs(retry_cap));

    let result = resolve_endpoint(addr).and_then(|endpoint| {
        tracing::debug!(%endpoint, "connecting");
        run_client(&endpoint, &backoff)
    });

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("tii: {}", e);
            e.exit_code()
        }
    }
}
