use tii::session::run_server;

use super::resolve_endpoint;

/// Serves a single client with `command` running on a pty
pub fn handle_serve(addr: Option<String>, command: &[String]) -> i32 {
    let result = resolve_endpoint(addr).and_then(|endpoint| run_server(&endpoint, command));

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("tii: {}", e);
            e.exit_code()
        }
    }
}
