use std::fs::File;
use std::io;
use std::os::fd::AsFd;

use crate::cancel::{cancel_pair, install_signal_handler};
use crate::config::Endpoint;
use crate::error::{Result, TiiError};
use crate::net::{bind_single, connect_with_backoff, Backoff};
use crate::pty::{ChildOutcome, PtySession, REAP_GRACE};
use crate::relay::{Ending, Relay};
use crate::terminal::TerminalGuard;

/// Run the client half: connect, attach the local terminal, relay until the
/// server goes away. Returns the process exit status.
pub fn run_client(endpoint: &Endpoint, backoff: &Backoff) -> Result<i32> {
    let network = connect_with_backoff(endpoint, backoff)?;

    let mut terminal = TerminalGuard::capture(io::stdin())?;
    let (trigger, watch) = cancel_pair()?;
    install_signal_handler(trigger)?;
    terminal.enter_raw()?;

    let mut relay = Relay::client(network, stdin_handle()?, stdout_handle()?).with_cancel(watch);
    let ending = relay.run();

    terminal.restore()?;
    drop(relay);

    report_failure(&ending);
    Ok(client_exit_code(&ending))
}

/// Run the server half: accept one client, run `argv` on a pty for it and
/// relay until either side ends. Returns the process exit status.
pub fn run_server(endpoint: &Endpoint, argv: &[String]) -> Result<i32> {
    if argv.is_empty() {
        return Err(TiiError::Spawn("no program given".to_string()));
    }

    let listener = bind_single(endpoint)?;
    println!("{}", listener.describe()?);
    let (network, peer) = listener.accept_one()?;

    let mut terminal = TerminalGuard::capture(io::stdin())?;
    // Installed before fork so a child that fails to exec can stop us
    let (trigger, watch) = cancel_pair()?;
    install_signal_handler(trigger)?;

    let PtySession { master, mut child } = PtySession::spawn(argv, terminal.snapshot())?;
    terminal.enter_raw()?;

    let mut relay =
        Relay::server(network, master, stdin_handle()?, stdout_handle()?).with_cancel(watch);
    let ending = relay.run();

    terminal.restore()?;
    let outcome = child.finish(REAP_GRACE)?;
    drop(relay);

    report_failure(&ending);
    if outcome == ChildOutcome::Killed {
        eprintln!(
            "tii: {} (pid {}) was still running after {}; killed it",
            child.program(),
            child.pid(),
            describe_ending(&ending, &peer.to_string())
        );
    }
    // The child's own outcome wins whenever it has one
    Ok(outcome.exit_code())
}

/// Client status: a clean close by the server is success.
pub fn client_exit_code(ending: &Ending) -> i32 {
    match ending {
        Ending::PeerClosed => 0,
        Ending::ChildHungUp => 0,
        Ending::Cancelled => 1,
        Ending::Failed(e) => e.exit_code(),
    }
}

fn report_failure(ending: &Ending) {
    if let Ending::Failed(e) = ending {
        eprintln!("tii: {}", e);
    }
}

fn describe_ending(ending: &Ending, peer: &str) -> String {
    match ending {
        Ending::PeerClosed => format!("{} disconnected", peer),
        Ending::ChildHungUp => "the pty closed".to_string(),
        Ending::Cancelled => "a termination signal".to_string(),
        Ending::Failed(e) => format!("a relay error ({})", e),
    }
}

// Unbuffered handles on the standard streams; the relay polls the fd and
// must not have bytes hidden in a userspace buffer.
fn stdin_handle() -> Result<File> {
    Ok(File::from(io::stdin().as_fd().try_clone_to_owned()?))
}

fn stdout_handle() -> Result<File> {
    Ok(File::from(io::stdout().as_fd().try_clone_to_owned()?))
}
