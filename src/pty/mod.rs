// PTY allocation and the child process attached to it
mod spawn;


pub use spawn::{ChildOutcome, PtyChild, PtySession, EXEC_FAILURE_STATUS, REAP_GRACE};
