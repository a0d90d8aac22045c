//! Fatal-error reporting.
//!
//! Subcommands fail with a single diagnostic line; stack traces never
//! reach stderr. The helpers here collapse an error and its context stack
//! into that line and turn it into the process exit code.

use anyhow::Error;
use log::error;

/// Collapse an error stack into one line, outermost context first.
///
/// `create` failing behind a missing kernel image comes out as
/// `"failed to launch VM: kernel image /x/vmlinux does not exist"`.
pub fn chain(err: Error) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        parts.push(cause.to_string());
    }
    parts.join(": ")
}

/// Report a fatal subcommand failure: one short line on stderr, the full
/// chain in the log. Returns the process exit code.
pub fn fatal(err: Error) -> i32 {
    let msg = chain(err);
    error!("{}", msg);
    eprintln!("virtc: {}", msg);
    1
}
