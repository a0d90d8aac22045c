//! Command line definitions, shaped after the OCI runtime CLI convention.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nix::sys::signal::Signal;
use std::{convert::TryFrom, path::PathBuf};

#[derive(Parser, Debug)]
#[clap(
    name = "virtc",
    version,
    about = "OCI-compatible container runtime backed by lightweight virtual machines"
)]
pub struct Cli {
    #[clap(long, value_name = "DIR", default_value = "/run/virtc/containers")]
    /// Root directory for storage of container state
    pub root: PathBuf,

    #[clap(long, value_name = "PATH")]
    /// Log file path; stderr when omitted
    pub log: Option<PathBuf>,

    #[clap(long, value_name = "FORMAT", default_value = "text")]
    /// Log format, 'text' or 'json'
    pub log_format: String,

    #[clap(long)]
    /// Enable debug output
    pub debug: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a container, leaving the VM paused
    Create {
        #[clap(long, short, value_name = "DIR")]
        /// Path to the bundle directory
        bundle: PathBuf,

        #[clap(long, value_name = "PATH")]
        /// Console device to use
        console: Option<PathBuf>,

        #[clap(long, value_name = "PATH")]
        /// File to write the workload pid to
        pid_file: Option<PathBuf>,

        #[clap(long)]
        /// Prepare everything but do not launch the VM
        dry_run: bool,

        /// Container id
        container_id: String,
    },

    /// Let a created container run its workload
    Start {
        #[clap(long, short)]
        /// Do not wait for the workload to finish
        detach: bool,

        /// Container id
        container_id: String,
    },

    /// Create and start in one step
    Run {
        #[clap(long, short, value_name = "DIR")]
        /// Path to the bundle directory
        bundle: PathBuf,

        #[clap(long, value_name = "PATH")]
        /// Console device to use
        console: Option<PathBuf>,

        #[clap(long, value_name = "PATH")]
        /// File to write the workload pid to
        pid_file: Option<PathBuf>,

        #[clap(long, short)]
        /// Do not wait for the workload to finish
        detach: bool,

        #[clap(long)]
        /// Prepare everything but do not launch the VM
        dry_run: bool,

        /// Container id
        container_id: String,
    },

    /// Stop the VM and clean the container up
    Stop {
        /// Container id
        container_id: String,
    },

    /// Send a signal to the workload
    Kill {
        /// Container id
        container_id: String,

        /// Signal name or number (default: SIGTERM)
        signal: Option<String>,
    },

    /// Delete any resources held by the container
    Delete {
        /// Container id
        container_id: String,
    },

    /// Output the state of a container
    State {
        /// Container id
        container_id: String,
    },

    /// List containers known to the runtime
    List {
        #[clap(long, value_name = "FORMAT", default_value = "table")]
        /// Output format, 'table' or 'json'
        format: String,

        #[clap(long)]
        /// Also show hypervisor, kernel and image details
        all: bool,

        #[clap(long, short)]
        /// Show container ids only
        quiet: bool,
    },

    /// Execute a new process inside the container
    Exec {
        /// Container id
        container_id: String,

        /// Command and arguments to run
        #[clap(required = true)]
        args: Vec<String>,
    },

    /// Suspend all processes inside the container
    Pause {
        /// Container id
        container_id: String,
    },

    /// Resume a previously paused container
    Resume {
        /// Container id
        container_id: String,
    },

    /// Attach to the container console
    Attach {
        /// Container id
        container_id: String,
    },

    /// Display the processes running inside a container
    Ps {
        /// Container id
        container_id: String,

        /// Options passed to ps
        ps_args: Vec<String>,
    },

    /// Display container events (not supported)
    Events {
        /// Container id
        container_id: String,
    },

    /// Update container resources (not supported)
    Update {
        /// Container id
        container_id: String,
    },

    /// Checkpoint a running container (not supported)
    Checkpoint {
        /// Container id
        container_id: String,
    },

    /// Restore a container from a checkpoint (not supported)
    Restore {
        /// Container id
        container_id: String,
    },

    /// Print version information
    Version,
}

/// Parse a signal argument: a number, a bare name or a SIG-prefixed name.
/// Absent input means SIGTERM.
pub fn parse_signal(signal: Option<&str>) -> Result<Signal> {
    let signal = match signal {
        None => return Ok(Signal::SIGTERM),
        Some(s) => s,
    };

    if let Ok(num) = signal.parse::<i32>() {
        return Signal::try_from(num).with_context(|| format!("invalid signal number {}", num));
    }

    let name = signal.to_uppercase();
    let name = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{}", name)
    };

    for candidate in Signal::iterator() {
        if candidate.as_str() == name {
            return Ok(candidate);
        }
    }
    bail!("invalid signal name {}", signal)
}
