//! Persistent per-container state.
//!
//! Every subcommand after `create` finds the container again through the
//! state document at `<root>/<container-id>/state.json`. The document is
//! rewritten atomically on every status change and removed on final cleanup.

use anyhow::{bail, Context, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters, Setters};
use log::debug;
use nix::{sys::signal::kill, unistd::Pid};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use strum::{Display, EnumString};

/// Name of the state document below the container runtime directory.
pub const STATE_FILE: &str = "state.json";

/// Status of a container.
#[derive(
    Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The VM is forked but paused; the workload has not started.
    Created,

    /// The VM is executing the workload.
    Running,

    /// The VM is paused via the hypervisor control socket.
    Paused,

    /// A stop has been requested but not yet confirmed.
    Stopping,

    /// The workload has exited or was killed.
    Stopped,
}

impl Default for Status {
    fn default() -> Self {
        Status::Created
    }
}

impl Status {
    /// Width of the longest status string, used for table formatting.
    pub fn max_len() -> usize {
        ["created", "running", "paused", "stopping", "stopped"]
            .iter()
            .map(|s| s.len())
            .max()
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// A mount applied on behalf of the container, with enough detail to undo it.
pub struct StateMount {
    #[getset(get = "pub")]
    /// Absolute host path the mount was applied to.
    destination: PathBuf,

    #[getset(get = "pub")]
    #[serde(
        default,
        rename = "directoryCreated",
        skip_serializing_if = "Option::is_none"
    )]
    /// First parent directory created for the mount, removed on cleanup.
    directory_created: Option<PathBuf>,

    #[getset(get = "pub")]
    #[serde(rename = "mountDir")]
    /// Guest-relative mount destination from the OCI configuration.
    mount_dir: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, rename = "hostPath", skip_serializing_if = "Option::is_none")]
    /// Randomized name below the shared workloads directory (volumes only).
    host_path: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Builder, Getters, Setters, CopyGetters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
/// The VM half of the state document.
pub struct VmState {
    #[getset(get = "pub")]
    /// Full path to the hypervisor binary.
    hypervisor_path: PathBuf,

    #[getset(get = "pub")]
    /// Full path to the guest root image.
    image_path: PathBuf,

    #[getset(get = "pub")]
    /// Full path to the guest kernel.
    kernel_path: PathBuf,

    #[getset(get = "pub")]
    /// Full path to the in-guest workload script (below the rootfs).
    workload_path: PathBuf,

    #[getset(get = "pub")]
    #[serde(default)]
    /// Extra kernel parameters.
    kernel_params: String,

    #[getset(get_copy = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Pid of the (possibly still paused) hypervisor process. The top-level
    /// `pid` field belongs to the shim; this one lets `start` deliver the
    /// continue signal from a fresh process.
    pid: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Builder, Getters, CopyGetters, Setters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// The on-disk state document.
pub struct State {
    #[getset(get = "pub")]
    #[serde(rename = "ociVersion")]
    /// OCI specification version the bundle complies with.
    oci_version: String,

    #[getset(get = "pub")]
    /// Container id the state belongs to.
    id: String,

    #[getset(get_copy = "pub", set = "pub")]
    /// Pid of the shim, the process the orchestrator waits on.
    pid: i32,

    #[getset(get = "pub")]
    #[serde(rename = "bundlePath")]
    /// Path to the bundle the container was created from.
    bundle_path: PathBuf,

    #[getset(get = "pub")]
    #[serde(rename = "commsPath")]
    /// Path to the hypervisor control socket.
    comms_path: PathBuf,

    #[getset(get = "pub")]
    #[serde(rename = "processSocketPath")]
    /// Path to the socket whose closure signals VM shutdown.
    process_socket_path: PathBuf,

    #[getset(get_copy = "pub", set = "pub")]
    /// Current container status.
    status: Status,

    #[getset(get = "pub")]
    /// ISO-8601 creation timestamp (UTC, microsecond precision).
    created: String,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Console device or socket path.
    console: Option<PathBuf>,

    #[getset(get_copy = "pub")]
    #[serde(default, rename = "useSocketConsole")]
    /// Whether `console` refers to a Unix socket rather than a pty.
    use_socket_console: bool,

    #[getset(get = "pub")]
    #[serde(default)]
    /// Mounts applied at create time, consulted for cleanup.
    mounts: Vec<StateMount>,

    #[getset(get = "pub")]
    #[serde(default)]
    /// Annotations from the OCI configuration.
    annotations: HashMap<String, String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// VM details, absent for pod member containers.
    vm: Option<VmState>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            oci_version: crate::config::SUPPORTED_SPEC_VERSION.into(),
            id: String::new(),
            pid: 0,
            bundle_path: PathBuf::new(),
            comms_path: PathBuf::new(),
            process_socket_path: PathBuf::new(),
            status: Status::Created,
            created: String::new(),
            console: None,
            use_socket_console: false,
            mounts: Vec::new(),
            annotations: HashMap::new(),
            vm: None,
        }
    }
}

impl State {
    /// Full path to the state file below `runtime_path`.
    pub fn file_path(runtime_path: &Path) -> PathBuf {
        runtime_path.join(STATE_FILE)
    }

    /// Atomically write the state document below `runtime_path`.
    ///
    /// The document is first written to a temporary sibling and then renamed
    /// over the final path, so readers either see the old or the new state.
    pub fn write(&self, runtime_path: &Path) -> Result<()> {
        let path = Self::file_path(runtime_path);
        let tmp = runtime_path.join(format!("{}.tmp", STATE_FILE));

        let data = serde_json::to_vec_pretty(self).context("serialize state")?;
        fs::write(&tmp, data)
            .with_context(|| format!("write temporary state file {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename state file into place {}", path.display()))?;

        debug!("wrote state file {} (status {})", path.display(), self.status);
        Ok(())
    }

    /// Read the state document from below `runtime_path`.
    pub fn read(runtime_path: &Path) -> Result<Self> {
        let path = Self::file_path(runtime_path);
        let data = fs::read(&path)
            .with_context(|| format!("read state file {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("parse state file {}", path.display()))
    }

    /// Remove the state document. Missing files are not an error.
    pub fn delete(runtime_path: &Path) -> Result<()> {
        let path = Self::file_path(runtime_path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete state file {}", path.display())),
        }
    }

    /// Whether a state document exists below `runtime_path`.
    pub fn exists(runtime_path: &Path) -> bool {
        Self::file_path(runtime_path).exists()
    }

    /// Whether the recorded workload process is still alive.
    pub fn workload_alive(&self) -> bool {
        pid_alive(self.pid)
    }

    /// The status to report to callers: a dead workload is always `Stopped`,
    /// whatever the document says.
    pub fn effective_status(&self) -> Status {
        if self.workload_alive() {
            self.status
        } else {
            Status::Stopped
        }
    }
}

/// Probe a pid with the null signal.
pub fn pid_alive(pid: i32) -> bool {
    pid > 0 && kill(Pid::from_raw(pid), None).is_ok()
}

/// Create an ISO-8601 UTC timestamp with microsecond precision.
pub fn iso8601_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

/// Write the pid file the container engine polls for.
pub fn create_pidfile(path: &Path, pid: i32) -> Result<()> {
    if pid <= 0 {
        bail!("refusing to write invalid pid {} to {}", pid, path.display());
    }
    fs::write(path, pid.to_string())
        .with_context(|| format!("write pid file {}", path.display()))
}
