//! Serde model of the OCI runtime configuration document.
//!
//! Only the portions this runtime consumes are modeled: the workload process,
//! the root filesystem, mounts, hooks, annotations, Linux namespaces and the
//! virtual-machine block. Unknown fields are ignored on load so newer bundles
//! keep parsing.

use anyhow::{Context, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
};

/// Name of the OCI configuration file inside a bundle.
pub const CONFIG_FILE: &str = "config.json";

/// Name of the optional VM configuration override inside a bundle.
pub const VM_CONFIG_FILE: &str = "vm.json";

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Spec is the base configuration for the container.
pub struct Spec {
    #[getset(get = "pub")]
    #[serde(rename = "ociVersion")]
    /// Version of the Open Container Initiative Runtime Specification with
    /// which the bundle complies.
    version: String,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Process configures the container process.
    process: Option<Process>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Root configures the container's root filesystem.
    root: Option<Root>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Hostname configures the container's hostname.
    hostname: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Mounts configures additional mounts (on top of Root).
    mounts: Option<Vec<Mount>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Hooks configures callbacks for container lifecycle events.
    hooks: Option<Hooks>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Annotations contains arbitrary metadata for the container.
    annotations: Option<HashMap<String, String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Linux is platform-specific configuration for Linux based containers.
    linux: Option<Linux>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// VM specifies configuration for virtual-machine-based containers.
    vm: Option<Vm>,
}

impl Default for Spec {
    fn default() -> Self {
        Self {
            version: "1.0.2".into(),
            process: None,
            root: None,
            hostname: None,
            mounts: None,
            hooks: None,
            annotations: None,
            linux: None,
            vm: None,
        }
    }
}

impl Spec {
    /// Load a new spec from the provided file `Path`.
    pub fn from(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open file {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("deserialize OCI spec from file {}", path.display()))
    }

    /// Save the loaded spec into the provided file `Path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file =
            File::create(path).with_context(|| format!("create file {}", path.display()))?;
        serde_json::to_writer(&mut file, self)
            .with_context(|| format!("serialize OCI spec to file {}", path.display()))
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug, Default, Builder, Getters, CopyGetters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Process contains information to start a specific application inside the
/// container.
pub struct Process {
    #[getset(get_copy = "pub")]
    #[serde(default)]
    /// Terminal creates an interactive terminal for the container.
    terminal: bool,

    #[getset(get = "pub")]
    #[serde(default)]
    /// User specifies user information for the process.
    user: User,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Args specifies the binary and arguments for the application to
    /// execute.
    args: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Env populates the process environment for the process.
    env: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default)]
    /// Cwd is the current working directory for the process and must be
    /// relative to the container's root.
    cwd: String,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug, Default, Builder, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// User specifies specific user (and group) information for the container
/// process.
pub struct User {
    #[getset(get_copy = "pub")]
    #[serde(default)]
    /// UID is the user id.
    uid: u32,

    #[getset(get_copy = "pub")]
    #[serde(default)]
    /// GID is the group id.
    gid: u32,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "additionalGids"
    )]
    /// AdditionalGids are additional group ids set for the container's
    /// process.
    additional_gids: Option<Vec<u32>>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug, Default, Builder, Getters, CopyGetters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Root contains information about the container's root filesystem on the
/// host.
pub struct Root {
    #[getset(get = "pub")]
    #[serde(default)]
    /// Path is the absolute path to the container's root filesystem.
    path: PathBuf,

    #[getset(get_copy = "pub")]
    #[serde(default)]
    /// Readonly makes the root filesystem for the container readonly before
    /// the process is executed.
    readonly: bool,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Mount specifies a mount for a container.
pub struct Mount {
    #[getset(get = "pub")]
    /// Destination is the absolute path where the mount will be placed in
    /// the container.
    destination: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    /// Type specifies the mount kind.
    typ: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Source specifies the source path of the mount.
    source: Option<PathBuf>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Options are fstab style mount options.
    options: Option<Vec<String>>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Hook specifies a command that is run at a particular event in the
/// lifecycle of a container.
pub struct Hook {
    #[getset(get = "pub")]
    /// Path to the binary to execute.
    path: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Args are the arguments passed to the hook. The first element may
    /// differ from `path` so hooks can inspect their own invocation name.
    args: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Env is the environment of the hook process.
    env: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Timeout is the number of seconds before aborting the hook.
    timeout: Option<i64>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Hooks specifies a command that is run in the container at a particular
/// event in the lifecycle of a container.
pub struct Hooks {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Prestart is a list of hooks to be run before the container process is
    /// executed.
    prestart: Option<Vec<Hook>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Poststart is a list of hooks to be run after the container process is
    /// started.
    poststart: Option<Vec<Hook>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Poststop is a list of hooks to be run after the container process
    /// exits.
    poststop: Option<Vec<Hook>>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Linux contains platform-specific configuration for Linux based
/// containers.
pub struct Linux {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Namespaces contains the namespaces that are created and/or joined by
    /// the container.
    namespaces: Option<Vec<LinuxNamespace>>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxNamespace is the configuration for a Linux namespace.
pub struct LinuxNamespace {
    #[getset(get = "pub")]
    #[serde(rename = "type")]
    /// Type is the type of namespace.
    typ: String,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Path is a path to an existing namespace persisted on disk that can be
    /// joined and is of the same type.
    path: Option<PathBuf>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Vm contains information for virtual-machine-based containers.
pub struct Vm {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Hypervisor specifies hypervisor-related configuration.
    hypervisor: Option<VmHypervisor>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Kernel specifies kernel-related configuration.
    kernel: Option<VmKernel>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Image specifies guest image related configuration.
    image: Option<VmImage>,
}

impl Vm {
    /// Load a VM configuration from a standalone `vm.json` file.
    pub fn from(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open file {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("deserialize VM config from file {}", path.display()))
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// VmHypervisor contains information about the hypervisor to use.
pub struct VmHypervisor {
    #[getset(get = "pub")]
    /// Path is the host path to the hypervisor binary.
    path: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Parameters specifies parameters to pass to the hypervisor.
    parameters: Option<Vec<String>>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// VmKernel contains information about the kernel to boot the VM with.
pub struct VmKernel {
    #[getset(get = "pub")]
    /// Path is the host path to the kernel image.
    path: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Parameters specifies extra parameters to pass to the kernel.
    parameters: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// InitRD is the host path to an initial ramdisk.
    initrd: Option<PathBuf>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// VmImage contains information about the root disk image of the VM.
pub struct VmImage {
    #[getset(get = "pub")]
    /// Path is the host path to the root image.
    path: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Format is the format of the root image.
    format: Option<String>,
}

/// Get the path of the configuration file below a bundle path.
pub fn config_file_path(bundle_path: &Path) -> PathBuf {
    bundle_path.join(CONFIG_FILE)
}
