//! Runtime configuration for a single container.
//!
//! `ContainerConfig` is the object every subcommand operates on. `create`
//! builds it fully from the CLI and the bundle; the other subcommands build
//! a partial one and fill in the rest from the state document.

use crate::{
    network::NetConfig,
    oci_spec::{self, Spec, Vm},
    pod::Pod,
    semver,
    state::{State, StateMount, Status, VmState},
};
use anyhow::{bail, Context, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters, MutGetters, Setters};
use log::debug;
use std::{
    cmp::Ordering,
    fs,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};

/// Version of the OCI runtime specification supported by this runtime.
pub const SUPPORTED_SPEC_VERSION: &str = "1.0.2";

/// Directory below which container runtime directories are created.
pub const DEFAULT_ROOT: &str = "/run/virtc/containers";

/// Socket used to control an already running VM.
pub const HYPERVISOR_SOCKET: &str = "hypervisor.sock";

/// Socket used to determine whether the VM is still running.
pub const PROCESS_SOCKET: &str = "process.sock";

/// Socket used as a console device when none is supplied.
pub const CONSOLE_SOCKET: &str = "console.sock";

/// Serial socket the guest agent control channel surfaces on.
pub const AGENT_CTL_SOCKET: &str = "agent-ctl.sock";

/// Serial socket the guest agent I/O channel surfaces on.
pub const AGENT_TTY_SOCKET: &str = "agent-tty.sock";

/// Well-known socket of the proxy daemon.
pub const PROXY_SOCKET: &str = "/run/virtc/proxy.sock";

/// File executed automatically on VM boot by the guest workload service.
pub const WORKLOAD_FILE: &str = ".containerexec";

/// File containing environment variables set inside the VM.
pub const ENV_FILE: &str = ".containerenv";

/// Shell used to interpret the workload file.
pub const WORKLOAD_SHELL: &str = "/bin/sh";

/// Mode for the workload script.
pub const SCRIPT_MODE: u32 = 0o755;

/// Mode for all created directories.
pub const DIR_MODE: u32 = 0o750;

/// Name of the shim binary, resolved through PATH.
pub const SHIM_BINARY: &str = "virtc-shim";

#[derive(Clone, Debug, Default, PartialEq, Builder, Getters, Setters, CopyGetters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// VM launch parameters, resolved from the OCI `vm` block or `vm.json`.
pub struct VmConfig {
    #[getset(get = "pub", set = "pub")]
    /// Full path to the hypervisor binary.
    hypervisor_path: PathBuf,

    #[getset(get = "pub", set = "pub")]
    /// Full path to the guest root image.
    image_path: PathBuf,

    #[getset(get = "pub", set = "pub")]
    /// Full path to the guest kernel.
    kernel_path: PathBuf,

    #[getset(get = "pub", set = "pub")]
    /// Full path to the emitted workload script.
    workload_path: PathBuf,

    #[getset(get = "pub", set = "pub")]
    /// Extra kernel parameters.
    kernel_params: String,

    #[getset(get_copy = "pub", set = "pub")]
    /// Pid of the hypervisor process once forked.
    pid: Option<i32>,
}

impl VmConfig {
    /// Build the launch parameters from the OCI `vm` block.
    pub fn from_spec_vm(vm: &Vm) -> Result<Self> {
        let hypervisor = vm
            .hypervisor()
            .as_ref()
            .context("no hypervisor in VM configuration")?;
        let kernel = vm.kernel().as_ref().context("no kernel in VM configuration")?;
        let image = vm.image().as_ref().context("no image in VM configuration")?;

        let mut params = kernel.parameters().clone().unwrap_or_default();
        if let Some(extra) = hypervisor.parameters() {
            params.extend(extra.clone());
        }

        Ok(Self {
            hypervisor_path: hypervisor.path().clone(),
            image_path: image.path().clone(),
            kernel_path: kernel.path().clone(),
            workload_path: PathBuf::new(),
            kernel_params: params.join(" "),
            pid: None,
        })
    }

    /// Rebuild the launch parameters from a state document.
    pub fn from_state(vm: &VmState) -> Self {
        Self {
            hypervisor_path: vm.hypervisor_path().clone(),
            image_path: vm.image_path().clone(),
            kernel_path: vm.kernel_path().clone(),
            workload_path: vm.workload_path().clone(),
            kernel_params: vm.kernel_params().clone(),
            pid: vm.pid(),
        }
    }

    /// The state-document form of the launch parameters.
    pub fn to_state(&self) -> VmState {
        let mut builder = crate::state::VmStateBuilder::default()
            .hypervisor_path(self.hypervisor_path.clone())
            .image_path(self.image_path.clone())
            .kernel_path(self.kernel_path.clone())
            .workload_path(self.workload_path.clone())
            .kernel_params(self.kernel_params.clone());
        if let Some(pid) = self.pid {
            builder = builder.pid(pid);
        }
        builder.build().unwrap_or_default()
    }
}

#[derive(Debug, Default, Builder, Getters, Setters, CopyGetters, MutGetters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// The main object holding all configuration data for one container.
pub struct ContainerConfig {
    #[getset(get = "pub")]
    /// Container id chosen by the caller.
    container_id: String,

    #[getset(get = "pub", set = "pub")]
    /// Path to the directory containing the OCI bundle.
    bundle_path: Option<PathBuf>,

    #[getset(get = "pub")]
    /// Root directory for runtime state.
    root_dir: PathBuf,

    #[getset(get = "pub")]
    /// Path to write the workload pid to.
    pid_file: Option<PathBuf>,

    #[getset(get = "pub", set = "pub")]
    /// Device or socket to use for console I/O.
    console: Option<PathBuf>,

    #[getset(get_copy = "pub", set = "pub")]
    /// Whether `console` is a socket rather than a pty device.
    use_socket_console: bool,

    #[getset(get_copy = "pub", set = "pub")]
    /// Do not wait for the hypervisor process to finish.
    detached: bool,

    #[getset(get_copy = "pub")]
    /// Prepare everything but do not start the VM.
    dry_run: bool,

    #[getset(get = "pub", get_mut = "pub", set = "pub")]
    /// Parsed OCI configuration.
    spec: Option<Spec>,

    #[getset(get = "pub", get_mut = "pub", set = "pub")]
    /// VM launch parameters.
    vm: Option<VmConfig>,

    #[getset(get = "pub", get_mut = "pub", set = "pub")]
    /// Pod grouping details, present when pod annotations were found.
    pod: Option<Pod>,

    #[getset(get = "pub", set = "pub")]
    /// Discovered network configuration.
    net: NetConfig,

    #[getset(get_copy = "pub", set = "pub")]
    /// Current status, mirrored to the state document.
    status: Status,

    #[getset(get_copy = "pub", set = "pub")]
    /// Pid of the shim once launched.
    workload_pid: i32,

    #[getset(get = "pub", set = "pub")]
    /// Mounts applied at create time.
    mounts: Vec<StateMount>,
}

impl ContainerConfig {
    /// Container-specific directory below the state root.
    pub fn runtime_path(&self) -> PathBuf {
        self.root_dir.join(&self.container_id)
    }

    /// Full path to the state document.
    pub fn state_file_path(&self) -> PathBuf {
        State::file_path(&self.runtime_path())
    }

    /// Full path to the hypervisor control socket.
    pub fn comms_path(&self) -> PathBuf {
        self.runtime_path().join(HYPERVISOR_SOCKET)
    }

    /// Full path to the process liveness socket.
    pub fn procsock_path(&self) -> PathBuf {
        self.runtime_path().join(PROCESS_SOCKET)
    }

    /// Full path to the fallback console socket.
    pub fn console_socket_path(&self) -> PathBuf {
        self.runtime_path().join(CONSOLE_SOCKET)
    }

    /// Full path to the guest agent control serial socket.
    pub fn agent_ctl_path(&self) -> PathBuf {
        self.runtime_path().join(AGENT_CTL_SOCKET)
    }

    /// Full path to the guest agent I/O serial socket.
    pub fn agent_tty_path(&self) -> PathBuf {
        self.runtime_path().join(AGENT_TTY_SOCKET)
    }

    /// Path to the container rootfs, resolved against the bundle when
    /// relative.
    pub fn rootfs_path(&self) -> Result<PathBuf> {
        let spec = self.spec.as_ref().context("no OCI configuration loaded")?;
        let root = spec.root().as_ref().context("no root in OCI configuration")?;
        let path = root.path();

        if path.is_absolute() {
            return Ok(path.clone());
        }

        let bundle = self
            .bundle_path
            .as_ref()
            .context("relative rootfs without a bundle path")?;
        Ok(bundle.join(path))
    }

    /// Create the container runtime directory.
    ///
    /// A container id is taken when a state document already lives below
    /// it; the bare directory may legitimately predate us (a pod sandbox
    /// creates its workloads tree while the annotations are parsed).
    pub fn runtime_dir_setup(&self) -> Result<()> {
        let path = self.runtime_path();
        if State::exists(&path) {
            bail!("container {} already exists", self.container_id);
        }

        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&path)
            .with_context(|| format!("create runtime directory {}", path.display()))?;

        debug!("created runtime directory {}", path.display());
        Ok(())
    }

    /// Remove the container runtime directory and everything below it.
    pub fn runtime_dir_delete(&self) -> Result<()> {
        let path = self.runtime_path();
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("delete runtime directory {}", path.display()))
            }
        }
    }

    /// Load the OCI configuration from the bundle, resolve the VM launch
    /// parameters and detect pod annotations.
    pub fn parse_bundle(&mut self) -> Result<()> {
        let bundle = self
            .bundle_path
            .clone()
            .context("no bundle path specified")?;

        let config_file = oci_spec::config_file_path(&bundle);
        debug!("using config file {}", config_file.display());

        let spec = Spec::from(&config_file)?;

        // The VM block in the OCI config wins over a bundle-local vm.json.
        let vm = match spec.vm() {
            Some(vm) => VmConfig::from_spec_vm(vm)?,
            None => {
                let vm_file = bundle.join(oci_spec::VM_CONFIG_FILE);
                if vm_file.exists() {
                    VmConfig::from_spec_vm(&Vm::from(&vm_file)?)?
                } else {
                    bail!("no VM configuration found in bundle {}", bundle.display())
                }
            }
        };

        self.spec = Some(spec);
        self.vm = Some(vm);

        self.pod = Pod::from_annotations(
            &self.container_id,
            &self.root_dir,
            self.annotations(),
        )?;

        Ok(())
    }

    /// Annotations from the OCI configuration, empty when absent.
    pub fn annotations(&self) -> std::collections::HashMap<String, String> {
        self.spec
            .as_ref()
            .and_then(|s| s.annotations().clone())
            .unwrap_or_default()
    }

    /// Validate the parsed configuration: supported spec version and all
    /// referenced files present.
    pub fn check(&self) -> Result<()> {
        let spec = self.spec.as_ref().context("no OCI configuration loaded")?;

        if semver::cmp(spec.version(), SUPPORTED_SPEC_VERSION) == Ordering::Greater {
            bail!(
                "unsupported OCI spec version {} (supported up to {})",
                spec.version(),
                SUPPORTED_SPEC_VERSION
            );
        }

        let vm = self.vm.as_ref().context("no VM configuration")?;

        if !vm.image_path().is_file() {
            bail!("image file {} does not exist", vm.image_path().display());
        }
        if !vm.kernel_path().is_file() {
            bail!("kernel image {} does not exist", vm.kernel_path().display());
        }

        let rootfs = self.rootfs_path()?;
        if !rootfs.is_dir() {
            bail!("workload directory {} does not exist", rootfs.display());
        }

        Ok(())
    }

    /// Build the state document for the current in-memory state.
    pub fn to_state(&self, created: &str) -> Result<State> {
        let version = self
            .spec
            .as_ref()
            .map(|s| s.version().clone())
            .unwrap_or_else(|| SUPPORTED_SPEC_VERSION.into());

        let mut builder = crate::state::StateBuilder::default()
            .oci_version(version)
            .id(self.container_id.clone())
            .pid(self.workload_pid)
            .bundle_path(self.bundle_path.clone().unwrap_or_default())
            .comms_path(self.comms_path())
            .process_socket_path(self.procsock_path())
            .status(self.status)
            .created(created.to_string())
            .use_socket_console(self.use_socket_console)
            .mounts(self.mounts.clone())
            .annotations(self.annotations());

        if let Some(console) = &self.console {
            builder = builder.console(console.clone());
        }
        if let Some(vm) = &self.vm {
            builder = builder.vm(vm.to_state());
        }

        builder.build().context("build state document")
    }

    /// Transfer the elements only present in a state document back into the
    /// configuration, so commands other than `create` can operate.
    pub fn update_from_state(&mut self, state: &State) -> Result<()> {
        if self.bundle_path.is_none() {
            self.bundle_path = Some(state.bundle_path().clone());
        }

        self.workload_pid = state.pid();
        self.status = state.status();
        self.mounts = state.mounts().clone();
        self.use_socket_console = state.use_socket_console();

        if self.console.is_none() {
            self.console = state.console().clone();
        }

        if let Some(vm) = state.vm() {
            self.vm = Some(VmConfig::from_state(vm));
        }

        Ok(())
    }
}
