//! The lifecycle orchestrator.
//!
//! One function per subcommand, each operating on a `ContainerConfig` and,
//! after `create`, the on-disk state document. All subcommands are strictly
//! serialized per container by the state file; no locking beyond its atomic
//! rewrite is provided.

use crate::{
    config::ContainerConfig,
    hooks,
    hypervisor::{self, CommsBuilder},
    launch,
    mounts,
    namespace,
    network::{self, NetConfig},
    proxy::{wait_for_path, Proxy},
    state::{self, State, Status},
    workload,
};
use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use log::{debug, warn};
use nix::{
    sys::{
        signal::{kill as send_signal, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd::Pid,
};
use serde_json::{json, Value};
use std::{
    fs,
    io::Read,
    os::unix::net::UnixStream,
    path::Path,
    time::Duration,
};
use strum::{Display, EnumString};

lazy_static! {
    /// Shells recognised by the exec heuristic, ordered by likelihood.
    static ref RECOGNISED_SHELLS: Vec<&'static str> = vec!["sh", "bash", "zsh", "ksh", "csh"];
}

/// Determine if a command names a shell, either bare or as a full path.
pub fn cmd_is_shell(cmd: &str) -> bool {
    RECOGNISED_SHELLS
        .iter()
        .any(|shell| cmd == *shell || cmd.ends_with(&format!("/{}", shell)))
}

/// Apply the exec usability concession: a lone leading shell (not followed
/// by an option argument) is suppressed so the guest spawns an interactive
/// shell instead of a confused non-interactive one.
pub fn adjust_exec_args(args: &[String]) -> Vec<String> {
    let mut just_shell = args.first().map(|a| cmd_is_shell(a)).unwrap_or(false);

    if let Some(second) = args.get(1) {
        if second.starts_with('-') {
            just_shell = false;
        }
    }

    if just_shell {
        args[1..].to_vec()
    } else {
        args.to_vec()
    }
}

/// The in-guest process description of the configured workload.
fn workload_process(config: &ContainerConfig) -> Value {
    let terminal = config
        .spec()
        .as_ref()
        .and_then(|s| s.process().as_ref())
        .map(|p| p.terminal())
        .unwrap_or(false);

    json!({
        "args": [
            crate::config::WORKLOAD_SHELL,
            format!("/{}", crate::config::WORKLOAD_FILE),
        ],
        "terminal": terminal,
        "workdir": "/",
    })
}

/// Remove everything `create` put on disk: mounts, state file, runtime
/// directory.
fn cleanup(config: &ContainerConfig, mounts: &[crate::state::StateMount]) -> Result<()> {
    mounts::unmount_all(mounts, config.dry_run())?;
    State::delete(&config.runtime_path())?;
    config.runtime_dir_delete()?;
    Ok(())
}

fn hooks_of(
    config: &ContainerConfig,
    select: fn(&crate::oci_spec::Hooks) -> &Option<Vec<crate::oci_spec::Hook>>,
) -> Vec<crate::oci_spec::Hook> {
    config
        .spec()
        .as_ref()
        .and_then(|s| s.hooks().as_ref())
        .and_then(|h| select(h).clone())
        .unwrap_or_default()
}

/// The state document serialized for hook consumption.
fn state_json(config: &ContainerConfig, created: &str) -> Result<String> {
    let state = config.to_state(created)?;
    serde_json::to_string_pretty(&state).context("serialize state for hooks")
}

/// Create a container: parse and validate the bundle, prepare the runtime
/// directory, mounts and workload files, then launch the VM paused.
pub fn create(config: &mut ContainerConfig) -> Result<()> {
    config.parse_bundle()?;
    config.check()?;
    config.runtime_dir_setup()?;

    match create_inner(config) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("create failed, tearing container down");
            launch::kill_launched(config);
            let mounts = config.mounts().clone();
            if let Err(cleanup_err) = cleanup(config, &mounts) {
                warn!("cleanup failed: {}", crate::error::chain(cleanup_err));
            }
            Err(e)
        }
    }
}

fn create_inner(config: &mut ContainerConfig) -> Result<()> {
    // Mount layout: a plain container mounts below its rootfs; pods mount
    // volumes below the shared workloads directory.
    let volume_mounts = config.pod().is_some();
    let workload_dir = match config.pod() {
        Some(pod) => pod.sandbox_workloads().clone(),
        None => config.rootfs_path()?,
    };

    let mut entries = mounts::from_spec(config);
    if let Some(pod) = config.pod() {
        if !pod.sandbox() {
            entries.push(mounts::rootfs_bind_mount(config)?);
        }
    }

    let applied = mounts::handle_mounts(config, &entries, &workload_dir, volume_mounts)
        .context("handle mounts")?;
    config.set_mounts(applied);

    workload::create_workload(config).context("create workload")?;

    if config.dry_run() {
        debug!("dry-run mode: not launching VM");
        return Ok(());
    }

    let member = config
        .pod()
        .as_ref()
        .map(|pod| !pod.sandbox())
        .unwrap_or(false);

    if member {
        pod_member_create(config)
    } else {
        vm_create(config)
    }
}

/// Launch the VM for a standalone container or a pod sandbox.
fn vm_create(config: &mut ContainerConfig) -> Result<()> {
    let created = state::iso8601_timestamp();
    let container_id = config.container_id().clone();
    config.set_status(Status::Created);

    // Namespace setup happens in the parent so the hooks run inside it and
    // the children inherit it.
    let namespaces = config
        .spec()
        .as_ref()
        .and_then(|s| s.linux().as_ref())
        .and_then(|l| l.namespaces().clone())
        .unwrap_or_default();
    namespace::setup(&namespace::from_spec(&namespaces)?).context("setup namespaces")?;

    // Connect before forking the shim so the control descriptor can be
    // inherited.
    let mut proxy = Proxy::for_container(config);
    proxy.connect().context("connect to proxy")?;

    // The hypervisor child blocks on its argument pipe; the shim child
    // blocks on its descriptor pipe. Both must exist before the state file
    // so the recorded pids are valid.
    let hypervisor_handle = launch::fork_hypervisor()?;
    if let Some(vm) = config.vm_mut() {
        vm.set_pid(Some(hypervisor_handle.pid.as_raw()));
    }

    let shim_handle = launch::fork_shim(&container_id)?;
    config.set_workload_pid(shim_handle.pid.as_raw());

    config.to_state(&created)?.write(&config.runtime_path())?;

    // A failing prestart hook tears the container down.
    hooks::run_hooks(
        &hooks_of(config, |h| h.prestart()),
        &state_json(config, &created)?,
        true,
    )
    .context("run prestart hooks")?;

    // The hooks may have populated the network namespace; only now is
    // discovery meaningful.
    let hostname = config
        .spec()
        .as_ref()
        .and_then(|s| s.hostname().clone())
        .unwrap_or_else(|| container_id.clone());
    let net = match network::discover_and_create(&hostname) {
        Ok(net) => net,
        Err(e) => {
            warn!(
                "network discovery failed, configuring the guest as isolated: {}",
                crate::error::chain(e)
            );
            NetConfig::new(&hostname)
        }
    };
    config.set_net(net.clone());

    let args = hypervisor::vm_args(config, &net).context("build hypervisor command line")?;
    hypervisor_handle.send_args(&args)?;
    hypervisor_handle.await_paused()?;

    // The agent serials must surface before the proxy can service us.
    proxy.wait_until_ready(&container_id)?;
    proxy.start_pod(&hostname)?;
    proxy.new_container(&container_id, workload_process(config))?;

    let proxy_fd = proxy.raw_fd().context("proxy connection lost")?;
    let terminal = config
        .spec()
        .as_ref()
        .and_then(|s| s.process().as_ref())
        .map(|p| p.terminal())
        .unwrap_or(false);
    let (io_fd, io_base) = proxy.allocate_io(terminal)?;

    shim_handle.send_fds(proxy_fd, io_fd, io_base)?;
    shim_handle.await_exec()?;
    let _ = nix::unistd::close(io_fd);

    // Recreate the state file now that the console and VM details are
    // final.
    config.to_state(&created)?.write(&config.runtime_path())?;

    // The shim keeps its inherited proxy connection; the parent lets go.
    proxy.disconnect()?;

    // The pid file is last: the engine takes its existence as
    // create-completion.
    if let Some(pid_file) = config.pid_file().clone() {
        state::create_pidfile(&pid_file, config.workload_pid())?;
    }

    hypervisor_handle.release();
    shim_handle.release();

    Ok(())
}

/// Create a pod member: no VM launch, attach to the sandbox session
/// instead.
fn pod_member_create(config: &mut ContainerConfig) -> Result<()> {
    let created = state::iso8601_timestamp();
    let container_id = config.container_id().clone();
    let sandbox_name = config
        .pod()
        .as_ref()
        .map(|pod| pod.sandbox_name().clone())
        .context("pod member without pod details")?;
    config.set_status(Status::Created);

    let mut proxy = Proxy::for_container(config);
    proxy.connect().context("connect to proxy")?;
    proxy.attach(&sandbox_name)?;

    let shim_handle = launch::fork_shim(&container_id)?;
    config.set_workload_pid(shim_handle.pid.as_raw());

    let proxy_fd = proxy.raw_fd().context("proxy connection lost")?;
    let terminal = config
        .spec()
        .as_ref()
        .and_then(|s| s.process().as_ref())
        .map(|p| p.terminal())
        .unwrap_or(false);
    let (io_fd, io_base) = proxy.allocate_io(terminal)?;

    shim_handle.send_fds(proxy_fd, io_fd, io_base)?;
    shim_handle.await_exec()?;
    let _ = nix::unistd::close(io_fd);

    config.to_state(&created)?.write(&config.runtime_path())?;

    proxy.new_container(&container_id, workload_process(config))?;
    proxy.disconnect()?;

    if let Some(pid_file) = config.pid_file().clone() {
        state::create_pidfile(&pid_file, config.workload_pid())?;
    }

    shim_handle.release();
    Ok(())
}

/// Let a created VM continue into its guest boot.
pub fn start(config: &mut ContainerConfig, state: &State) -> Result<()> {
    match state.status() {
        Status::Running => {
            if state.workload_alive() {
                bail!("container {} is already running", config.container_id());
            }
            bail!("container {} is no longer running", config.container_id());
        }
        Status::Created => {
            // The shim (and with it the paused VM) must still be around;
            // a dead workload cannot be advanced to running.
            if !state.workload_alive() {
                bail!(
                    "container {} is no longer created",
                    config.container_id()
                );
            }
        }
        other => bail!(
            "unexpected state for container {}: {}",
            config.container_id(),
            other
        ),
    }

    let hypervisor_pid = state
        .vm()
        .as_ref()
        .and_then(|vm| vm.pid())
        .filter(|pid| *pid > 0)
        .context("no hypervisor pid recorded")?;

    let terminal = config
        .spec()
        .as_ref()
        .and_then(|s| s.process().as_ref())
        .map(|p| p.terminal())
        .unwrap_or(false);
    let wait = terminal && !config.detached() && !state.use_socket_console();

    // The VM was left stopped by `create`; the continue signal lets it
    // exec the hypervisor and boot.
    send_signal(Pid::from_raw(hypervisor_pid), Signal::SIGCONT).with_context(|| {
        format!("failed to start VM {}", config.container_id())
    })?;

    debug!(
        "activated VM {} (hypervisor pid {})",
        config.container_id(),
        hypervisor_pid
    );

    config.set_status(Status::Running);
    config.to_state(state.created())?.write(&config.runtime_path())?;

    // Poststart hook failures are logged but do not stop the container.
    if let Err(e) = hooks::run_hooks(
        &hooks_of(config, |h| h.poststart()),
        &state_json(config, state.created())?,
        false,
    ) {
        warn!("{}", crate::error::chain(e.context("poststart hooks")));
    }

    if wait {
        wait_for_shutdown(config)?;
    }

    Ok(())
}

/// Block on the process socket until the hypervisor closes it, then tear
/// the container down.
fn wait_for_shutdown(config: &mut ContainerConfig) -> Result<()> {
    let procsock = config.procsock_path();

    // The socket only surfaces once the hypervisor actually boots.
    wait_for_path(&procsock, Duration::from_secs(30))?;

    let mut stream = UnixStream::connect(&procsock)
        .with_context(|| format!("connect to process socket {}", procsock.display()))?;

    debug!("waiting for VM shutdown");
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    debug!("VM has shut down");

    // Somebody else may have torn the container down while we waited.
    let state = match State::read(&config.runtime_path()) {
        Ok(state) => state,
        Err(_) => return Ok(()),
    };

    if state.status() != Status::Stopped && state.status() != Status::Stopping {
        if let Err(e) = hooks::run_hooks(
            &hooks_of(config, |h| h.poststop()),
            &serde_json::to_string_pretty(&state)?,
            false,
        ) {
            warn!("{}", crate::error::chain(e.context("poststop hooks")));
        }
        cleanup(config, state.mounts())?;
    }

    Ok(())
}

/// Create and start in one go.
pub fn run(config: &mut ContainerConfig) -> Result<()> {
    create(config)?;

    if config.dry_run() {
        return Ok(());
    }

    // The state file is the source of truth for what `create` recorded.
    let state = State::read(&config.runtime_path())?;
    config.update_from_state(&state)?;

    start(config, &state)
}

/// Stop the VM and clean up. Also the workhorse of `delete`.
pub fn stop(config: &mut ContainerConfig, state: &State) -> Result<()> {
    if state.workload_alive() {
        let comms = CommsBuilder::default()
            .socket_path(state.comms_path().clone())
            .build()
            .context("build comms client")?;
        if let Err(e) = comms.shutdown() {
            warn!(
                "VM unreachable, proceeding to cleanup: {}",
                crate::error::chain(e)
            );
        }
    } else {
        warn!(
            "cannot stop VM {} (pid {}) - not running",
            state.id(),
            state.pid()
        );
    }

    // Poststop hooks run unconditionally, before the state disappears.
    if let Err(e) = hooks::run_hooks(
        &hooks_of(config, |h| h.poststop()),
        &serde_json::to_string_pretty(state)?,
        false,
    ) {
        warn!("{}", crate::error::chain(e.context("poststop hooks")));
    }

    cleanup(config, state.mounts())
}

/// Delete a container. Repeatable: a missing container is a no-op.
pub fn delete(config: &mut ContainerConfig) -> Result<()> {
    if !State::exists(&config.runtime_path()) {
        debug!(
            "container {} has no state, nothing to delete",
            config.container_id()
        );
        // A leftover runtime directory without a state file is removed as
        // well, so a failed create can always be deleted.
        return config.runtime_dir_delete();
    }

    let state = State::read(&config.runtime_path())?;
    config.update_from_state(&state)?;
    stop(config, &state)
}

/// Deliver a signal to the workload.
pub fn kill(config: &mut ContainerConfig, signum: Signal) -> Result<()> {
    if !State::exists(&config.runtime_path()) {
        debug!(
            "container {} has no state, nothing to signal",
            config.container_id()
        );
        return Ok(());
    }

    let state = State::read(&config.runtime_path())?;
    config.update_from_state(&state)?;

    if state.pid() <= 0 {
        debug!("container {} has no recorded pid", config.container_id());
        return Ok(());
    }

    let last_status = config.status();
    config.set_status(Status::Stopping);
    config.to_state(state.created())?.write(&config.runtime_path())?;

    match send_signal(Pid::from_raw(state.pid()), signum) {
        Ok(()) => {}
        // A pid that is already gone satisfies the intent of any signal.
        Err(nix::errno::Errno::ESRCH) => {
            debug!("workload pid {} already gone", state.pid())
        }
        Err(e) => {
            config.set_status(last_status);
            config.to_state(state.created())?.write(&config.runtime_path())?;
            return Err(e).with_context(|| {
                format!(
                    "failed to stop container {} running with pid {}",
                    config.container_id(),
                    state.pid()
                )
            });
        }
    }

    config.set_status(Status::Stopped);
    config.to_state(state.created())?.write(&config.runtime_path())?;
    Ok(())
}

/// Pause or resume the VM through the hypervisor control socket.
pub fn toggle(config: &mut ContainerConfig, state: &State, pause: bool) -> Result<()> {
    let dest_status = if pause { Status::Paused } else { Status::Running };

    if state.status() == dest_status {
        warn!("already {}", state.status());
        return Ok(());
    }

    let comms = CommsBuilder::default()
        .socket_path(state.comms_path().clone())
        .build()
        .context("build comms client")?;
    if pause {
        comms.pause()?;
    } else {
        comms.resume()?;
    }

    config.set_status(dest_status);
    config.to_state(state.created())?.write(&config.runtime_path())
}

/// Run a command inside the VM and return its exit code.
pub fn exec(config: &mut ContainerConfig, state: &State, args: &[String]) -> Result<i32> {
    if args.is_empty() {
        bail!("no command specified");
    }
    if state.effective_status() != Status::Running {
        bail!(
            "container {} is not running ({})",
            config.container_id(),
            state.effective_status()
        );
    }

    let args = adjust_exec_args(args);
    let container_id = config.container_id().clone();

    let mut proxy = Proxy::for_container(config);
    proxy.connect().context("connect to proxy")?;
    proxy.attach(&container_id)?;

    let shim_handle = launch::fork_shim(&container_id)?;

    let proxy_fd = proxy.raw_fd().context("proxy connection lost")?;
    let terminal = nix::unistd::isatty(libc::STDIN_FILENO).unwrap_or(false);
    let (io_fd, io_base) = proxy.allocate_io(terminal)?;

    shim_handle.send_fds(proxy_fd, io_fd, io_base)?;
    shim_handle.await_exec()?;
    let _ = nix::unistd::close(io_fd);

    proxy.exec_command(
        &container_id,
        json!({
            "args": args,
            "terminal": terminal,
        }),
    )?;
    proxy.disconnect()?;

    // The shim's exit status is the remote command's exit status.
    let code = match waitpid(shim_handle.pid, None).context("wait for exec shim")? {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        other => bail!("unexpected exec shim state: {:?}", other),
    };

    shim_handle.release();
    Ok(code)
}

/// Bridge the caller's stdio to the console socket until the VM dies.
pub fn attach(config: &mut ContainerConfig, state: &State) -> Result<()> {
    let console = state
        .console()
        .clone()
        .filter(|c| !c.as_os_str().is_empty())
        .context("container has no console to attach to")?;

    let mut socket = UnixStream::connect(&console)
        .with_context(|| format!("connect to console {}", console.display()))?;
    socket
        .set_nonblocking(true)
        .context("set console non-blocking")?;

    debug!("attached to console {}", console.display());

    let socket_fd = {
        use std::os::unix::io::AsRawFd;
        socket.as_raw_fd()
    };

    use nix::poll::{poll, PollFd, PollFlags};
    let mut buf = [0u8; 8192];

    loop {
        if !state.workload_alive() {
            debug!("VM is gone, detaching");
            return Ok(());
        }

        let mut fds = [
            PollFd::new(libc::STDIN_FILENO, PollFlags::POLLIN),
            PollFd::new(socket_fd, PollFlags::POLLIN),
        ];
        // Wake up periodically to re-check liveness.
        match poll(&mut fds, 1000) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("poll console"),
        }

        if fds[0]
            .revents()
            .map(|r| r.intersects(PollFlags::POLLIN))
            .unwrap_or(false)
        {
            let n = nix::unistd::read(libc::STDIN_FILENO, &mut buf).unwrap_or(0);
            if n > 0 {
                use std::io::Write;
                let _ = socket.write_all(&buf[..n]);
            }
        }

        if fds[1]
            .revents()
            .map(|r| !r.is_empty())
            .unwrap_or(false)
        {
            match socket.read(&mut buf) {
                Ok(0) => {
                    debug!("console closed");
                    return Ok(());
                }
                Ok(n) => {
                    let _ = nix::unistd::write(libc::STDOUT_FILENO, &buf[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => return Ok(()),
            }
        }
    }
}

/// Show the processes inside the container by running `ps` in the guest.
pub fn ps(config: &mut ContainerConfig, state: &State, ps_args: &[String]) -> Result<i32> {
    let mut args = vec!["ps".to_string()];
    if ps_args.is_empty() {
        args.push("-ef".into());
    } else {
        args.extend(ps_args.iter().cloned());
    }
    exec(config, state, &args)
}

/// Selectable list output formats.
#[derive(Clone, Copy, Debug, Default, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum ListFormat {
    #[default]
    Table,
    Json,
}

/// One row of `list` output.
struct ListEntry {
    state: State,
    status: Status,
}

fn list_entries(root: &Path) -> Vec<ListEntry> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        // No containers yet, so not an error.
        Err(_) => return Vec::new(),
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        // Containers may be destroyed while we scan, so be lax.
        if let Ok(state) = State::read(&entry.path()) {
            let status = state.effective_status();
            out.push(ListEntry { state, status });
        }
    }
    out.sort_by(|a, b| a.state.id().cmp(b.state.id()));
    out
}

/// List all containers below `root` in the requested format.
pub fn list(root: &Path, format: ListFormat, show_all: bool, quiet: bool) -> Result<String> {
    let entries = list_entries(root);

    if quiet {
        return Ok(entries
            .iter()
            .map(|e| e.state.id().clone())
            .collect::<Vec<_>>()
            .join("\n"));
    }

    match format {
        ListFormat::Json => {
            if entries.is_empty() {
                // Empty list prints the literal null, like runc.
                return Ok("null".into());
            }

            let array: Vec<Value> = entries
                .iter()
                .map(|e| {
                    let mut obj = json!({
                        "id": e.state.id(),
                        "pid": e.state.pid(),
                        "status": e.status.to_string(),
                        "bundle": e.state.bundle_path(),
                        "created": e.state.created(),
                    });
                    if show_all {
                        if let Some(vm) = e.state.vm() {
                            obj["hypervisor"] = json!(vm.hypervisor_path());
                            obj["kernel"] = json!(vm.kernel_path());
                            obj["image"] = json!(vm.image_path());
                        }
                    }
                    obj
                })
                .collect();
            serde_json::to_string(&array).context("serialize container list")
        }
        ListFormat::Table => Ok(list_table(&entries, show_all)),
    }
}

fn list_table(entries: &[ListEntry], show_all: bool) -> String {
    let mut id_w = "ID".len();
    let mut pid_w = "PID".len();
    let mut status_w = Status::max_len().max("STATUS".len());
    let mut bundle_w = "BUNDLE".len();
    let mut created_w = "CREATED".len();
    let mut hypervisor_w = "HYPERVISOR".len();
    let mut kernel_w = "KERNEL".len();
    let mut image_w = "IMAGE".len();

    for e in entries {
        id_w = id_w.max(e.state.id().len());
        pid_w = pid_w.max(e.state.pid().to_string().len());
        status_w = status_w.max(e.status.to_string().len());
        bundle_w = bundle_w.max(e.state.bundle_path().display().to_string().len());
        created_w = created_w.max(e.state.created().len());
        if let Some(vm) = e.state.vm() {
            hypervisor_w = hypervisor_w.max(vm.hypervisor_path().display().to_string().len());
            kernel_w = kernel_w.max(vm.kernel_path().display().to_string().len());
            image_w = image_w.max(vm.image_path().display().to_string().len());
        }
    }

    let mut out = format!(
        "{:<id_w$} {:<pid_w$} {:<status_w$} {:<bundle_w$} {:<created_w$}",
        "ID",
        "PID",
        "STATUS",
        "BUNDLE",
        "CREATED",
        id_w = id_w,
        pid_w = pid_w,
        status_w = status_w,
        bundle_w = bundle_w,
        created_w = created_w,
    );
    if show_all {
        out.push_str(&format!(
            " {:<hypervisor_w$} {:<kernel_w$} {:<image_w$}",
            "HYPERVISOR",
            "KERNEL",
            "IMAGE",
            hypervisor_w = hypervisor_w,
            kernel_w = kernel_w,
            image_w = image_w,
        ));
    }
    out.push('\n');

    for e in entries {
        out.push_str(&format!(
            "{:<id_w$} {:<pid_w$} {:<status_w$} {:<bundle_w$} {:<created_w$}",
            e.state.id(),
            e.state.pid(),
            e.status.to_string(),
            e.state.bundle_path().display().to_string(),
            e.state.created(),
            id_w = id_w,
            pid_w = pid_w,
            status_w = status_w,
            bundle_w = bundle_w,
            created_w = created_w,
        ));
        if show_all {
            if let Some(vm) = e.state.vm() {
                out.push_str(&format!(
                    " {:<hypervisor_w$} {:<kernel_w$} {:<image_w$}",
                    vm.hypervisor_path().display().to_string(),
                    vm.kernel_path().display().to_string(),
                    vm.image_path().display().to_string(),
                    hypervisor_w = hypervisor_w,
                    kernel_w = kernel_w,
                    image_w = image_w,
                ));
            }
        }
        out.push('\n');
    }

    out
}

/// The OCI state of a container as a JSON document.
pub fn container_state(config: &ContainerConfig) -> Result<String> {
    let state = State::read(&config.runtime_path()).with_context(|| {
        format!("no state for container {}", config.container_id())
    })?;

    let view = json!({
        "ociVersion": state.oci_version(),
        "id": state.id(),
        "pid": state.pid(),
        "status": state.effective_status().to_string(),
        "bundle": state.bundle_path(),
        "created": state.created(),
        "annotations": state.annotations(),
    });
    serde_json::to_string_pretty(&view).context("serialize container state")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ContainerConfigBuilder,
        state::{StateBuilder, StateMountBuilder, VmStateBuilder},
    };
    use tempfile::TempDir;

    #[test]
    fn shell_detection_table() {
        for shell in &[
            "sh",
            "/bin/sh",
            "/usr/local/bin/bash",
            "/usr/bin/zsh",
            "/bin/ksh",
            "/bin/csh",
        ] {
            assert!(cmd_is_shell(shell), "{} should be a shell", shell);
        }

        for not_shell in &["true", "/bin/true", "", "fish"] {
            assert!(!cmd_is_shell(not_shell), "{} is not a shell", not_shell);
        }
    }

    #[test]
    fn exec_args_shell_heuristic() {
        // A lone shell is suppressed to get an interactive session.
        assert_eq!(
            adjust_exec_args(&["/bin/bash".to_string()]),
            Vec::<String>::new()
        );

        // A shell followed by an option keeps everything.
        assert_eq!(
            adjust_exec_args(&["bash".to_string(), "-c".into(), "ls".into()]),
            vec!["bash".to_string(), "-c".into(), "ls".into()]
        );

        // A non-shell command is left alone.
        assert_eq!(
            adjust_exec_args(&["top".to_string()]),
            vec!["top".to_string()]
        );

        assert_eq!(adjust_exec_args(&[]), Vec::<String>::new());
    }

    fn write_state(root: &Path, id: &str, status: Status, pid: i32) -> Result<State> {
        let dir = root.join(id);
        fs::create_dir_all(&dir)?;
        let state = StateBuilder::default()
            .oci_version("1.0.2")
            .id(id)
            .pid(pid)
            .bundle_path(format!("/bundles/{}", id))
            .comms_path(dir.join("hypervisor.sock"))
            .process_socket_path(dir.join("process.sock"))
            .status(status)
            .created("2016-09-28T09:50:09.264956Z")
            .vm(VmStateBuilder::default()
                .hypervisor_path("/usr/bin/qemu-lite")
                .image_path("/usr/share/vm/root.img")
                .kernel_path("/usr/share/vm/vmlinux")
                .workload_path("/tmp/rootfs/.containerexec")
                .build()?)
            .build()?;
        state.write(&dir)?;
        Ok(state)
    }

    #[test]
    fn list_empty_json_prints_null() -> Result<()> {
        let dir = TempDir::new()?;
        assert_eq!(list(dir.path(), ListFormat::Json, false, false)?, "null");
        Ok(())
    }

    #[test]
    fn list_missing_root_is_empty() -> Result<()> {
        let out = list(Path::new("/nonexistent/root"), ListFormat::Json, false, false)?;
        assert_eq!(out, "null");
        Ok(())
    }

    #[test]
    fn list_table_header_and_row() -> Result<()> {
        let dir = TempDir::new()?;
        // Our own pid is alive, so the stored status stands.
        write_state(dir.path(), "c1", Status::Running, std::process::id() as i32)?;

        let out = list(dir.path(), ListFormat::Table, false, false)?;
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("ID"));
        assert_eq!(
            lines[0].split_whitespace().collect::<Vec<_>>(),
            vec!["ID", "PID", "STATUS", "BUNDLE", "CREATED"]
        );

        let fields: Vec<&str> = lines[1].split_whitespace().collect();
        assert_eq!(fields[0], "c1");
        assert_eq!(fields[1], std::process::id().to_string());
        assert_eq!(fields[2], "running");
        assert_eq!(fields[3], "/bundles/c1");
        assert_eq!(fields[4], "2016-09-28T09:50:09.264956Z");
        Ok(())
    }

    #[test]
    fn list_reports_dead_container_as_stopped() -> Result<()> {
        let dir = TempDir::new()?;
        write_state(dir.path(), "c1", Status::Running, i32::MAX - 1)?;

        let out = list(dir.path(), ListFormat::Json, false, false)?;
        let parsed: Vec<Value> = serde_json::from_str(&out)?;
        assert_eq!(parsed[0]["status"], "stopped");
        Ok(())
    }

    #[test]
    fn list_all_fields_variant() -> Result<()> {
        let dir = TempDir::new()?;
        write_state(dir.path(), "c1", Status::Running, std::process::id() as i32)?;

        let out = list(dir.path(), ListFormat::Json, true, false)?;
        let parsed: Vec<Value> = serde_json::from_str(&out)?;
        assert_eq!(parsed[0]["hypervisor"], "/usr/bin/qemu-lite");
        assert_eq!(parsed[0]["kernel"], "/usr/share/vm/vmlinux");
        assert_eq!(parsed[0]["image"], "/usr/share/vm/root.img");

        let table = list(dir.path(), ListFormat::Table, true, false)?;
        assert!(table.lines().next().expect("header").contains("HYPERVISOR"));
        Ok(())
    }

    #[test]
    fn list_quiet_prints_ids() -> Result<()> {
        let dir = TempDir::new()?;
        write_state(dir.path(), "b", Status::Running, std::process::id() as i32)?;
        write_state(dir.path(), "a", Status::Created, std::process::id() as i32)?;

        let out = list(dir.path(), ListFormat::Table, false, true)?;
        assert_eq!(out, "a\nb");
        Ok(())
    }

    fn test_config(dir: &TempDir, id: &str) -> ContainerConfig {
        ContainerConfigBuilder::default()
            .container_id(id)
            .root_dir(dir.path().to_path_buf())
            .build()
            .expect("config")
    }

    #[test]
    fn state_output_shape() -> Result<()> {
        let dir = TempDir::new()?;
        write_state(dir.path(), "c1", Status::Created, std::process::id() as i32)?;

        let config = test_config(&dir, "c1");
        let out = container_state(&config)?;
        let parsed: Value = serde_json::from_str(&out)?;
        assert_eq!(parsed["status"], "created");
        assert!(parsed["pid"].as_i64().expect("pid") > 0);
        assert_eq!(parsed["id"], "c1");
        Ok(())
    }

    #[test]
    fn kill_without_state_is_a_noop() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = test_config(&dir, "ghost");
        kill(&mut config, Signal::SIGTERM)?;
        kill(&mut config, Signal::SIGTERM)?;
        Ok(())
    }

    #[test]
    fn kill_dead_pid_reports_stopped() -> Result<()> {
        let dir = TempDir::new()?;
        write_state(dir.path(), "c1", Status::Running, i32::MAX - 1)?;

        let mut config = test_config(&dir, "c1");
        kill(&mut config, Signal::SIGTERM)?;

        let state = State::read(&dir.path().join("c1"))?;
        assert_eq!(state.status(), Status::Stopped);
        Ok(())
    }

    #[test]
    fn kill_updates_status_for_live_process() -> Result<()> {
        let dir = TempDir::new()?;
        // Use a real child process we can signal.
        let child = std::process::Command::new("sleep").arg("30").spawn()?;
        write_state(dir.path(), "c1", Status::Running, child.id() as i32)?;

        let mut config = test_config(&dir, "c1");
        kill(&mut config, Signal::SIGKILL)?;

        let state = State::read(&dir.path().join("c1"))?;
        assert_eq!(state.status(), Status::Stopped);

        // The signal actually arrived.
        let _ = waitpid(Pid::from_raw(child.id() as i32), None);
        Ok(())
    }

    #[test]
    fn delete_missing_container_succeeds() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = test_config(&dir, "ghost");
        delete(&mut config)?;
        delete(&mut config)?;
        Ok(())
    }

    #[test]
    fn delete_removes_leftover_runtime_dir() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = test_config(&dir, "leftover");
        fs::create_dir_all(config.runtime_path())?;

        delete(&mut config)?;
        assert!(!config.runtime_path().exists());
        Ok(())
    }

    #[test]
    fn stop_on_stopped_container_cleans_up() -> Result<()> {
        let dir = TempDir::new()?;
        let state = write_state(dir.path(), "c1", Status::Stopped, i32::MAX - 1)?;
        let mut config = test_config(&dir, "c1");

        stop(&mut config, &state)?;
        assert!(!State::exists(&dir.path().join("c1")));
        assert!(!dir.path().join("c1").exists());

        // A second stop (through delete) is still fine.
        delete(&mut config)?;
        Ok(())
    }

    #[test]
    fn stop_removes_created_mount_directories() -> Result<()> {
        let dir = TempDir::new()?;
        let created_dir = dir.path().join("rootfs/data");
        fs::create_dir_all(&created_dir)?;

        let runtime = dir.path().join("c1");
        fs::create_dir_all(&runtime)?;
        let state = StateBuilder::default()
            .oci_version("1.0.2")
            .id("c1")
            .pid(i32::MAX - 1)
            .bundle_path("/bundles/c1")
            .comms_path(runtime.join("hypervisor.sock"))
            .process_socket_path(runtime.join("process.sock"))
            .status(Status::Stopped)
            .created(state::iso8601_timestamp())
            .mounts(vec![StateMountBuilder::default()
                .destination(dir.path().join("rootfs/data"))
                .mount_dir("/data")
                .directory_created(created_dir.clone())
                .build()?])
            .build()?;
        state.write(&runtime)?;

        let mut config = test_config(&dir, "c1");
        stop(&mut config, &state)?;
        assert!(!created_dir.exists());
        Ok(())
    }

    #[test]
    fn start_rejects_wrong_status() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = test_config(&dir, "c1");

        let state = write_state(dir.path(), "c1", Status::Stopped, std::process::id() as i32)?;
        assert!(start(&mut config, &state).is_err());

        let state = write_state(dir.path(), "c1", Status::Running, std::process::id() as i32)?;
        let err = start(&mut config, &state).expect_err("already running");
        assert!(crate::error::chain(err).contains("already running"));

        // Running but dead: different diagnostic.
        let state = write_state(dir.path(), "c1", Status::Running, i32::MAX - 1)?;
        let err = start(&mut config, &state).expect_err("no longer running");
        assert!(crate::error::chain(err).contains("no longer running"));
        Ok(())
    }

    #[test]
    fn start_rejects_created_container_with_dead_workload() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = test_config(&dir, "c1");

        // Created on disk, but the shim is gone: starting must fail before
        // any signal is sent.
        let state = write_state(dir.path(), "c1", Status::Created, i32::MAX - 1)?;
        let err = start(&mut config, &state).expect_err("dead workload");
        assert!(crate::error::chain(err).contains("no longer created"));
        Ok(())
    }

    #[test]
    fn start_requires_hypervisor_pid() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = test_config(&dir, "c1");
        let state = write_state(dir.path(), "c1", Status::Created, std::process::id() as i32)?;

        let err = start(&mut config, &state).expect_err("no hypervisor pid");
        assert!(crate::error::chain(err).contains("no hypervisor pid"));
        Ok(())
    }

    #[test]
    fn workload_process_shape() {
        let config = ContainerConfigBuilder::default()
            .container_id("c1")
            .build()
            .expect("config");
        let process = workload_process(&config);
        assert_eq!(process["args"][0], "/bin/sh");
        assert_eq!(process["args"][1], "/.containerexec");
        assert_eq!(process["terminal"], false);
    }
}
