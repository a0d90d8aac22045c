//! Hypervisor command line assembly and VM control socket client.
//!
//! The hypervisor is an opaque executable. Its command line comes from an
//! external arguments template (one argument per line) whose placeholder
//! tokens are substituted with runtime-derived values; network devices are
//! appended programmatically.

use crate::{
    config::ContainerConfig,
    network::{self, NetConfig},
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use getset::Getters;
use log::debug;
use serde_json::json;
use std::{
    fmt::Debug,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
    runtime::Builder as RuntimeBuilder,
};

/// Name of the hypervisor arguments template file.
pub const ARGS_FILE: &str = "hypervisor.args";

/// System configuration directory searched for the template.
pub const SYSCONF_DIR: &str = "/etc/virtc";

/// Stateless defaults directory searched for the template.
pub const DEFAULTS_DIR: &str = "/usr/share/defaults/virtc";

/// Find the arguments template. Search order: bundle directory, system
/// configuration directory, stateless defaults directory; first hit wins.
fn find_args_file(candidates: &[PathBuf]) -> Result<PathBuf> {
    for candidate in candidates {
        if candidate.is_file() {
            debug!("using hypervisor arguments template {}", candidate.display());
            return Ok(candidate.clone());
        }
    }
    bail!("no {} template found", ARGS_FILE)
}

/// Locate the template for the given container configuration.
pub fn args_file_path(config: &ContainerConfig) -> Result<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(bundle) = config.bundle_path() {
        candidates.push(bundle.join(ARGS_FILE));
    }
    candidates.push(Path::new(SYSCONF_DIR).join(ARGS_FILE));
    candidates.push(Path::new(DEFAULTS_DIR).join(ARGS_FILE));

    find_args_file(&candidates)
}

/// Parse the template: one argument per non-empty, non-comment line.
pub fn file_to_args(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read arguments template {}", path.display()))?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// The console chardev descriptor, deciding between a caller-provided
/// device and a runtime-owned socket.
fn console_device(config: &mut ContainerConfig) -> String {
    match config.console().clone() {
        Some(console) if !console.as_os_str().is_empty() => {
            format!("tty,id=charconsole0,path={}", console.display())
        }
        _ => {
            // No console requested, so have the hypervisor serve one on a
            // Unix socket below the runtime directory.
            let socket = config.console_socket_path();
            debug!("no console device provided, using socket {}", socket.display());
            config.set_use_socket_console(true);
            config.set_console(Some(socket.clone()));
            format!(
                "socket,path={},server,nowait,id=charconsole0,signal=off",
                socket.display()
            )
        }
    }
}

/// Expand all placeholder tokens in the template arguments and append the
/// network device arguments. Unknown tokens pass through unchanged.
pub fn expand_args(
    config: &mut ContainerConfig,
    mut args: Vec<String>,
    net: &NetConfig,
) -> Result<Vec<String>> {
    let vm = config.vm().clone().context("no VM configuration")?;

    let image_size = fs::metadata(vm.image_path())
        .with_context(|| format!("stat image file {}", vm.image_path().display()))?
        .len()
        .to_string();

    let uuid = uuid::Uuid::new_v4().to_string();
    // The short name is the trailing segment of the UUID.
    let name = uuid
        .rsplit('-')
        .next()
        .unwrap_or_default()
        .to_string();

    let rootfs = config.rootfs_path()?;
    let console = console_device(config);
    let procsock = format!(
        "socket,id=procsock,path={},server,nowait",
        config.procsock_path().display()
    );
    let net_params = network::kernel_net_params(net).join(" ");

    for (count, arg) in args.iter_mut().enumerate() {
        if count == 0 && !Path::new(arg.as_str()).is_absolute() {
            // The command must be an absolute path; fall back to PATH lookup.
            if let Ok(cmd) = which::which(arg.as_str()) {
                *arg = cmd.display().to_string();
            }
        }

        let expanded = arg
            .replace("@WORKLOAD_DIR@", &rootfs.display().to_string())
            .replace("@KERNEL@", &vm.kernel_path().display().to_string())
            .replace("@KERNEL_PARAMS@", vm.kernel_params())
            .replace("@KERNEL_NET_PARAMS@", &net_params)
            .replace("@IMAGE@", &vm.image_path().display().to_string())
            .replace("@SIZE@", &image_size)
            .replace("@COMMS_SOCKET@", &config.comms_path().display().to_string())
            .replace("@PROCESS_SOCKET@", &procsock)
            .replace("@CONSOLE_DEVICE@", &console)
            .replace("@NAME@", &name)
            .replace("@UUID@", &uuid)
            .replace(
                "@AGENT_CTL_SOCKET@",
                &config.agent_ctl_path().display().to_string(),
            )
            .replace(
                "@AGENT_TTY_SOCKET@",
                &config.agent_tty_path().display().to_string(),
            );
        *arg = expanded;
    }

    args.extend(network::netdev_args(net));

    Ok(args)
}

/// Produce the full expanded hypervisor command line.
pub fn vm_args(config: &mut ContainerConfig, net: &NetConfig) -> Result<Vec<String>> {
    let template = args_file_path(config)?;
    let args = file_to_args(&template)?;
    if args.is_empty() {
        bail!("arguments template {} is empty", template.display());
    }
    expand_args(config, args, net)
}

#[async_trait]
/// Transport for control commands to the hypervisor socket, replaceable for
/// testing.
pub trait CommsTransport: Debug + DynClone + Send + Sync {
    /// Send the JSON commands and collect whatever replies arrive before the
    /// hypervisor goes quiet.
    async fn execute(&self, socket: &Path, commands: &[serde_json::Value]) -> Result<Vec<String>> {
        let stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("connect to hypervisor socket {}", socket.display()))?;
        let (read_half, mut write_half) = stream.into_split();

        for command in commands {
            let mut line = command.to_string();
            line.push('\n');
            write_half
                .write_all(line.as_bytes())
                .await
                .context("write hypervisor command")?;
        }

        let mut replies = Vec::new();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Ok(Some(line))) =
            tokio::time::timeout(Duration::from_secs(2), lines.next_line()).await
        {
            replies.push(line);
        }

        Ok(replies)
    }
}

clone_trait_object!(CommsTransport);

#[derive(Clone, Debug, Default)]
/// The production transport.
struct DefaultCommsTransport;

impl CommsTransport for DefaultCommsTransport {}

#[derive(Builder, Debug, Getters)]
#[builder(pattern = "owned", setter(into))]
/// Client for the hypervisor control socket.
pub struct Comms {
    #[getset(get)]
    #[builder(private, default = "Box::new(DefaultCommsTransport)")]
    /// The transport used to reach the socket.
    transport: Box<dyn CommsTransport>,

    #[getset(get = "pub")]
    /// Path of the control socket.
    socket_path: PathBuf,
}

impl Comms {
    #[cfg(test)]
    fn set_transport(&mut self, transport: Box<dyn CommsTransport>) {
        self.transport = transport;
    }

    fn run(&self, command: &str) -> Result<Vec<String>> {
        let commands = vec![json!({"execute": "qmp_capabilities"}), json!({"execute": command})];

        let runtime = RuntimeBuilder::new_current_thread()
            .enable_all()
            .build()
            .context("build comms runtime")?;

        runtime.block_on(self.transport.execute(&self.socket_path, &commands))
    }

    /// Ask the hypervisor to shut down.
    pub fn shutdown(&self) -> Result<()> {
        debug!("sending shutdown to {}", self.socket_path.display());
        self.run("quit").map(|_| ())
    }

    /// Pause guest execution.
    pub fn pause(&self) -> Result<()> {
        debug!("pausing VM via {}", self.socket_path.display());
        self.run("stop").map(|_| ())
    }

    /// Resume guest execution.
    pub fn resume(&self) -> Result<()> {
        debug!("resuming VM via {}", self.socket_path.display());
        self.run("cont").map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ContainerConfigBuilder, network::NetConfig};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn write_template(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join(ARGS_FILE);
        fs::write(&path, contents).expect("write template");
        path
    }

    #[test]
    fn template_parsing_strips_comments() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_template(
            dir.path(),
            "# leading comment\n/usr/bin/qemu-lite\n\n   # indented comment\n-m\n2G\n",
        );

        let args = file_to_args(&path)?;
        assert_eq!(args, vec!["/usr/bin/qemu-lite", "-m", "2G"]);
        Ok(())
    }

    #[test]
    fn template_search_order() -> Result<()> {
        let bundle = TempDir::new()?;
        let sysconf = TempDir::new()?;

        let sys_file = write_template(sysconf.path(), "a");
        let candidates = vec![
            bundle.path().join(ARGS_FILE),
            sys_file.clone(),
        ];
        assert_eq!(find_args_file(&candidates)?, sys_file);

        let bundle_file = write_template(bundle.path(), "b");
        assert_eq!(find_args_file(&candidates)?, bundle_file);

        assert!(find_args_file(&[PathBuf::from("/nonexistent/args")]).is_err());
        Ok(())
    }

    fn expansion_config(dir: &TempDir) -> Result<ContainerConfig> {
        let image = dir.path().join("root.img");
        fs::write(&image, vec![0u8; 1234])?;
        let kernel = dir.path().join("vmlinux");
        fs::write(&kernel, b"kernel")?;
        fs::create_dir_all(dir.path().join("rootfs"))?;

        Ok(ContainerConfigBuilder::default()
            .container_id("expand-1")
            .bundle_path(dir.path().to_path_buf())
            .root_dir(dir.path().to_path_buf())
            .spec(
                crate::oci_spec::SpecBuilder::default()
                    .root(crate::oci_spec::RootBuilder::default().path("rootfs").build()?)
                    .build()?,
            )
            .vm(
                crate::config::VmConfigBuilder::default()
                    .hypervisor_path("/usr/bin/qemu-lite")
                    .image_path(image)
                    .kernel_path(kernel)
                    .kernel_params("quiet agent.use_vsock=false")
                    .build()?,
            )
            .build()?)
    }

    #[test]
    fn expansion_substitutes_tokens() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = expansion_config(&dir)?;

        let args = vec![
            "sh".to_string(),
            "-kernel".into(),
            "@KERNEL@".into(),
            "-append".into(),
            "@KERNEL_PARAMS@ @KERNEL_NET_PARAMS@".into(),
            "-drive".into(),
            "file=@IMAGE@,size=@SIZE@".into(),
            "-chardev".into(),
            "@PROCESS_SOCKET@".into(),
            "-chardev".into(),
            "@CONSOLE_DEVICE@".into(),
            "-uuid".into(),
            "@UUID@".into(),
            "-name".into(),
            "@NAME@".into(),
            "-monitor".into(),
            "unix:@COMMS_SOCKET@".into(),
            "@UNKNOWN_TOKEN@".into(),
        ];

        let expanded = expand_args(&mut config, args, &NetConfig::new("guest"))?;

        // The first argument is resolved through PATH.
        assert!(Path::new(&expanded[0]).is_absolute());
        assert!(expanded[0].ends_with("/sh"));

        assert_eq!(expanded[2], dir.path().join("vmlinux").display().to_string());
        assert!(expanded[4].starts_with("quiet agent.use_vsock=false"));
        assert!(expanded[6].contains(&format!("size={}", 1234)));
        assert!(expanded[8].contains("socket,id=procsock,path="));
        assert!(expanded[8].contains("process.sock"));
        assert!(expanded[10].contains("console.sock"));

        // A random RFC-4122 UUID, and the short name derived from it.
        let uuid = &expanded[12];
        assert_eq!(uuid.len(), 36);
        assert_eq!(expanded[14], uuid.rsplit('-').next().expect("uuid segment"));

        assert!(expanded[16].ends_with("hypervisor.sock"));

        // Unknown placeholders pass through unchanged.
        assert_eq!(expanded[17], "@UNKNOWN_TOKEN@");

        // No interfaces configured: networking is disabled explicitly.
        assert_eq!(expanded[expanded.len() - 2], "-net");
        assert_eq!(expanded[expanded.len() - 1], "none");

        // The console fell back to a socket below the runtime directory.
        assert!(config.use_socket_console());
        Ok(())
    }

    #[test]
    fn expansion_keeps_configured_console() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = expansion_config(&dir)?;
        config.set_console(Some(PathBuf::from("/dev/pts/7")));

        let expanded = expand_args(
            &mut config,
            vec!["/usr/bin/qemu-lite".to_string(), "@CONSOLE_DEVICE@".into()],
            &NetConfig::new("guest"),
        )?;

        assert_eq!(expanded[1], "tty,id=charconsole0,path=/dev/pts/7");
        assert!(!config.use_socket_console());
        Ok(())
    }

    #[test]
    fn vm_args_requires_template() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = expansion_config(&dir)?;
        assert!(vm_args(&mut config, &NetConfig::new("")).is_err());

        write_template(dir.path(), "/usr/bin/qemu-lite\n-kernel\n@KERNEL@\n");
        let args = vm_args(&mut config, &NetConfig::new(""))?;
        assert_eq!(args[0], "/usr/bin/qemu-lite");
        Ok(())
    }

    #[derive(Clone, Debug, Default)]
    struct RecordingTransport {
        commands: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    #[async_trait]
    impl CommsTransport for RecordingTransport {
        async fn execute(
            &self,
            _socket: &Path,
            commands: &[serde_json::Value],
        ) -> Result<Vec<String>> {
            self.commands
                .lock()
                .expect("lock")
                .extend(commands.iter().cloned());
            Ok(vec![r#"{"return": {}}"#.to_string()])
        }
    }

    #[test]
    fn comms_command_sequences() -> Result<()> {
        let transport = RecordingTransport::default();
        let commands = transport.commands.clone();

        let mut comms = CommsBuilder::default()
            .socket_path("/run/test/hypervisor.sock")
            .build()?;
        comms.set_transport(Box::new(transport));

        comms.shutdown()?;
        comms.pause()?;
        comms.resume()?;

        let recorded = commands.lock().expect("lock");
        let executed: Vec<&str> = recorded
            .iter()
            .map(|c| c["execute"].as_str().expect("execute"))
            .collect();
        assert_eq!(
            executed,
            vec![
                "qmp_capabilities",
                "quit",
                "qmp_capabilities",
                "stop",
                "qmp_capabilities",
                "cont"
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn default_transport_reaches_socket() -> Result<()> {
        let dir = TempDir::new()?;
        let socket_path = dir.path().join("hypervisor.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path)?;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read_half, mut write_half) = stream.into_split();
            write_half
                .write_all(b"{\"QMP\": {\"version\": {}}}\n")
                .await
                .expect("greeting");

            let mut lines = BufReader::new(read_half).lines();
            let mut received = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                received.push(line);
                if received.len() == 2 {
                    break;
                }
            }
            received
        });

        let transport = DefaultCommsTransport;
        let replies = transport
            .execute(
                &socket_path,
                &[json!({"execute": "qmp_capabilities"}), json!({"execute": "quit"})],
            )
            .await?;
        assert!(!replies.is_empty());

        let received = server.await.expect("server");
        assert!(received[0].contains("qmp_capabilities"));
        assert!(received[1].contains("quit"));
        Ok(())
    }

    #[test]
    fn comms_fails_without_socket() -> Result<()> {
        let comms = CommsBuilder::default()
            .socket_path("/nonexistent/hypervisor.sock")
            .build()?;
        assert!(comms.shutdown().is_err());
        Ok(())
    }
}
