//! Client for the proxy daemon.
//!
//! The proxy multiplexes many runtime invocations onto the guest agents.
//! The control channel carries framed JSON messages (`length | reserved |
//! payload`); commands for the guest agent are wrapped in a `hyper`
//! envelope and passed through verbatim.

use crate::{
    config::ContainerConfig,
    protocol::{read_ctl_message, write_ctl_message},
};
use anyhow::{bail, Context, Result};
use crossbeam_channel::RecvTimeoutError;
use derive_builder::Builder;
use getset::Getters;
use log::debug;
use notify::{recommended_watcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use std::{
    io::IoSliceMut,
    os::unix::{
        io::{AsRawFd, RawFd},
        net::UnixStream,
    },
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

/// How long to wait for an agent socket to surface before giving up.
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the envelope wrapping a guest agent command.
pub fn hyper_payload(command: &str, data: Value) -> Value {
    json!({
        "id": "hyper",
        "data": {
            "hyperName": command,
            "data": data,
        }
    })
}

/// Validate a proxy reply: `success` must be present and true. A missing
/// field is treated as a protocol error.
pub fn check_response(response: &Value) -> Result<()> {
    match response.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(()),
        Some(false) => bail!(
            "proxy reported failure: {}",
            response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
        ),
        None => bail!("proxy response misses the success field: {}", response),
    }
}

/// Block until `path` exists, watching its parent directory for creation
/// events and polling defensively for the case where it already exists.
pub fn wait_for_path(path: &Path, timeout: Duration) -> Result<()> {
    if path.exists() {
        return Ok(());
    }

    let parent = path
        .parent()
        .with_context(|| format!("no parent directory for {}", path.display()))?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let mut watcher = recommended_watcher(move |event| {
        let _ = tx.send(event);
    })
    .context("create path watcher")?;
    watcher
        .watch(parent, RecursiveMode::NonRecursive)
        .with_context(|| format!("watch directory {}", parent.display()))?;

    let deadline = Instant::now() + timeout;
    loop {
        if path.exists() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("timed out waiting for {}", path.display());
        }
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(_) | Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                bail!("watcher died while waiting for {}", path.display())
            }
        }
    }
}

#[derive(Builder, Debug, Default, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Connection state towards the proxy daemon.
pub struct Proxy {
    #[getset(get = "pub")]
    /// Socket the proxy daemon listens on.
    socket_path: PathBuf,

    #[getset(get = "pub")]
    /// Serial socket carrying the guest agent control channel.
    agent_ctl_socket: PathBuf,

    #[getset(get = "pub")]
    /// Serial socket carrying the guest agent I/O channel.
    agent_tty_socket: PathBuf,

    /// The connected control channel.
    stream: Option<UnixStream>,
}

impl Proxy {
    /// Build a client for the given container, using the well-known proxy
    /// socket.
    pub fn for_container(config: &ContainerConfig) -> Self {
        Self {
            socket_path: PathBuf::from(crate::config::PROXY_SOCKET),
            agent_ctl_socket: config.agent_ctl_path(),
            agent_tty_socket: config.agent_tty_path(),
            stream: None,
        }
    }

    /// Whether the control channel is connected.
    pub fn connected(&self) -> bool {
        self.stream.is_some()
    }

    /// The raw control channel descriptor, needed to hand the connection to
    /// the shim.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    /// Connect the control channel.
    pub fn connect(&mut self) -> Result<()> {
        if self.connected() {
            bail!("already connected to proxy");
        }

        debug!("connecting to proxy {}", self.socket_path.display());
        let stream = UnixStream::connect(&self.socket_path).with_context(|| {
            format!("connect to proxy socket {}", self.socket_path.display())
        })?;
        self.stream = Some(stream);

        Ok(())
    }

    /// Close the control channel. The shim keeps its inherited copy.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.stream.take().is_none() {
            bail!("not connected to proxy");
        }
        debug!("disconnected from proxy");
        Ok(())
    }

    fn stream_mut(&mut self) -> Result<&mut UnixStream> {
        self.stream.as_mut().context("no proxy connection")
    }

    /// Send one framed request and validate the framed reply.
    pub fn request(&mut self, payload: &Value) -> Result<Value> {
        let stream = self.stream_mut()?;

        let bytes = serde_json::to_vec(payload).context("serialize proxy request")?;
        debug!("sending proxy message ({} bytes)", bytes.len());
        write_ctl_message(stream, &bytes)?;

        let reply_bytes = read_ctl_message(stream)?;
        let reply: Value =
            serde_json::from_slice(&reply_bytes).context("parse proxy response")?;
        debug!("proxy replied: {}", reply);

        check_response(&reply)?;
        Ok(reply)
    }

    /// Initial handshake registering this container with the proxy.
    pub fn hello(&mut self, container_id: &str) -> Result<()> {
        let msg = json!({
            "id": "hello",
            "data": {
                "containerId": container_id,
                "ctlSerial": self.agent_ctl_socket.display().to_string(),
                "ioSerial": self.agent_tty_socket.display().to_string(),
            }
        });
        self.request(&msg).map(|_| ())
    }

    /// Attach to the session of an already registered container.
    pub fn attach(&mut self, container_id: &str) -> Result<()> {
        let msg = json!({
            "id": "attach",
            "data": {
                "containerId": container_id,
            }
        });
        self.request(&msg).map(|_| ())
    }

    /// Final message before closing the control channel.
    pub fn bye(&mut self) -> Result<()> {
        self.request(&json!({"id": "bye"})).map(|_| ())
    }

    /// Wait for the agent control socket to surface, then handshake.
    pub fn wait_until_ready(&mut self, container_id: &str) -> Result<()> {
        // Launching the hypervisor does not guarantee the serial sockets
        // exist yet, and the proxy cannot service us before they do.
        wait_for_path(&self.agent_ctl_socket, READY_TIMEOUT)?;
        self.hello(container_id)
    }

    /// Ask the proxy to allocate an I/O stream pair.
    ///
    /// Returns the received I/O channel descriptor and the base sequence
    /// number; the base is used for stdin/stdout, base + 1 for stderr.
    pub fn allocate_io(&mut self, terminal: bool) -> Result<(RawFd, u64)> {
        let msg = json!({
            "id": "allocateIO",
            "data": {
                "nStreams": 2,
                "terminal": terminal,
            }
        });

        let stream = self.stream_mut()?;
        let bytes = serde_json::to_vec(&msg).context("serialize allocateIO")?;
        write_ctl_message(stream, &bytes)?;

        // The reply arrives with the I/O descriptor as ancillary data.
        let mut buf = vec![0u8; 4096];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
        let (received, io_fd) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = nix::sys::socket::recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                nix::sys::socket::MsgFlags::empty(),
            )
            .context("receive allocateIO reply")?;

            let mut io_fd = None;
            for cmsg in msg.cmsgs() {
                if let nix::sys::socket::ControlMessageOwned::ScmRights(fds) = cmsg {
                    io_fd = fds.first().copied();
                }
            }
            (msg.bytes, io_fd)
        };

        let reply_bytes = &buf[..received];
        if reply_bytes.len() < crate::protocol::CTL_HEADER_SIZE {
            bail!("allocateIO reply truncated: {} bytes", reply_bytes.len());
        }
        let reply: Value = serde_json::from_slice(&reply_bytes[crate::protocol::CTL_HEADER_SIZE..])
            .context("parse allocateIO reply")?;
        check_response(&reply)?;

        let io_base = reply
            .get("ioBase")
            .and_then(Value::as_u64)
            .context("allocateIO reply misses ioBase")?;
        let io_fd = io_fd.context("allocateIO reply carried no descriptor")?;

        debug!("allocated I/O streams at base {}", io_base);
        Ok((io_fd, io_base))
    }

    /// Forward a command to the guest agent.
    pub fn hyper(&mut self, command: &str, data: Value) -> Result<()> {
        debug!("running hyper command {}", command);
        self.request(&hyper_payload(command, data)).map(|_| ())
    }

    /// Create the pod sandbox inside the VM.
    pub fn start_pod(&mut self, hostname: &str) -> Result<()> {
        self.hyper(
            "startpod",
            json!({
                "hostname": hostname,
                "containers": [],
                "shareDir": "rootfs",
            }),
        )
    }

    /// Start a container inside the pod.
    pub fn new_container(&mut self, container_id: &str, workload: Value) -> Result<()> {
        self.hyper(
            "newcontainer",
            json!({
                "id": container_id,
                "rootfs": "rootfs",
                "process": workload,
            }),
        )
    }

    /// Deliver a signal to the in-guest workload.
    pub fn kill_container(&mut self, container_id: &str, signal: i32) -> Result<()> {
        self.hyper(
            "killcontainer",
            json!({
                "container_id": container_id,
                "signal": signal,
            }),
        )
    }

    /// Propagate a terminal resize.
    pub fn winsize(&mut self, container_id: &str, row: u16, col: u16) -> Result<()> {
        self.hyper(
            "winsize",
            json!({
                "container_id": container_id,
                "row": row,
                "col": col,
            }),
        )
    }

    /// Tear the pod down.
    pub fn destroy_pod(&mut self) -> Result<()> {
        self.hyper("destroypod", json!({}))
    }

    /// Run a command inside a container of the pod.
    pub fn exec_command(&mut self, container_id: &str, process: Value) -> Result<()> {
        self.hyper(
            "execcmd",
            json!({
                "container": container_id,
                "process": process,
            }),
        )
    }
}
