//! The shim: the process the orchestrator knows as "the container".
//!
//! One shim runs per container. It owns the caller-facing standard streams
//! and bridges them to the proxy: stdin becomes sequence-numbered stream
//! frames, inbound frames are demultiplexed to stdout/stderr, caught
//! signals are forwarded as guest agent commands, and the workload's exit
//! status becomes the shim's own exit code.
//!
//! The event loop is a single-threaded poll over four descriptors: a
//! self-pipe fed by the signal handler, stdin, the proxy I/O channel and
//! the proxy control channel.

use crate::{
    protocol::{
        encode_ctl_message, StreamFrame, CTL_HEADER_SIZE, STREAM_EOF_SIZE,
        STREAM_EXIT_STATUS_SIZE, STREAM_HEADER_SIZE,
    },
    proxy::hyper_payload,
};
use anyhow::{bail, Context, Result};
use getset::{CopyGetters, Getters};
use derive_builder::Builder;
use log::{debug, warn};
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
    poll::{poll, PollFd, PollFlags},
    sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd::{pipe2, read, write},
};
use serde_json::Value;
use std::{
    os::unix::io::RawFd,
    sync::atomic::{AtomicI32, Ordering},
};

/// Signals the shim catches and forwards.
pub const FORWARDED_SIGNALS: &[Signal] = &[
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGWINCH,
];

/// Read chunk size for stdin and the proxy channels.
const BUF_SIZE: usize = 8192;

/// Write end of the signal self-pipe, the only state the handler touches.
static SIGNAL_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_handler(signum: libc::c_int) {
    // Async-signal-safe: a single write to the self-pipe, errno preserved.
    unsafe {
        let errno = libc::__errno_location();
        let saved = *errno;
        let fd = SIGNAL_PIPE_WR.load(Ordering::Relaxed);
        if fd >= 0 {
            let bytes = signum.to_ne_bytes();
            libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
        }
        *errno = saved;
    }
}

/// Set a descriptor non-blocking.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).context("get descriptor flags")?;
    fcntl(
        fd,
        FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )
    .context("set descriptor non-blocking")?;
    Ok(())
}

/// Install the forwarding handler for all caught signals.
fn setup_signal_handlers(pipe_wr: RawFd) -> Result<()> {
    SIGNAL_PIPE_WR.store(pipe_wr, Ordering::Relaxed);

    let action = SigAction::new(
        SigHandler::Handler(signal_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in FORWARDED_SIGNALS {
        unsafe { sigaction(*signal, &action) }
            .with_context(|| format!("install handler for {}", signal))?;
    }
    Ok(())
}

/// Message sent when the terminal geometry changes.
pub fn winsize_message(container_id: &str, row: u16, col: u16) -> Value {
    hyper_payload(
        "winsize",
        serde_json::json!({
            "container_id": container_id,
            "row": row,
            "col": col,
        }),
    )
}

/// Message forwarding a caught signal to the workload.
pub fn kill_message(container_id: &str, signum: i32) -> Value {
    hyper_payload(
        "killcontainer",
        serde_json::json!({
            "container_id": container_id,
            "signal": signum,
        }),
    )
}

/// Current geometry of the terminal on `fd`.
pub fn terminal_size(fd: RawFd) -> (u16, u16) {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) } == 0 {
        (ws.ws_row, ws.ws_col)
    } else {
        (0, 0)
    }
}

/// Event produced by the stream demultiplexer.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Payload for the caller's stdout.
    Out(Vec<u8>),

    /// Payload for the caller's stderr.
    Err(Vec<u8>),

    /// Data on an unexpected sequence number.
    UnknownSeq(u64),

    /// End-of-stream marker, an exit status frame follows.
    Eof,

    /// The workload's exit status.
    ExitCode(u8),
}

#[derive(Debug)]
/// Incremental parser for the proxy I/O stream channel, tolerant of
/// arbitrary read fragmentation.
pub struct StreamDemux {
    io_seq: u64,
    err_seq: u64,
    exiting: bool,
    buf: Vec<u8>,
}

impl StreamDemux {
    pub fn new(io_seq: u64, err_seq: u64) -> Self {
        Self {
            io_seq,
            err_seq,
            exiting: false,
            buf: Vec::new(),
        }
    }

    /// Feed newly read bytes, draining every complete frame.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<StreamEvent>> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            if self.buf.len() < STREAM_HEADER_SIZE {
                break;
            }
            let (seq, total) = StreamFrame::decode_header(&self.buf)?;
            if self.buf.len() < total as usize {
                break;
            }

            let frame: Vec<u8> = self.buf.drain(..total as usize).collect();

            if total == STREAM_EOF_SIZE {
                self.exiting = true;
                events.push(StreamEvent::Eof);
                continue;
            }
            if self.exiting && total == STREAM_EXIT_STATUS_SIZE {
                events.push(StreamEvent::ExitCode(frame[STREAM_HEADER_SIZE]));
                continue;
            }

            let payload = frame[STREAM_HEADER_SIZE..].to_vec();
            if seq == self.io_seq {
                events.push(StreamEvent::Out(payload));
            } else if seq == self.err_seq {
                events.push(StreamEvent::Err(payload));
            } else {
                events.push(StreamEvent::UnknownSeq(seq));
            }
        }

        Ok(events)
    }
}

#[derive(Debug, Default)]
/// Incremental parser for framed control channel replies.
pub struct CtlDemux {
    buf: Vec<u8>,
}

impl CtlDemux {
    /// Feed newly read bytes, draining every complete payload.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut payloads = Vec::new();

        loop {
            if self.buf.len() < CTL_HEADER_SIZE {
                break;
            }
            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if self.buf.len() < CTL_HEADER_SIZE + len {
                break;
            }
            let message: Vec<u8> = self.buf.drain(..CTL_HEADER_SIZE + len).collect();
            payloads.push(message[CTL_HEADER_SIZE..].to_vec());
        }

        payloads
    }
}

#[derive(Builder, Debug, Getters, CopyGetters)]
#[builder(pattern = "owned", setter(into))]
/// Everything the shim needs to run.
pub struct Shim {
    #[getset(get = "pub")]
    /// Container the shim fronts.
    container_id: String,

    #[getset(get_copy = "pub")]
    /// Inherited proxy control channel.
    proxy_ctl_fd: RawFd,

    #[getset(get_copy = "pub")]
    /// Proxy I/O channel received over the launcher socket.
    proxy_io_fd: RawFd,

    #[getset(get_copy = "pub")]
    /// Sequence number for stdin/stdout.
    io_seq: u64,

    #[getset(get_copy = "pub")]
    /// Sequence number for stderr.
    err_seq: u64,

    #[getset(get_copy = "pub")]
    #[builder(default = "libc::STDIN_FILENO")]
    /// Caller-facing input.
    stdin_fd: RawFd,

    #[getset(get_copy = "pub")]
    #[builder(default = "libc::STDOUT_FILENO")]
    /// Caller-facing output.
    stdout_fd: RawFd,

    #[getset(get_copy = "pub")]
    #[builder(default = "libc::STDERR_FILENO")]
    /// Caller-facing error output.
    stderr_fd: RawFd,
}

/// Write the whole buffer, waiting out EAGAIN on the non-blocking fd.
fn write_all(fd: RawFd, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        match write(fd, data) {
            Ok(n) => data = &data[n..],
            Err(Errno::EAGAIN) => {
                let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
                poll(&mut fds, -1).context("wait for writable descriptor")?;
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("write descriptor"),
        }
    }
    Ok(())
}

impl Shim {
    /// Forward one caught signal as the matching agent command.
    fn handle_signal(&self, signum: i32) -> Result<()> {
        let message = if signum == Signal::SIGWINCH as i32 {
            let (row, col) = terminal_size(self.stdin_fd);
            debug!("forwarding window resize ({}x{})", row, col);
            winsize_message(&self.container_id, row, col)
        } else {
            debug!("forwarding signal {}", signum);
            kill_message(&self.container_id, signum)
        };

        let bytes = serde_json::to_vec(&message).context("serialize signal message")?;
        write_all(self.proxy_ctl_fd, &encode_ctl_message(&bytes))
    }

    /// Forward one chunk of caller input as a stream frame. Returns false
    /// on stdin EOF.
    fn handle_stdin(&self) -> Result<bool> {
        let mut buf = [0u8; BUF_SIZE];
        match read(self.stdin_fd, &mut buf) {
            Ok(0) => {
                debug!("stdin closed, sending end-of-stream");
                let frame = StreamFrame::new(self.io_seq, b"");
                write_all(self.proxy_io_fd, &frame.encode())?;
                Ok(false)
            }
            Ok(n) => {
                let frame = StreamFrame::new(self.io_seq, &buf[..n]);
                write_all(self.proxy_io_fd, &frame.encode())?;
                Ok(true)
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(true),
            Err(e) => Err(e).context("read stdin"),
        }
    }

    /// Run the event loop until the workload exits.
    ///
    /// The returned value is the exit code the shim should terminate with.
    pub fn run(&self) -> Result<i32> {
        let (signal_rd, signal_wr) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).context("create signal pipe")?;
        setup_signal_handlers(signal_wr)?;

        set_nonblocking(self.stdin_fd).context("stdin")?;
        set_nonblocking(self.proxy_io_fd).context("proxy I/O channel")?;
        set_nonblocking(self.proxy_ctl_fd).context("proxy control channel")?;

        let mut stream_demux = StreamDemux::new(self.io_seq, self.err_seq);
        let mut ctl_demux = CtlDemux::default();
        let mut stdin_open = true;

        debug!(
            "shim for {} entering event loop (io seq {}, err seq {})",
            self.container_id, self.io_seq, self.err_seq
        );

        loop {
            let mut fds = [
                PollFd::new(signal_rd, PollFlags::POLLIN),
                PollFd::new(
                    if stdin_open { self.stdin_fd } else { -1 },
                    PollFlags::POLLIN,
                ),
                PollFd::new(self.proxy_io_fd, PollFlags::POLLIN),
                PollFd::new(self.proxy_ctl_fd, PollFlags::POLLIN),
            ];

            match poll(&mut fds, -1) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("poll"),
            }

            let revents: Vec<PollFlags> = fds
                .iter()
                .map(|fd| fd.revents().unwrap_or_else(PollFlags::empty))
                .collect();

            // Signals first, so a pending kill is not starved by stream
            // traffic.
            if revents[0].intersects(PollFlags::POLLIN) {
                let mut buf = [0u8; 4];
                while let Ok(n) = read(signal_rd, &mut buf) {
                    if n < 4 {
                        break;
                    }
                    self.handle_signal(i32::from_ne_bytes(buf))?;
                }
            }

            if stdin_open && !revents[1].is_empty() {
                stdin_open = self.handle_stdin()?;
            }

            if !revents[2].is_empty() {
                let mut buf = [0u8; BUF_SIZE];
                loop {
                    match read(self.proxy_io_fd, &mut buf) {
                        Ok(0) => bail!("proxy I/O channel closed unexpectedly"),
                        Ok(n) => {
                            for event in stream_demux.feed(&buf[..n])? {
                                match event {
                                    StreamEvent::Out(data) => {
                                        write_all(self.stdout_fd, &data)?
                                    }
                                    StreamEvent::Err(data) => {
                                        write_all(self.stderr_fd, &data)?
                                    }
                                    StreamEvent::UnknownSeq(seq) => {
                                        warn!("dropping frame with unknown sequence {}", seq)
                                    }
                                    StreamEvent::Eof => {
                                        debug!("workload streams closed")
                                    }
                                    StreamEvent::ExitCode(code) => {
                                        debug!("workload exited with code {}", code);
                                        return Ok(i32::from(code));
                                    }
                                }
                            }
                        }
                        Err(Errno::EAGAIN) => break,
                        Err(Errno::EINTR) => continue,
                        Err(e) => return Err(e).context("read proxy I/O channel"),
                    }
                }
            }

            if !revents[3].is_empty() {
                let mut buf = [0u8; BUF_SIZE];
                loop {
                    match read(self.proxy_ctl_fd, &mut buf) {
                        Ok(0) => bail!("proxy control channel closed"),
                        Ok(n) => {
                            for payload in ctl_demux.feed(&buf[..n]) {
                                debug!(
                                    "proxy response: {}",
                                    String::from_utf8_lossy(&payload)
                                );
                            }
                        }
                        Err(Errno::EAGAIN) => break,
                        Err(Errno::EINTR) => continue,
                        Err(e) => return Err(e).context("read proxy control channel"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::{io::AsRawFd, net::UnixStream};

    #[test]
    fn demux_single_frames() -> Result<()> {
        let mut demux = StreamDemux::new(4, 5);

        let events = demux.feed(&StreamFrame::new(4, b"to stdout").encode())?;
        assert_eq!(events, vec![StreamEvent::Out(b"to stdout".to_vec())]);

        let events = demux.feed(&StreamFrame::new(5, b"to stderr").encode())?;
        assert_eq!(events, vec![StreamEvent::Err(b"to stderr".to_vec())]);

        let events = demux.feed(&StreamFrame::new(99, b"elsewhere").encode())?;
        assert_eq!(events, vec![StreamEvent::UnknownSeq(99)]);
        Ok(())
    }

    #[test]
    fn demux_handles_fragmentation() -> Result<()> {
        let mut demux = StreamDemux::new(4, 5);
        let encoded = StreamFrame::new(4, b"split").encode();

        // Byte-by-byte delivery produces the event exactly once.
        let mut events = Vec::new();
        for byte in &encoded {
            events.extend(demux.feed(&[*byte])?);
        }
        assert_eq!(events, vec![StreamEvent::Out(b"split".to_vec())]);
        Ok(())
    }

    #[test]
    fn demux_coalesced_frames() -> Result<()> {
        let mut demux = StreamDemux::new(4, 5);
        let mut bytes = StreamFrame::new(4, b"one").encode();
        bytes.extend(StreamFrame::new(5, b"two").encode());

        let events = demux.feed(&bytes)?;
        assert_eq!(
            events,
            vec![
                StreamEvent::Out(b"one".to_vec()),
                StreamEvent::Err(b"two".to_vec()),
            ]
        );
        Ok(())
    }

    #[test]
    fn demux_exit_sequence() -> Result<()> {
        let mut demux = StreamDemux::new(4, 5);

        // EOF marker (header only), then the one-byte exit status.
        let mut bytes = StreamFrame::new(4, b"").encode();
        bytes.extend(StreamFrame::new(4, &[42]).encode());

        let events = demux.feed(&bytes)?;
        assert_eq!(events, vec![StreamEvent::Eof, StreamEvent::ExitCode(42)]);
        Ok(())
    }

    #[test]
    fn demux_one_byte_frame_without_eof_is_data() -> Result<()> {
        let mut demux = StreamDemux::new(4, 5);
        let events = demux.feed(&StreamFrame::new(4, &[7]).encode())?;
        assert_eq!(events, vec![StreamEvent::Out(vec![7])]);
        Ok(())
    }

    #[test]
    fn ctl_demux_reassembles_messages() {
        let mut demux = CtlDemux::default();
        let mut bytes = encode_ctl_message(br#"{"success":true}"#);
        bytes.extend(encode_ctl_message(br#"{"success":false}"#));

        let (head, tail) = bytes.split_at(10);
        assert!(demux.feed(head).is_empty());
        let payloads = demux.feed(tail);
        assert_eq!(
            payloads,
            vec![
                br#"{"success":true}"#.to_vec(),
                br#"{"success":false}"#.to_vec(),
            ]
        );
    }

    #[test]
    fn signal_messages() {
        let msg = winsize_message("c1", 24, 80);
        assert_eq!(msg["id"], "hyper");
        assert_eq!(msg["data"]["hyperName"], "winsize");
        assert_eq!(msg["data"]["data"]["container_id"], "c1");
        assert_eq!(msg["data"]["data"]["row"], 24);
        assert_eq!(msg["data"]["data"]["col"], 80);

        let msg = kill_message("c1", Signal::SIGTERM as i32);
        assert_eq!(msg["data"]["hyperName"], "killcontainer");
        assert_eq!(msg["data"]["data"]["signal"], 15);
    }

    fn test_shim(
        io: &UnixStream,
        ctl: &UnixStream,
        stdin: RawFd,
        stdout: RawFd,
        stderr: RawFd,
    ) -> Shim {
        ShimBuilder::default()
            .container_id("shim-test")
            .proxy_io_fd(io.as_raw_fd())
            .proxy_ctl_fd(ctl.as_raw_fd())
            .io_seq(8u64)
            .err_seq(9u64)
            .stdin_fd(stdin)
            .stdout_fd(stdout)
            .stderr_fd(stderr)
            .build()
            .expect("shim")
    }

    #[test]
    fn signals_become_framed_agent_commands() -> Result<()> {
        let (io_local, _io_remote) = UnixStream::pair()?;
        let (ctl_local, mut ctl_remote) = UnixStream::pair()?;
        let (stdin_rd, stdin_wr) = nix::unistd::pipe()?;

        let shim = test_shim(
            &io_local,
            &ctl_local,
            stdin_rd,
            libc::STDOUT_FILENO,
            libc::STDERR_FILENO,
        );

        shim.handle_signal(Signal::SIGTERM as i32)?;
        shim.handle_signal(Signal::SIGWINCH as i32)?;

        let mut demux = CtlDemux::default();
        let mut messages = Vec::new();
        {
            use std::io::Read;
            let mut buf = [0u8; 1024];
            while messages.len() < 2 {
                let n = ctl_remote.read(&mut buf)?;
                for payload in demux.feed(&buf[..n]) {
                    messages.push(serde_json::from_slice::<Value>(&payload)?);
                }
            }
        }

        assert_eq!(messages[0]["data"]["hyperName"], "killcontainer");
        assert_eq!(messages[0]["data"]["data"]["signal"], Signal::SIGTERM as i32);

        // Stdin is a pipe here, so the reported geometry is zero.
        assert_eq!(messages[1]["data"]["hyperName"], "winsize");
        assert_eq!(messages[1]["data"]["data"]["row"], 0);
        assert_eq!(messages[1]["data"]["data"]["col"], 0);

        for fd in [stdin_rd, stdin_wr] {
            let _ = nix::unistd::close(fd);
        }
        Ok(())
    }

    #[test]
    fn event_loop_bridges_streams_and_exit_code() -> Result<()> {
        let (io_local, io_remote) = UnixStream::pair()?;
        let (ctl_local, _ctl_remote) = UnixStream::pair()?;
        let (stdin_rd, stdin_wr) = nix::unistd::pipe()?;
        let (stdout_rd, stdout_wr) = nix::unistd::pipe()?;
        let (stderr_rd, stderr_wr) = nix::unistd::pipe()?;

        let shim = test_shim(&io_local, &ctl_local, stdin_rd, stdout_wr, stderr_wr);
        let worker = std::thread::spawn(move || shim.run());

        // Caller input is framed onto the I/O channel with the stdin
        // sequence number.
        nix::unistd::write(stdin_wr, b"typed input")?;
        let mut remote = io_remote.try_clone()?;
        {
            use std::io::Read;
            let mut frame = vec![0u8; STREAM_HEADER_SIZE + b"typed input".len()];
            remote.read_exact(&mut frame)?;
            let decoded = StreamFrame::decode(&frame)?;
            assert_eq!(decoded.seq, 8);
            assert_eq!(decoded.payload, b"typed input");
        }

        // Guest output lands on the caller's stdout and stderr.
        {
            use std::io::Write;
            remote.write_all(&StreamFrame::new(8, b"guest stdout").encode())?;
            remote.write_all(&StreamFrame::new(9, b"guest stderr").encode())?;
            remote.write_all(&StreamFrame::new(8, b"").encode())?;
            remote.write_all(&StreamFrame::new(8, &[3]).encode())?;
        }

        let exit_code = worker.join().expect("join").expect("run");
        assert_eq!(exit_code, 3);

        let mut buf = [0u8; 64];
        let n = nix::unistd::read(stdout_rd, &mut buf)?;
        assert_eq!(&buf[..n], b"guest stdout");
        let n = nix::unistd::read(stderr_rd, &mut buf)?;
        assert_eq!(&buf[..n], b"guest stderr");

        for fd in [stdin_wr, stdout_rd, stderr_rd, stdout_wr, stderr_wr, stdin_rd] {
            let _ = nix::unistd::close(fd);
        }
        Ok(())
    }

    #[test]
    fn event_loop_fails_on_io_channel_close() -> Result<()> {
        let (io_local, io_remote) = UnixStream::pair()?;
        let (ctl_local, _ctl_remote) = UnixStream::pair()?;
        let (stdin_rd, stdin_wr) = nix::unistd::pipe()?;
        let (stdout_rd, stdout_wr) = nix::unistd::pipe()?;
        let (stderr_rd, stderr_wr) = nix::unistd::pipe()?;

        let shim = test_shim(&io_local, &ctl_local, stdin_rd, stdout_wr, stderr_wr);
        let worker = std::thread::spawn(move || shim.run());

        drop(io_remote);
        assert!(worker.join().expect("join").is_err());

        for fd in [stdin_wr, stdout_rd, stderr_rd, stdout_wr, stderr_wr, stdin_rd] {
            let _ = nix::unistd::close(fd);
        }
        Ok(())
    }
}
