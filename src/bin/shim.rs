use anyhow::Result;
use clap::Parser;
use std::process;
use virtc::{error, shim::ShimBuilder};

#[derive(Parser, Debug)]
#[clap(
    name = "virtc-shim",
    version,
    about = "Per-container I/O and signal bridge between the engine and the proxy"
)]
struct Args {
    #[clap(long, short = 'c', value_name = "ID")]
    /// Container id
    container_id: String,

    #[clap(long, short = 'p', value_name = "FD")]
    /// Inherited proxy control socket descriptor
    proxy_fd: i32,

    #[clap(long, short = 'o', value_name = "FD")]
    /// Inherited proxy I/O stream descriptor
    proxy_io_fd: i32,

    #[clap(long, short = 's', value_name = "SEQ")]
    /// Sequence number for stdin/stdout
    seq: u64,

    #[clap(long, short = 'e', value_name = "SEQ")]
    /// Sequence number for stderr
    err_seq: u64,
}

fn run(args: Args) -> Result<i32> {
    let shim = ShimBuilder::default()
        .container_id(args.container_id)
        .proxy_ctl_fd(args.proxy_fd)
        .proxy_io_fd(args.proxy_io_fd)
        .io_seq(args.seq)
        .err_seq(args.err_seq)
        .build()?;

    shim.run()
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    match run(args) {
        Ok(code) => process::exit(code),
        Err(e) => process::exit(error::fatal(e)),
    }
}
