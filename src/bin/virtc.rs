use anyhow::{bail, Context, Result};
use clap::Parser;
use log::warn;
use std::process;
use virtc::{
    cli::{parse_signal, Cli, Command},
    config::{ContainerConfig, ContainerConfigBuilder, SUPPORTED_SPEC_VERSION},
    error,
    lifecycle,
    logging,
    oci_spec,
    state::State,
};

/// Build the configuration shared by all subcommands.
fn base_config(cli: &Cli, container_id: &str) -> Result<ContainerConfigBuilder> {
    Ok(ContainerConfigBuilder::default()
        .container_id(container_id.to_string())
        .root_dir(cli.root.clone()))
}

/// Load the state document and rehydrate the configuration from it,
/// re-reading the bundle's OCI config when it is still around (hooks and
/// terminal settings live there).
fn config_with_state(cli: &Cli, container_id: &str) -> Result<(ContainerConfig, State)> {
    let mut config = base_config(cli, container_id)?.build()?;

    let state = State::read(&config.runtime_path())
        .with_context(|| format!("failed to read state file for container {}", container_id))?;

    if oci_spec::config_file_path(state.bundle_path()).is_file() {
        config.set_bundle_path(Some(state.bundle_path().clone()));
        if let Err(e) = config.parse_bundle() {
            warn!("cannot reload bundle config: {}", error::chain(e));
        }
    }

    // The state document wins over anything the bundle says now.
    config.update_from_state(&state)?;

    Ok((config, state))
}

fn dispatch(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Command::Create {
            bundle,
            console,
            pid_file,
            dry_run,
            container_id,
        } => {
            let mut builder = base_config(cli, container_id)?
                .bundle_path(bundle.clone())
                .dry_run(*dry_run);
            if let Some(console) = console {
                builder = builder.console(console.clone());
            }
            if let Some(pid_file) = pid_file {
                builder = builder.pid_file(pid_file.clone());
            }
            let mut config = builder.build()?;
            lifecycle::create(&mut config)?;
            Ok(0)
        }

        Command::Start {
            detach,
            container_id,
        } => {
            let (mut config, state) = config_with_state(cli, container_id)?;
            config.set_detached(*detach);
            lifecycle::start(&mut config, &state)?;
            Ok(0)
        }

        Command::Run {
            bundle,
            console,
            pid_file,
            detach,
            dry_run,
            container_id,
        } => {
            let mut builder = base_config(cli, container_id)?
                .bundle_path(bundle.clone())
                .detached(*detach)
                .dry_run(*dry_run);
            if let Some(console) = console {
                builder = builder.console(console.clone());
            }
            if let Some(pid_file) = pid_file {
                builder = builder.pid_file(pid_file.clone());
            }
            let mut config = builder.build()?;
            lifecycle::run(&mut config)?;
            Ok(0)
        }

        Command::Stop { container_id } => {
            let (mut config, state) = config_with_state(cli, container_id)?;
            lifecycle::stop(&mut config, &state)?;
            Ok(0)
        }

        Command::Kill {
            container_id,
            signal,
        } => {
            let signum = parse_signal(signal.as_deref())?;
            let mut config = base_config(cli, container_id)?.build()?;
            lifecycle::kill(&mut config, signum)?;
            Ok(0)
        }

        Command::Delete { container_id } => {
            let mut config = base_config(cli, container_id)?.build()?;
            lifecycle::delete(&mut config)?;
            Ok(0)
        }

        Command::State { container_id } => {
            let config = base_config(cli, container_id)?.build()?;
            println!("{}", lifecycle::container_state(&config)?);
            Ok(0)
        }

        Command::List { format, all, quiet } => {
            let format = format
                .parse::<lifecycle::ListFormat>()
                .map_err(|_| anyhow::anyhow!("invalid list format: {}", format))?;
            let out = lifecycle::list(&cli.root, format, *all, *quiet)?;
            println!("{}", out);
            Ok(0)
        }

        Command::Exec {
            container_id,
            args,
        } => {
            let (mut config, state) = config_with_state(cli, container_id)?;
            lifecycle::exec(&mut config, &state, args)
        }

        Command::Pause { container_id } => {
            let (mut config, state) = config_with_state(cli, container_id)?;
            lifecycle::toggle(&mut config, &state, true)?;
            Ok(0)
        }

        Command::Resume { container_id } => {
            let (mut config, state) = config_with_state(cli, container_id)?;
            lifecycle::toggle(&mut config, &state, false)?;
            Ok(0)
        }

        Command::Attach { container_id } => {
            let (mut config, state) = config_with_state(cli, container_id)?;
            lifecycle::attach(&mut config, &state)?;
            Ok(0)
        }

        Command::Ps {
            container_id,
            ps_args,
        } => {
            let (mut config, state) = config_with_state(cli, container_id)?;
            lifecycle::ps(&mut config, &state, ps_args)
        }

        Command::Events { .. } => bail!("events is not supported by this runtime"),
        Command::Update { .. } => bail!("update is not supported by this runtime"),
        Command::Checkpoint { .. } => bail!("checkpoint is not supported by this runtime"),
        Command::Restore { .. } => bail!("restore is not supported by this runtime"),

        Command::Version => {
            println!(
                "virtc version {}\nOCI specification version {}",
                env!("CARGO_PKG_VERSION"),
                SUPPORTED_SPEC_VERSION
            );
            Ok(0)
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let format = match cli.log_format.parse::<logging::LogFormat>() {
        Ok(format) => format,
        Err(_) => {
            eprintln!("virtc: invalid log format: {}", cli.log_format);
            process::exit(1);
        }
    };

    if let Err(e) = logging::setup(cli.debug, cli.log.as_deref(), format) {
        eprintln!("virtc: {}", error::chain(e));
        process::exit(1);
    }

    match dispatch(&cli) {
        Ok(code) => process::exit(code),
        Err(e) => process::exit(error::fatal(e)),
    }
}
