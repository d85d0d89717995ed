use std::process::ExitCode;

use clap::{Parser, error::ErrorKind};
use log::{info, warn};

use qmeventd::cli::Cli;
use qmeventd::core::server::{self, ControlSocket, ShutdownSignals};
use qmeventd::core::{Supervisor, SystemHost, ignore_child_exits};
use qmeventd::logging::init_logging;
use qmeventd::{Error, Result, exit_code, resolve_config};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(64),
            };
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            exit_code(&err)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(cli.into_overrides())?;
    init_logging(config.verbose);
    for warning in &config.warnings {
        warn!("{warning}");
    }

    ignore_child_exits().map_err(|source| Error::SignalSetup {
        signal: "SIGCHLD",
        source,
    })?;
    let signals = ShutdownSignals::install()?;

    let socket = ControlSocket::bind(&config.socket_path, config.listen_backlog)?;

    if !config.foreground {
        server::daemonize()?;
    }

    info!(
        "kill timeout {}s, cleanup via {}",
        config.kill_timeout.as_secs(),
        config.cleanup.program.display()
    );
    let mut supervisor = Supervisor::new(SystemHost::new(config.cleanup.clone()), config.kill_timeout);
    server::run(&socket, &signals, &mut supervisor, config.sweep_interval)
}
