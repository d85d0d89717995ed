use std::path::PathBuf;

use clap::Parser;

use crate::config::ConfigOverrides;

/// Command line of the `qmeventd` daemon.
#[derive(Debug, Parser)]
#[command(
    name = "qmeventd",
    version,
    about = "Watches QEMU processes over QMP and cleans up after them.",
    long_about = "qmeventd listens on a UNIX socket for QMP connections from VM processes.\n\
                  When a VM shuts down it makes sure the process exits and runs the cleanup action."
)]
pub struct Cli {
    #[arg(
        short = 'f',
        long = "foreground",
        help = "Stay in the foreground instead of detaching"
    )]
    pub foreground: bool,

    #[arg(short = 'v', long = "verbose", help = "Log debug messages")]
    pub verbose: bool,

    #[arg(
        short = 't',
        long = "kill-timeout",
        value_name = "SECONDS",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds to wait after 'quit' before sending SIGKILL (default: 60)"
    )]
    pub kill_timeout: Option<u64>,

    #[arg(
        short = 'c',
        long = "config",
        value_name = "PATH",
        help = "Load daemon settings from the TOML file at PATH"
    )]
    pub config: Option<PathBuf>,

    /// Control socket to listen on.
    #[arg(value_name = "PATH", help = "Create the listening socket at PATH")]
    pub socket: PathBuf,
}

impl Cli {
    pub fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            socket_path: self.socket,
            foreground: self.foreground,
            verbose: self.verbose,
            kill_timeout_secs: self.kill_timeout,
            config_file: self.config,
        }
    }
}
