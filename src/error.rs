use std::path::PathBuf;
use std::process::ExitCode;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Fatal daemon errors. Everything that can go wrong on a single control
/// connection is handled in place and never reaches this type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read configuration file at {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Configuration at {path} could not be parsed: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Configuration validation failed: {message}")]
    InvalidConfig { message: String },
    #[error("Failed to create listening socket: {source}")]
    Socket {
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to bind control socket at {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to listen on control socket at {path}: {source}")]
    Listen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to detach from the controlling terminal: {source}")]
    Daemonize {
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to install handler for {signal}: {source}")]
    SignalSetup {
        signal: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Readiness wait failed: {source}")]
    Poll {
        #[source]
        source: std::io::Error,
    },
}

pub fn exit_code(err: &Error) -> ExitCode {
    match err {
        Error::ReadConfig { .. } => ExitCode::from(66),
        Error::ParseConfig { .. } => ExitCode::from(65),
        Error::InvalidConfig { .. } => ExitCode::from(65),
        Error::Socket { .. } => ExitCode::from(71),
        Error::Bind { .. } => ExitCode::from(71),
        Error::Listen { .. } => ExitCode::from(71),
        Error::Daemonize { .. } => ExitCode::from(71),
        Error::SignalSetup { .. } => ExitCode::from(71),
        Error::Poll { .. } => ExitCode::from(74),
    }
}
