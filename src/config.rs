use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_KILL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_LISTEN_BACKLOG: u32 = 10;
pub const DEFAULT_CLEANUP_PROGRAM: &str = "/usr/sbin/qm";
pub const DEFAULT_CLEANUP_ARGS: &[&str] = &["cleanup"];

/// External program run once a VM connection is gone. The VM identity and
/// the two status flags are appended after `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for CleanupCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_CLEANUP_PROGRAM),
            args: DEFAULT_CLEANUP_ARGS.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub foreground: bool,
    pub verbose: bool,
    /// Grace period between the quit request and the forced kill.
    pub kill_timeout: Duration,
    /// Upper bound on a single readiness wait while kills are pending.
    pub sweep_interval: Duration,
    pub listen_backlog: u32,
    pub cleanup: CleanupCommand,
    pub warnings: Vec<String>,
}

impl DaemonConfig {
    /// Defaults for everything but the socket path.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            foreground: false,
            verbose: false,
            kill_timeout: Duration::from_secs(DEFAULT_KILL_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            cleanup: CleanupCommand::default(),
            warnings: Vec::new(),
        }
    }
}

/// Values taken from the command line. They win over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub socket_path: PathBuf,
    pub foreground: bool,
    pub verbose: bool,
    pub kill_timeout_secs: Option<u64>,
    pub config_file: Option<PathBuf>,
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::new(overrides.socket_path);
    config.foreground = overrides.foreground;
    config.verbose = overrides.verbose;

    if let Some(path) = overrides.config_file.as_deref() {
        let file = load_config_file(path)?;
        file.apply(&mut config);
    }

    if let Some(secs) = overrides.kill_timeout_secs {
        if secs == 0 {
            return Err(Error::InvalidConfig {
                message: "kill timeout must be a positive number of seconds".to_string(),
            });
        }
        config.kill_timeout = Duration::from_secs(secs);
    }

    if config.socket_path.as_os_str().is_empty() {
        return Err(Error::InvalidConfig {
            message: "socket path must not be empty".to_string(),
        });
    }

    Ok(config)
}

/// Validated contents of an optional TOML configuration file.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    pub kill_timeout: Option<Duration>,
    pub sweep_interval: Option<Duration>,
    pub listen_backlog: Option<u32>,
    pub cleanup: Option<CleanupCommand>,
    pub warnings: Vec<String>,
}

impl FileConfig {
    fn apply(self, config: &mut DaemonConfig) {
        if let Some(timeout) = self.kill_timeout {
            config.kill_timeout = timeout;
        }
        if let Some(interval) = self.sweep_interval {
            config.sweep_interval = interval;
        }
        if let Some(backlog) = self.listen_backlog {
            config.listen_backlog = backlog;
        }
        if let Some(cleanup) = self.cleanup {
            config.cleanup = cleanup;
        }
        config.warnings.extend(self.warnings);
    }
}

pub fn load_config_file(path: &Path) -> Result<FileConfig> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(path, &contents)
}

fn parse_config(path: &Path, contents: &str) -> Result<FileConfig> {
    let value: toml::Value = toml::from_str(contents).map_err(|source| Error::ParseConfig {
        path: path.to_path_buf(),
        source,
    })?;

    let warnings = detect_unknown_fields(&value);

    let raw = RawConfig::deserialize(value).map_err(|source| Error::ParseConfig {
        path: path.to_path_buf(),
        source,
    })?;

    raw.into_validated(path, warnings)
}

fn invalid_config(path: &Path, message: impl Into<String>) -> Error {
    Error::InvalidConfig {
        message: format!("{}: {}", path.display(), message.into()),
    }
}

fn detect_unknown_fields(value: &toml::Value) -> Vec<String> {
    let allowed = [
        "kill_timeout_secs",
        "sweep_interval_secs",
        "listen_backlog",
        "cleanup_command",
    ];
    let mut warnings = Vec::new();
    if let toml::Value::Table(table) = value {
        for key in table.keys() {
            if !allowed.contains(&key.as_str()) {
                warnings.push(format!(
                    "Unknown configuration key `{key}` ignored. Supported keys: {}.",
                    allowed.join(", ")
                ));
            }
        }
    }
    warnings
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    kill_timeout_secs: Option<u64>,
    #[serde(default)]
    sweep_interval_secs: Option<u64>,
    #[serde(default)]
    listen_backlog: Option<u32>,
    #[serde(default)]
    cleanup_command: Option<Vec<String>>,
}

impl RawConfig {
    fn into_validated(self, path: &Path, warnings: Vec<String>) -> Result<FileConfig> {
        let kill_timeout = match self.kill_timeout_secs {
            Some(0) => {
                return Err(invalid_config(
                    path,
                    "`kill_timeout_secs` must be at least 1. Example: `kill_timeout_secs = 60`.",
                ));
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        let sweep_interval = match self.sweep_interval_secs {
            Some(0) => {
                return Err(invalid_config(
                    path,
                    "`sweep_interval_secs` must be at least 1. Example: `sweep_interval_secs = 10`.",
                ));
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        if self.listen_backlog == Some(0) {
            return Err(invalid_config(path, "`listen_backlog` must be at least 1."));
        }

        let cleanup = match self.cleanup_command {
            Some(command) => {
                let mut parts = command.into_iter();
                let program = parts
                    .next()
                    .filter(|program| !program.trim().is_empty())
                    .ok_or_else(|| {
                        invalid_config(
                            path,
                            "`cleanup_command` needs at least a program. Example: \
                             `cleanup_command = [\"/usr/sbin/qm\", \"cleanup\"]`.",
                        )
                    })?;
                Some(CleanupCommand {
                    program: PathBuf::from(program),
                    args: parts.collect(),
                })
            }
            None => None,
        };

        Ok(FileConfig {
            kill_timeout,
            sweep_interval,
            listen_backlog: self.listen_backlog,
            cleanup,
            warnings,
        })
    }
}
