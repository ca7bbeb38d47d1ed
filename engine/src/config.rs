use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Error,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

/// name of the per user configuration file, looked up in `$HOME`
pub const USER_CONFIG_FILE: &str = ".fanout.yaml";

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read configuration file")]
    ReadFailed(#[from] Error),
    #[error("Failed to parse configuration")]
    ParseFailed(#[from] serde_yaml::Error),
    #[error("kill_timeout must be a finite, positive number of seconds")]
    InvalidKillTimeout,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    // grace period in seconds between SIGTERM and the automatic SIGKILL
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout: f64,
    // outputs longer than this are cut in the middle when dumped, 0 disables it
    #[serde(default = "default_compact_output_threshold")]
    pub compact_output_threshold: usize,
    // defaults for every remote connection
    #[serde(default)]
    pub connection: ConnectionParams,
}

/// Parameters used to build ssh/scp command lines
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ConnectionParams {
    pub user: Option<String>,
    pub keyfile: Option<PathBuf>,
    pub port: Option<u16>,
    pub ssh: String,
    pub ssh_options: Vec<String>,
    pub scp: String,
    pub scp_options: Vec<String>,
    // allocate a pseudo terminal for remote processes
    pub pty: bool,
    // template for rewriting host addresses, `{address}` is replaced by the address
    pub host_rewrite: Option<String>,
}

fn default_kill_timeout() -> f64 {
    5.0
}

fn default_compact_output_threshold() -> usize {
    4096
}

const COMMON_SSH_OPTIONS: [&str; 10] = [
    "-o",
    "BatchMode=yes",
    "-o",
    "PasswordAuthentication=no",
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "ConnectTimeout=20",
];

impl Default for ConnectionParams {
    fn default() -> Self {
        let common = COMMON_SSH_OPTIONS.iter().map(|option| option.to_string());

        Self {
            user: None,
            keyfile: None,
            port: None,
            ssh: "ssh".to_string(),
            ssh_options: std::iter::once("-tt".to_string())
                .chain(common.clone())
                .collect(),
            scp: "scp".to_string(),
            scp_options: common.chain(std::iter::once("-rp".to_string())).collect(),
            pty: false,
            host_rewrite: None,
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            kill_timeout: default_kill_timeout(),
            compact_output_threshold: default_compact_output_threshold(),
            connection: ConnectionParams::default(),
        }
    }
}

impl Configuration {
    /// parse a configuration from yaml
    pub fn from_yaml(input: &str) -> Result<Self, ConfigErrors> {
        let config: Self = serde_yaml::from_str(input)?;
        config.validate()
    }

    /// load a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let config: Self = serde_yaml::from_reader(File::open(path)?)?;
        debug!(path = ?path, "Loaded configuration");

        config.validate()
    }

    /// load `$HOME/.fanout.yaml` if it exists, defaults otherwise
    pub fn load_default() -> Result<Self, ConfigErrors> {
        match std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(USER_CONFIG_FILE))
            .filter(|path| path.is_file())
        {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// grace period before SIGKILL, unbounded when the value cannot be
    /// represented (only possible without validation)
    pub fn kill_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.kill_timeout).unwrap_or(Duration::MAX)
    }

    fn validate(self) -> Result<Self, ConfigErrors> {
        match Duration::try_from_secs_f64(self.kill_timeout) {
            Ok(grace) if !grace.is_zero() => Ok(self),
            _ => Err(ConfigErrors::InvalidKillTimeout),
        }
    }
}
