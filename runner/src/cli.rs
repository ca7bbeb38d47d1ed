//! Command line arguments of `fanout`.

use clap::{Args, Parser, Subcommand, ValueEnum};
use fanout_engine::{time::parse_duration, Host};
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "fanout",
    version,
    about = "Run commands on many hosts or locally and report how they went.",
    long_about = None
)]
pub struct CliArgs {
    /// YAML configuration, defaults to `$HOME/.fanout.yaml` when it exists
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FANOUT_LOG` or `warn` is used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Per process timeout, in seconds or `H:MM:SS`
    #[arg(long, global = true, value_parser = parse_timeout)]
    pub timeout: Option<Duration>,

    /// A non zero exit code does not count as a failure
    #[arg(long, global = true)]
    pub ignore_exit_code: bool,

    /// Print the statistics of the run as YAML on stdout
    #[arg(long, global = true)]
    pub stats: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a command on every host through ssh
    Remote {
        #[command(flatten)]
        targets: Targets,
        /// Allocate a pseudo terminal for the ssh processes
        #[arg(long)]
        pty: bool,
        /// Command, `{{{host}}}` and `{{name}}` are substituted per host
        command: String,
    },
    /// Run a command through the local shell
    Local { command: String },
    /// Copy local files to every host
    Put {
        #[command(flatten)]
        targets: Targets,
        /// Create the destination directory first
        #[arg(long)]
        create_dirs: bool,
        /// Destination on the hosts
        #[arg(long, value_name = "PATH")]
        to: String,
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Copy remote files of every host to a local directory
    Get {
        #[command(flatten)]
        targets: Targets,
        /// Create the local directory first
        #[arg(long)]
        create_dirs: bool,
        /// Local destination
        #[arg(long, value_name = "PATH")]
        to: String,
        #[arg(required = true)]
        files: Vec<String>,
    },
}

#[derive(Debug, Clone, Args)]
pub struct Targets {
    /// `[user@]address[:port]`, repeat for every host
    #[arg(short = 'H', long = "host", required = true, value_name = "HOST")]
    pub hosts: Vec<Host>,

    /// Values for `{{name}}`, picked per host index: `name=v1,v2,...`
    #[arg(long = "bind", value_name = "NAME=VALUES", value_parser = parse_binding)]
    pub bindings: Vec<(String, Vec<String>)>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

fn parse_timeout(input: &str) -> Result<Duration, String> {
    parse_duration(input).map_err(|error| error.to_string())
}

fn parse_binding(input: &str) -> Result<(String, Vec<String>), String> {
    let (name, values) = input
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUES, got `{input}`"))?;
    let name = name.trim();

    if name.is_empty() {
        return Err("binding name is empty".to_string());
    }

    Ok((
        name.to_string(),
        values.split(',').map(str::to_string).collect(),
    ))
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
