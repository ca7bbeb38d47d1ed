//! Builds the action described on the command line, runs it and reports.

use crate::cli::{CliArgs, Command, Targets};
use fanout_engine::{
    Action, ActionError, ActionOptions, Bindings, Conductor, ConductorError, ConfigErrors,
    Configuration, Process, ProcessOptions, Report,
};
use thiserror::Error;
use tracing::info;
use tracing_unwrap::ResultExt;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Failed to load the configuration")]
    Config(#[from] ConfigErrors),
    #[error("Failed to start the conductor")]
    Conductor(#[from] ConductorError),
    #[error(transparent)]
    Action(#[from] ActionError),
}

fn action_options(targets: &Targets, process: ProcessOptions) -> ActionOptions {
    ActionOptions {
        bindings: targets.bindings.iter().cloned().collect::<Bindings>(),
        process,
        ..Default::default()
    }
}

pub fn build_action(
    conductor: &Conductor,
    command: Command,
    process: ProcessOptions,
) -> Result<Action, ActionError> {
    match command {
        Command::Remote {
            targets,
            pty,
            command,
        } => Action::remote(
            conductor,
            &command,
            &targets.hosts,
            action_options(&targets, ProcessOptions { pty, ..process }),
        ),
        Command::Local { command } => Action::local(
            conductor,
            &command,
            ActionOptions {
                process: ProcessOptions {
                    shell: true,
                    ..process
                },
                ..Default::default()
            },
        ),
        Command::Put {
            targets,
            create_dirs,
            to,
            files,
        } => Action::put(
            conductor,
            &targets.hosts,
            &files,
            &to,
            create_dirs,
            action_options(&targets, process),
        ),
        Command::Get {
            targets,
            create_dirs,
            to,
            files,
        } => Action::get(
            conductor,
            &targets.hosts,
            &files,
            &to,
            create_dirs,
            action_options(&targets, process),
        ),
    }
}

/// stdout of a process, every line prefixed with its host
fn print_output(process: &Process) {
    let prefix = process
        .host()
        .map(|host| format!("{}: ", host.address))
        .unwrap_or_default();

    for line in process.stdout().lines() {
        println!("{prefix}{line}");
    }
}

/// whether every process finished ok
pub fn run(args: CliArgs) -> Result<bool, RunError> {
    let config = match &args.config {
        Some(path) => Configuration::load(path)?,
        None => Configuration::load_default()?,
    };
    let conductor = Conductor::init(config)?;
    let process = ProcessOptions {
        timeout: args.timeout,
        ignore_exit_code: args.ignore_exit_code,
        ..Default::default()
    };

    let action = build_action(&conductor, args.command, process)?;
    info!(action = %action.name(), "Running");
    action.run(None)?;

    for process in action.processes() {
        print_output(&process);
        if !process.ok() {
            eprintln!("{}", process.dump());
        }
    }

    if args.stats {
        let mut report = Report::new(Some("fanout"));
        report.add_action(&action);
        print!("{}", serde_yaml::to_string(&report.stats()).unwrap_or_log());
    }

    let finished_ok = action.finished_ok();
    info!(finished_ok, "Done");
    conductor.shutdown();

    Ok(finished_ok)
}
