//! One process per host for the ssh and scp based actions.

use super::{ActionError, ActionOptions};
use crate::{
    conductor::Conductor,
    config::ConnectionParams,
    connector,
    host::Host,
    process::{Process, ProcessOptions},
    substitution::remote_substitute,
};

fn connection(conductor: &Conductor, options: &ActionOptions) -> ConnectionParams {
    options
        .connection
        .clone()
        .unwrap_or_else(|| conductor.configuration().connection.clone())
}

/// scp command lines go through the shell so that globs expand
fn shell_process(
    conductor: &Conductor,
    command_line: Vec<String>,
    options: &ActionOptions,
) -> Result<Process, ActionError> {
    let process_options = ProcessOptions {
        shell: true,
        ..options.process.clone()
    };

    Ok(Process::new(
        conductor,
        &command_line.join(" "),
        process_options,
    )?)
}

pub(super) fn remote_processes(
    conductor: &Conductor,
    command: &str,
    hosts: &[Host],
    options: &ActionOptions,
) -> Result<Vec<Process>, ActionError> {
    let params = connection(conductor, options);

    hosts
        .iter()
        .enumerate()
        .map(|(index, host)| {
            let command = remote_substitute(command, hosts, index, &options.bindings)?;

            Ok(Process::remote(
                conductor,
                host,
                &command,
                Some(&params),
                options.process.clone(),
            ))
        })
        .collect()
}

pub(super) fn put_processes(
    conductor: &Conductor,
    hosts: &[Host],
    local_files: &[String],
    remote_location: &str,
    create_dirs: bool,
    options: &ActionOptions,
) -> Result<Vec<Process>, ActionError> {
    if local_files.is_empty() {
        return Err(ActionError::NoFiles);
    }
    let params = connection(conductor, options);

    hosts
        .iter()
        .enumerate()
        .map(|(index, host)| {
            let location = remote_substitute(remote_location, hosts, index, &options.bindings)?;
            let mut command_line = Vec::new();

            if create_dirs {
                command_line.extend(connector::ssh_command(host, &params));
                command_line.push(format!(
                    "'mkdir -p \"{location}\" || test -d \"{location}\"'"
                ));
                command_line.push("&&".to_string());
            }
            command_line.extend(connector::scp_command(host, &params));
            for file in local_files {
                command_line.push(remote_substitute(file, hosts, index, &options.bindings)?);
            }
            command_line.push(connector::scp_location(host, &location, &params));

            shell_process(conductor, command_line, options)
        })
        .collect()
}

pub(super) fn get_processes(
    conductor: &Conductor,
    hosts: &[Host],
    remote_files: &[String],
    local_location: &str,
    create_dirs: bool,
    options: &ActionOptions,
) -> Result<Vec<Process>, ActionError> {
    if remote_files.is_empty() {
        return Err(ActionError::NoFiles);
    }
    let params = connection(conductor, options);

    hosts
        .iter()
        .enumerate()
        .map(|(index, host)| {
            let location = remote_substitute(local_location, hosts, index, &options.bindings)?;
            let mut command_line = Vec::new();

            if create_dirs {
                command_line.push(format!(
                    "mkdir -p \"{location}\" || test -d \"{location}\" &&"
                ));
            }
            command_line.extend(connector::scp_command(host, &params));
            for file in remote_files {
                let path = remote_substitute(file, hosts, index, &options.bindings)?;
                command_line.push(connector::scp_location(host, &path, &params));
            }
            command_line.push(location);

            shell_process(conductor, command_line, options)
        })
        .collect()
}
