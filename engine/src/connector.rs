//! Command lines for reaching remote hosts with ssh and scp.

use crate::{config::ConnectionParams, host::Host};

/// authentication options for a host, host values override the params
fn auth_options(host: &Host, params: &ConnectionParams) -> Vec<String> {
    let mut options = Vec::new();

    if let Some(user) = host.user.as_ref().or(params.user.as_ref()) {
        options.push("-o".to_string());
        options.push(format!("User={user}"));
    }
    if let Some(keyfile) = host.keyfile.as_ref().or(params.keyfile.as_ref()) {
        options.push("-i".to_string());
        options.push(keyfile.to_string_lossy().into_owned());
    }
    if let Some(port) = host.port.or(params.port) {
        options.push("-o".to_string());
        options.push(format!("Port={port}"));
    }

    options
}

/// address to connect to, after applying `host_rewrite`
pub fn rewrite_address(address: &str, params: &ConnectionParams) -> String {
    match &params.host_rewrite {
        Some(template) => template.replace("{address}", address),
        None => address.to_string(),
    }
}

/// `ssh <options> <auth> <address>`, the remote command is appended by the caller
pub fn ssh_command(host: &Host, params: &ConnectionParams) -> Vec<String> {
    let mut command = vec![params.ssh.clone()];
    command.extend(params.ssh_options.iter().cloned());
    command.extend(auth_options(host, params));
    command.push(rewrite_address(&host.address, params));

    command
}

/// `scp <options> <auth>`, sources and destination are appended by the caller
pub fn scp_command(host: &Host, params: &ConnectionParams) -> Vec<String> {
    let mut command = vec![params.scp.clone()];
    command.extend(params.scp_options.iter().cloned());
    command.extend(auth_options(host, params));

    command
}

/// `address:path` operand for scp
pub fn scp_location(host: &Host, path: &str, params: &ConnectionParams) -> String {
    format!("{}:{path}", rewrite_address(&host.address, params))
}
