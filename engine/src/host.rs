use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HostError {
    #[error("Host address is empty in `{0}`")]
    EmptyAddress(String),
    #[error("Invalid port in `{0}`")]
    InvalidPort(String),
}

/// A remote host and the credentials used to reach it
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(deny_unknown_fields)]
pub struct Host {
    pub address: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub keyfile: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl Host {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user: None,
            keyfile: None,
            port: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_keyfile(mut self, keyfile: impl Into<PathBuf>) -> Self {
        self.keyfile = Some(keyfile.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// parses `[user@]address[:port]`, addresses with several colons are kept whole
impl FromStr for Host {
    type Err = HostError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (user, rest) = match input.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some((_, rest)) => (None, rest),
            None => (None, input),
        };

        let (address, port) = match rest.split_once(':') {
            Some((address, port)) if !port.contains(':') => (
                address,
                Some(
                    port.parse::<u16>()
                        .map_err(|_| HostError::InvalidPort(input.to_string()))?,
                ),
            ),
            _ => (rest, None),
        };

        if address.is_empty() {
            return Err(HostError::EmptyAddress(input.to_string()));
        }

        Ok(Self {
            address: address.to_string(),
            user,
            keyfile: None,
            port,
        })
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.address)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_host() {
        let host: Host = "root@node-1.cluster:2222".parse().unwrap();

        assert_eq!(host, Host::new("node-1.cluster").with_user("root").with_port(2222));
        assert_eq!(host.to_string(), "root@node-1.cluster:2222");
    }

    #[test]
    fn parse_plain_and_ipv6_hosts() {
        assert_eq!("node".parse::<Host>(), Ok(Host::new("node")));
        assert_eq!("fe80::1".parse::<Host>(), Ok(Host::new("fe80::1")));
    }

    #[test]
    fn parse_invalid_hosts() {
        assert!(matches!("node:ssh".parse::<Host>(), Err(HostError::InvalidPort(_))));
        assert!(matches!("root@".parse::<Host>(), Err(HostError::EmptyAddress(_))));
    }
}
