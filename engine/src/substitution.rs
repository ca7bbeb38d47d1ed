//! Per host expansion of command templates.
//!
//! `{{{host}}}` is replaced by the address of the host the command runs on and
//! `{{name}}` by the `index % len`-th value bound to `name`, where `index` is the
//! position of the host in the host list.

use crate::host::Host;
use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};
use std::collections::HashMap;
use thiserror::Error;

/// values available to `{{name}}` expansions
pub type Bindings = HashMap<String, Vec<String>>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubstitutionError {
    #[error("No binding named `{0}`")]
    UnknownName(String),
    #[error("Binding `{0}` has no values")]
    EmptyBinding(String),
}

static HOST_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\{host\}\}\}").unwrap());
static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{([^{}]+)\}\}").unwrap());

/// expand `template` for the host at position `index` of `hosts`
pub fn remote_substitute(
    template: &str,
    hosts: &[Host],
    index: usize,
    bindings: &Bindings,
) -> Result<String, SubstitutionError> {
    let with_host = match hosts.get(index) {
        Some(host) => HOST_PATTERN.replace_all(template, NoExpand(&host.address)),
        None => template.into(),
    };

    let mut output = String::with_capacity(with_host.len());
    let mut last = 0;

    for captures in NAME_PATTERN.captures_iter(&with_host) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let name = name.as_str().trim();
        let values = bindings
            .get(name)
            .ok_or_else(|| SubstitutionError::UnknownName(name.to_string()))?;

        if values.is_empty() {
            return Err(SubstitutionError::EmptyBinding(name.to_string()));
        }

        output.push_str(&with_host[last..whole.start()]);
        output.push_str(&values[index % values.len()]);
        last = whole.end();
    }
    output.push_str(&with_host[last..]);

    Ok(output)
}

/// expand `template` once for every host
pub fn substitute_all(
    template: &str,
    hosts: &[Host],
    bindings: &Bindings,
) -> Result<Vec<String>, SubstitutionError> {
    (0..hosts.len())
        .map(|index| remote_substitute(template, hosts, index, bindings))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Vec<Host> {
        ["a", "b", "c"].into_iter().map(Host::new).collect()
    }

    #[test]
    fn host_and_cyclic_bindings() {
        let bindings = Bindings::from([(
            "ports".to_string(),
            vec!["80".to_string(), "443".to_string()],
        )]);

        assert_eq!(
            substitute_all("curl {{{host}}}:{{ports}}", &hosts(), &bindings).unwrap(),
            vec!["curl a:80", "curl b:443", "curl c:80"]
        );
    }

    #[test]
    fn template_without_placeholders() {
        assert_eq!(
            remote_substitute("uptime", &hosts(), 1, &Bindings::new()),
            Ok("uptime".to_string())
        );
    }

    #[test]
    fn unknown_and_empty_bindings() {
        let bindings = Bindings::from([("empty".to_string(), Vec::new())]);

        assert_eq!(
            remote_substitute("{{ missing }}", &hosts(), 0, &bindings),
            Err(SubstitutionError::UnknownName("missing".to_string()))
        );
        assert_eq!(
            remote_substitute("{{empty}}", &hosts(), 0, &bindings),
            Err(SubstitutionError::EmptyBinding("empty".to_string()))
        );
    }
}
