use itertools::Itertools;
use nix::unistd::Pid;
use std::{collections::VecDeque, fs};

/// parent pid from the content of `/proc/<pid>/stat`
fn parse_parent(stat: &str) -> Option<Pid> {
    // the command name may contain spaces and parentheses
    let after_name = &stat[stat.rfind(')')? + 1..];
    let mut fields = after_name.split_whitespace();
    fields.next()?;

    fields.next()?.parse().ok().map(Pid::from_raw)
}

/// all descendants of `pid`, closest first. Processes are discovered through
/// `/proc`, elsewhere nothing is found.
pub(super) fn descendants(pid: Pid) -> Vec<Pid> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };

    let children = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter_map(|raw| {
            let stat = fs::read_to_string(format!("/proc/{raw}/stat")).ok()?;
            Some((parse_parent(&stat)?, Pid::from_raw(raw)))
        })
        .into_group_map();

    let mut found = Vec::new();
    let mut queue = VecDeque::from([pid]);
    while let Some(current) = queue.pop_front() {
        for &child in children.get(&current).into_iter().flatten() {
            found.push(child);
            queue.push_back(child);
        }
    }

    found
}
