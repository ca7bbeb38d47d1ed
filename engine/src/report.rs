//! Statistics of processes, actions and of reports themselves, nested the way
//! the actions are.

use crate::{action::Action, process::Process};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Stats {
    pub name: String,
    // earliest start
    pub start_date: Option<DateTime<Utc>>,
    // latest end, unset while anything is still running
    pub end_date: Option<DateTime<Utc>>,
    pub num_processes: usize,
    pub num_started: usize,
    pub num_ended: usize,
    pub num_errors: usize,
    pub num_timeouts: usize,
    pub num_forced_kills: usize,
    pub num_non_zero_exit_codes: usize,
    pub num_ok: usize,
    pub num_finished_ok: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_stats: Vec<Stats>,
}

impl Stats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn from_processes(name: impl Into<String>, processes: &[Process]) -> Self {
        let mut stats = Self::new(name);

        for process in processes {
            let start_date = process.start_date().map(DateTime::<Utc>::from);
            let end_date = process.end_date().map(DateTime::<Utc>::from);

            stats.start_date = earliest(stats.start_date, start_date);
            stats.end_date = stats.end_date.max(end_date);
            stats.num_processes += 1;
            stats.num_started += usize::from(process.started());
            stats.num_ended += usize::from(process.ended());
            stats.num_errors += usize::from(process.error());
            stats.num_timeouts += usize::from(process.timeouted());
            stats.num_forced_kills += usize::from(process.forced_kill());
            // processes in error have no exit code and count here too
            stats.num_non_zero_exit_codes += usize::from(
                process.started() && process.ended() && process.exit_code() != Some(0),
            );
            stats.num_ok += usize::from(process.ok());
            stats.num_finished_ok += usize::from(process.finished_ok());
        }

        if stats.num_processes > stats.num_ended {
            stats.end_date = None;
        }

        stats
    }

    /// sums the counts of `sub_stats`, which are kept as children
    pub fn aggregate(name: impl Into<String>, sub_stats: Vec<Stats>) -> Self {
        let mut stats = Self::new(name);
        let mut unfinished = false;

        for sub in &sub_stats {
            stats.start_date = earliest(stats.start_date, sub.start_date);
            match sub.end_date {
                Some(end_date) => stats.end_date = stats.end_date.max(Some(end_date)),
                None => unfinished = true,
            }
            stats.num_processes += sub.num_processes;
            stats.num_started += sub.num_started;
            stats.num_ended += sub.num_ended;
            stats.num_errors += sub.num_errors;
            stats.num_timeouts += sub.num_timeouts;
            stats.num_forced_kills += sub.num_forced_kills;
            stats.num_non_zero_exit_codes += sub.num_non_zero_exit_codes;
            stats.num_ok += sub.num_ok;
            stats.num_finished_ok += sub.num_finished_ok;
        }

        if unfinished {
            stats.end_date = None;
        }
        stats.sub_stats = sub_stats;

        stats
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.end_date? - self.start_date?)
    }
}

fn earliest(
    current: Option<DateTime<Utc>>,
    candidate: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (current, candidate) {
        (Some(current), Some(candidate)) => Some(current.min(candidate)),
        (current, candidate) => current.or(candidate),
    }
}

/// Gathers the statistics of actions and of other reports. Statistics are
/// snapshotted when added.
#[derive(Clone, Debug)]
pub struct Report {
    name: String,
    sub_stats: Vec<Stats>,
}

impl Report {
    pub fn new(name: Option<&str>) -> Self {
        Self {
            name: name.unwrap_or("Report").to_string(),
            sub_stats: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&mut self, stats: Stats) -> &mut Self {
        self.sub_stats.push(stats);
        self
    }

    pub fn add_action(&mut self, action: &Action) -> &mut Self {
        self.add(action.stats())
    }

    pub fn add_report(&mut self, report: &Report) -> &mut Self {
        self.add(report.stats())
    }

    pub fn stats(&self) -> Stats {
        Stats::aggregate(self.name.clone(), self.sub_stats.clone())
    }
}
