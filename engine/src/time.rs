use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fmt::Write,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

#[cfg(test)]
mod time_test;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TimeError {
    #[error("Invalid duration `{0}`, expected seconds or H:MM:SS[.fraction]")]
    InvalidDuration(String),
    #[error("Invalid date `{0}`, expected a unix timestamp or YYYY-MM-DD HH:MM:SS[.fraction]")]
    InvalidDate(String),
}

static CLOCK_DURATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+):(\d{1,2}):(\d{1,2}(?:\.\d*)?)$").unwrap());

/// parse either a number of seconds or a H:MM:SS[.fraction] duration
pub fn parse_duration(input: &str) -> Result<Duration, TimeError> {
    let trimmed = input.trim();
    let invalid = || TimeError::InvalidDuration(input.to_string());

    let seconds = match trimmed.parse::<f64>() {
        Ok(seconds) => seconds,
        Err(_) => {
            let captures = CLOCK_DURATION.captures(trimmed).ok_or_else(invalid)?;
            let field = |index: usize| -> Result<f64, TimeError> {
                captures[index].parse::<f64>().map_err(|_| invalid())
            };

            field(1)? * 3600.0 + field(2)? * 60.0 + field(3)?
        }
    };

    // negative, non finite and overflowing values alike
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

/// parse either a unix timestamp or a local YYYY-MM-DD HH:MM:SS[.fraction] date
pub fn parse_date(input: &str) -> Result<SystemTime, TimeError> {
    let trimmed = input.trim();
    let invalid = || TimeError::InvalidDate(input.to_string());

    if let Ok(timestamp) = trimmed.parse::<f64>() {
        return Duration::try_from_secs_f64(timestamp)
            .ok()
            .and_then(|since_epoch| UNIX_EPOCH.checked_add(since_epoch))
            .ok_or_else(invalid);
    }

    let naive =
        NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f").map_err(|_| invalid())?;

    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(SystemTime::from)
        .ok_or_else(invalid)
}

/// absolute deadline for an optional timeout, `None` as well when the
/// deadline lies beyond what an `Instant` can hold
pub fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

/// time left until an optional deadline, zero once it has passed
pub fn remaining_until(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

/// human readable duration, e.g. `1d2h3m4.500s`
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let millis = duration.subsec_millis();
    let (days, hours, minutes, seconds) = (
        total / 86_400,
        (total % 86_400) / 3600,
        (total % 3600) / 60,
        total % 60,
    );

    let mut output = String::new();
    if days > 0 {
        let _ = write!(output, "{days}d");
    }
    if hours > 0 || !output.is_empty() {
        let _ = write!(output, "{hours}h");
    }
    if minutes > 0 || !output.is_empty() {
        let _ = write!(output, "{minutes}m");
    }
    if millis > 0 {
        let _ = write!(output, "{seconds}.{millis:03}s");
    } else {
        let _ = write!(output, "{seconds}s");
    }

    output
}

pub fn format_date(date: SystemTime) -> String {
    DateTime::<Local>::from(date)
        .format("%Y-%m-%d %H:%M:%S%.3f %z")
        .to_string()
}

/// sleep at least `delay` and at least until `until`, returns the time slept
pub fn sleep(delay: Option<Duration>, until: Option<SystemTime>) -> Duration {
    let until_delay = until
        .and_then(|until| until.duration_since(SystemTime::now()).ok())
        .unwrap_or_default();
    let sleeping = delay.unwrap_or_default().max(until_delay);

    if !sleeping.is_zero() {
        std::thread::sleep(sleeping);
    }

    sleeping
}

/// Keeps track of the time elapsed since its creation
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
    start_date: SystemTime,
    timeout: Option<Duration>,
}

impl Timer {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            start_date: SystemTime::now(),
            timeout,
        }
    }

    pub fn start_date(&self) -> SystemTime {
        self.start_date
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// time left before the timeout, `None` without timeout
    pub fn remaining(&self) -> Option<Duration> {
        self.timeout
            .map(|timeout| timeout.saturating_sub(self.start.elapsed()))
    }

    /// sleep until at least `duration` has elapsed since the timer started
    pub fn wait_elapsed(&self, duration: Duration) -> Duration {
        sleep(Some(duration.saturating_sub(self.elapsed())), None)
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new(None)
    }
}
