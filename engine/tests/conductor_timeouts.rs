mod common;

use common::init_tracing;
use fanout_engine::{Conductor, Configuration, Process, ProcessOptions};
use nix::sys::signal::Signal;
use once_cell::sync::Lazy;
use std::{
    thread,
    time::{Duration, Instant},
};

// a short grace period between SIGTERM and SIGKILL
static CONDUCTOR: Lazy<Conductor> = Lazy::new(|| {
    init_tracing();
    Conductor::init(Configuration {
        kill_timeout: 0.5,
        ..Default::default()
    })
    .expect("conductor should start")
});

fn with_timeout(timeout: Duration) -> ProcessOptions {
    ProcessOptions {
        timeout: Some(timeout),
        ..Default::default()
    }
}

#[test]
fn timeout_terminates_the_process() {
    let started = Instant::now();
    let process = Process::new(&CONDUCTOR, "sleep 10", with_timeout(Duration::from_millis(200)))
        .unwrap();
    process.run(None).unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(process.timeouted());
    assert!(!process.forced_kill());
    assert_eq!(process.exit_code(), Some(-15));
    assert!(!process.ok());
}

#[test]
fn ignored_timeout_and_exit_code_stay_ok() {
    let options = ProcessOptions {
        ignore_timeout: true,
        ignore_exit_code: true,
        ..with_timeout(Duration::from_millis(100))
    };
    let process = Process::new(&CONDUCTOR, "sleep 10", options).unwrap();
    process.run(None).unwrap();

    assert!(process.timeouted());
    assert!(process.finished_ok());
}

#[test]
fn ignored_sigterm_escalates_to_sigkill() {
    let options = ProcessOptions {
        shell: true,
        ..with_timeout(Duration::from_millis(200))
    };
    let process = Process::new(&CONDUCTOR, "trap '' TERM; sleep 10", options).unwrap();
    let started = Instant::now();
    process.run(None).unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(process.timeouted());
    assert!(process.forced_kill());
    assert_eq!(process.exit_code(), Some(-9));
}

#[test]
fn sigterm_and_sigkill_are_sent_once() {
    let traps = tempfile::NamedTempFile::new().unwrap();
    let options = ProcessOptions {
        shell: true,
        ..with_timeout(Duration::from_millis(200))
    };
    let command = format!(
        "trap 'echo term >> {}' TERM; while :; do sleep 0.05; done",
        traps.path().display()
    );
    let process = Process::new(&CONDUCTOR, &command, options).unwrap();
    process.run(None).unwrap();

    assert!(process.timeouted());
    assert!(process.forced_kill());
    assert_eq!(process.exit_code(), Some(-9));
    assert_eq!(std::fs::read_to_string(traps.path()).unwrap(), "term\n");
}

#[test]
fn grace_expiry_after_a_manual_sigterm_is_a_timeout() {
    let options = ProcessOptions {
        shell: true,
        ..Default::default()
    };
    let process = Process::new(&CONDUCTOR, "trap '' TERM; sleep 30", options).unwrap();
    process.start().unwrap();
    // let the shell install its trap
    thread::sleep(Duration::from_millis(200));

    process.kill(Signal::SIGTERM).unwrap().wait(None).unwrap();

    assert!(process.timeouted());
    assert!(process.forced_kill());
    assert_eq!(process.exit_code(), Some(-9));
}

#[test]
fn unreachable_timeouts_mean_no_deadline() {
    let process = Process::new(&CONDUCTOR, "true", with_timeout(Duration::MAX)).unwrap();
    process.run(Some(Duration::MAX)).unwrap();

    assert_eq!(process.timeout_deadline(), None);
    assert!(!process.timeouted());
    assert!(process.finished_ok());
}

#[test]
fn process_ending_before_its_timeout() {
    let process = Process::new(&CONDUCTOR, "true", with_timeout(Duration::from_secs(5))).unwrap();
    process.run(None).unwrap();

    assert!(!process.timeouted());
    assert!(process.finished_ok());
    assert!(process.timeout_deadline().is_some());
}

#[test]
fn conductor_is_the_configured_singleton() {
    assert!(CONDUCTOR.is_running());
    assert_eq!(CONDUCTOR.configuration().kill_timeout(), Duration::from_millis(500));
    assert!(Conductor::init(Configuration::default()).is_err());
}
