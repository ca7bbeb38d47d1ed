mod common;

use common::conductor;
use fanout_engine::{
    Action, ConductorError, LineHandler, Process, ProcessError, ProcessOptions, Stream,
};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

fn shell() -> ProcessOptions {
    ProcessOptions {
        shell: true,
        ..Default::default()
    }
}

#[test]
fn successful_command_finishes_ok() {
    let process = Process::new(&conductor(), "true", ProcessOptions::default()).unwrap();
    assert!(process.ok());
    assert!(!process.finished_ok());

    process.run(None).unwrap();

    assert!(process.started());
    assert!(process.ended());
    assert_eq!(process.exit_code(), Some(0));
    assert!(process.finished_ok());
    assert!(process.start_date() <= process.end_date());
}

#[test]
fn non_zero_exit_code_is_not_ok() {
    let process = Process::new(&conductor(), "false", ProcessOptions::default()).unwrap();
    process.run(None).unwrap();

    assert_eq!(process.exit_code(), Some(1));
    assert!(!process.error());
    assert!(!process.ok());
    assert!(!process.finished_ok());
}

#[test]
fn ignored_exit_code_stays_ok() {
    let options = ProcessOptions {
        ignore_exit_code: true,
        ..shell()
    };
    let process = Process::new(&conductor(), "exit 3", options).unwrap();
    process.run(None).unwrap();

    assert_eq!(process.exit_code(), Some(3));
    assert!(process.finished_ok());
}

#[test]
fn missing_executable_ends_in_error() {
    let process = Process::new(
        &conductor(),
        "/nonexistent/fanout-test-binary",
        ProcessOptions::default(),
    )
    .unwrap();
    process.start().unwrap();

    assert!(process.ended());
    assert!(process.error());
    assert!(process.error_reason().is_some());
    assert_eq!(process.exit_code(), None);
    assert_eq!(process.pid(), None);
    assert!(!process.ok());

    // waiting on a process in error returns right away
    process.wait(None).unwrap();
}

#[test]
fn pty_spawn_errors_while_another_process_runs() {
    let conductor = conductor();
    // keeps the reaper busy waiting for exits
    let sleeper = Process::new(&conductor, "sleep 20", ProcessOptions::default()).unwrap();
    sleeper.start().unwrap();

    for _ in 0..200 {
        let options = ProcessOptions {
            pty: true,
            ..Default::default()
        };
        let process = Process::new(&conductor, "/nonexistent/fanout-test-binary", options).unwrap();
        process.start().unwrap();

        assert!(process.error());
        assert!(process.ended());
        assert_eq!(process.exit_code(), None);
    }

    assert!(sleeper.running());
    sleeper.kill(Signal::SIGKILL).unwrap().wait(None).unwrap();
    assert_eq!(sleeper.exit_code(), Some(-9));
}

#[test]
fn pty_output_is_captured() {
    let options = ProcessOptions {
        pty: true,
        ..Default::default()
    };
    let process = Process::new(&conductor(), "echo on a terminal", options).unwrap();
    process.run(None).unwrap();

    // the terminal translates newlines
    assert_eq!(process.stdout().trim_end(), "on a terminal");
    assert!(process.finished_ok());
}

#[test]
fn contract_violations() {
    let process = Process::new(&conductor(), "true", ProcessOptions::default()).unwrap();
    assert!(matches!(process.wait(None), Err(ProcessError::NotStarted)));

    process.run(None).unwrap();
    assert!(matches!(process.start(), Err(ProcessError::AlreadyStarted)));
}

#[test]
fn both_streams_are_captured() {
    let process = Process::new(&conductor(), "echo out; echo err >&2", shell()).unwrap();
    process.run(None).unwrap();

    assert_eq!(process.stdout(), "out\n");
    assert_eq!(process.stderr(), "err\n");
    assert!(!process.stream_error(Stream::Stdout));
    assert!(process.dump().contains("stdout:\nout\n"));
}

#[test]
fn disabled_default_handler_keeps_nothing() {
    let options = ProcessOptions {
        default_stdout_handler: false,
        ..shell()
    };
    let process = Process::new(&conductor(), "echo out", options).unwrap();
    process.run(None).unwrap();

    assert_eq!(process.stdout(), "");
    assert!(process.finished_ok());
}

#[test]
fn lines_are_forwarded_to_handlers() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let collected = lines.clone();
    let options = ProcessOptions {
        stdout_handler: Some(Arc::new(LineHandler::new(
            move |_: &Process, stream: Stream, line: &str| {
                collected.lock().push(format!("{stream}: {line}"));
            },
        ))),
        ..shell()
    };
    let process = Process::new(&conductor(), "printf 'a\\nb\\nc'", options).unwrap();

    // the action ends once every handler of its process was called
    Action::from_process(process, None).run(None).unwrap();

    assert_eq!(
        *lines.lock(),
        vec!["stdout: a", "stdout: b", "stdout: c"]
    );
}

#[test]
fn killed_by_signal_has_negative_exit_code() {
    let process = Process::new(&conductor(), "kill -9 $$", shell()).unwrap();
    process.run(None).unwrap();

    assert_eq!(process.exit_code(), Some(-9));
    assert!(!process.ok());
}

#[test]
fn wait_timeout_then_kill() {
    let process = Process::new(&conductor(), "sleep 10", ProcessOptions::default()).unwrap();
    process.start().unwrap();
    process.wait(Some(Duration::from_millis(100))).unwrap();

    assert!(process.running());
    assert!(!process.ended());

    process.kill(Signal::SIGTERM).unwrap();
    process.wait(None).unwrap();

    assert_eq!(process.exit_code(), Some(-(Signal::SIGTERM as i32)));
    assert!(!process.timeouted());
    assert!(!process.forced_kill());
}

#[test]
fn stdin_is_fed_then_closed() {
    let options = ProcessOptions {
        close_stdin: Some(false),
        ..Default::default()
    };
    let process = Process::new(&conductor(), "cat", options).unwrap();
    process.start().unwrap();
    process.write_stdin(b"hello\n").unwrap().close_stdin();
    process.wait(None).unwrap();

    assert_eq!(process.stdout(), "hello\n");
    assert!(matches!(
        process.write_stdin(b"late"),
        Err(ProcessError::StdinClosed)
    ));
}

#[test]
fn reset_allows_another_run() {
    let process = Process::new(&conductor(), "echo again", shell()).unwrap();
    process.run(None).unwrap();
    process.reset().unwrap();

    assert!(!process.started());
    assert!(!process.ended());
    assert_eq!(process.exit_code(), None);
    assert_eq!(process.stdout(), "");

    process.run(None).unwrap();
    assert_eq!(process.stdout(), "again\n");
}

#[test]
fn many_concurrent_processes() {
    let conductor = conductor();
    let processes: Vec<Process> = (0..20)
        .map(|index| Process::new(&conductor, &format!("echo {index}"), shell()).unwrap())
        .collect();

    for process in &processes {
        process.start().unwrap();
    }
    for (index, process) in processes.iter().enumerate() {
        process.wait(None).unwrap();
        assert_eq!(process.stdout(), format!("{index}\n"));
        assert!(process.finished_ok());
    }
}

/// gone, or a zombie about to be collected by its new parent
fn is_gone(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map_or(false, |(_, rest)| matches!(rest.trim_start().chars().next(), Some('Z' | 'X'))),
        Err(_) => true,
    }
}

#[test]
fn descendants_are_killed_with_a_shell() {
    let process = Process::new(&conductor(), "sleep 30 & echo $!; wait", shell()).unwrap();
    process.start().unwrap();

    let started = Instant::now();
    while process.stdout().is_empty() && started.elapsed() < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(10));
    }
    let grandchild: i32 = process.stdout().trim().parse().unwrap();
    assert!(!is_gone(grandchild));

    process.kill(Signal::SIGTERM).unwrap().wait(None).unwrap();

    let killed = Instant::now();
    while !is_gone(grandchild) && killed.elapsed() < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(is_gone(grandchild));
}

#[test]
fn descendants_survive_without_kill_descendants() {
    let options = ProcessOptions {
        kill_descendants: Some(false),
        ..shell()
    };
    let process = Process::new(&conductor(), "sleep 30 & echo $!; wait", options).unwrap();
    process.start().unwrap();

    let started = Instant::now();
    while process.stdout().is_empty() && started.elapsed() < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(10));
    }
    let grandchild: i32 = process.stdout().trim().parse().unwrap();

    process.kill(Signal::SIGTERM).unwrap().wait(None).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(!is_gone(grandchild));

    nix::sys::signal::kill(nix::unistd::Pid::from_raw(grandchild), Signal::SIGKILL).unwrap();
}

#[test]
fn removed_process_is_no_longer_observed() {
    let conductor = conductor();
    let process = Process::new(&conductor, "sleep 10", ProcessOptions::default()).unwrap();
    assert!(matches!(
        conductor.remove(&process),
        Err(ConductorError::NotTracked)
    ));

    process.start().unwrap();
    conductor.remove(&process).unwrap();
    process.kill(Signal::SIGKILL).unwrap();
    process.wait(Some(Duration::from_millis(300))).unwrap();

    // the exit is reaped but no longer reported to the process
    assert!(!process.ended());
    assert!(process.forced_kill());
    assert!(matches!(
        conductor.remove(&process),
        Err(ConductorError::NotTracked)
    ));
}
