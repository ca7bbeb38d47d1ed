mod common;

use common::conductor;
use fanout_engine::{
    wait_all, wait_any, Action, ActionError, ActionLifecycleHandler, ActionOptions, Host,
    ConnectionParams, LineHandler, Process, ProcessOptions, Report, Stream,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

fn local(command: &str) -> Action {
    let options = ActionOptions {
        process: ProcessOptions {
            shell: true,
            ..Default::default()
        },
        ..Default::default()
    };

    Action::local(&conductor(), command, options).unwrap()
}

#[derive(Default)]
struct CountingHandler {
    starts: AtomicUsize,
    ends: AtomicUsize,
}

impl ActionLifecycleHandler for CountingHandler {
    fn start(&self, _action: &Action) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn end(&self, _action: &Action) {
        self.ends.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn parallel_local_actions() {
    let action = Action::parallel(vec![local("true"), local("true"), local("true")], None);
    action.run(None).unwrap();

    let stats = action.stats();
    assert!(action.finished_ok());
    assert_eq!(stats.num_processes, 3);
    assert_eq!(stats.num_ok, 3);
    assert_eq!(stats.num_finished_ok, 3);
    assert!(stats.end_date.is_some());
    assert_eq!(action.processes().len(), 3);
}

#[test]
fn failing_child_does_not_stop_siblings() {
    let action = Action::parallel(vec![local("exit 2"), local("echo fine")], None);
    action.run(None).unwrap();

    assert!(action.ended());
    assert!(!action.ok());
    assert!(!action.finished_ok());
    assert!(action.actions()[1].finished_ok());
    assert_eq!(action.stats().num_non_zero_exit_codes, 1);
}

#[test]
fn sequential_runs_next_after_failure() {
    let first = local("exit 1");
    let second = local("echo second");
    let action = Action::sequential(vec![first.clone(), second.clone()], Some("seq".into()));
    action.run(None).unwrap();

    assert!(action.ended());
    assert!(first.ended());
    assert!(second.finished_ok());
    assert_eq!(second.processes()[0].stdout(), "second\n");
    assert!(!action.ok());
    assert_eq!(action.name(), "seq");
}

#[test]
fn sequential_keeps_order() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("order");
    let steps = (0..3)
        .map(|index| local(&format!("echo {index} >> {}", log.display())))
        .collect();
    Action::sequential(steps, None).run(None).unwrap();

    assert_eq!(std::fs::read_to_string(log).unwrap(), "0\n1\n2\n");
}

#[test]
fn empty_actions_end_right_away() {
    let parallel = Action::parallel(Vec::new(), None);
    let sequential = Action::sequential(Vec::new(), None);
    let remote = Action::remote(&conductor(), "true", &[], ActionOptions::default()).unwrap();

    for action in [parallel, sequential, remote] {
        action.start().unwrap();
        assert!(action.ended());
        assert!(action.finished_ok());
    }
}

#[test]
fn lifecycle_handlers_and_reset() {
    let handler = Arc::new(CountingHandler::default());
    let action = local("true");
    action.add_lifecycle_handler(handler.clone());

    action.run(None).unwrap();
    assert!(matches!(action.start(), Err(ActionError::AlreadyStarted)));

    action.reset().unwrap();
    assert!(!action.started());
    assert!(!action.ended());

    action.run(None).unwrap();
    assert!(action.finished_ok());
    assert_eq!(handler.starts.load(Ordering::SeqCst), 2);
    assert_eq!(handler.ends.load(Ordering::SeqCst), 2);
}

#[test]
fn wait_requires_start() {
    assert!(matches!(
        local("true").wait(None),
        Err(ActionError::NotStarted)
    ));
}

#[test]
fn start_with_a_started_child_fails_cleanly() {
    let started = local("true");
    started.run(None).unwrap();
    let fresh = local("true");
    let action = Action::parallel(vec![fresh.clone(), started], None);

    assert!(matches!(action.start(), Err(ActionError::AlreadyStarted)));
    assert!(!action.started());
    assert!(!fresh.started());
    assert!(matches!(action.wait(None), Err(ActionError::NotStarted)));
}

#[test]
fn one_line_handler_shared_by_two_processes() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let collected = lines.clone();
    let options = ActionOptions {
        process: ProcessOptions {
            shell: true,
            stdout_handler: Some(Arc::new(LineHandler::new(
                move |process: &Process, _: Stream, line: &str| {
                    let owner = if process.command().contains("AA") { "A" } else { "B" };
                    collected.lock().push(format!("{owner}:{line}"));
                },
            ))),
            ..Default::default()
        },
        ..Default::default()
    };
    let first = Action::local(
        &conductor(),
        "printf AA; sleep 0.5; printf 'A\\n'",
        options.clone(),
    )
    .unwrap();
    let second = Action::local(&conductor(), "sleep 0.2; printf 'BB\\n'", options).unwrap();

    Action::parallel(vec![first, second], None).run(None).unwrap();

    assert_eq!(*lines.lock(), vec!["B:BB", "A:AAA"]);
}

#[test]
fn kill_running_action() {
    let action = Action::parallel(vec![local("sleep 10"), local("sleep 10")], None);
    action.start().unwrap();
    action.wait(Some(Duration::from_millis(100))).unwrap();
    assert!(!action.ended());

    action.kill().unwrap().wait(None).unwrap();

    assert!(action.ended());
    assert!(!action.ok());
    assert!(action
        .processes()
        .iter()
        .all(|process| process.exit_code() == Some(-15)));
}

#[test]
fn wait_for_any_then_all() {
    let quick = local("true");
    let slow = local("sleep 0.5");
    let actions = [quick.clone(), slow.clone()];
    for action in &actions {
        action.start().unwrap();
    }

    let ended = wait_any(&actions, None);
    assert!(!ended.is_empty());
    assert!(ended.iter().all(Action::ended));

    let ended = wait_all(&actions, Some(Duration::from_secs(10)));
    assert_eq!(ended.len(), 2);
    assert!(quick.finished_ok() && slow.finished_ok());
}

#[test]
fn report_of_actions() {
    let first = local("true");
    let second = local("false");
    Action::parallel(vec![first.clone(), second.clone()], None)
        .run(None)
        .unwrap();

    let mut report = Report::new(Some("run"));
    report.add_action(&first).add_action(&second);
    let stats = report.stats();

    assert_eq!(stats.name, "run");
    assert_eq!(stats.num_processes, 2);
    assert_eq!(stats.num_ended, 2);
    assert_eq!(stats.num_ok, 1);
    assert_eq!(stats.num_non_zero_exit_codes, 1);
    assert_eq!(stats.sub_stats.len(), 2);
    assert!(stats.start_date <= stats.end_date);
}

#[test]
fn remote_action_builds_one_process_per_host() {
    let hosts = vec![Host::new("node-1"), "root@node-2:2222".parse().unwrap()];
    let action = Action::remote(&conductor(), "hostname", &hosts, ActionOptions::default())
        .unwrap();

    assert_eq!(action.hosts(), hosts.as_slice());
    assert_eq!(action.processes().len(), 2);
    assert_eq!(action.name(), "Remote on 2 hosts: hostname");
    assert_eq!(action.stats().num_started, 0);
}

/// connection whose "ssh" echoes the host and the remote command locally
fn echo_connection() -> ActionOptions {
    ActionOptions {
        connection: Some(ConnectionParams {
            ssh: "echo".to_string(),
            ssh_options: Vec::new(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn remote_action_over_three_hosts() {
    let hosts: Vec<Host> = ["a", "b", "c"].into_iter().map(Host::new).collect();
    let mut options = echo_connection();
    options
        .bindings
        .insert("n".to_string(), vec!["1".to_string(), "2".to_string()]);
    let action = Action::remote(&conductor(), "run {{n}} on {{{host}}}", &hosts, options).unwrap();
    action.run(None).unwrap();

    let stats = action.stats();
    assert!(action.finished_ok());
    assert_eq!(stats.num_ok, 3);
    assert_eq!(stats.num_finished_ok, 3);

    let outputs: Vec<String> = action.processes().iter().map(|process| process.stdout()).collect();
    assert_eq!(outputs, ["a run 1 on a\n", "b run 2 on b\n", "c run 1 on c\n"]);
}
