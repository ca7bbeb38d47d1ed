//! Actions treat a set of processes, or of other actions, as one unit of
//! work: started once, ended once every child ended, ok while every process
//! is ok. A failing child never stops its siblings.

mod listeners;
mod remote;

use crate::{
    conductor::Conductor,
    config::ConnectionParams,
    host::Host,
    process::{Process, ProcessError, ProcessOptions},
    report::Stats,
    substitution::{Bindings, SubstitutionError},
    time::deadline_after,
};
use itertools::Itertools;
use listeners::{Countdown, SequentialLink};
use nix::sys::signal::Signal;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Action was already started")]
    AlreadyStarted,
    #[error("Action was never started")]
    NotStarted,
    #[error("No file to transfer")]
    NoFiles,
    #[error(transparent)]
    Substitution(#[from] SubstitutionError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Notified of the lifecycle transitions of an action
pub trait ActionLifecycleHandler: Send + Sync {
    fn start(&self, _action: &Action) {}
    /// called exactly once per run, from the thread that ended the last child
    fn end(&self, _action: &Action) {}
    fn reset(&self, _action: &Action) {}
}

/// Construction parameters shared by the process based actions
#[derive(Clone, Debug, Default)]
pub struct ActionOptions {
    pub name: Option<String>,
    // defaults to the connection params of the configuration
    pub connection: Option<ConnectionParams>,
    // values for `{{name}}` substitutions
    pub bindings: Bindings,
    // applied to every process of the action
    pub process: ProcessOptions,
}

enum ActionKind {
    Remote {
        command: String,
        hosts: Vec<Host>,
        processes: Vec<Process>,
    },
    Put {
        hosts: Vec<Host>,
        processes: Vec<Process>,
    },
    Get {
        hosts: Vec<Host>,
        processes: Vec<Process>,
    },
    Local {
        command: String,
        processes: Vec<Process>,
    },
    Parallel {
        actions: Vec<Action>,
    },
    Sequential {
        actions: Vec<Action>,
    },
}

enum Children<'a> {
    Processes(&'a [Process]),
    Actions(&'a [Action]),
}

impl ActionKind {
    fn children(&self) -> Children<'_> {
        match self {
            Self::Remote { processes, .. }
            | Self::Put { processes, .. }
            | Self::Get { processes, .. }
            | Self::Local { processes, .. } => Children::Processes(processes),
            Self::Parallel { actions } | Self::Sequential { actions } => Children::Actions(actions),
        }
    }

    fn default_name(&self) -> String {
        match self {
            Self::Remote { command, hosts, .. } => {
                format!("Remote on {} hosts: {command}", hosts.len())
            }
            Self::Put { hosts, .. } => format!("Put to {} hosts", hosts.len()),
            Self::Get { hosts, .. } => format!("Get from {} hosts", hosts.len()),
            Self::Local { command, .. } => format!("Local: {command}"),
            Self::Parallel { actions } => format!("Parallel {} actions", actions.len()),
            Self::Sequential { actions } => format!("Sequential {} actions", actions.len()),
        }
    }
}

#[derive(Debug, Default)]
struct ActionState {
    started: bool,
    ended: bool,
}

struct ActionInner {
    name: Option<String>,
    kind: ActionKind,
    // counts ended children, absent for sequential actions
    countdown: Option<Arc<Countdown>>,
    state: Mutex<ActionState>,
    ended_signal: Condvar,
    handlers: Mutex<Vec<Arc<dyn ActionLifecycleHandler>>>,
}

/// Handle on an action, clones refer to the same action
#[derive(Clone)]
pub struct Action {
    inner: Arc<ActionInner>,
}

/// signalled whenever any action ends
static ACTION_ENDED: Lazy<(Mutex<u64>, Condvar)> = Lazy::new(|| (Mutex::new(0), Condvar::new()));

impl Action {
    /// action over processes, each of them counted down on end
    fn with_processes(name: Option<String>, kind: ActionKind) -> Self {
        let inner = Arc::new_cyclic(|weak| {
            let processes = match kind.children() {
                Children::Processes(processes) => processes,
                Children::Actions(_) => &[],
            };
            let countdown = Arc::new(Countdown::new(weak.clone(), processes.len()));

            for process in processes {
                process.add_lifecycle_handler(countdown.clone());
            }

            ActionInner {
                name,
                kind,
                countdown: Some(countdown),
                state: Mutex::new(ActionState::default()),
                ended_signal: Condvar::new(),
                handlers: Mutex::new(Vec::new()),
            }
        });

        Self { inner }
    }

    /// `command` on every host through ssh, after per host substitution
    pub fn remote(
        conductor: &Conductor,
        command: &str,
        hosts: &[Host],
        options: ActionOptions,
    ) -> Result<Self, ActionError> {
        let processes = remote::remote_processes(conductor, command, hosts, &options)?;

        Ok(Self::with_processes(
            options.name,
            ActionKind::Remote {
                command: command.to_string(),
                hosts: hosts.to_vec(),
                processes,
            },
        ))
    }

    /// copy local files to `remote_location` on every host
    pub fn put(
        conductor: &Conductor,
        hosts: &[Host],
        local_files: &[String],
        remote_location: &str,
        create_dirs: bool,
        options: ActionOptions,
    ) -> Result<Self, ActionError> {
        let processes = remote::put_processes(
            conductor,
            hosts,
            local_files,
            remote_location,
            create_dirs,
            &options,
        )?;

        Ok(Self::with_processes(
            options.name,
            ActionKind::Put {
                hosts: hosts.to_vec(),
                processes,
            },
        ))
    }

    /// copy remote files of every host to `local_location`
    pub fn get(
        conductor: &Conductor,
        hosts: &[Host],
        remote_files: &[String],
        local_location: &str,
        create_dirs: bool,
        options: ActionOptions,
    ) -> Result<Self, ActionError> {
        let processes = remote::get_processes(
            conductor,
            hosts,
            remote_files,
            local_location,
            create_dirs,
            &options,
        )?;

        Ok(Self::with_processes(
            options.name,
            ActionKind::Get {
                hosts: hosts.to_vec(),
                processes,
            },
        ))
    }

    /// `command` as a local process
    pub fn local(
        conductor: &Conductor,
        command: &str,
        options: ActionOptions,
    ) -> Result<Self, ActionError> {
        let process = Process::new(conductor, command, options.process)?;

        Ok(Self::from_process(process, options.name))
    }

    /// wrap an existing, not yet started process
    pub fn from_process(process: Process, name: Option<String>) -> Self {
        Self::with_processes(
            name,
            ActionKind::Local {
                command: process.command(),
                processes: vec![process],
            },
        )
    }

    /// run `actions` concurrently, ended once all of them ended
    pub fn parallel(actions: Vec<Action>, name: Option<String>) -> Self {
        let inner = Arc::new_cyclic(|weak| {
            let countdown = Arc::new(Countdown::new(weak.clone(), actions.len()));

            for action in &actions {
                action.add_lifecycle_handler(countdown.clone());
            }

            ActionInner {
                name,
                kind: ActionKind::Parallel { actions },
                countdown: Some(countdown),
                state: Mutex::new(ActionState::default()),
                ended_signal: Condvar::new(),
                handlers: Mutex::new(Vec::new()),
            }
        });

        Self { inner }
    }

    /// run `actions` one after the other, whatever the outcome of the
    /// previous one, ended once the last one ended
    pub fn sequential(actions: Vec<Action>, name: Option<String>) -> Self {
        let inner = Arc::new_cyclic(|weak| {
            let total = actions.len();

            for (index, action) in actions.iter().enumerate() {
                action.add_lifecycle_handler(Arc::new(SequentialLink::new(
                    weak.clone(),
                    index,
                    total,
                    actions.get(index + 1).cloned(),
                )));
            }

            ActionInner {
                name,
                kind: ActionKind::Sequential { actions },
                countdown: None,
                state: Mutex::new(ActionState::default()),
                ended_signal: Condvar::new(),
                handlers: Mutex::new(Vec::new()),
            }
        });

        Self { inner }
    }

    pub fn name(&self) -> String {
        self.inner
            .name
            .clone()
            .unwrap_or_else(|| self.inner.kind.default_name())
    }

    pub fn add_lifecycle_handler(&self, handler: Arc<dyn ActionLifecycleHandler>) {
        self.inner.handlers.lock().push(handler);
    }

    fn handlers(&self) -> Vec<Arc<dyn ActionLifecycleHandler>> {
        self.inner.handlers.lock().clone()
    }

    pub fn hosts(&self) -> &[Host] {
        match &self.inner.kind {
            ActionKind::Remote { hosts, .. }
            | ActionKind::Put { hosts, .. }
            | ActionKind::Get { hosts, .. } => hosts,
            _ => &[],
        }
    }

    /// direct sub actions of a parallel or sequential action
    pub fn actions(&self) -> &[Action] {
        match self.inner.kind.children() {
            Children::Actions(actions) => actions,
            Children::Processes(_) => &[],
        }
    }

    /// every process of this action and of its sub actions
    pub fn processes(&self) -> Vec<Process> {
        match self.inner.kind.children() {
            Children::Processes(processes) => processes.to_vec(),
            Children::Actions(actions) => actions.iter().flat_map(Action::processes).collect(),
        }
    }

    pub fn started(&self) -> bool {
        self.inner.state.lock().started
    }

    pub fn ended(&self) -> bool {
        self.inner.state.lock().ended
    }

    /// every process is ok, see [`Process::ok`]
    pub fn ok(&self) -> bool {
        self.processes().iter().all(Process::ok)
    }

    pub fn finished_ok(&self) -> bool {
        self.started() && self.ended() && self.ok()
    }

    /// start the children, or the first one of a sequence. Fails without
    /// side effect when the action or one of its children already started.
    pub fn start(&self) -> Result<&Self, ActionError> {
        let child_started = match self.inner.kind.children() {
            Children::Processes(processes) => processes.iter().any(Process::started),
            Children::Actions(actions) => actions.iter().any(Action::started),
        };
        if child_started {
            return Err(ActionError::AlreadyStarted);
        }

        {
            let mut state = self.inner.state.lock();
            if state.started {
                return Err(ActionError::AlreadyStarted);
            }
            state.started = true;
        }
        debug!(action = %self.name(), "start");

        for handler in self.handlers() {
            handler.start(self);
        }

        let mut first_error: Option<ActionError> = None;
        match &self.inner.kind {
            ActionKind::Sequential { actions } => match actions.first() {
                Some(first) => {
                    first.start()?;
                }
                None => self.notify_terminated(),
            },
            kind => match kind.children() {
                Children::Processes([]) | Children::Actions([]) => {
                    debug!(action = %self.name(), "No children, ended right away");
                    self.notify_terminated();
                }
                // a failing child must not keep its siblings from starting
                Children::Processes(processes) => {
                    for process in processes {
                        if let Err(error) = process.start() {
                            first_error = first_error.or(Some(error.into()));
                        }
                    }
                }
                Children::Actions(actions) => {
                    for action in actions {
                        if let Err(error) = action.start() {
                            first_error = first_error.or(Some(error));
                        }
                    }
                }
            },
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }

    /// kill every running child, without waiting for them
    pub fn kill(&self) -> Result<&Self, ActionError> {
        debug!(action = %self.name(), "kill");
        let mut outcome = Ok(());

        match self.inner.kind.children() {
            Children::Processes(processes) => {
                for process in processes.iter().filter(|process| process.running()) {
                    if let Err(error) = process.kill(Signal::SIGTERM) {
                        warn!(error = ?error, process = %process, "Failed to kill process");
                        outcome = Err(error.into());
                    }
                }
            }
            Children::Actions(actions) => {
                for action in actions
                    .iter()
                    .filter(|action| action.started() && !action.ended())
                {
                    if let Err(error) = action.kill() {
                        outcome = Err(error);
                    }
                }
            }
        }

        outcome.map(|_| self)
    }

    /// block until ended or the timeout elapsed
    pub fn wait(&self, timeout: Option<Duration>) -> Result<&Self, ActionError> {
        let deadline = deadline_after(timeout);
        let mut state = self.inner.state.lock();

        if !state.started {
            return Err(ActionError::NotStarted);
        }

        while !state.ended {
            match deadline {
                Some(deadline) => {
                    if self
                        .inner
                        .ended_signal
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                None => self.inner.ended_signal.wait(&mut state),
            }
        }

        Ok(self)
    }

    pub fn run(&self, timeout: Option<Duration>) -> Result<&Self, ActionError> {
        self.start()?.wait(timeout)
    }

    /// back to the not started state, killing and waiting first if running
    pub fn reset(&self) -> Result<&Self, ActionError> {
        debug!(action = %self.name(), "reset");

        if self.started() && !self.ended() {
            self.kill()?;
            self.wait(None)?;
        }

        for handler in self.handlers() {
            handler.reset(self);
        }

        match self.inner.kind.children() {
            Children::Processes(processes) => {
                for process in processes {
                    process.reset()?;
                }
            }
            Children::Actions(actions) => {
                for action in actions {
                    action.reset()?;
                }
            }
        }

        if let Some(countdown) = &self.inner.countdown {
            countdown.reset();
        }
        *self.inner.state.lock() = ActionState::default();

        Ok(self)
    }

    /// statistics of the processes, or aggregated from the sub actions
    pub fn stats(&self) -> Stats {
        match self.inner.kind.children() {
            Children::Processes(processes) => Stats::from_processes(self.name(), processes),
            Children::Actions(actions) => {
                Stats::aggregate(self.name(), actions.iter().map(Action::stats).collect())
            }
        }
    }

    /// mark ended and wake every waiter, at most once per run
    fn notify_terminated(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.ended {
                return;
            }
            state.ended = true;
        }
        debug!(action = %self.name(), "ended");
        self.inner.ended_signal.notify_all();

        {
            let (generation, condvar) = &*ACTION_ENDED;
            *generation.lock() += 1;
            condvar.notify_all();
        }

        for handler in self.handlers() {
            handler.end(self);
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();

        write!(
            f,
            "Action({:?}, started={}, ended={})",
            self.name(),
            state.started,
            state.ended
        )
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn wait_ended(
    actions: &[Action],
    timeout: Option<Duration>,
    enough: impl Fn(usize) -> bool,
) -> Vec<Action> {
    let deadline = deadline_after(timeout);
    let (generation, condvar) = &*ACTION_ENDED;
    let mut guard = generation.lock();

    loop {
        let ended = actions.iter().filter(|action| action.ended()).cloned().collect_vec();
        if enough(ended.len()) {
            return ended;
        }

        match deadline {
            Some(deadline) => {
                if condvar.wait_until(&mut guard, deadline).timed_out() {
                    return actions.iter().filter(|action| action.ended()).cloned().collect();
                }
            }
            None => condvar.wait(&mut guard),
        }
    }
}

/// wait until at least one of `actions` ended, returns the ended ones
pub fn wait_any(actions: &[Action], timeout: Option<Duration>) -> Vec<Action> {
    wait_ended(actions, timeout, |ended| ended > 0 || actions.is_empty())
}

/// wait until all of `actions` ended, returns the ended ones
pub fn wait_all(actions: &[Action], timeout: Option<Duration>) -> Vec<Action> {
    wait_ended(actions, timeout, |ended| ended == actions.len())
}
