//! One OS level subprocess, local or reached through ssh, and its lifecycle:
//! not started, running, then ended exactly once, with timeout and forced
//! kill flags layered on top.

mod spawn;
mod tree;


use crate::{
    conductor::{Conductor, ConductorError},
    config::ConnectionParams,
    connector,
    host::Host,
    output::{compact, OutputHandler, Stream},
    time::{deadline_after, format_date},
};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use parking_lot::Mutex;
use spawn::{ChildIo, CommandLine};
use std::{
    fmt,
    hash::{Hash, Hasher},
    io::Write,
    os::unix::io::{AsRawFd, RawFd},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};
use thiserror::Error;
use tracing::{debug, warn};

/// signals whose intent is preserved by hanging up the pty of a process
const HANGUP_SIGNALS: [Signal; 6] = [
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGKILL,
    Signal::SIGPIPE,
    Signal::SIGQUIT,
];

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Process was already started")]
    AlreadyStarted,
    #[error("Process was never started")]
    NotStarted,
    #[error("Invalid command line `{0}`")]
    InvalidCommand(String),
    #[error("Failed to send {signal} to process {pid}")]
    Signal {
        pid: i32,
        signal: Signal,
        #[source]
        source: Errno,
    },
    #[error("Standard input of the process is closed")]
    StdinClosed,
    #[error("Failed to write to the standard input of the process")]
    Stdin(#[source] std::io::Error),
    #[error(transparent)]
    Conductor(#[from] ConductorError),
}

/// Notified of the lifecycle transitions of a process
pub trait ProcessLifecycleHandler: Send + Sync {
    fn start(&self, _process: &Process) {}
    /// called exactly once per run, without any lock held
    fn end(&self, _process: &Process) {}
    fn reset(&self, _process: &Process) {}
}

#[derive(Clone)]
pub struct ProcessOptions {
    // SIGTERM is sent once it elapses
    pub timeout: Option<Duration>,
    pub ignore_exit_code: bool,
    pub ignore_timeout: bool,
    pub ignore_error: bool,
    // log the matching failure as a warning, defaults to not ignoring it
    pub log_exit_code: Option<bool>,
    pub log_timeout: Option<bool>,
    pub log_error: Option<bool>,
    // collect the stream into `stdout()`/`stderr()`
    pub default_stdout_handler: bool,
    pub default_stderr_handler: bool,
    pub stdout_handler: Option<Arc<dyn OutputHandler>>,
    pub stderr_handler: Option<Arc<dyn OutputHandler>>,
    pub lifecycle_handler: Option<Arc<dyn ProcessLifecycleHandler>>,
    pub pty: bool,
    pub shell: bool,
    // defaults to true without a pty
    pub close_stdin: Option<bool>,
    // signal the descendants of the process too, defaults to `shell`
    pub kill_descendants: Option<bool>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            ignore_exit_code: false,
            ignore_timeout: false,
            ignore_error: false,
            log_exit_code: None,
            log_timeout: None,
            log_error: None,
            default_stdout_handler: true,
            default_stderr_handler: true,
            stdout_handler: None,
            stderr_handler: None,
            lifecycle_handler: None,
            pty: false,
            shell: false,
            close_stdin: None,
            kill_descendants: None,
        }
    }
}

impl fmt::Debug for ProcessOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessOptions")
            .field("timeout", &self.timeout)
            .field("ignore_exit_code", &self.ignore_exit_code)
            .field("ignore_timeout", &self.ignore_timeout)
            .field("ignore_error", &self.ignore_error)
            .field("stdout_handler", &self.stdout_handler.is_some())
            .field("stderr_handler", &self.stderr_handler.is_some())
            .field("pty", &self.pty)
            .field("shell", &self.shell)
            .field("close_stdin", &self.close_stdin)
            .field("kill_descendants", &self.kill_descendants)
            .finish_non_exhaustive()
    }
}

/// Host and command of a process running through ssh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: Host,
    pub command: String,
}

#[derive(Debug, Default)]
struct ProcessState {
    started: bool,
    ended: bool,
    error: bool,
    error_reason: Option<String>,
    timeouted: bool,
    forced_kill: bool,
    already_got_sigterm: bool,
    exit_code: Option<i32>,
    pid: Option<Pid>,
    start_date: Option<SystemTime>,
    end_date: Option<SystemTime>,
    timeout_deadline: Option<Instant>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_ioerror: bool,
    stderr_ioerror: bool,
    io: Option<ChildIo>,
}

/// no failure observed yet: not started, still running, or ended without an
/// unignored error, timeout or non zero exit code
fn is_ok(state: &ProcessState, options: &ProcessOptions) -> bool {
    if !state.started || !state.ended {
        return true;
    }

    (!state.error || options.ignore_error)
        && (!state.timeouted || options.ignore_timeout)
        && (state.exit_code == Some(0) || options.ignore_exit_code)
}

/// whether a termination deserves a warning rather than a debug line
fn failure_logged(state: &ProcessState, options: &ProcessOptions) -> bool {
    (state.error && options.log_error.unwrap_or(!options.ignore_error))
        || (state.timeouted && options.log_timeout.unwrap_or(!options.ignore_timeout))
        || (state.exit_code != Some(0) && options.log_exit_code.unwrap_or(!options.ignore_exit_code))
}

struct ProcessInner {
    conductor: Conductor,
    command: CommandLine,
    remote: Option<RemoteTarget>,
    options: ProcessOptions,
    handlers: Mutex<Vec<Arc<dyn ProcessLifecycleHandler>>>,
    state: Mutex<ProcessState>,
}

/// Handle on a subprocess, clones refer to the same process
#[derive(Clone)]
pub struct Process {
    inner: Arc<ProcessInner>,
}

impl Process {
    fn build(
        conductor: &Conductor,
        command: CommandLine,
        remote: Option<RemoteTarget>,
        options: ProcessOptions,
    ) -> Self {
        let handlers = options.lifecycle_handler.iter().cloned().collect();

        Self {
            inner: Arc::new(ProcessInner {
                conductor: conductor.clone(),
                command,
                remote,
                options,
                handlers: Mutex::new(handlers),
                state: Mutex::new(ProcessState::default()),
            }),
        }
    }

    /// a command line, run by `/bin/sh -c` with `shell` or split with shell
    /// quoting rules otherwise
    pub fn new(
        conductor: &Conductor,
        command: &str,
        options: ProcessOptions,
    ) -> Result<Self, ProcessError> {
        let command = CommandLine::parse(command, options.shell)
            .ok_or_else(|| ProcessError::InvalidCommand(command.to_string()))?;

        Ok(Self::build(conductor, command, None, options))
    }

    /// an argument vector, executed directly whatever `shell` says
    pub fn from_args<I, S>(conductor: &Conductor, args: I, options: ProcessOptions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args = args.into_iter().map(Into::into).collect();
        Self::build(conductor, CommandLine::Args(args), None, options)
    }

    /// `command` run on `host` through ssh. Without explicit params the
    /// configured connection defaults are used.
    pub fn remote(
        conductor: &Conductor,
        host: &Host,
        command: &str,
        params: Option<&ConnectionParams>,
        mut options: ProcessOptions,
    ) -> Self {
        let params = params.unwrap_or(&conductor.configuration().connection);
        let mut args = connector::ssh_command(host, params);
        args.push(command.to_string());
        options.pty |= params.pty;

        Self::build(
            conductor,
            CommandLine::Args(args),
            Some(RemoteTarget {
                host: host.clone(),
                command: command.to_string(),
            }),
            options,
        )
    }

    pub fn add_lifecycle_handler(&self, handler: Arc<dyn ProcessLifecycleHandler>) {
        self.inner.handlers.lock().push(handler);
    }

    fn handlers(&self) -> Vec<Arc<dyn ProcessLifecycleHandler>> {
        self.inner.handlers.lock().clone()
    }

    pub fn command(&self) -> String {
        self.inner.command.to_string()
    }

    pub fn options(&self) -> &ProcessOptions {
        &self.inner.options
    }

    pub fn host(&self) -> Option<&Host> {
        self.inner.remote.as_ref().map(|remote| &remote.host)
    }

    pub fn remote_command(&self) -> Option<&str> {
        self.inner.remote.as_ref().map(|remote| remote.command.as_str())
    }

    pub fn pid(&self) -> Option<Pid> {
        self.inner.state.lock().pid
    }

    pub fn started(&self) -> bool {
        self.inner.state.lock().started
    }

    pub fn ended(&self) -> bool {
        self.inner.state.lock().ended
    }

    pub fn running(&self) -> bool {
        let state = self.inner.state.lock();
        state.started && !state.ended
    }

    pub fn error(&self) -> bool {
        self.inner.state.lock().error
    }

    pub fn error_reason(&self) -> Option<String> {
        self.inner.state.lock().error_reason.clone()
    }

    /// only set once ended without error, negated signal number when killed
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.state.lock().exit_code
    }

    pub fn timeouted(&self) -> bool {
        self.inner.state.lock().timeouted
    }

    pub fn forced_kill(&self) -> bool {
        self.inner.state.lock().forced_kill
    }

    pub fn start_date(&self) -> Option<SystemTime> {
        self.inner.state.lock().start_date
    }

    pub fn end_date(&self) -> Option<SystemTime> {
        self.inner.state.lock().end_date
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.options.timeout
    }

    /// current deadline, either the timeout or the SIGKILL escalation
    pub fn timeout_deadline(&self) -> Option<Instant> {
        self.inner.state.lock().timeout_deadline
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.inner.state.lock().stdout).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.inner.state.lock().stderr).into_owned()
    }

    /// whether reading a stream failed
    pub fn stream_error(&self, stream: Stream) -> bool {
        let state = self.inner.state.lock();

        match stream {
            Stream::Stdout => state.stdout_ioerror,
            Stream::Stderr => state.stderr_ioerror,
        }
    }

    pub fn ok(&self) -> bool {
        is_ok(&self.inner.state.lock(), &self.inner.options)
    }

    pub fn finished_ok(&self) -> bool {
        let state = self.inner.state.lock();
        state.started && state.ended && is_ok(&state, &self.inner.options)
    }

    /// description followed by both outputs, compacted
    pub fn dump(&self) -> String {
        self.dump_locked(&self.inner.state.lock())
    }

    fn dump_locked(&self, state: &ProcessState) -> String {
        let threshold = self.inner.conductor.configuration().compact_output_threshold;

        format!(
            "{}\nstdout:\n{}\nstderr:\n{}",
            self.describe(state),
            compact(&state.stdout, threshold),
            compact(&state.stderr, threshold)
        )
    }

    fn describe(&self, state: &ProcessState) -> String {
        let mut fields = vec![format!("cmd={:?}", self.inner.command.to_string())];

        if let Some(remote) = &self.inner.remote {
            fields.push(format!("host={}", remote.host));
        }
        if let Some(pid) = state.pid {
            fields.push(format!("pid={pid}"));
        }
        fields.push(format!("started={}", state.started));
        if let Some(start_date) = state.start_date {
            fields.push(format!("start_date={}", format_date(start_date)));
        }
        fields.push(format!("ended={}", state.ended));
        if let Some(end_date) = state.end_date {
            fields.push(format!("end_date={}", format_date(end_date)));
        }
        fields.push(format!("error={}", state.error));
        if let Some(reason) = &state.error_reason {
            fields.push(format!("error_reason={reason:?}"));
        }
        fields.push(format!("timeouted={}", state.timeouted));
        fields.push(format!("forced_kill={}", state.forced_kill));
        match state.exit_code {
            Some(exit_code) => fields.push(format!("exit_code={exit_code}")),
            None => fields.push("exit_code=none".to_string()),
        }
        fields.push(format!("ok={}", is_ok(state, &self.inner.options)));

        format!("Process({})", fields.join(", "))
    }

    fn log_terminated(&self, state: &ProcessState) {
        let dump = self.dump_locked(state);

        if failure_logged(state, &self.inner.options) {
            warn!("terminated: {dump}");
        } else {
            debug!("terminated: {dump}");
        }
    }

    /// spawn the process and hand it to the conductor. A spawn failure is not
    /// an `Err`: the process ends right away in error.
    pub fn start(&self) -> Result<&Self, ProcessError> {
        let conductor = &self.inner.conductor;
        let options = &self.inner.options;

        {
            let mut state = self.inner.state.lock();
            if state.started {
                return Err(ProcessError::AlreadyStarted);
            }
            state.started = true;
            state.start_date = Some(SystemTime::now());
            state.timeout_deadline = deadline_after(options.timeout);
        }
        debug!(process = %self, "start");

        for handler in self.handlers() {
            handler.start(self);
        }

        // spawning under the sync lock keeps the exit of the child behind
        // the request registering it
        let registered = conductor.with_sync(|sync| -> Result<(), String> {
            let spawned = spawn::spawn(
                &self.inner.command,
                options.pty,
                options.close_stdin.unwrap_or(!options.pty),
            )
            .map_err(|error| error.to_string())?;
            let pid = spawned.pid;

            {
                let mut state = self.inner.state.lock();
                state.pid = Some(pid);
                state.io = Some(spawned.io);
            }
            sync.tracked.insert(pid);

            if let Err(error) = conductor.add(self) {
                sync.tracked.remove(&pid);
                if let Err(errno) = kill(pid, Signal::SIGKILL) {
                    debug!(pid = pid.as_raw(), error = ?errno, "Failed to kill unregistered process");
                }
                return Err(error.to_string());
            }

            Ok(())
        });

        if let Err(reason) = registered {
            {
                let mut state = self.inner.state.lock();
                state.error = true;
                state.error_reason = Some(reason);
                state.ended = true;
                state.end_date = state.start_date;
                state.io = None;
                self.log_terminated(&state);
            }
            self.notify_ended();
        }

        Ok(self)
    }

    /// block until the process ended or the timeout elapsed
    pub fn wait(&self, timeout: Option<Duration>) -> Result<&Self, ProcessError> {
        {
            let state = self.inner.state.lock();
            if state.error {
                return Ok(self);
            }
            if !state.started || state.pid.is_none() {
                return Err(ProcessError::NotStarted);
            }
        }
        debug!(process = %self, "wait");

        self.inner
            .conductor
            .wait_while(|| !self.ended(), deadline_after(timeout));
        debug!(process = %self, "wait finished");

        Ok(self)
    }

    pub fn run(&self, timeout: Option<Duration>) -> Result<&Self, ProcessError> {
        self.start()?.wait(timeout)
    }

    /// send `signal`, a SIGTERM is followed by a SIGKILL after the configured
    /// kill timeout if the process is still alive
    pub fn kill(&self, signal: Signal) -> Result<&Self, ProcessError> {
        self.send_signal(signal, true)
    }

    /// send `signal`, returns immediately. Nothing happens unless running.
    pub fn send_signal(&self, signal: Signal, auto_kill: bool) -> Result<&Self, ProcessError> {
        let (pid, pty, reschedule) = {
            let mut state = self.inner.state.lock();
            let Some(pid) = state.pid.filter(|_| !state.ended) else {
                return Ok(self);
            };

            let mut reschedule = false;
            if signal == Signal::SIGTERM {
                state.already_got_sigterm = true;
                if auto_kill {
                    state.timeout_deadline = deadline_after(Some(
                        self.inner.conductor.configuration().kill_timeout(),
                    ));
                    reschedule = true;
                }
            }
            if signal == Signal::SIGKILL {
                state.forced_kill = true;
            }

            (pid, state.io.as_ref().map_or(false, |io| io.pty), reschedule)
        };
        debug!(process = %self, %signal, "kill");

        let descendants = if self
            .inner
            .options
            .kill_descendants
            .unwrap_or(self.inner.options.shell)
        {
            tree::descendants(pid)
        } else {
            Vec::new()
        };

        if reschedule {
            self.inner.conductor.update(self)?;
        }

        match kill(pid, signal) {
            // ESRCH: exited but not reaped yet
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(Errno::EPERM) if pty && HANGUP_SIGNALS.contains(&signal) => {
                debug!(pid = pid.as_raw(), %signal, "EPERM, hanging up the pty instead");
                self.inner.conductor.hangup_pty(self)?;
            }
            Err(Errno::EPERM) => {
                debug!(pid = pid.as_raw(), %signal, "EPERM, unable to signal process");
            }
            Err(source) => {
                return Err(ProcessError::Signal {
                    pid: pid.as_raw(),
                    signal,
                    source,
                })
            }
        }

        for descendant in descendants {
            match kill(descendant, signal) {
                Ok(()) | Err(Errno::EPERM) | Err(Errno::ESRCH) => {}
                Err(source) => {
                    return Err(ProcessError::Signal {
                        pid: descendant.as_raw(),
                        signal,
                        source,
                    })
                }
            }
        }

        Ok(self)
    }

    /// return to the not started state, killing and waiting for the process
    /// first if it still runs. The command and options are kept.
    pub fn reset(&self) -> Result<&Self, ProcessError> {
        debug!(process = %self, "reset");

        if self.running() && self.pid().is_some() {
            self.kill(Signal::SIGTERM)?;
            self.wait(None)?;
        }

        for handler in self.handlers() {
            handler.reset(self);
        }
        *self.inner.state.lock() = ProcessState::default();

        Ok(self)
    }

    /// feed the standard input, which is only open with `close_stdin` off
    pub fn write_stdin(&self, data: &[u8]) -> Result<&Self, ProcessError> {
        let mut state = self.inner.state.lock();
        let stdin = state
            .io
            .as_mut()
            .and_then(|io| io.stdin.as_mut())
            .ok_or(ProcessError::StdinClosed)?;

        stdin
            .write_all(data)
            .and_then(|_| stdin.flush())
            .map_err(ProcessError::Stdin)?;

        Ok(self)
    }

    pub fn close_stdin(&self) -> &Self {
        if let Some(io) = self.inner.state.lock().io.as_mut() {
            io.stdin = None;
        }

        self
    }

    pub(crate) fn output_fds(&self) -> Vec<(RawFd, Stream)> {
        let state = self.inner.state.lock();
        let Some(io) = state.io.as_ref() else {
            return Vec::new();
        };

        io.stdout
            .iter()
            .map(|fd| (fd.as_raw_fd(), Stream::Stdout))
            .chain(io.stderr.iter().map(|fd| (fd.as_raw_fd(), Stream::Stderr)))
            .collect()
    }

    pub(crate) fn pty_master_fd(&self) -> Option<RawFd> {
        let state = self.inner.state.lock();

        state
            .io
            .as_ref()
            .filter(|io| io.pty)
            .and_then(|io| io.stdout.as_ref())
            .map(|fd| fd.as_raw_fd())
    }

    /// close every copy of the pty master, the session sees a hangup
    pub(crate) fn close_pty(&self) {
        if let Some(io) = self.inner.state.lock().io.as_mut().filter(|io| io.pty) {
            io.stdout = None;
            io.stdin = None;
        }
    }

    /// append to the default buffer of a stream
    pub(crate) fn buffer_output(&self, stream: Stream, chunk: &[u8], error: bool) {
        let options = &self.inner.options;
        let mut state = self.inner.state.lock();

        match stream {
            Stream::Stdout => {
                if options.default_stdout_handler {
                    state.stdout.extend_from_slice(chunk);
                }
                state.stdout_ioerror |= error;
            }
            Stream::Stderr => {
                if options.default_stderr_handler {
                    state.stderr.extend_from_slice(chunk);
                }
                state.stderr_ioerror |= error;
            }
        }
    }

    /// hand a chunk to the custom handler of a stream, no lock may be held
    pub(crate) fn forward_output(&self, stream: Stream, chunk: &[u8], eof: bool, error: bool) {
        if chunk.is_empty() && !eof && !error {
            return;
        }

        let handler = match stream {
            Stream::Stdout => self.inner.options.stdout_handler.as_ref(),
            Stream::Stderr => self.inner.options.stderr_handler.as_ref(),
        };
        if let Some(handler) = handler {
            handler.read(self, stream, chunk, eof, error);
        }
    }

    /// every expiry marks the timeout. The first one sends SIGTERM, one after
    /// a SIGTERM means the grace period is over and escalates to SIGKILL.
    pub(crate) fn timeout_kill(&self) -> Result<(), ProcessError> {
        let signal = {
            let mut state = self.inner.state.lock();
            if state.pid.is_none() || state.ended {
                return Ok(());
            }

            state.timeouted = true;
            if state.already_got_sigterm {
                Signal::SIGKILL
            } else {
                Signal::SIGTERM
            }
        };

        self.kill(signal)?;

        Ok(())
    }

    /// the single terminal transition, the conductor has already flushed and
    /// unregistered the descriptors
    pub(crate) fn set_terminated(&self, exit_code: i32) {
        let mut state = self.inner.state.lock();
        if state.ended {
            return;
        }

        state.exit_code = Some(exit_code);
        state.end_date = Some(SystemTime::now());
        state.ended = true;
        state.io = None;
        self.log_terminated(&state);
    }

    pub(crate) fn notify_ended(&self) {
        for handler in self.handlers() {
            handler.end(self);
        }
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Process {}

impl Hash for Process {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe(&self.inner.state.lock()))
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
