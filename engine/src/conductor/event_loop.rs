use super::{fd, reaper, ConductorError, Request, Shared, SyncState};
use crate::{output::Stream, process::Process};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
    sys::{
        signal::{kill, Signal},
        wait::WaitPidFlag,
    },
    unistd::{getpid, Pid},
};
use std::{
    collections::{HashMap, HashSet},
    os::unix::io::RawFd,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, instrument, trace, warn};

/// Callback delivered once the sync lock is released
enum Deferred {
    Output {
        process: Process,
        stream: Stream,
        chunk: Vec<u8>,
        eof: bool,
        error: bool,
    },
    Ended(Process),
}

/// State owned by the conductor thread
pub(super) struct EventLoop {
    shared: Arc<Shared>,
    rpipe: RawFd,
    processes: HashSet<Process>,
    fds: HashMap<RawFd, (Process, Stream)>,
    pids: HashMap<Pid, Process>,
    // sorted by deadline, at most one entry per process
    timeline: Vec<(Instant, Process)>,
    deferred: Vec<Deferred>,
}

/// run the loop, a failure takes the whole program down since the running
/// processes can no longer be observed
pub(super) fn run_guarded(event_loop: EventLoop) {
    let outcome = catch_unwind(AssertUnwindSafe(move || event_loop.run()));

    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(error)) => format!("{error}"),
        Err(_) => "panic".to_string(),
    };

    error!(failure = %failure, "Conductor thread failed, terminating");
    if let Err(error) = kill(getpid(), Signal::SIGTERM) {
        error!(error = ?error, "Failed to terminate after conductor failure");
    }
}

fn poll_timeout(delay: Option<Duration>) -> i32 {
    match delay {
        // round up to avoid spinning right before a deadline
        Some(delay) => i32::try_from((delay.as_nanos() + 999_999) / 1_000_000).unwrap_or(i32::MAX),
        None => -1,
    }
}

impl EventLoop {
    pub(super) fn new(shared: Arc<Shared>, rpipe: RawFd) -> Self {
        Self {
            shared,
            rpipe,
            processes: HashSet::new(),
            fds: HashMap::new(),
            pids: HashMap::new(),
            timeline: Vec::new(),
            deferred: Vec::new(),
        }
    }

    fn run(mut self) -> Result<(), ConductorError> {
        let mut finished = false;

        while !finished {
            let delay = self.next_timeout();
            trace!(
                fds = self.fds.len(),
                timeline = self.timeline.len(),
                delay = ?delay,
                "Polling"
            );

            let events = match delay {
                Some(delay) if delay.is_zero() => Vec::new(),
                _ => self.poll(delay)?,
            };

            // the wakeup pipe is handled after the process descriptors
            let mut wakeup_event = None;
            for (fd, revents) in events {
                if fd == self.rpipe {
                    wakeup_event = Some(revents);
                } else {
                    self.handle_fd_event(fd, revents);
                }
            }

            self.check_timeouts();

            if let Some(revents) = wakeup_event {
                if revents.contains(PollFlags::POLLIN) && fd::read_available(self.rpipe)?.1 {
                    finished = true;
                }
                if revents.contains(PollFlags::POLLHUP) {
                    finished = true;
                }
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                    return Err(ConductorError::WakeupPipe);
                }
            }

            {
                let shared = self.shared.clone();
                let mut sync = shared.sync.lock();

                for request in shared.take_requests() {
                    self.handle_request(&mut sync, request)?;
                }
                self.reap_terminated(&mut sync)?;
                shared.condvar.notify_all();
            }

            self.dispatch_deferred();
        }

        fd::close_quietly(self.rpipe);
        debug!("Conductor stopped");

        Ok(())
    }

    fn next_timeout(&self) -> Option<Duration> {
        self.timeline
            .first()
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()))
    }

    fn poll(&self, delay: Option<Duration>) -> Result<Vec<(RawFd, PollFlags)>, ConductorError> {
        let interest = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP;
        let descriptors = std::iter::once(self.rpipe)
            .chain(self.fds.keys().copied())
            .collect::<Vec<_>>();
        let mut poll_fds = descriptors
            .iter()
            .map(|&fd| PollFd::new(fd, interest))
            .collect::<Vec<_>>();

        match poll(&mut poll_fds, poll_timeout(delay)) {
            Ok(_) => Ok(descriptors
                .into_iter()
                .zip(poll_fds.iter())
                .filter_map(|(fd, poll_fd)| {
                    poll_fd
                        .revents()
                        .filter(|revents| !revents.is_empty())
                        .map(|revents| (fd, revents))
                })
                .collect()),
            Err(Errno::EINTR) => Ok(Vec::new()),
            Err(error) => Err(error.into()),
        }
    }

    fn handle_fd_event(&mut self, fd: RawFd, revents: PollFlags) {
        let Some((process, stream)) = self.fds.get(&fd).cloned() else {
            return;
        };
        trace!(fd, ?revents, %stream, pid = ?process.pid(), "Descriptor event");

        if revents.contains(PollFlags::POLLIN) {
            match fd::read_available(fd) {
                Ok((chunk, _)) => {
                    process.buffer_output(stream, &chunk, false);
                    process.forward_output(stream, &chunk, false, false);
                }
                Err(error) => {
                    warn!(fd, error = ?error, "Failed to read process output");
                    self.fds.remove(&fd);
                    process.buffer_output(stream, &[], true);
                    process.forward_output(stream, &[], false, true);
                    return;
                }
            }
        }

        if revents.contains(PollFlags::POLLHUP) {
            self.fds.remove(&fd);
            process.forward_output(stream, &[], true, false);
        } else if revents.contains(PollFlags::POLLERR) {
            self.fds.remove(&fd);
            process.buffer_output(stream, &[], true);
            process.forward_output(stream, &[], false, true);
        } else if revents.contains(PollFlags::POLLNVAL) {
            debug!(fd, "Descriptor closed while polled");
            self.fds.remove(&fd);
        }
    }

    /// fire every due deadline, in deadline order
    fn check_timeouts(&mut self) {
        let now = Instant::now();
        let due = self
            .timeline
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .count();

        for (_, process) in self.timeline.drain(..due).collect::<Vec<_>>() {
            debug!(pid = ?process.pid(), "Timeout reached");

            if let Err(error) = process.timeout_kill() {
                warn!(error = ?error, pid = ?process.pid(), "Failed to kill process on timeout");
            }
        }
    }

    fn schedule(&mut self, process: &Process) {
        self.timeline.retain(|(_, scheduled)| scheduled != process);

        if let Some(deadline) = process.timeout_deadline() {
            let position = self
                .timeline
                .partition_point(|(scheduled, _)| *scheduled <= deadline);
            self.timeline.insert(position, (deadline, process.clone()));
        }
    }

    #[instrument(level = "trace", skip_all)]
    fn handle_request(
        &mut self,
        sync: &mut SyncState,
        request: Request,
    ) -> Result<(), ConductorError> {
        match request {
            Request::Add(process) => self.add(sync, process)?,
            Request::Update(process) => {
                // a process killed quickly may already be gone
                if self.processes.contains(&process) {
                    self.schedule(&process);
                }
            }
            Request::Remove(process) => {
                if self.processes.contains(&process) {
                    self.remove(sync, process, None);
                } else {
                    warn!(pid = ?process.pid(), "Removing a process the conductor does not track");
                }
            }
            // collected by reap_terminated right after the requests
            Request::Exited(pid) => trace!(pid = pid.as_raw(), "Exit announced"),
            Request::HangupPty(process) => self.hangup_pty(process),
        }

        Ok(())
    }

    fn add(&mut self, sync: &mut SyncState, process: Process) -> Result<(), ConductorError> {
        if self.processes.contains(&process) {
            return Ok(());
        }
        let Some(pid) = process.pid() else {
            warn!("Ignoring a process that was never spawned");
            return Ok(());
        };
        if process.ended() {
            warn!(pid = pid.as_raw(), "Ignoring an already ended process");
            return Ok(());
        }

        for (fd, stream) in process.output_fds() {
            fd::set_nonblocking(fd)?;
            self.fds.insert(fd, (process.clone(), stream));
        }
        self.pids.insert(pid, process.clone());
        self.schedule(&process);
        self.processes.insert(process);

        if !sync.reaper_running {
            sync.reaper_running = true;

            if let Err(error) = reaper::spawn(self.shared.clone()) {
                // exits are still collected by the loop itself
                error!(error = ?error, "Failed to start the reaper thread");
                sync.reaper_running = false;
            }
        }

        Ok(())
    }

    /// unregister a process, flushing what is left on its descriptors, and
    /// mark it terminated when its exit code is known
    fn remove(&mut self, sync: &mut SyncState, process: Process, exit_code: Option<i32>) {
        self.timeline.retain(|(_, scheduled)| scheduled != &process);
        if let Some(pid) = process.pid() {
            self.pids.remove(&pid);
            sync.tracked.remove(&pid);
        }

        for (fd, stream) in process.output_fds() {
            if self.fds.remove(&fd).is_some() {
                self.flush(&process, fd, stream);
            }
        }
        self.processes.remove(&process);

        if let Some(exit_code) = exit_code {
            process.set_terminated(exit_code);
            self.deferred.push(Deferred::Ended(process));
        }
    }

    fn flush(&mut self, process: &Process, fd: RawFd, stream: Stream) {
        let (chunk, error) = match fd::read_available(fd) {
            Ok((chunk, _)) => (chunk, false),
            Err(Errno::EBADF) => (Vec::new(), false),
            Err(error) => {
                warn!(fd, error = ?error, "Failed to read remaining process output");
                (Vec::new(), true)
            }
        };

        process.buffer_output(stream, &chunk, error);
        self.deferred.push(Deferred::Output {
            process: process.clone(),
            stream,
            chunk,
            eof: !error,
            error,
        });
    }

    fn hangup_pty(&mut self, process: Process) {
        if !self.processes.contains(&process) {
            return;
        }

        if let Some(fd) = process.pty_master_fd() {
            if let Some((_, stream)) = self.fds.remove(&fd) {
                self.flush(&process, fd, stream);
            }
            debug!(pid = ?process.pid(), "Closing pty master side");
            process.close_pty();
        }
    }

    fn reap_terminated(&mut self, sync: &mut SyncState) -> Result<(), ConductorError> {
        while let Some((pid, exit_code)) = reaper::checked_waitpid(Some(WaitPidFlag::WNOHANG))? {
            match self.pids.get(&pid).cloned() {
                Some(process) => self.remove(sync, process, Some(exit_code)),
                None => warn!(pid = pid.as_raw(), exit_code, "Reaped an unknown child process"),
            }
        }

        Ok(())
    }

    fn dispatch_deferred(&mut self) {
        for deferred in std::mem::take(&mut self.deferred) {
            match deferred {
                Deferred::Output {
                    process,
                    stream,
                    chunk,
                    eof,
                    error,
                } => process.forward_output(stream, &chunk, eof, error),
                Deferred::Ended(process) => process.notify_ended(),
            }
        }
    }
}
