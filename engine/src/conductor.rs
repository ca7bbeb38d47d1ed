//! The conductor: one event loop thread multiplexing the output streams,
//! timeouts and exit notifications of every started [`Process`], plus a reaper
//! thread blocking on child exits.
//!
//! Only the event loop mutates its maps. Other threads push [`Request`]s on a
//! queue and write to a self pipe to wake the loop up. A single mutex (the
//! sync lock) and its condition variable are shared by callers, the loop and
//! the reaper. A process is spawned and announced to the loop under this
//! lock. The reaper only observes exits and announces them under it. The
//! loop applies requests, reaps children and notifies waiters under it.

mod event_loop;
mod fd;
mod reaper;

use crate::{
    config::{ConfigErrors, Configuration},
    process::Process,
};
use nix::{errno::Errno, unistd::Pid};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    collections::{HashSet, VecDeque},
    fmt,
    os::unix::io::RawFd,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("A conductor is already running")]
    AlreadyRunning,
    #[error("The conductor was shut down")]
    ShutDown,
    #[error("Process is not tracked by the conductor")]
    NotTracked,
    #[error("Failed to load the configuration")]
    Config(#[from] ConfigErrors),
    #[error("Failed to spawn a conductor thread")]
    Thread(#[source] std::io::Error),
    #[error("System call failed")]
    Sys(#[from] Errno),
    #[error("Error on the conductor wakeup pipe")]
    WakeupPipe,
}

/// Cross thread request, applied in FIFO order by the event loop
pub(crate) enum Request {
    /// start polling a freshly spawned process
    Add(Process),
    /// the timeout deadline of a process changed
    Update(Process),
    /// stop tracking a process without waiting for its exit
    Remove(Process),
    /// the reaper saw `pid` exit, its status is still to be collected
    Exited(Pid),
    /// close the pty master of a process that could not be signalled
    HangupPty(Process),
}

/// State guarded by the sync lock
#[derive(Debug, Default)]
pub(crate) struct SyncState {
    // pids spawned and not yet reaped or removed
    pub(crate) tracked: HashSet<Pid>,
    pub(crate) reaper_running: bool,
}

pub(crate) struct Shared {
    config: Arc<Configuration>,
    sync: Mutex<SyncState>,
    condvar: Condvar,
    requests: Mutex<VecDeque<Request>>,
    // write end of the wakeup pipe, `None` once shut down
    wakeup: Mutex<Option<RawFd>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn enqueue(&self, request: Request) -> Result<(), ConductorError> {
        let wakeup = self.wakeup.lock();
        let wpipe = wakeup.ok_or(ConductorError::ShutDown)?;

        self.requests.lock().push_back(request);
        fd::wakeup(wpipe)?;

        Ok(())
    }

    fn take_requests(&self) -> VecDeque<Request> {
        std::mem::take(&mut *self.requests.lock())
    }
}

/// Handle on the event loop, cheap to clone
#[derive(Clone)]
pub struct Conductor {
    shared: Arc<Shared>,
}

static GLOBAL: Lazy<Mutex<Option<Conductor>>> = Lazy::new(|| Mutex::new(None));

impl Conductor {
    /// the running conductor, started with the default configuration if needed
    pub fn global() -> Result<Conductor, ConductorError> {
        let mut global = GLOBAL.lock();

        match global.as_ref() {
            Some(conductor) => Ok(conductor.clone()),
            None => {
                let conductor = Self::launch(Configuration::load_default()?)?;
                *global = Some(conductor.clone());

                Ok(conductor)
            }
        }
    }

    /// start the conductor with an explicit configuration
    pub fn init(config: Configuration) -> Result<Conductor, ConductorError> {
        let mut global = GLOBAL.lock();

        if global.is_some() {
            return Err(ConductorError::AlreadyRunning);
        }

        let conductor = Self::launch(config)?;
        *global = Some(conductor.clone());

        Ok(conductor)
    }

    fn launch(config: Configuration) -> Result<Conductor, ConductorError> {
        let (rpipe, wpipe) = fd::wakeup_pipe()?;
        let shared = Arc::new(Shared {
            config: Arc::new(config),
            sync: Mutex::new(SyncState::default()),
            condvar: Condvar::new(),
            requests: Mutex::new(VecDeque::new()),
            wakeup: Mutex::new(Some(wpipe)),
            thread: Mutex::new(None),
        });

        let event_loop = event_loop::EventLoop::new(shared.clone(), rpipe);
        let handle = thread::Builder::new()
            .name("conductor".to_string())
            .spawn(move || event_loop::run_guarded(event_loop))
            .map_err(|error| {
                fd::close_quietly(rpipe);
                fd::close_quietly(wpipe);
                ConductorError::Thread(error)
            })?;
        *shared.thread.lock() = Some(handle);
        debug!("Conductor started");

        Ok(Self { shared })
    }

    /// stop the event loop, processes still running are left alone
    pub fn shutdown(&self) {
        if let Some(wpipe) = self.shared.wakeup.lock().take() {
            debug!("Shutting down conductor");
            fd::close_quietly(wpipe);
        }

        {
            let mut global = GLOBAL.lock();
            if global
                .as_ref()
                .map_or(false, |conductor| Arc::ptr_eq(&conductor.shared, &self.shared))
            {
                *global = None;
            }
        }

        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("Conductor thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.wakeup.lock().is_some()
    }

    pub fn configuration(&self) -> &Configuration {
        &self.shared.config
    }

    /// stop tracking a started process, it keeps running unobserved
    pub fn remove(&self, process: &Process) -> Result<(), ConductorError> {
        let sync = self.shared.sync.lock();

        match process.pid() {
            Some(pid) if sync.tracked.contains(&pid) => {
                self.shared.enqueue(Request::Remove(process.clone()))
            }
            _ => Err(ConductorError::NotTracked),
        }
    }

    /// run `register` under the sync lock
    pub(crate) fn with_sync<T>(&self, register: impl FnOnce(&mut SyncState) -> T) -> T {
        let mut sync = self.shared.sync.lock();
        register(&mut sync)
    }

    pub(crate) fn add(&self, process: &Process) -> Result<(), ConductorError> {
        self.shared.enqueue(Request::Add(process.clone()))
    }

    pub(crate) fn update(&self, process: &Process) -> Result<(), ConductorError> {
        self.shared.enqueue(Request::Update(process.clone()))
    }

    pub(crate) fn hangup_pty(&self, process: &Process) -> Result<(), ConductorError> {
        self.shared.enqueue(Request::HangupPty(process.clone()))
    }

    /// block while `pending` holds, re-checked every time the loop notifies
    pub(crate) fn wait_while(&self, pending: impl Fn() -> bool, deadline: Option<Instant>) {
        let mut sync: MutexGuard<'_, SyncState> = self.shared.sync.lock();

        while pending() {
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .condvar
                        .wait_until(&mut sync, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                None => self.shared.condvar.wait(&mut sync),
            }
        }
    }
}

impl fmt::Debug for Conductor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conductor")
            .field("running", &self.is_running())
            .field("queued_requests", &self.shared.requests.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessOptions;
    use std::time::Duration;

    #[test]
    fn hanging_up_the_pty_ends_its_reader() {
        let conductor = Conductor::global().unwrap();
        let options = ProcessOptions {
            pty: true,
            ..Default::default()
        };
        let process = Process::new(&conductor, "cat", options).unwrap();
        process.start().unwrap();
        assert!(process.pty_master_fd().is_some());

        // the fallback used when signalling a pty session fails with EPERM
        conductor.hangup_pty(&process).unwrap();
        process.wait(Some(Duration::from_secs(10))).unwrap();

        assert!(process.ended());
        assert!(!process.error());
        assert!(process.exit_code().is_some());
        assert!(process.pty_master_fd().is_none());
    }

    #[test]
    fn start_after_shutdown_ends_in_error() {
        let conductor = Conductor::launch(Configuration::default()).unwrap();
        conductor.shutdown();
        assert!(!conductor.is_running());

        let process = Process::new(&conductor, "sleep 5", ProcessOptions::default()).unwrap();
        process.start().unwrap();

        assert!(process.ended());
        assert!(process.error());
        assert_eq!(
            process.error_reason().as_deref(),
            Some("The conductor was shut down")
        );
    }

    #[test]
    fn removing_needs_a_tracked_process() {
        let conductor = Conductor::global().unwrap();
        let process = Process::new(&conductor, "true", ProcessOptions::default()).unwrap();

        assert!(matches!(
            conductor.remove(&process),
            Err(ConductorError::NotTracked)
        ));

        process.run(None).unwrap();
        assert!(matches!(
            conductor.remove(&process),
            Err(ConductorError::NotTracked)
        ));
    }
}
