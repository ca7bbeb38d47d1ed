use super::{Request, Shared};
use nix::{
    errno::Errno,
    libc,
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::Pid,
};
use std::{sync::Arc, thread, time::Duration};
use tracing::{debug, error};

/// pause before asking again when there is no child yet but one is expected
const NO_CHILD_RETRY: Duration = Duration::from_millis(10);
/// upper bound on waiting for the loop to collect a child seen exiting
const REAP_WAIT: Duration = Duration::from_millis(100);

/// `waitpid` on any child, restarted on EINTR. `None` when no child exited
/// (with WNOHANG) or when there is no child at all. A process killed by a
/// signal reports the negated signal number as exit code.
pub(super) fn checked_waitpid(flags: Option<WaitPidFlag>) -> Result<Option<(Pid, i32)>, Errno> {
    loop {
        match waitpid(Pid::from_raw(-1), flags) {
            Ok(WaitStatus::Exited(pid, code)) => return Ok(Some((pid, code))),
            Ok(WaitStatus::Signaled(pid, signal, _)) => return Ok(Some((pid, -(signal as i32)))),
            Ok(WaitStatus::StillAlive) => return Ok(None),
            // stops and continues are not exits
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(None),
            Err(error) => return Err(error),
        }
    }
}

/// Block until some child has exited and return its pid, leaving it
/// waitable. `None` when there is no child at all.
///
/// Children are only collected under the sync lock, which is also held while
/// spawning: std waits on a child that failed to exec and must not find its
/// status already taken.
pub(super) fn peek_exited() -> Result<Option<Pid>, Errno> {
    loop {
        // SAFETY: siginfo_t is plain data and all zeroes is a valid value
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: `info` outlives the call, WNOWAIT leaves the child a zombie
        let result = unsafe {
            libc::waitid(
                libc::P_ALL,
                0,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };

        match Errno::result(result) {
            // SAFETY: waitid filled a SIGCHLD siginfo, which carries si_pid
            Ok(_) => return Ok(Some(Pid::from_raw(unsafe { info.si_pid() }))),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(None),
            Err(error) => return Err(error),
        }
    }
}

/// start the reaper thread, the caller must have set `reaper_running`
pub(super) fn spawn(shared: Arc<Shared>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("reaper".to_string())
        .spawn(move || run(shared))
        .map(|_| ())
}

fn run(shared: Arc<Shared>) {
    debug!("Reaper started");

    loop {
        let exited = peek_exited();
        // the sync lock orders this notification after the request adding the process
        let mut sync = shared.sync.lock();

        match exited {
            Ok(Some(pid)) => {
                debug!(pid = pid.as_raw(), "Child process exited");

                if let Err(error) = shared.enqueue(Request::Exited(pid)) {
                    debug!(error = ?error, "Conductor gone, reaper stopping");
                    sync.reaper_running = false;
                    break;
                }
                // the child stays a zombie until the loop collects it
                shared.condvar.wait_for(&mut sync, REAP_WAIT);
            }
            Ok(None) if sync.tracked.is_empty() => {
                // restarted with the next process
                sync.reaper_running = false;
                break;
            }
            // a process was spawned after waitid returned
            Ok(None) => {
                shared.condvar.wait_for(&mut sync, NO_CHILD_RETRY);
            }
            Err(error) => {
                error!(error = ?error, "Reaper failed to wait for child processes");
                sync.reaper_running = false;
                break;
            }
        }
    }

    debug!("Reaper stopped");
}
