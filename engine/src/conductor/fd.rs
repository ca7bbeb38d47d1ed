use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, FdFlag, OFlag},
    unistd::{close, pipe, read, write},
};
use std::os::unix::io::RawFd;
use tracing::debug;

/// largest single read from a descriptor
const MAX_READ: usize = 32767;

pub(super) fn set_nonblocking(fd: RawFd) -> Result<(), Errno> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;

    Ok(())
}

fn set_cloexec(fd: RawFd) -> Result<(), Errno> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// self pipe used to wake the event loop up, both ends non blocking
pub(super) fn wakeup_pipe() -> Result<(RawFd, RawFd), Errno> {
    let (rpipe, wpipe) = pipe()?;

    for fd in [rpipe, wpipe] {
        if let Err(error) = set_nonblocking(fd).and_then(|_| set_cloexec(fd)) {
            close_quietly(rpipe);
            close_quietly(wpipe);
            return Err(error);
        }
    }

    Ok((rpipe, wpipe))
}

/// a full pipe already guarantees a pending wakeup
pub(super) fn wakeup(wpipe: RawFd) -> Result<(), Errno> {
    match write(wpipe, b".") {
        Ok(_) | Err(Errno::EAGAIN) => Ok(()),
        Err(error) => Err(error),
    }
}

pub(super) fn close_quietly(fd: RawFd) {
    if let Err(error) = close(fd) {
        debug!(fd, error = ?error, "Failed to close descriptor");
    }
}

/// read everything currently available on a non blocking descriptor,
/// returns the data and whether the end of the stream was reached
pub(super) fn read_available(fd: RawFd) -> Result<(Vec<u8>, bool), Errno> {
    let mut data = Vec::new();
    let mut buffer = [0u8; MAX_READ];

    loop {
        match read(fd, &mut buffer) {
            Ok(0) => return Ok((data, true)),
            Ok(count) => data.extend_from_slice(&buffer[..count]),
            Err(Errno::EAGAIN) => return Ok((data, false)),
            Err(Errno::EINTR) => continue,
            // a pty master reports the hangup of its slave side this way
            Err(Errno::EIO) => return Ok((data, true)),
            Err(error) => return Err(error),
        }
    }
}
