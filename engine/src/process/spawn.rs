use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    pty::{openpty, OpenptyResult},
    unistd::{setsid, Pid},
};
use std::{
    fmt,
    fs::File,
    io,
    os::unix::{
        io::{AsRawFd, FromRawFd, OwnedFd},
        process::CommandExt,
    },
    process::{Child, Command, Stdio},
};

/// What gets executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CommandLine {
    Args(Vec<String>),
    // run through `/bin/sh -c`
    Shell(String),
}

impl CommandLine {
    /// a shell command is kept verbatim, otherwise it is split with shell quoting rules
    pub(crate) fn parse(command: &str, shell: bool) -> Option<Self> {
        if shell {
            Some(Self::Shell(command.to_string()))
        } else {
            shlex::split(command).map(Self::Args)
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Args(args) => write!(f, "{}", args.join(" ")),
            Self::Shell(line) => write!(f, "{line}"),
        }
    }
}

/// Parent side of the standard streams of a child
#[derive(Debug)]
pub(crate) struct ChildIo {
    pub(crate) stdin: Option<File>,
    pub(crate) stdout: Option<OwnedFd>,
    pub(crate) stderr: Option<OwnedFd>,
    // stdout (and stdin) is the master side of a pty
    pub(crate) pty: bool,
}

#[derive(Debug)]
pub(crate) struct Spawned {
    pub(crate) pid: Pid,
    pub(crate) io: ChildIo,
}

pub(crate) fn spawn(command: &CommandLine, pty: bool, close_stdin: bool) -> io::Result<Spawned> {
    let mut builder = match command {
        CommandLine::Args(args) => {
            let (program, args) = args
                .split_first()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
            let mut builder = Command::new(program);
            builder.args(args);
            builder
        }
        CommandLine::Shell(line) => {
            let mut builder = Command::new("/bin/sh");
            builder.arg("-c").arg(line);
            builder
        }
    };
    builder.stderr(Stdio::piped());

    if pty {
        spawn_with_pty(builder, close_stdin)
    } else {
        spawn_with_pipes(builder, close_stdin)
    }
}

fn child_pid(child: &Child) -> Pid {
    Pid::from_raw(child.id() as i32)
}

fn spawn_with_pipes(mut builder: Command, close_stdin: bool) -> io::Result<Spawned> {
    builder
        .stdin(if close_stdin {
            Stdio::null()
        } else {
            Stdio::piped()
        })
        .stdout(Stdio::piped());

    let mut child = builder.spawn()?;

    Ok(Spawned {
        pid: child_pid(&child),
        io: ChildIo {
            stdin: child.stdin.take().map(|stdin| File::from(OwnedFd::from(stdin))),
            stdout: child.stdout.take().map(OwnedFd::from),
            stderr: child.stderr.take().map(OwnedFd::from),
            pty: false,
        },
    })
}

/// stdin and stdout on a new pty, the child leads its own session
fn spawn_with_pty(mut builder: Command, close_stdin: bool) -> io::Result<Spawned> {
    let OpenptyResult { master, slave } = openpty(None, None)?;
    // SAFETY: both descriptors were just opened and are owned by nobody else
    let (master, slave) = unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave)) };

    for fd in [&master, &slave] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }

    builder
        .stdin(Stdio::from(slave.try_clone()?))
        .stdout(Stdio::from(slave));
    // SAFETY: setsid is async signal safe
    unsafe {
        builder.pre_exec(|| setsid().map(|_| ()).map_err(io::Error::from));
    }

    let mut child = builder.spawn()?;
    // releases the parent copies of the slave side
    drop(builder);

    let stdin = if close_stdin {
        None
    } else {
        Some(File::from(master.try_clone()?))
    };

    Ok(Spawned {
        pid: child_pid(&child),
        io: ChildIo {
            stdin,
            stdout: Some(master),
            stderr: child.stderr.take().map(OwnedFd::from),
            pty: true,
        },
    })
}
