use crate::process::Process;
use parking_lot::Mutex;
use std::{collections::HashMap, fmt};

/// Output stream of a process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Receives the raw output of a process.
///
/// Called from the conductor thread without any lock held, so an
/// implementation may query the process it is given. `eof` or `error` mark the
/// last call for a stream.
pub trait OutputHandler: Send + Sync {
    fn read(&self, process: &Process, stream: Stream, chunk: &[u8], eof: bool, error: bool);
}

/// Splits a byte stream into lines, keeping incomplete lines until more data
/// or the end of the stream arrives
#[derive(Debug, Default, Clone)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// complete lines contained in `chunk`, without their terminator
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.pending[consumed..].iter().position(|&byte| byte == b'\n') {
            lines.push(decode_line(&self.pending[consumed..consumed + offset]));
            consumed += offset + 1;
        }
        self.pending.drain(..consumed);

        lines
    }

    /// the unterminated rest of the stream, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let rest = decode_line(&self.pending);
            self.pending.clear();
            Some(rest)
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// [`OutputHandler`] calling a closure for every line of output. One handler
/// may be shared by several processes, each stream is split on its own.
pub struct LineHandler<F> {
    on_line: F,
    // dropped once the stream ends
    splitters: Mutex<HashMap<(Process, Stream), LineSplitter>>,
}

impl<F> LineHandler<F>
where
    F: Fn(&Process, Stream, &str) + Send + Sync,
{
    pub fn new(on_line: F) -> Self {
        Self {
            on_line,
            splitters: Mutex::new(HashMap::new()),
        }
    }
}

impl<F> OutputHandler for LineHandler<F>
where
    F: Fn(&Process, Stream, &str) + Send + Sync,
{
    fn read(&self, process: &Process, stream: Stream, chunk: &[u8], eof: bool, error: bool) {
        let lines = {
            let mut splitters = self.splitters.lock();
            let key = (process.clone(), stream);
            let mut lines = splitters.entry(key.clone()).or_default().push(chunk);

            if eof || error {
                if let Some(mut splitter) = splitters.remove(&key) {
                    lines.extend(splitter.finish());
                }
            }
            lines
        };

        for line in lines {
            (self.on_line)(process, stream, &line);
        }
    }
}

impl<F> fmt::Debug for LineHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineHandler").finish_non_exhaustive()
    }
}

/// cut `output` in the middle when it is longer than `threshold` bytes
pub fn compact(output: &[u8], threshold: usize) -> String {
    if threshold == 0 || output.len() <= threshold {
        return String::from_utf8_lossy(output).into_owned();
    }

    let half = threshold / 2;
    format!(
        "{}\n[...]\n{}",
        String::from_utf8_lossy(&output[..half]),
        String::from_utf8_lossy(&output[output.len() - half..])
    )
}
