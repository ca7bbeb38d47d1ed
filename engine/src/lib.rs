//! Concurrent subprocess orchestration: a single event loop (the [`Conductor`])
//! multiplexes the output, timeouts and exit notifications of every
//! [`Process`], and [`Action`]s compose processes into units of work.

pub mod action;
pub mod conductor;
pub mod config;
pub mod connector;
pub mod host;
pub mod output;
pub mod process;
pub mod report;
pub mod substitution;
pub mod time;

pub use action::{
    wait_all, wait_any, Action, ActionError, ActionLifecycleHandler, ActionOptions,
};
pub use conductor::{Conductor, ConductorError};
pub use config::{ConfigErrors, Configuration, ConnectionParams};
pub use host::{Host, HostError};
pub use output::{LineHandler, OutputHandler, Stream};
pub use process::{Process, ProcessError, ProcessLifecycleHandler, ProcessOptions};
pub use report::{Report, Stats};
pub use substitution::{Bindings, SubstitutionError};
