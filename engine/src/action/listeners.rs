use super::{Action, ActionInner, ActionLifecycleHandler};
use crate::process::{Process, ProcessLifecycleHandler};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Weak,
};
use tracing::{debug, warn};

fn notify_parent(parent: &Weak<ActionInner>) {
    if let Some(inner) = parent.upgrade() {
        Action { inner }.notify_terminated();
    }
}

/// Ends its parent action once every child ended
pub(super) struct Countdown {
    parent: Weak<ActionInner>,
    total: usize,
    remaining: AtomicUsize,
}

impl Countdown {
    pub(super) fn new(parent: Weak<ActionInner>, total: usize) -> Self {
        Self {
            parent,
            total,
            remaining: AtomicUsize::new(total),
        }
    }

    pub(super) fn reset(&self) {
        self.remaining.store(self.total, Ordering::SeqCst);
    }

    fn child_ended(&self) {
        // a child restarted outside of its parent may end once more
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            });

        if previous == Ok(1) {
            notify_parent(&self.parent);
        }
    }
}

impl ProcessLifecycleHandler for Countdown {
    fn end(&self, _process: &Process) {
        self.child_ended();
    }
}

impl ActionLifecycleHandler for Countdown {
    fn end(&self, _action: &Action) {
        self.child_ended();
    }
}

/// Starts the next sub action of a sequence, or ends the sequence after the
/// last one
pub(super) struct SequentialLink {
    parent: Weak<ActionInner>,
    index: usize,
    total: usize,
    next: Option<Action>,
}

impl SequentialLink {
    pub(super) fn new(
        parent: Weak<ActionInner>,
        index: usize,
        total: usize,
        next: Option<Action>,
    ) -> Self {
        Self {
            parent,
            index,
            total,
            next,
        }
    }
}

impl ActionLifecycleHandler for SequentialLink {
    fn end(&self, action: &Action) {
        debug!(
            action = %action.name(),
            step = self.index + 1,
            total = self.total,
            "Sequential step ended"
        );

        match &self.next {
            Some(next) => {
                if let Err(error) = next.start() {
                    warn!(error = %error, action = %next.name(), "Failed to start next step");
                    notify_parent(&self.parent);
                }
            }
            None => notify_parent(&self.parent),
        }
    }
}
