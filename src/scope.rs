use crate::{
    current::{current, set_current},
    frame::Frame,
    state::{DynamicRuleError, State},
};
use std::{fmt, sync::Arc};

/// Push an empty child frame onto the current state.
///
/// Everything bound in ancestor frames stays readable; writes land in the
/// new frame and vanish when the guard drops. Guards nest LIFO by drop
/// order, and the drop restores the exact frame that was on top at entry on
/// every exit path, including panics.
pub fn enter() -> FrameGuard {
    let state = current();
    let prev = state.top();
    state.push();
    state.lock_scope();

    #[cfg(feature = "tracing")]
    tracing::trace!("entered frame at depth {}", state.depth());

    FrameGuard { state, prev }
}

/// Scoped child frame; see [`enter`].
#[must_use = "the frame pops when the guard drops"]
pub struct FrameGuard {
    state: State,
    prev: Arc<Frame>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.state.set_top(self.prev.clone());
        self.state.unlock_scope();

        #[cfg(feature = "tracing")]
        tracing::trace!("left frame, back at depth {}", self.state.depth());
    }
}

impl fmt::Debug for FrameGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameGuard").field("state", &self.state).finish()
    }
}

/// Swap in a brand-new state inheriting nothing, until the guard drops.
///
/// The previous state of the task is restored on drop. Made for test
/// isolation: nothing read or written inside the scope leaks out.
pub fn isolate() -> StateGuard {
    let isolated = State::new();
    isolated.lock_scope();
    let prev = set_current(isolated.clone());

    StateGuard { prev, isolated }
}

/// Scoped fresh state; see [`isolate`].
#[must_use = "the previous state returns when the guard drops"]
pub struct StateGuard {
    prev: State,
    isolated: State,
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        self.isolated.unlock_scope();
        set_current(self.prev.clone());
    }
}

impl fmt::Debug for StateGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateGuard").field("prev", &self.prev).finish()
    }
}

/// Pin the current state and its frame chain for a later [`restore`].
///
/// O(1): frames are append-only and keep their parents alive, so one
/// top-frame reference preserves the whole chain.
pub fn snapshot() -> Snapshot {
    let state = current();
    Snapshot {
        top: state.top(),
        state,
    }
}

/// Make the pinned state current for this task, returning a snapshot of the
/// state it displaces for the trip back.
///
/// This is the switch point for cooperative runtimes: a scheduler snapshots
/// the outgoing task's state and restores the incoming one. The handoff must
/// be synchronized by the caller; restoring a state whose scope guards are
/// still open on another thread fails with
/// [`DynamicRuleError::ForeignRestore`].
pub fn restore(snapshot: Snapshot) -> Result<Snapshot, DynamicRuleError> {
    if snapshot.state.locked_elsewhere() {
        return Err(DynamicRuleError::ForeignRestore);
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("restoring state at depth {}", snapshot.top.depth());

    snapshot.state.set_top(snapshot.top);
    let prev = set_current(snapshot.state);
    Ok(Snapshot {
        top: prev.top(),
        state: prev,
    })
}

/// Opaque pin of a state and its frame chain; see [`snapshot`].
#[derive(Clone)]
pub struct Snapshot {
    state: State,
    top: Arc<Frame>,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("top", &self.top).finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[test]
    fn guards_restore_the_entry_frame_on_panic() {
        let _scope = isolate();
        let speed = declare_setting("speed", 16i32, |v| *v as f64);
        let depth = current().depth();

        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _frame = enter();
            speed.assign(48).unwrap();
            panic!("boom");
        }));

        assert!(caught.is_err());
        assert_eq!(current().depth(), depth);
        assert_eq!(speed.get(), 16.0);
    }

    #[test]
    fn snapshot_then_restore_is_a_no_op_for_reads() {
        let _scope = isolate();
        let speed = declare_setting("speed", 16i32, |v| *v as f64);
        speed.assign(48).unwrap();

        let here = snapshot();
        let back = restore(here).unwrap();
        assert_eq!(speed.get(), 48.0);

        restore(back).unwrap();
        assert_eq!(speed.get(), 48.0);
    }

    #[test]
    fn isolation_does_not_leak_between_scopes() {
        let speed = declare_setting("speed", 16i32, |v| *v as f64);
        {
            let _scope = isolate();
            speed.assign(3).unwrap();
            assert_eq!(speed.get(), 3.0);
        }
        {
            let _scope = isolate();
            assert_eq!(speed.get(), 16.0);
        }
    }
}
