use crate::{
    frame::{Frame, InputConflict},
    key::{Input, KeyKind, KeyRecord},
};
use ahash::AHashSet;
use std::{
    any::Any,
    fmt,
    sync::{Arc, Mutex},
    thread::{self, ThreadId},
};
use thiserror::Error;

/// A rule of the context engine was broken at resolution time.
#[derive(Debug, Error)]
pub enum DynamicRuleError {
    /// Replacement resolution revisited a key it had already followed.
    #[error("replacement cycle while resolving `{key}`")]
    ReplacementCycle {
        /// Name of the key the resolution started from.
        key: String,
    },

    /// No frame binds the key and it declared no default.
    #[error("`{key}` has no bound input and no declared default")]
    MissingBinding {
        /// Name of the unresolvable key.
        key: String,
    },

    /// The target state has open scope guards on another thread.
    #[error("state is scope-locked by another task")]
    ForeignRestore,
}

struct Entered {
    owner: ThreadId,
    depth: usize,
}

struct StateInner {
    top: Mutex<Arc<Frame>>,
    entered: Mutex<Option<Entered>>,
}

/// One logical task's view of the world: a chain of frames, swappable as a
/// whole.
///
/// `State` is a cheap clonable handle; all clones observe the same chain.
/// A state is owned by exactly one logical task at a time. Handing it to
/// another task is legal only at a synchronized swap point, which
/// [`restore`](crate::restore) enforces for guard-locked states.
#[derive(Clone)]
pub struct State {
    inner: Arc<StateInner>,
}

impl State {
    /// A state with a single empty root frame, inheriting nothing.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StateInner {
                top: Mutex::new(Frame::root()),
                entered: Mutex::new(None),
            }),
        }
    }

    /// Number of frames currently on this state's chain.
    pub fn depth(&self) -> usize {
        self.top().depth()
    }

    pub(crate) fn top(&self) -> Arc<Frame> {
        self.inner.top.lock().unwrap().clone()
    }

    pub(crate) fn set_top(&self, frame: Arc<Frame>) {
        *self.inner.top.lock().unwrap() = frame;
    }

    /// Push an empty child of the current top and make it the new top.
    pub(crate) fn push(&self) -> Arc<Frame> {
        let mut top = self.inner.top.lock().unwrap();
        let child = Frame::child(&top);
        *top = child.clone();
        child
    }

    /// Tie this state to the current thread while a scope guard is open.
    pub(crate) fn lock_scope(&self) {
        let mut entered = self.inner.entered.lock().unwrap();
        match &mut *entered {
            Some(entered) => {
                debug_assert_eq!(
                    entered.owner,
                    thread::current().id(),
                    "a state is owned by one task at a time"
                );
                entered.depth += 1;
            }
            None => {
                *entered = Some(Entered {
                    owner: thread::current().id(),
                    depth: 1,
                });
            }
        }
    }

    pub(crate) fn unlock_scope(&self) {
        let mut entered = self.inner.entered.lock().unwrap();
        if let Some(inner) = &mut *entered {
            inner.depth -= 1;
            if inner.depth == 0 {
                *entered = None;
            }
        }
    }

    pub(crate) fn locked_elsewhere(&self) -> bool {
        self.inner
            .entered
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|entered| entered.owner != thread::current().id())
    }

    /// Resolve and memoize the value bound to `record`.
    ///
    /// Walks the chain top to root for the nearest frame binding the key,
    /// returning its memoized output when the frame already froze it, and
    /// otherwise computing and freezing it there. With no binding anywhere
    /// the declared default is seeded and frozen at the root. Service keys
    /// resolve through replacements first, on every read.
    pub(crate) fn read(
        &self,
        record: &Arc<KeyRecord>,
    ) -> Result<Arc<dyn Any + Send + Sync>, DynamicRuleError> {
        let top = self.top();

        let record = match record.kind() {
            KeyKind::Setting => record.clone(),
            KeyKind::Service | KeyKind::Resource => self.resolve(&top, record)?,
        };
        let key = record.id();

        let mut cursor = Some(top);
        let mut nearest = None;
        while let Some(frame) = cursor {
            if let Some(binding) = frame.lookup(key) {
                nearest = Some((frame, binding));
                break;
            }
            cursor = frame.parent().cloned();
        }

        let (frame, input) = match nearest {
            Some((_, (_, Some(out)))) => return Ok(out),
            Some((frame, (input, None))) => (frame, input),
            None => {
                let Some(default) = record.default() else {
                    return Err(DynamicRuleError::MissingBinding {
                        key: record.name().to_string(),
                    });
                };

                let root = self.root_frame();
                let (input, computed) = root.seed(key, default.clone());
                match computed {
                    Some(out) => return Ok(out),
                    None => (root, input),
                }
            }
        };

        #[cfg(feature = "tracing")]
        tracing::trace!("computing `{}`", record.name());

        // No frame lock is held here: the transform may read other keys.
        let out = record.apply(&input);
        Ok(frame.freeze(key, out))
    }

    /// Install `input` in the top frame. Writes never descend into parents.
    pub(crate) fn write(&self, record: &KeyRecord, input: Input) -> Result<(), InputConflict> {
        self.top().write_input(record, input)
    }

    pub(crate) fn install_replacement(
        &self,
        from: &KeyRecord,
        to: Arc<KeyRecord>,
    ) -> Result<(), InputConflict> {
        self.top().install_replacement(from, to)
    }

    /// Canonical key for `record`: the fixed point of following the first
    /// replacement found walking top to root, restarting from the top after
    /// every redirection.
    ///
    /// Cycles are detected lazily here rather than at install time, since
    /// redirections may be spread over arbitrary frames. Every key the walk
    /// touches counts as read in the top frame, which pins the redirections
    /// the result depends on.
    fn resolve(
        &self,
        top: &Arc<Frame>,
        record: &Arc<KeyRecord>,
    ) -> Result<Arc<KeyRecord>, DynamicRuleError> {
        let mut seen = AHashSet::new();
        seen.insert(record.id());

        let mut current = record.clone();
        'walk: loop {
            let mut cursor = Some(top.clone());
            while let Some(frame) = cursor {
                if let Some(target) = frame.replacement_of(current.id()) {
                    if !seen.insert(target.id()) {
                        return Err(DynamicRuleError::ReplacementCycle {
                            key: record.name().to_string(),
                        });
                    }
                    current = target;
                    continue 'walk;
                }
                cursor = frame.parent().cloned();
            }
            break;
        }

        for key in seen {
            top.mark_observed(key);
        }
        Ok(current)
    }

    fn root_frame(&self) -> Arc<Frame> {
        let mut frame = self.top();
        while let Some(parent) = frame.parent() {
            let parent = parent.clone();
            frame = parent;
        }
        frame
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("top", &self.top())
            .finish()
    }
}
