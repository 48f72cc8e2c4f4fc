use crate::state::State;
use std::cell::RefCell;

thread_local! {
    static CURRENT: RefCell<Option<State>> = const { RefCell::new(None) };
}

/// Get the current [`State`] of this logical task.
///
/// A task that has none yet gets a fresh single-root state, so every OS
/// thread starts from an empty world. Cooperative runtimes that multiplex
/// tasks over threads swap states in and out with [`set_current`] or
/// [`restore`](crate::restore) at their switch points.
pub fn current() -> State {
    CURRENT.with(|slot| slot.borrow_mut().get_or_insert_with(State::new).clone())
}

/// Make `state` current for this logical task, returning the previous state.
pub fn set_current(state: State) -> State {
    CURRENT.with(|slot| slot.borrow_mut().replace(state).unwrap_or_else(State::new))
}
