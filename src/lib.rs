//! Scoped, write-once, task-switchable contextual state.
//!
//! This crate replaces process globals and ad-hoc thread locals with named
//! bindings resolved against the *current state* of the calling task: a
//! chain of append-only frames that can be nested, snapshotted, and swapped
//! wholesale between logical tasks.
//!
//! # Settings
//!
//! A [`Setting`] derives a value from a write-once input:
//!
//! ```
//! use contextual::prelude::*;
//!
//! let speed = declare_setting("speed", 16i32, |v| *v as f64);
//! assert_eq!(speed.get(), 16.0);
//!
//! {
//!     let _frame = enter();
//!     speed.assign(48).unwrap();
//!     assert_eq!(speed.get(), 48.0);
//! }
//! assert_eq!(speed.get(), 16.0);
//! ```
//!
//! Inputs accept any number of writes until the first read freezes them in
//! the frame that binds them; unequal writes after that fail with
//! [`InputConflict`]. Values are memoized where their input lives, so a read
//! after leaving a frame sees exactly what the enclosing frame saw.
//!
//! # Services
//!
//! A [`Service`] binds a factory instead of a value and hands out one lazily
//! built instance per state. Declaring the instance type as a trait object
//! lets a frame [replace](Service::replaces) one implementation with
//! another for its own scope.
//!
//! # Tasks
//!
//! Every OS thread has its own current [`State`]. Cooperative runtimes
//! switch logical tasks by swapping states at their yield points with
//! [`snapshot`] and [`restore`]; the engine itself never blocks and imposes
//! no scheduler.
//!
//! # Feature flags
//!
//! - `tracing`: emit [`tracing`](https://docs.rs/tracing) events for frame
//!   transitions, state swaps, and rejected writes.

mod current;
mod frame;
mod key;
mod scope;
mod service;
mod setting;
mod state;

pub use self::current::{current, set_current};
pub use self::frame::InputConflict;
pub use self::key::{declared_keys, KeyKind};
pub use self::scope::{enter, isolate, restore, snapshot, FrameGuard, Snapshot, StateGuard};
pub use self::service::{
    declare_deferred_service, declare_resource, declare_service, Resource, Service,
};
pub use self::setting::{declare_setting, Setting};
pub use self::state::{DynamicRuleError, State};

/// Prelude of the user-facing surface.
/// `use contextual::prelude::*;`
pub mod prelude {
    pub use crate::{
        current, declare_deferred_service, declare_resource, declare_service, declare_setting,
        enter, isolate, restore, set_current, snapshot, DynamicRuleError, FrameGuard,
        InputConflict, KeyKind, Resource, Service, Setting, Snapshot, State, StateGuard,
    };
}
