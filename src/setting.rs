use crate::{
    current,
    frame::InputConflict,
    key::{Input, KeyKind, KeyRecord},
};
use std::{borrow::Cow, fmt, marker::PhantomData, sync::Arc};

/// Declare a setting: a named value derived from a write-once input.
///
/// `transform` maps the effective input to the value readers see; it runs at
/// most once per frame per key, when the first read freezes the input.
/// `default_input` is what reads fall back to when no frame binds the key.
///
/// Keys carry identity in the returned handle: declare once (typically in a
/// `LazyLock` static) and clone the handle wherever it is read. The name is
/// for diagnostics only.
pub fn declare_setting<I, O>(
    name: impl Into<Cow<'static, str>>,
    default_input: I,
    transform: impl Fn(&I) -> O + Send + Sync + 'static,
) -> Setting<I, O>
where
    I: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    let record = KeyRecord::register(
        name.into(),
        KeyKind::Setting,
        Some(Input::by_value(default_input)),
        Box::new(move |input| {
            let input = input
                .downcast_ref::<I>()
                .expect("a setting's inputs share its declared input type");
            Arc::new(transform(input))
        }),
    );

    Setting {
        record,
        _marker: PhantomData,
    }
}

/// Handle to a declared setting.
///
/// Reads resolve against the current state of the calling task; see
/// [`declare_setting`].
pub struct Setting<I, O> {
    record: Arc<KeyRecord>,
    _marker: PhantomData<fn(&I) -> O>,
}

impl<I, O> Setting<I, O>
where
    I: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// The effective value in the current state.
    ///
    /// The first read in the frame that binds the input computes and
    /// memoizes the value there, freezing the input.
    ///
    /// # Panics
    /// Panics only if the transform itself panics; the frame is then left
    /// unfrozen and the next read retries.
    pub fn get(&self) -> O {
        let out = current()
            .read(&self.record)
            .expect("a setting always carries a default input");
        out.downcast_ref::<O>()
            .expect("a setting's outputs share its declared output type")
            .clone()
    }

    /// Write `value` as the input in the top frame of the current state.
    ///
    /// Until the first read in that frame, writes may be repeated freely and
    /// the last one wins. After the first read, only writes equal to the
    /// frozen input succeed.
    pub fn assign(&self, value: I) -> Result<(), InputConflict> {
        current().write(&self.record, Input::by_value(value))
    }

    /// Diagnostic name given at declaration.
    pub fn name(&self) -> &str {
        self.record.name()
    }
}

impl<I, O> Clone for Setting<I, O> {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
            _marker: PhantomData,
        }
    }
}

impl<I, O> fmt::Debug for Setting<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Setting").field(&self.record.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[test]
    fn reads_fall_back_to_the_default() {
        let _scope = isolate();
        let speed = declare_setting("speed", 16i32, |v| *v as f64);

        assert_eq!(speed.get(), 16.0);
    }

    #[test]
    fn last_write_wins_until_the_first_read() {
        let _scope = isolate();
        let speed = declare_setting("speed", 16i32, |v| *v as f64);
        let _frame = enter();

        speed.assign(77).unwrap();
        speed.assign(99).unwrap();
        speed.assign(66).unwrap();
        assert_eq!(speed.get(), 66.0);

        let err = speed.assign(8).unwrap_err();
        assert_eq!(err.key, "speed");
        assert_eq!(err.existing, "66");
        assert_eq!(err.attempted, "8");

        // Equal writes stay idempotent after the freeze.
        speed.assign(66).unwrap();
    }

    #[test]
    fn handles_share_identity_with_their_clones() {
        let _scope = isolate();
        let speed = declare_setting("speed", 16i32, |v| *v as f64);
        let alias = speed.clone();

        speed.assign(48).unwrap();
        assert_eq!(alias.get(), 48.0);
    }
}
