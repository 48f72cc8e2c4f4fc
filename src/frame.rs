use crate::key::{Input, KeyId, KeyRecord};
use ahash::{AHashMap, AHashSet};
use std::{
    any::Any,
    fmt,
    sync::{Arc, Mutex},
};
use thiserror::Error;

/// A binding's input was already fixed by a read.
///
/// Bindings accept any number of writes until their first read freezes them;
/// from then on only writes equal to the frozen input are accepted. Settings
/// compare inputs by value, services compare factories by identity.
#[derive(Debug, Error)]
#[error("`{key}` is frozen in this frame: have {existing}, rejected {attempted}")]
pub struct InputConflict {
    /// Name of the key whose binding was already fixed.
    pub key: String,
    /// Rendering of the input in place.
    pub existing: String,
    /// Rendering of the rejected input.
    pub attempted: String,
}

#[derive(Default)]
struct Slots {
    inputs: AHashMap<KeyId, Input>,
    computed: AHashMap<KeyId, Arc<dyn Any + Send + Sync>>,
    replacements: AHashMap<KeyId, Arc<KeyRecord>>,
    /// Keys whose resolution passed through this frame while it was on top;
    /// gates replacement installs the way `computed` gates input writes.
    observed: AHashSet<KeyId>,
}

/// One append-only layer of bindings, linked to the layer it shadows.
///
/// Frames are reachable only through the state that owns them, so the inner
/// mutex is uncontended; it exists so whole states can be handed between
/// threads at synchronized swap points.
pub(crate) struct Frame {
    parent: Option<Arc<Frame>>,
    slots: Mutex<Slots>,
}

impl Frame {
    pub(crate) fn root() -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            slots: Mutex::default(),
        })
    }

    pub(crate) fn child(parent: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(parent.clone()),
            slots: Mutex::default(),
        })
    }

    pub(crate) fn parent(&self) -> Option<&Arc<Frame>> {
        self.parent.as_ref()
    }

    pub(crate) fn depth(&self) -> usize {
        let mut depth = 1;
        let mut frame = self;
        while let Some(parent) = frame.parent() {
            depth += 1;
            frame = parent;
        }
        depth
    }

    /// The input bound in this frame, with its memoized output if the frame
    /// has already frozen it.
    #[allow(clippy::type_complexity)]
    pub(crate) fn lookup(
        &self,
        key: KeyId,
    ) -> Option<(Input, Option<Arc<dyn Any + Send + Sync>>)> {
        let slots = self.slots.lock().unwrap();
        let input = slots.inputs.get(&key)?.clone();
        Some((input, slots.computed.get(&key).cloned()))
    }

    /// Install `input` unless the binding is frozen with a different value.
    pub(crate) fn write_input(
        &self,
        record: &KeyRecord,
        input: Input,
    ) -> Result<(), InputConflict> {
        let mut slots = self.slots.lock().unwrap();

        if slots.computed.contains_key(&record.id()) {
            let existing = slots
                .inputs
                .get(&record.id())
                .expect("a frozen binding keeps its input");
            if existing.matches(&input) {
                return Ok(());
            }

            #[cfg(feature = "tracing")]
            tracing::warn!("rejected write to frozen `{}`", record.name());

            return Err(InputConflict {
                key: record.name().to_string(),
                existing: existing.render(),
                attempted: input.render(),
            });
        }

        slots.inputs.insert(record.id(), input);
        Ok(())
    }

    /// Bind `input` only if the key has no input here yet, then report the
    /// binding as a read would see it.
    #[allow(clippy::type_complexity)]
    pub(crate) fn seed(
        &self,
        key: KeyId,
        input: Input,
    ) -> (Input, Option<Arc<dyn Any + Send + Sync>>) {
        let mut slots = self.slots.lock().unwrap();
        let computed = slots.computed.get(&key).cloned();
        let input = slots.inputs.entry(key).or_insert(input).clone();
        (input, computed)
    }

    /// Memoize `out` for `key`, freezing the input it was computed from.
    ///
    /// Returns the winning output: if a reentrant read froze the key first,
    /// that output is kept and `out` is discarded.
    pub(crate) fn freeze(
        &self,
        key: KeyId,
        out: Arc<dyn Any + Send + Sync>,
    ) -> Arc<dyn Any + Send + Sync> {
        let mut slots = self.slots.lock().unwrap();
        debug_assert!(
            slots.inputs.contains_key(&key),
            "memoization lands where the input lives"
        );
        slots.computed.entry(key).or_insert(out).clone()
    }

    pub(crate) fn replacement_of(&self, key: KeyId) -> Option<Arc<KeyRecord>> {
        self.slots.lock().unwrap().replacements.get(&key).cloned()
    }

    /// Redirect `from` to `to` for reads resolved through this frame.
    ///
    /// Rejected once `from` has been read in this frame; until then the
    /// redirection may be rewritten freely, like any other input.
    pub(crate) fn install_replacement(
        &self,
        from: &KeyRecord,
        to: Arc<KeyRecord>,
    ) -> Result<(), InputConflict> {
        let mut slots = self.slots.lock().unwrap();

        if slots.observed.contains(&from.id()) || slots.computed.contains_key(&from.id()) {
            let existing = slots
                .replacements
                .get(&from.id())
                .map(|record| format!("`{}`", record.name()))
                .unwrap_or_else(|| "<resolved as declared>".into());
            return Err(InputConflict {
                key: from.name().to_string(),
                existing,
                attempted: format!("`{}`", to.name()),
            });
        }

        slots.replacements.insert(from.id(), to);
        Ok(())
    }

    /// Record that a resolution of `key` passed through this frame.
    pub(crate) fn mark_observed(&self, key: KeyId) {
        self.slots.lock().unwrap().observed.insert(key);
    }

    fn binding_count(&self) -> (usize, usize) {
        let slots = self.slots.lock().unwrap();
        (slots.inputs.len(), slots.computed.len())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (inputs, computed) = self.binding_count();
        f.debug_struct("Frame")
            .field("depth", &self.depth())
            .field("inputs", &inputs)
            .field("computed", &computed)
            .finish()
    }
}
