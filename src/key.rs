use slotmap::{DefaultKey, SlotMap};
use std::{
    any::Any,
    borrow::Cow,
    fmt,
    sync::{Arc, LazyLock, RwLock},
};

/// Stable identity of a bindable slot.
///
/// Ids are handed out once per declaration and never reused for the lifetime
/// of the process.
pub(crate) type KeyId = DefaultKey;

/// What a key binds: a transformed value, a shared instance, or a managed
/// resource kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// A value produced by applying a transform to an input.
    Setting,
    /// A shared instance produced by a factory.
    Service,
    /// A service-shaped slot reserved for a resource lifecycle layered on top.
    Resource,
}

struct KeyMeta {
    name: Cow<'static, str>,
    kind: KeyKind,
}

static REGISTRY: LazyLock<RwLock<SlotMap<DefaultKey, KeyMeta>>> =
    LazyLock::new(|| RwLock::new(SlotMap::new()));

/// Names and kinds of every key declared so far, for diagnostics.
///
/// Names are informational; identity lives in the declared handle, so two
/// keys may share a name without sharing a slot.
pub fn declared_keys() -> Vec<(String, KeyKind)> {
    REGISTRY
        .read()
        .unwrap()
        .values()
        .map(|meta| (meta.name.to_string(), meta.kind))
        .collect()
}

pub(crate) type EqFn = fn(&(dyn Any + Send + Sync), &(dyn Any + Send + Sync)) -> bool;

pub(crate) type RenderFn = fn(&(dyn Any + Send + Sync)) -> String;

/// Write-side value of a binding, erased together with the comparison its
/// key kind uses for write idempotence.
#[derive(Clone)]
pub(crate) struct Input {
    value: Arc<dyn Any + Send + Sync>,
    eq: EqFn,
    render: RenderFn,
}

impl Input {
    pub(crate) fn raw(value: Arc<dyn Any + Send + Sync>, eq: EqFn, render: RenderFn) -> Self {
        Self { value, eq, render }
    }

    /// Input compared by value equality of its domain.
    pub(crate) fn by_value<I>(value: I) -> Self
    where
        I: PartialEq + fmt::Debug + Send + Sync + 'static,
    {
        Self::raw(Arc::new(value), eq_value::<I>, render_value::<I>)
    }

    pub(crate) fn value(&self) -> &(dyn Any + Send + Sync) {
        &*self.value
    }

    pub(crate) fn matches(&self, other: &Input) -> bool {
        (self.eq)(&*self.value, &*other.value)
    }

    pub(crate) fn render(&self) -> String {
        (self.render)(&*self.value)
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn eq_value<I: PartialEq + 'static>(
    a: &(dyn Any + Send + Sync),
    b: &(dyn Any + Send + Sync),
) -> bool {
    match (a.downcast_ref::<I>(), b.downcast_ref::<I>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn render_value<I: fmt::Debug + 'static>(value: &(dyn Any + Send + Sync)) -> String {
    value
        .downcast_ref::<I>()
        .map(|value| format!("{value:?}"))
        .unwrap_or_else(|| "<opaque>".into())
}

pub(crate) type Transform =
    Box<dyn Fn(&(dyn Any + Send + Sync)) -> Arc<dyn Any + Send + Sync> + Send + Sync>;

/// Immortal record behind a declared key: identity, diagnostics, and the
/// erased default producer.
pub(crate) struct KeyRecord {
    id: KeyId,
    name: Cow<'static, str>,
    kind: KeyKind,
    default: Option<Input>,
    transform: Transform,
}

impl KeyRecord {
    pub(crate) fn register(
        name: Cow<'static, str>,
        kind: KeyKind,
        default: Option<Input>,
        transform: Transform,
    ) -> Arc<Self> {
        let id = REGISTRY.write().unwrap().insert(KeyMeta {
            name: name.clone(),
            kind,
        });

        Arc::new(Self {
            id,
            name,
            kind,
            default,
            transform,
        })
    }

    pub(crate) fn id(&self) -> KeyId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn kind(&self) -> KeyKind {
        self.kind
    }

    pub(crate) fn default(&self) -> Option<&Input> {
        self.default.as_ref()
    }

    /// Apply the key's transform to an input.
    ///
    /// The caller must not hold any frame lock: transforms are user code and
    /// may read other keys reentrantly.
    pub(crate) fn apply(&self, input: &Input) -> Arc<dyn Any + Send + Sync> {
        (self.transform)(input.value())
    }
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}
