use crate::{
    current,
    frame::InputConflict,
    key::{EqFn, Input, KeyKind, KeyRecord, RenderFn},
    state::DynamicRuleError,
};
use std::{any::Any, borrow::Cow, fmt, marker::PhantomData, sync::Arc};

pub(crate) type Factory<T> = Arc<dyn Fn() -> Arc<T> + Send + Sync>;

/// Declare a service: a named singleton instantiated lazily per state.
///
/// `factory` produces the instance on the first read in the frame that fixes
/// the binding; the instance lives until that frame is popped. Each logical
/// task resolves its own instance.
pub fn declare_service<T>(
    name: impl Into<Cow<'static, str>>,
    factory: impl Fn() -> Arc<T> + Send + Sync + 'static,
) -> Service<T>
where
    T: ?Sized + Send + Sync + 'static,
{
    declare_with(name.into(), KeyKind::Service, Some(Arc::new(factory)))
}

/// Declare a service with no default factory.
///
/// Reading it before a factory is bound (or a replacement redirects it to a
/// defaulted key) fails with [`DynamicRuleError::MissingBinding`].
pub fn declare_deferred_service<T>(name: impl Into<Cow<'static, str>>) -> Service<T>
where
    T: ?Sized + Send + Sync + 'static,
{
    declare_with(name.into(), KeyKind::Service, None)
}

/// Declare a resource slot.
///
/// Resources behave exactly like services inside the engine; the distinct
/// kind lets a lifecycle layer above enumerate them.
pub fn declare_resource<T>(
    name: impl Into<Cow<'static, str>>,
    factory: impl Fn() -> Arc<T> + Send + Sync + 'static,
) -> Resource<T>
where
    T: ?Sized + Send + Sync + 'static,
{
    declare_with(name.into(), KeyKind::Resource, Some(Arc::new(factory)))
}

fn declare_with<T>(name: Cow<'static, str>, kind: KeyKind, default: Option<Factory<T>>) -> Service<T>
where
    T: ?Sized + Send + Sync + 'static,
{
    let record = KeyRecord::register(
        name,
        kind,
        default.map(factory_input::<T>),
        Box::new(|input| {
            let factory = input
                .downcast_ref::<Factory<T>>()
                .expect("a service's inputs are factories of its instance type");
            Arc::new(factory())
        }),
    );

    Service {
        record,
        _marker: PhantomData,
    }
}

fn factory_input<T: ?Sized + Send + Sync + 'static>(factory: Factory<T>) -> Input {
    Input::raw(
        Arc::new(factory),
        eq_identity::<T> as EqFn,
        render_identity::<T> as RenderFn,
    )
}

// Factories are compared by identity: two bindings are the same input iff
// they hold the same factory allocation.
fn eq_identity<T: ?Sized + Send + Sync + 'static>(
    a: &(dyn Any + Send + Sync),
    b: &(dyn Any + Send + Sync),
) -> bool {
    match (a.downcast_ref::<Factory<T>>(), b.downcast_ref::<Factory<T>>()) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

fn render_identity<T: ?Sized + Send + Sync + 'static>(value: &(dyn Any + Send + Sync)) -> String {
    value
        .downcast_ref::<Factory<T>>()
        .map(|factory| format!("factory at {:p}", Arc::as_ptr(factory)))
        .unwrap_or_else(|| "<opaque>".into())
}

/// Handle to a declared service.
///
/// `T` is the instance type; declaring with a trait object (`Service<dyn
/// Trait>`) lets replacements swap in other implementations.
pub struct Service<T: ?Sized> {
    record: Arc<KeyRecord>,
    _marker: PhantomData<fn() -> Arc<T>>,
}

/// A service-shaped slot managed by a resource lifecycle layer.
pub type Resource<T> = Service<T>;

impl<T: ?Sized + Send + Sync + 'static> Service<T> {
    /// The instance for the current state.
    ///
    /// Resolves the canonical key through any replacements first (on every
    /// read), then instantiates once in the frame that fixes the factory.
    pub fn current(&self) -> Result<Arc<T>, DynamicRuleError> {
        let out = current().read(&self.record)?;
        Ok(out
            .downcast_ref::<Arc<T>>()
            .expect("a service's instances share its declared type")
            .clone())
    }

    /// Run `f` against the current instance.
    ///
    /// Shorthand for member access through the handle. Unlike dynamic
    /// attribute forwarding, this cannot rebind the handle itself, so
    /// in-place updates go through the instance's own interior mutability.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, DynamicRuleError> {
        Ok(f(&*self.current()?))
    }

    /// Bind `factory` in the top frame of the current state.
    ///
    /// Subject to the same discipline as setting writes, with factory
    /// identity as the equality: rebinding after the frame froze the service
    /// fails with [`InputConflict`].
    pub fn assign(&self, factory: impl Fn() -> Arc<T> + Send + Sync + 'static) -> Result<(), InputConflict> {
        let factory: Factory<T> = Arc::new(factory);
        current().write(&self.record, factory_input::<T>(factory))
    }

    /// Redirect reads of `original` to this service, in the top frame of the
    /// current state.
    ///
    /// The redirection holds for this frame and its descendants and dissolves
    /// when the frame is popped. Fails once `original` has already been read
    /// in this frame.
    pub fn replaces(&self, original: &Service<T>) -> Result<(), InputConflict> {
        current().install_replacement(&original.record, self.record.clone())
    }

    /// Diagnostic name given at declaration.
    pub fn name(&self) -> &str {
        self.record.name()
    }
}

impl<T: ?Sized> Clone for Service<T> {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> fmt::Debug for Service<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Service").field(&self.record.name()).finish()
    }
}
