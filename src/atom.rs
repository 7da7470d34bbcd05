//! Node descriptors and their typed handles.
//!
//! A descriptor is a plain value carrying a stable identity, an optional
//! debug name, and the node's behavior (an initial value for sources, a
//! computation for derived nodes, nothing for actions). Descriptors hold no
//! state themselves: any number of environments can evaluate the same
//! descriptor independently.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use slab::Slab;

use crate::cache::CacheEntry;
use crate::ctx::Ctx;
use crate::error::AtomError;
use crate::spy::Spy;

/// Stable identity of a node.
///
/// Identities come from a process-wide counter, so descriptors can be
/// shared across environments without collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId(pub u64);

static NEXT_ATOM_ID: AtomicU64 = AtomicU64::new(0);

fn next_atom_id() -> AtomId {
    AtomId(NEXT_ATOM_ID.fetch_add(1, Ordering::Relaxed))
}

pub(crate) type ComputeFn = Box<dyn Fn(&mut Spy<'_>) -> Result<Rc<dyn Any>, AtomError>>;
pub(crate) type EqFn = Box<dyn Fn(&dyn Any, &dyn Any) -> bool>;
pub(crate) type ConnectHook = Rc<dyn Fn(&Ctx)>;
pub(crate) type UpdateHook = Rc<dyn Fn(&Ctx, &Rc<CacheEntry>)>;

/// Payload queue held by an action's cache entry. Cleared at the end of
/// every transaction that touched it.
#[derive(Default)]
pub(crate) struct ActionQueue {
    pub(crate) payloads: Vec<Rc<dyn Any>>,
}

pub(crate) enum AtomKind {
    /// Settable value node, seeded from `init` on first use.
    Source { init: Rc<dyn Any>, eq: EqFn },
    /// Value produced by `compute`, revalidated against recorded reads.
    Computed { compute: ComputeFn, eq: EqFn },
    /// Transient event node; its entry holds an [`ActionQueue`].
    Action,
}

pub(crate) struct AtomInner {
    id: AtomId,
    name: Option<Box<str>>,
    kind: AtomKind,
    hooks: Hooks,
}

#[derive(Default)]
struct Hooks {
    connect: RefCell<Slab<ConnectHook>>,
    cleanup: RefCell<Slab<ConnectHook>>,
    update: RefCell<Slab<UpdateHook>>,
}

fn eq_fn<T: PartialEq + 'static>() -> EqFn {
    Box::new(|a, b| match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    })
}

/// An untyped handle to a node descriptor.
///
/// Cache entries expose their node through this type. It carries identity,
/// debug name, and hooks, but no value type; typed access goes through
/// [`Atom`], [`Derived`], and [`Action`].
///
/// This is cheap to clone.
#[derive(Clone)]
pub struct AnyAtom {
    inner: Rc<AtomInner>,
}

impl AnyAtom {
    fn new(kind: AtomKind, name: Option<String>) -> Self {
        AnyAtom {
            inner: Rc::new(AtomInner {
                id: next_atom_id(),
                name: name.map(Into::into),
                kind,
                hooks: Hooks::default(),
            }),
        }
    }

    /// The stable identity of this node.
    pub fn id(&self) -> AtomId {
        self.inner.id
    }

    /// The debug name given at construction, if any.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The debug name, or `atom{id}` when none was given.
    pub fn display_name(&self) -> String {
        match self.name() {
            Some(name) => name.to_owned(),
            None => format!("atom{}", self.id().0),
        }
    }

    pub(crate) fn kind(&self) -> &AtomKind {
        &self.inner.kind
    }

    pub(crate) fn connect_hooks(&self) -> Vec<ConnectHook> {
        self.inner.hooks.connect.borrow().iter().map(|(_, h)| h.clone()).collect()
    }

    pub(crate) fn cleanup_hooks(&self) -> Vec<ConnectHook> {
        self.inner.hooks.cleanup.borrow().iter().map(|(_, h)| h.clone()).collect()
    }

    pub(crate) fn update_hooks(&self) -> Vec<UpdateHook> {
        self.inner.hooks.update.borrow().iter().map(|(_, h)| h.clone()).collect()
    }

    fn register(&self, kind: HookKind, hook: HookFn) -> HookHandle {
        let key = match (&kind, hook) {
            (HookKind::Connect, HookFn::Lifecycle(h)) => {
                self.inner.hooks.connect.borrow_mut().insert(h)
            }
            (HookKind::Cleanup, HookFn::Lifecycle(h)) => {
                self.inner.hooks.cleanup.borrow_mut().insert(h)
            }
            (HookKind::Update, HookFn::Update(h)) => {
                self.inner.hooks.update.borrow_mut().insert(h)
            }
            _ => unreachable!("hook function matches its registration kind"),
        };
        HookHandle { atom: self.clone(), kind, key }
    }
}

impl PartialEq for AnyAtom {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for AnyAtom {}

impl std::hash::Hash for AnyAtom {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for AnyAtom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnyAtom({})", self.display_name())
    }
}

enum HookKind {
    Connect,
    Cleanup,
    Update,
}

enum HookFn {
    Lifecycle(ConnectHook),
    Update(UpdateHook),
}

/// Detach capability returned by hook registration.
///
/// Dropping the handle keeps the hook attached for the life of the
/// descriptor; call [`HookHandle::detach`] to remove it.
pub struct HookHandle {
    atom: AnyAtom,
    kind: HookKind,
    key: usize,
}

impl HookHandle {
    /// Remove the hook this handle was returned for.
    pub fn detach(self) {
        let hooks = &self.atom.inner.hooks;
        match self.kind {
            HookKind::Connect => {
                let _ = hooks.connect.borrow_mut().try_remove(self.key);
            }
            HookKind::Cleanup => {
                let _ = hooks.cleanup.borrow_mut().try_remove(self.key);
            }
            HookKind::Update => {
                let _ = hooks.update.borrow_mut().try_remove(self.key);
            }
        }
    }
}

/// Common surface of all node handles.
pub trait AtomNode {
    /// The untyped view of this node.
    fn as_any(&self) -> &AnyAtom;

    /// The stable identity of this node.
    fn id(&self) -> AtomId {
        self.as_any().id()
    }

    /// The debug name given at construction, if any.
    fn name(&self) -> Option<&str> {
        self.as_any().name()
    }

    /// Attach a hook fired after this node transitions from unobserved to
    /// observed in some environment.
    ///
    /// Hooks run outside any transaction, after the pass that caused the
    /// transition commits. When a whole chain connects at once, hooks fire
    /// dependencies-first. The engine does not catch panics raised inside
    /// a hook; isolating them is the registrant's responsibility.
    fn on_connect(&self, hook: impl Fn(&Ctx) + 'static) -> HookHandle {
        self.as_any().register(HookKind::Connect, HookFn::Lifecycle(Rc::new(hook)))
    }

    /// Attach a hook fired after this node transitions from observed back
    /// to unobserved. When a whole chain disconnects at once, hooks fire
    /// dependents-first.
    fn on_cleanup(&self, hook: impl Fn(&Ctx) + 'static) -> HookHandle {
        self.as_any().register(HookKind::Cleanup, HookFn::Lifecycle(Rc::new(hook)))
    }

    /// Attach a hook fired once per commit in which this node's cached
    /// value actually changed, receiving the fresh cache entry.
    fn on_update(&self, hook: impl Fn(&Ctx, &Rc<CacheEntry>) + 'static) -> HookHandle {
        self.as_any().register(HookKind::Update, HookFn::Update(Rc::new(hook)))
    }
}

impl AtomNode for AnyAtom {
    fn as_any(&self) -> &AnyAtom {
        self
    }
}

/// A settable source node holding a `T`.
///
/// ```
/// use atom_flow::{Atom, Ctx};
///
/// let count = Atom::new(0_u32);
/// let ctx = Ctx::new();
/// assert_eq!(*ctx.get(&count).unwrap(), 0);
/// ctx.set(&count, 3).unwrap();
/// assert_eq!(*ctx.get(&count).unwrap(), 3);
/// ```
pub struct Atom<T> {
    any: AnyAtom,
    _type: PhantomData<fn() -> T>,
}

impl<T: PartialEq + 'static> Atom<T> {
    /// Create a source node seeded with `initial`.
    ///
    /// Writing a value equal to the current one is a no-op: the version is
    /// kept and dependents are not touched.
    pub fn new(initial: T) -> Self {
        Self::build(initial, None)
    }

    /// Create a named source node. The name shows up in display output and
    /// cycle reports.
    pub fn named(initial: T, name: impl Into<String>) -> Self {
        Self::build(initial, Some(name.into()))
    }

    fn build(initial: T, name: Option<String>) -> Self {
        let kind = AtomKind::Source { init: Rc::new(initial), eq: eq_fn::<T>() };
        Atom { any: AnyAtom::new(kind, name), _type: PhantomData }
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Atom { any: self.any.clone(), _type: PhantomData }
    }
}

impl<T> AtomNode for Atom<T> {
    fn as_any(&self) -> &AnyAtom {
        &self.any
    }
}

impl<T> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Atom({})", self.any.display_name())
    }
}

/// A derived node whose value is produced by a tracked computation.
///
/// The computation receives a [`Spy`] and must perform all graph reads
/// through it; every read becomes a recorded dependency, so the node
/// recomputes exactly when something it actually read changes.
///
/// ```
/// use atom_flow::{Atom, Ctx, Derived};
///
/// let base = Atom::new(2_i32);
/// let b = base.clone();
/// let doubled = Derived::new(move |spy| Ok(*spy.get(&b)? * 2));
///
/// let ctx = Ctx::new();
/// assert_eq!(*ctx.get(&doubled).unwrap(), 4);
/// ```
pub struct Derived<T> {
    any: AnyAtom,
    _type: PhantomData<fn() -> T>,
}

impl<T: PartialEq + 'static> Derived<T> {
    /// Create a derived node from a computation.
    ///
    /// A recomputation that returns a value equal to the cached one keeps
    /// the old version, cutting propagation off below this node.
    pub fn new(compute: impl Fn(&mut Spy<'_>) -> Result<T, AtomError> + 'static) -> Self {
        Self::build(compute, None)
    }

    /// Create a named derived node.
    pub fn named(
        compute: impl Fn(&mut Spy<'_>) -> Result<T, AtomError> + 'static,
        name: impl Into<String>,
    ) -> Self {
        Self::build(compute, Some(name.into()))
    }

    fn build(
        compute: impl Fn(&mut Spy<'_>) -> Result<T, AtomError> + 'static,
        name: Option<String>,
    ) -> Self {
        let compute: ComputeFn =
            Box::new(move |spy| compute(spy).map(|value| Rc::new(value) as Rc<dyn Any>));
        let kind = AtomKind::Computed { compute, eq: eq_fn::<T>() };
        Derived { any: AnyAtom::new(kind, name), _type: PhantomData }
    }
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Derived { any: self.any.clone(), _type: PhantomData }
    }
}

impl<T> AtomNode for Derived<T> {
    fn as_any(&self) -> &AnyAtom {
        &self.any
    }
}

impl<T> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Derived({})", self.any.display_name())
    }
}

/// An action node carrying transient payloads of type `T`.
///
/// Dispatching appends a payload to the action's queue; computations that
/// read the action during the same transaction see every payload queued so
/// far. At commit the queue is cleared without waking dependents, so
/// actions never hold state across transactions.
pub struct Action<T> {
    any: AnyAtom,
    _type: PhantomData<fn() -> T>,
}

impl<T: 'static> Action<T> {
    /// Create an action node.
    pub fn new() -> Self {
        Action { any: AnyAtom::new(AtomKind::Action, None), _type: PhantomData }
    }

    /// Create a named action node.
    pub fn named(name: impl Into<String>) -> Self {
        Action { any: AnyAtom::new(AtomKind::Action, Some(name.into())), _type: PhantomData }
    }
}

impl<T: 'static> Default for Action<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Action<T> {
    fn clone(&self) -> Self {
        Action { any: self.any.clone(), _type: PhantomData }
    }
}

impl<T> AtomNode for Action<T> {
    fn as_any(&self) -> &AnyAtom {
        &self.any
    }
}

impl<T> fmt::Debug for Action<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action({})", self.any.display_name())
    }
}
