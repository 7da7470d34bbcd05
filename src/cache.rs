//! Cache entries: per-environment snapshots of node state.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexSet;

use crate::atom::{AnyAtom, AtomId};

/// Insertion-ordered set of node identities, used for dependent edges.
pub(crate) type ChildSet = IndexSet<AtomId, ahash::RandomState>;

/// Version is a per-environment number assigned when a node's value
/// changes. It increases monotonically, but not one by one: a recomputation
/// whose result equals the previous value keeps the previous version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(pub u64);

/// What triggered the creation of a cache entry.
///
/// Every entry records its cause, so a transaction log can be walked back
/// to the write or dispatch that started a pass.
#[derive(Clone)]
pub enum Cause {
    /// Demand-driven computation: a first read, a revalidation, or the
    /// initial pull of a subscription.
    Pull,
    /// A direct write to this source node.
    Write,
    /// A payload dispatched to this action node.
    Dispatch,
    /// A dependency whose new value propagated here.
    Parent(Rc<CacheEntry>),
}

impl Cause {
    /// Returns the dependency entry that propagated here, if any.
    pub fn parent(&self) -> Option<&Rc<CacheEntry>> {
        match self {
            Cause::Parent(entry) => Some(entry),
            _ => None,
        }
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Pull => write!(f, "Pull"),
            Cause::Write => write!(f, "Write"),
            Cause::Dispatch => write!(f, "Dispatch"),
            Cause::Parent(entry) => {
                write!(f, "Parent({}@{})", entry.atom().display_name(), entry.version().0)
            }
        }
    }
}

/// One immutable snapshot of a node's state inside an environment.
///
/// An entry is replaced, never mutated, when the node's value or recorded
/// dependencies change; the dependent-edge set and the stale flag are the
/// only live parts, carried forward across replacements. Holding an `Rc`
/// to an entry pins the exact value and dependency versions observed at
/// the time it was created.
pub struct CacheEntry {
    atom: AnyAtom,
    version: Version,
    value: Rc<dyn Any>,
    cause: Cause,
    /// Dependencies in first-read order, pinned at their observed versions.
    parents: Vec<Rc<CacheEntry>>,
    /// Nodes whose recorded dependencies include this one.
    children: RefCell<ChildSet>,
    /// Set when an ancestor changed or the node disconnected; a stale entry
    /// must be revalidated against its parents before its value is trusted.
    stale: Cell<bool>,
}

impl CacheEntry {
    pub(crate) fn new(
        atom: AnyAtom,
        version: Version,
        value: Rc<dyn Any>,
        cause: Cause,
        parents: Vec<Rc<CacheEntry>>,
        children: ChildSet,
        stale: bool,
    ) -> Self {
        CacheEntry {
            atom,
            version,
            value,
            cause,
            parents,
            children: RefCell::new(children),
            stale: Cell::new(stale),
        }
    }

    /// The node this entry belongs to.
    pub fn atom(&self) -> &AnyAtom {
        &self.atom
    }

    /// The version assigned when this value was produced.
    pub fn version(&self) -> Version {
        self.version
    }

    /// What triggered the creation of this entry.
    pub fn cause(&self) -> &Cause {
        &self.cause
    }

    /// Whether this entry needs revalidation before its value is trusted.
    pub fn is_stale(&self) -> bool {
        self.stale.get()
    }

    /// The dependencies recorded by the computation that produced this
    /// entry, in first-read order.
    pub fn parents(&self) -> &[Rc<CacheEntry>] {
        &self.parents
    }

    /// The identities of nodes currently depending on this one.
    pub fn children(&self) -> Vec<AtomId> {
        self.children.borrow().iter().copied().collect()
    }

    /// Number of nodes currently depending on this one.
    pub fn child_count(&self) -> usize {
        self.children.borrow().len()
    }

    /// The value, downcast to its concrete type.
    ///
    /// Returns `None` if `T` is not the type the node was declared with.
    /// Action entries hold their payload queue rather than a plain value;
    /// read them through their typed handle instead.
    pub fn value<T: 'static>(&self) -> Option<Rc<T>> {
        self.value.clone().downcast::<T>().ok()
    }

    pub(crate) fn raw_value(&self) -> &Rc<dyn Any> {
        &self.value
    }

    pub(crate) fn set_stale(&self, stale: bool) {
        self.stale.set(stale);
    }

    pub(crate) fn add_child(&self, id: AtomId) {
        self.children.borrow_mut().insert(id);
    }

    pub(crate) fn remove_child(&self, id: AtomId) {
        self.children.borrow_mut().shift_remove(&id);
    }

    pub(crate) fn children_snapshot(&self) -> ChildSet {
        self.children.borrow().clone()
    }

    /// A copy of this entry marked stale. Used when a node disconnects: the
    /// old entry stays pinned by whoever holds it, while the map moves on
    /// to the copy.
    pub(crate) fn detached(&self) -> Self {
        CacheEntry::new(
            self.atom.clone(),
            self.version,
            self.value.clone(),
            self.cause.clone(),
            self.parents.clone(),
            self.children_snapshot(),
            true,
        )
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("atom", &self.atom.display_name())
            .field("version", &self.version)
            .field("cause", &self.cause)
            .field("parents", &self.parents.len())
            .field("children", &self.child_count())
            .field("stale", &self.is_stale())
            .finish()
    }
}
