//! The dependency tracker handed to derived computations.

use std::rc::Rc;

use crate::atom::{Action, ActionQueue, AnyAtom, Atom, AtomNode, Derived};
use crate::cache::CacheEntry;
use crate::ctx::CtxInner;
use crate::error::AtomError;

/// Tracker passed to derived computations.
///
/// Every graph read a computation performs goes through its `Spy`. A read
/// first brings the target up to date (recursively recomputing it if it is
/// stale), then records it as a dependency of the running computation, in
/// first-read order with repeats collapsed. The recorded set replaces the
/// node's previous dependencies wholesale, so a conditional branch that
/// stops reading something really drops the edge.
pub struct Spy<'a> {
    pub(crate) ctx: &'a CtxInner,
    pub(crate) reader: AnyAtom,
    pub(crate) parents: Vec<Rc<CacheEntry>>,
}

impl Spy<'_> {
    /// Read a node, recording it as a dependency of the current
    /// computation.
    ///
    /// Sources and derived nodes yield their current value; actions yield
    /// the payloads queued in the open transaction (empty outside one).
    pub fn get<S: Spyable>(&mut self, node: &S) -> Result<S::Output, AtomError> {
        let entry = self.track(node.as_any())?;
        Ok(S::resolve(&entry))
    }

    fn track(&mut self, atom: &AnyAtom) -> Result<Rc<CacheEntry>, AtomError> {
        let entry = self.ctx.actualize(atom)?;
        if self.parents.iter().any(|p| p.atom().id() == atom.id()) {
            return Ok(entry);
        }
        entry.add_child(self.reader.id());
        if self.ctx.is_connected(self.reader.id()) {
            self.ctx.connect(atom);
        }
        self.parents.push(entry.clone());
        Ok(entry)
    }
}

/// Node handles readable through a [`Spy`] or [`crate::Ctx::get`].
pub trait Spyable: AtomNode {
    /// What a read of this node yields.
    type Output;

    /// Extract the typed output from a fresh cache entry.
    fn resolve(entry: &Rc<CacheEntry>) -> Self::Output;
}

impl<T: 'static> Spyable for Atom<T> {
    type Output = Rc<T>;

    fn resolve(entry: &Rc<CacheEntry>) -> Rc<T> {
        entry.value::<T>().expect("source entry holds the handle's value type")
    }
}

impl<T: 'static> Spyable for Derived<T> {
    type Output = Rc<T>;

    fn resolve(entry: &Rc<CacheEntry>) -> Rc<T> {
        entry.value::<T>().expect("derived entry holds the computation's output type")
    }
}

impl<T: 'static> Spyable for Action<T> {
    type Output = Vec<Rc<T>>;

    fn resolve(entry: &Rc<CacheEntry>) -> Vec<Rc<T>> {
        let queue = entry.value::<ActionQueue>().expect("action entry holds a payload queue");
        queue
            .payloads
            .iter()
            .map(|payload| {
                payload.clone().downcast::<T>().expect("payload type fixed by the handle")
            })
            .collect()
    }
}
