//! Execution environments: cache ownership, transactions, propagation, and
//! subscriptions.

use std::cell::{Cell, RefCell};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use indexmap::IndexSet;
use slab::Slab;

use crate::atom::{Action, ActionQueue, AnyAtom, Atom, AtomId, AtomKind, AtomNode, Derived};
use crate::cache::{CacheEntry, Cause, ChildSet, Version};
use crate::error::AtomError;
use crate::scheduler::{EffectScheduler, Immediate};
use crate::spy::{Spy, Spyable};

/// An execution environment: the owner of one cache over the node graph.
///
/// Descriptors carry no state, so the same atoms can be evaluated in any
/// number of environments at once; each `Ctx` tracks its own values,
/// versions, dependency edges, and subscriptions.
///
/// This is cheap to clone; clones share one environment.
///
/// ```
/// use atom_flow::{Atom, Ctx};
///
/// let a = Atom::new(1_i32);
/// let ctx = Ctx::new();
/// ctx.run(|| {
///     ctx.set(&a, 2)?;
///     ctx.set(&a, 3)?;
///     Ok(())
/// })
/// .unwrap();
/// assert_eq!(*ctx.get(&a).unwrap(), 3);
/// ```
#[derive(Clone)]
pub struct Ctx {
    inner: Rc<CtxInner>,
}

impl Ctx {
    /// Create an environment with the default immediate scheduler.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start building an environment.
    pub fn builder() -> CtxBuilder {
        CtxBuilder::new()
    }

    /// Write a new value to a source node.
    ///
    /// The write applies immediately; dependents recompute and subscribers
    /// are notified when the enclosing transaction commits (at once, if
    /// there is none). Writing a value equal to the current one is a no-op.
    pub fn set<T: 'static>(&self, atom: &Atom<T>, value: T) -> Result<(), AtomError> {
        self.inner.reject_in_computation("set")?;
        self.inner.enter();
        self.inner.write_source(atom.as_any(), Rc::new(value));
        self.inner.exit_ok()
    }

    /// Write a source node through a function of its current value.
    pub fn update<T: 'static>(
        &self,
        atom: &Atom<T>,
        f: impl FnOnce(&T) -> T,
    ) -> Result<(), AtomError> {
        self.inner.reject_in_computation("update")?;
        self.inner.enter();
        let current: Rc<T> = match self.inner.entry(atom.id()) {
            Some(entry) => {
                entry.value::<T>().expect("source entry holds the handle's value type")
            }
            None => match atom.as_any().kind() {
                AtomKind::Source { init, .. } => init
                    .clone()
                    .downcast::<T>()
                    .ok()
                    .expect("source seed holds the handle's value type"),
                _ => unreachable!("source handles always carry a source descriptor"),
            },
        };
        self.inner.write_source(atom.as_any(), Rc::new(f(&current)));
        self.inner.exit_ok()
    }

    /// Append a payload to an action's queue.
    ///
    /// Computations reading the action during the same transaction see
    /// every payload queued so far; at commit the queue clears without
    /// waking dependents again.
    pub fn dispatch<T: 'static>(&self, action: &Action<T>, payload: T) -> Result<(), AtomError> {
        self.inner.reject_in_computation("dispatch")?;
        self.inner.enter();
        self.inner.dispatch_payload(action.as_any(), Rc::new(payload));
        self.inner.exit_ok()
    }

    /// Run `body` inside a transaction.
    ///
    /// Writes made by the body apply immediately and reads observe them,
    /// but recomputation of dependents and all deliveries (subscriber
    /// notifications, lifecycle hooks, transaction logs) happen once, when
    /// the outermost transaction exits. A body that returns an error
    /// commits nothing: values already written remain, and the
    /// notification pass does not happen.
    pub fn run<R>(&self, body: impl FnOnce() -> Result<R, AtomError>) -> Result<R, AtomError> {
        self.inner.reject_in_computation("run")?;
        self.inner.enter();
        match body() {
            Ok(value) => self.inner.exit_ok().map(|()| value),
            Err(err) => {
                self.inner.exit_err();
                Err(err)
            }
        }
    }

    /// Read a node's current value, forcing it up to date.
    ///
    /// This does not subscribe: a node read this way stays disconnected
    /// and its entry is left stale, to be revalidated on the next read.
    pub fn get<S: Spyable>(&self, node: &S) -> Result<S::Output, AtomError> {
        self.inner.enter();
        match self.inner.actualize(node.as_any()) {
            Ok(entry) => self.inner.exit_ok().map(|()| S::resolve(&entry)),
            Err(err) => {
                self.inner.exit_err();
                Err(err)
            }
        }
    }

    /// Subscribe to a node's value.
    ///
    /// The node is brought up to date and connected, firing `on_connect`
    /// hooks dependencies-first for every node that becomes observed, and
    /// the listener is invoked synchronously once with the current value.
    /// After that the listener runs through the environment's scheduler,
    /// at most once per batch, with the value current at delivery time.
    ///
    /// Listeners registered first are notified first, across all nodes.
    pub fn subscribe<O, F>(&self, node: &O, listener: F) -> Result<Subscription, AtomError>
    where
        O: Observable,
        F: Fn(&O::Value) + 'static,
    {
        self.inner.reject_in_computation("subscribe")?;
        let atom = node.as_any().clone();
        // The commit drain and the initial call after subscribing can see
        // the same entry; each version is delivered once.
        let delivered = Cell::new(None::<Version>);
        let notify: Rc<dyn Fn(&Rc<CacheEntry>)> = Rc::new(move |entry| {
            if delivered.get() == Some(entry.version()) {
                return;
            }
            delivered.set(Some(entry.version()));
            if let Some(value) = entry.value::<O::Value>() {
                listener(&value);
            }
        });

        self.inner.enter();
        let sub = match self.inner.actualize(&atom) {
            Ok(_) => {
                self.inner.connect(&atom);
                self.inner.add_listener(atom.id(), notify.clone())
            }
            Err(err) => {
                self.inner.exit_err();
                return Err(err);
            }
        };
        if let Err(err) = self.inner.exit_ok() {
            self.inner.remove_listener(atom.id(), sub);
            return Err(err);
        }

        if let Some(entry) = self.inner.entry(atom.id()) {
            notify(&entry);
        }
        Ok(Subscription { ctx: Rc::downgrade(&self.inner), atom, id: sub })
    }

    /// The node's current cache entry, if it has ever been touched here.
    ///
    /// Purely observational: nothing is computed, validated, or connected.
    pub fn read<N: AtomNode>(&self, node: &N) -> Option<Rc<CacheEntry>> {
        self.inner.entry(node.as_any().id())
    }

    /// Register a transaction log listener.
    ///
    /// After every committed transaction that produced entries, the
    /// listener receives each cache entry the pass created, in creation
    /// order. Every entry carries its [`Cause`].
    pub fn log(&self, listener: impl Fn(&[Rc<CacheEntry>]) + 'static) -> LogHandle {
        let key = self.inner.log_subs.borrow_mut().insert(Rc::new(listener));
        LogHandle { ctx: Rc::downgrade(&self.inner), key }
    }

    /// Drop the cached state of a disconnected node.
    ///
    /// Returns `false` (and does nothing) if the node is connected or has
    /// listeners, or if it has no cached state here. A dependent that
    /// still records the dropped entry simply recomputes on its next
    /// validation.
    pub fn prune<N: AtomNode>(&self, node: &N) -> bool {
        let id = node.as_any().id();
        let mut slots = self.inner.slots.borrow_mut();
        match slots.get(&id) {
            Some(slot) if !slot.connected && slot.listeners.is_empty() => {
                slots.remove(&id);
                true
            }
            _ => false,
        }
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`Ctx`].
pub struct CtxBuilder {
    scheduler: Box<dyn EffectScheduler>,
}

impl CtxBuilder {
    /// Start with the default immediate scheduler.
    pub fn new() -> Self {
        CtxBuilder { scheduler: Box::new(Immediate) }
    }

    /// Inject the scheduler that runs subscriber notification batches.
    ///
    /// The environment never hands over a second batch while one is
    /// outstanding, so any number of commits between drains collapse into
    /// one delivery per listener, carrying the value current at drain
    /// time.
    pub fn late_effects(mut self, scheduler: impl EffectScheduler + 'static) -> Self {
        self.scheduler = Box::new(scheduler);
        self
    }

    /// Build the environment.
    pub fn build(self) -> Ctx {
        let scheduler = self.scheduler;
        Ctx {
            inner: Rc::new_cyclic(|weak| CtxInner {
                slots: RefCell::new(HashMap::default()),
                next_version: Cell::new(1),
                next_sub: Cell::new(0),
                depth: Cell::new(0),
                committing: Cell::new(false),
                tx: RefCell::new(TxState::default()),
                stack: RefCell::new(Vec::new()),
                log_subs: RefCell::new(Slab::new()),
                dirty_subs: RefCell::new(IndexSet::default()),
                drain_scheduled: Cell::new(false),
                scheduler,
                weak: weak.clone(),
            }),
        }
    }
}

impl Default for CtxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Value-bearing nodes that subscriptions can observe.
pub trait Observable: AtomNode {
    /// The observed value type.
    type Value: 'static;
}

impl<T: 'static> Observable for Atom<T> {
    type Value = T;
}

impl<T: 'static> Observable for Derived<T> {
    type Value = T;
}

/// An active subscription returned by [`Ctx::subscribe`].
///
/// Dropping the handle keeps the subscription active; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "dropping the handle keeps the subscription active"]
pub struct Subscription {
    ctx: Weak<CtxInner>,
    atom: AnyAtom,
    id: u64,
}

impl Subscription {
    /// The node this subscription observes.
    pub fn atom(&self) -> &AnyAtom {
        &self.atom
    }

    /// Remove the listener.
    ///
    /// If this was the last thing observing the node, the node and every
    /// dependency observed only through it disconnect: cleanup hooks fire
    /// dependents-first, and the affected entries are replaced by stale
    /// copies so later reads revalidate them.
    pub fn unsubscribe(self) {
        let Some(inner) = self.ctx.upgrade() else { return };
        inner.remove_listener(self.atom.id(), self.id);
        inner.enter();
        inner.maybe_disconnect(&self.atom);
        let _ = inner.exit_ok();
    }
}

/// Detach capability returned by [`Ctx::log`].
#[must_use = "dropping the handle keeps the log listener active"]
pub struct LogHandle {
    ctx: Weak<CtxInner>,
    key: usize,
}

impl LogHandle {
    /// Remove the log listener.
    pub fn detach(self) {
        if let Some(inner) = self.ctx.upgrade() {
            let _ = inner.log_subs.borrow_mut().try_remove(self.key);
        }
    }
}

struct Slot {
    entry: Rc<CacheEntry>,
    listeners: Vec<Listener>,
    connected: bool,
}

struct Listener {
    id: u64,
    notify: Rc<dyn Fn(&Rc<CacheEntry>)>,
}

#[derive(Default)]
struct TxState {
    /// Nodes stale-marked by writes in the open transaction, in the order
    /// they were first reached.
    touched: IndexSet<AtomId, ahash::RandomState>,
    /// Action nodes holding payloads, cleared at commit.
    actions: IndexSet<AtomId, ahash::RandomState>,
    /// Every cache entry produced during the transaction.
    patches: Vec<Rc<CacheEntry>>,
    /// Lifecycle events queued during the transaction, fired post-commit.
    hooks: Vec<HookEvent>,
}

enum HookEvent {
    Connect(AnyAtom),
    Cleanup(AnyAtom),
    Update(AnyAtom, Rc<CacheEntry>),
}

pub(crate) struct CtxInner {
    slots: RefCell<HashMap<AtomId, Slot, ahash::RandomState>>,
    next_version: Cell<u64>,
    next_sub: Cell<u64>,
    /// Open transaction depth; a commit runs when it returns to zero.
    depth: Cell<usize>,
    committing: Cell<bool>,
    tx: RefCell<TxState>,
    /// Nodes with a computation in progress, outermost first.
    stack: RefCell<Vec<AnyAtom>>,
    log_subs: RefCell<Slab<Rc<dyn Fn(&[Rc<CacheEntry>])>>>,
    /// Subscribed nodes with changes not yet delivered.
    dirty_subs: RefCell<IndexSet<AtomId, ahash::RandomState>>,
    drain_scheduled: Cell<bool>,
    scheduler: Box<dyn EffectScheduler>,
    weak: Weak<CtxInner>,
}

impl CtxInner {
    fn version_bump(&self) -> Version {
        let version = self.next_version.get();
        self.next_version.set(version + 1);
        Version(version)
    }

    fn entry(&self, id: AtomId) -> Option<Rc<CacheEntry>> {
        self.slots.borrow().get(&id).map(|slot| slot.entry.clone())
    }

    pub(crate) fn is_connected(&self, id: AtomId) -> bool {
        self.slots.borrow().get(&id).map(|slot| slot.connected).unwrap_or(false)
    }

    fn reject_in_computation(&self, operation: &'static str) -> Result<(), AtomError> {
        if self.stack.borrow().is_empty() {
            Ok(())
        } else {
            Err(AtomError::Scope { operation })
        }
    }

    fn handle(&self) -> Ctx {
        Ctx { inner: self.weak.upgrade().expect("environment outlives its commits") }
    }

    // ---- transactions ----

    fn enter(&self) {
        self.depth.set(self.depth.get() + 1);
    }

    fn exit_ok(&self) -> Result<(), AtomError> {
        let depth = self.depth.get() - 1;
        self.depth.set(depth);
        if depth == 0 && !self.committing.get() {
            self.commit()
        } else {
            Ok(())
        }
    }

    fn exit_err(&self) {
        let depth = self.depth.get() - 1;
        self.depth.set(depth);
        if depth == 0 && !self.committing.get() {
            let state = std::mem::take(&mut *self.tx.borrow_mut());
            self.reset_actions(&state.actions);
        }
    }

    fn commit(&self) -> Result<(), AtomError> {
        self.committing.set(true);
        let touched: Vec<AtomId> = self.tx.borrow().touched.iter().copied().collect();
        let result = self.propagate(&touched);
        let state = std::mem::take(&mut *self.tx.borrow_mut());
        self.committing.set(false);
        // Queues clear whichever way the pass ended; payloads from an
        // aborted transaction must not resurface in the next one.
        self.reset_actions(&state.actions);
        match result {
            Ok(()) => {
                self.fire_hooks(state.hooks);
                self.deliver_log(&state.patches);
                self.schedule_notifications();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Recompute the connected part of the touched subgraph, each node at
    /// most once, dependencies before dependents. Disconnected nodes stay
    /// stale-marked for lazy revalidation.
    fn propagate(&self, touched: &[AtomId]) -> Result<(), AtomError> {
        if touched.is_empty() {
            return Ok(());
        }
        let touched_set: IndexSet<AtomId, ahash::RandomState> =
            touched.iter().copied().collect();

        // Edges among touched nodes, snapshotted before any recomputation.
        let mut pending: HashMap<AtomId, usize, ahash::RandomState> = HashMap::default();
        let mut released: HashMap<AtomId, Vec<AtomId>, ahash::RandomState> = HashMap::default();
        for &id in touched {
            let Some(entry) = self.entry(id) else { continue };
            let mut count = 0;
            for parent in entry.parents() {
                let pid = parent.atom().id();
                if touched_set.contains(&pid) {
                    count += 1;
                    released.entry(pid).or_default().push(id);
                }
            }
            pending.insert(id, count);
        }

        let mut ready: VecDeque<AtomId> = touched
            .iter()
            .copied()
            .filter(|id| pending.get(id).copied().unwrap_or(0) == 0)
            .collect();

        while let Some(id) = ready.pop_front() {
            if let Some(entry) = self.entry(id) {
                if self.is_connected(id) {
                    let atom = entry.atom().clone();
                    self.actualize(&atom)?;
                }
            }
            if let Some(children) = released.get(&id) {
                for &child in children {
                    if let Some(count) = pending.get_mut(&child) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push_back(child);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ---- evaluation ----

    /// Bring a node's entry up to date and return it.
    ///
    /// Sources and actions are seeded on first use and authoritative after
    /// that. A stale derived entry is validated against the recorded
    /// versions of its dependencies and recomputed only when one of them
    /// actually changed.
    pub(crate) fn actualize(&self, atom: &AnyAtom) -> Result<Rc<CacheEntry>, AtomError> {
        if self.stack.borrow().iter().any(|a| a.id() == atom.id()) {
            let mut path: Vec<String> =
                self.stack.borrow().iter().map(AnyAtom::display_name).collect();
            path.push(atom.display_name());
            return Err(AtomError::Cycle { path });
        }

        let existing = self.entry(atom.id());
        if let Some(entry) = &existing {
            if !entry.is_stale() {
                return Ok(entry.clone());
            }
        }
        match atom.kind() {
            // A source's value is authoritative; staleness only records
            // disconnection.
            AtomKind::Source { init, .. } => match existing {
                Some(entry) => Ok(entry),
                None => Ok(self.seed(atom, init.clone())),
            },
            AtomKind::Action => match existing {
                Some(entry) => Ok(entry),
                None => Ok(self.seed(atom, Rc::new(ActionQueue::default()))),
            },
            AtomKind::Computed { .. } => match existing {
                None => self.recompute(atom, None, Cause::Pull),
                Some(old) => match self.find_changed_parent(&old)? {
                    None => {
                        if self.is_connected(atom.id()) {
                            old.set_stale(false);
                        }
                        Ok(old)
                    }
                    Some(parent) => self.recompute(atom, Some(&old), Cause::Parent(parent)),
                },
            },
        }
    }

    fn seed(&self, atom: &AnyAtom, value: Rc<dyn std::any::Any>) -> Rc<CacheEntry> {
        let entry = Rc::new(CacheEntry::new(
            atom.clone(),
            self.version_bump(),
            value,
            Cause::Pull,
            Vec::new(),
            ChildSet::default(),
            !self.is_connected(atom.id()),
        ));
        self.insert_entry(entry.clone());
        self.record_patch(entry.clone());
        entry
    }

    fn find_changed_parent(
        &self,
        old: &Rc<CacheEntry>,
    ) -> Result<Option<Rc<CacheEntry>>, AtomError> {
        for recorded in old.parents() {
            let current = self.actualize(recorded.atom())?;
            if current.version() != recorded.version() {
                return Ok(Some(current));
            }
        }
        Ok(None)
    }

    fn recompute(
        &self,
        atom: &AnyAtom,
        old: Option<&Rc<CacheEntry>>,
        cause: Cause,
    ) -> Result<Rc<CacheEntry>, AtomError> {
        let AtomKind::Computed { compute, eq } = atom.kind() else {
            unreachable!("only derived nodes recompute")
        };

        self.stack.borrow_mut().push(atom.clone());
        let mut spy = Spy { ctx: self, reader: atom.clone(), parents: Vec::new() };
        let result = compute(&mut spy);
        let parents = spy.parents;
        self.stack.borrow_mut().pop();

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                // Drop the edges the failed attempt recorded, unless the
                // old entry records them too.
                for parent in &parents {
                    let kept = old
                        .map(|o| {
                            o.parents().iter().any(|p| p.atom().id() == parent.atom().id())
                        })
                        .unwrap_or(false);
                    if !kept {
                        parent.remove_child(atom.id());
                        self.maybe_disconnect(parent.atom());
                    }
                }
                return Err(err);
            }
        };

        let unchanged = match old {
            Some(old) => eq(old.raw_value().as_ref(), value.as_ref()),
            None => false,
        };
        let version = match (unchanged, old) {
            (true, Some(old)) => old.version(),
            _ => self.version_bump(),
        };
        let children = old.map(|o| o.children_snapshot()).unwrap_or_default();
        let connected = self.is_connected(atom.id());
        let entry = Rc::new(CacheEntry::new(
            atom.clone(),
            version,
            value,
            cause,
            parents,
            children,
            !connected,
        ));
        self.insert_entry(entry.clone());
        self.record_patch(entry.clone());

        if let Some(old) = old {
            for previous in old.parents() {
                let kept =
                    entry.parents().iter().any(|p| p.atom().id() == previous.atom().id());
                if !kept {
                    if let Some(current) = self.entry(previous.atom().id()) {
                        current.remove_child(atom.id());
                    }
                    self.maybe_disconnect(previous.atom());
                }
            }
        }

        if !unchanged {
            self.queue_update(atom, &entry);
            // A first computation seeds the node; there is no earlier
            // delivery for subscribers to catch up from.
            if old.is_some() {
                self.mark_dirty(atom.id());
            }
        }
        Ok(entry)
    }

    // ---- writes ----

    fn write_source(&self, atom: &AnyAtom, value: Rc<dyn std::any::Any>) {
        let AtomKind::Source { eq, .. } = atom.kind() else {
            unreachable!("source handles always carry a source descriptor")
        };
        let old = self.entry(atom.id());
        if let Some(old) = &old {
            if eq(old.raw_value().as_ref(), value.as_ref()) {
                return;
            }
        }
        let children = old.as_ref().map(|o| o.children_snapshot()).unwrap_or_default();
        let connected = self.is_connected(atom.id());
        let entry = Rc::new(CacheEntry::new(
            atom.clone(),
            self.version_bump(),
            value,
            Cause::Write,
            Vec::new(),
            children,
            !connected,
        ));
        self.insert_entry(entry.clone());
        self.record_patch(entry.clone());
        self.queue_update(atom, &entry);
        self.mark_dirty(atom.id());
        self.mark_children_stale(&entry);
    }

    fn dispatch_payload(&self, atom: &AnyAtom, payload: Rc<dyn std::any::Any>) {
        let old = self.entry(atom.id());
        let mut payloads = match &old {
            Some(entry) => entry
                .value::<ActionQueue>()
                .expect("action entry holds a payload queue")
                .payloads
                .clone(),
            None => Vec::new(),
        };
        payloads.push(payload);
        let children = old.as_ref().map(|o| o.children_snapshot()).unwrap_or_default();
        let connected = self.is_connected(atom.id());
        let entry = Rc::new(CacheEntry::new(
            atom.clone(),
            self.version_bump(),
            Rc::new(ActionQueue { payloads }),
            Cause::Dispatch,
            Vec::new(),
            children,
            !connected,
        ));
        self.insert_entry(entry.clone());
        self.record_patch(entry.clone());
        self.tx.borrow_mut().actions.insert(atom.id());
        self.queue_update(atom, &entry);
        self.mark_dirty(atom.id());
        self.mark_children_stale(&entry);
    }

    /// Eagerly stale-mark the dependents of a changed node, recording the
    /// order they were first reached for the commit pass. The walk prunes
    /// at nodes it already staled in this transaction; a node refreshed
    /// since then has a clear stale flag and is walked again in full.
    /// Stale marks can outlive an aborted transaction, so staleness alone
    /// is not proof the dependents below were reached.
    fn mark_children_stale(&self, entry: &Rc<CacheEntry>) {
        for child in entry.children() {
            self.stale_walk(child);
        }
    }

    fn stale_walk(&self, id: AtomId) {
        let Some(entry) = self.entry(id) else { return };
        let first_reach = self.touch(id);
        if entry.is_stale() && !first_reach {
            return;
        }
        entry.set_stale(true);
        for child in entry.children() {
            self.stale_walk(child);
        }
    }

    /// Record a node in the open transaction's touched set. Returns whether
    /// this was the first reach in this transaction.
    fn touch(&self, id: AtomId) -> bool {
        self.tx.borrow_mut().touched.insert(id)
    }

    fn reset_actions(&self, actions: &IndexSet<AtomId, ahash::RandomState>) {
        for &id in actions {
            let Some(entry) = self.entry(id) else { continue };
            match entry.value::<ActionQueue>() {
                Some(queue) if !queue.payloads.is_empty() => {}
                _ => continue,
            }
            // Same version on purpose: clearing the queue must not wake
            // dependents.
            let cleared = Rc::new(CacheEntry::new(
                entry.atom().clone(),
                entry.version(),
                Rc::new(ActionQueue::default()),
                entry.cause().clone(),
                Vec::new(),
                entry.children_snapshot(),
                entry.is_stale(),
            ));
            self.insert_entry(cleared);
        }
    }

    // ---- connection lifecycle ----

    /// Mark a node observed, cascading through its recorded dependencies.
    /// Recursion queues dependency hooks before the node's own, so connect
    /// hooks fire dependencies-first.
    pub(crate) fn connect(&self, atom: &AnyAtom) {
        if self.is_connected(atom.id()) {
            return;
        }
        {
            let mut slots = self.slots.borrow_mut();
            let Some(slot) = slots.get_mut(&atom.id()) else { return };
            slot.connected = true;
        }
        if let Some(entry) = self.entry(atom.id()) {
            for parent in entry.parents() {
                self.connect(parent.atom());
            }
            entry.set_stale(false);
        }
        self.queue_hook(HookEvent::Connect(atom.clone()));
    }

    /// Disconnect a node that lost its last observer, cascading through
    /// dependencies that were only observed through it. Each disconnected
    /// entry is replaced by a stale copy, and cleanup hooks queue
    /// dependents-first.
    fn maybe_disconnect(&self, atom: &AnyAtom) {
        if !self.is_connected(atom.id()) || self.observed(atom.id()) {
            return;
        }
        {
            let mut slots = self.slots.borrow_mut();
            if let Some(slot) = slots.get_mut(&atom.id()) {
                slot.connected = false;
            }
        }
        let Some(entry) = self.entry(atom.id()) else { return };
        self.insert_entry(Rc::new(entry.detached()));
        self.queue_hook(HookEvent::Cleanup(atom.clone()));
        for parent in entry.parents() {
            if let Some(current) = self.entry(parent.atom().id()) {
                current.remove_child(atom.id());
            }
            self.maybe_disconnect(parent.atom());
        }
    }

    fn observed(&self, id: AtomId) -> bool {
        let slots = self.slots.borrow();
        let Some(slot) = slots.get(&id) else { return false };
        if !slot.listeners.is_empty() {
            return true;
        }
        slot.entry
            .children()
            .iter()
            .any(|child| slots.get(child).map(|s| s.connected).unwrap_or(false))
    }

    // ---- bookkeeping ----

    fn insert_entry(&self, entry: Rc<CacheEntry>) {
        let mut slots = self.slots.borrow_mut();
        match slots.entry(entry.atom().id()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().entry = entry;
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot { entry, listeners: Vec::new(), connected: false });
            }
        }
    }

    fn record_patch(&self, entry: Rc<CacheEntry>) {
        self.tx.borrow_mut().patches.push(entry);
    }

    fn queue_hook(&self, event: HookEvent) {
        self.tx.borrow_mut().hooks.push(event);
    }

    fn queue_update(&self, atom: &AnyAtom, entry: &Rc<CacheEntry>) {
        if atom.update_hooks().is_empty() {
            return;
        }
        self.queue_hook(HookEvent::Update(atom.clone(), entry.clone()));
    }

    fn mark_dirty(&self, id: AtomId) {
        self.dirty_subs.borrow_mut().insert(id);
    }

    fn add_listener(&self, id: AtomId, notify: Rc<dyn Fn(&Rc<CacheEntry>)>) -> u64 {
        let sub = self.next_sub.get();
        self.next_sub.set(sub + 1);
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(&id).expect("subscribed node has a cache entry");
        slot.listeners.push(Listener { id: sub, notify });
        sub
    }

    fn remove_listener(&self, id: AtomId, sub: u64) {
        let mut slots = self.slots.borrow_mut();
        if let Some(slot) = slots.get_mut(&id) {
            slot.listeners.retain(|listener| listener.id != sub);
        }
    }

    // ---- deliveries ----

    fn fire_hooks(&self, events: Vec<HookEvent>) {
        if events.is_empty() {
            return;
        }
        let ctx = self.handle();
        // Several update events for one node collapse into the last, so a
        // hook sees one call per commit, carrying the final entry.
        let mut latest: HashMap<AtomId, usize, ahash::RandomState> = HashMap::default();
        for (index, event) in events.iter().enumerate() {
            if let HookEvent::Update(atom, _) = event {
                latest.insert(atom.id(), index);
            }
        }
        for (index, event) in events.into_iter().enumerate() {
            match event {
                HookEvent::Connect(atom) => {
                    for hook in atom.connect_hooks() {
                        hook(&ctx);
                    }
                }
                HookEvent::Cleanup(atom) => {
                    for hook in atom.cleanup_hooks() {
                        hook(&ctx);
                    }
                }
                HookEvent::Update(atom, entry) => {
                    if latest.get(&atom.id()) == Some(&index) {
                        for hook in atom.update_hooks() {
                            hook(&ctx, &entry);
                        }
                    }
                }
            }
        }
    }

    fn deliver_log(&self, patches: &[Rc<CacheEntry>]) {
        if patches.is_empty() {
            return;
        }
        let listeners: Vec<Rc<dyn Fn(&[Rc<CacheEntry>])>> =
            self.log_subs.borrow().iter().map(|(_, listener)| listener.clone()).collect();
        for listener in listeners {
            listener(patches);
        }
    }

    fn schedule_notifications(&self) {
        if self.dirty_subs.borrow().is_empty() || self.drain_scheduled.get() {
            return;
        }
        self.drain_scheduled.set(true);
        let weak = self.weak.clone();
        self.scheduler.schedule(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.drain_notifications();
            }
        }));
    }

    /// Deliver pending subscriber notifications, reading each node's entry
    /// at delivery time. Listeners run in registration order.
    fn drain_notifications(&self) {
        self.drain_scheduled.set(false);
        let dirty: Vec<AtomId> = self.dirty_subs.borrow_mut().drain(..).collect();
        let mut due: Vec<(u64, AtomId, Rc<dyn Fn(&Rc<CacheEntry>)>)> = Vec::new();
        {
            let slots = self.slots.borrow();
            for id in dirty {
                let Some(slot) = slots.get(&id) else { continue };
                for listener in &slot.listeners {
                    due.push((listener.id, id, listener.notify.clone()));
                }
            }
        }
        due.sort_by_key(|(id, _, _)| *id);
        for (_, id, notify) in due {
            if let Some(entry) = self.entry(id) {
                notify(&entry);
            }
        }
    }
}
