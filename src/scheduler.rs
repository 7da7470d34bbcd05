//! Deferred invocation of subscriber notifications.
//!
//! Writes are synchronous, but the moment subscriber callbacks run is up to
//! the environment's [`EffectScheduler`]. The default scheduler invokes each
//! batch immediately; an event-loop integration can queue batches and drain
//! them later. The environment never schedules a second batch while one is
//! outstanding, and a drain reads current values, so however late it runs it
//! observes only the latest state.

/// A unit of deferred work handed to the scheduler.
pub type LateEffect = Box<dyn FnOnce()>;

/// Deferred-invocation capability used for subscriber notifications.
///
/// Closures implement this trait directly:
///
/// ```ignore
/// let queue: Rc<RefCell<Vec<LateEffect>>> = Default::default();
/// let q = queue.clone();
/// let ctx = Ctx::builder()
///     .late_effects(move |effect| q.borrow_mut().push(effect))
///     .build();
/// // ... later, on the host loop:
/// for effect in queue.borrow_mut().drain(..) {
///     effect();
/// }
/// ```
pub trait EffectScheduler {
    /// Schedule one batch of deferred work.
    fn schedule(&self, effect: LateEffect);
}

impl<F: Fn(LateEffect)> EffectScheduler for F {
    fn schedule(&self, effect: LateEffect) {
        self(effect)
    }
}

/// Default scheduler: runs every batch synchronously, at the end of the
/// commit that produced it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl EffectScheduler for Immediate {
    fn schedule(&self, effect: LateEffect) {
        effect()
    }
}
