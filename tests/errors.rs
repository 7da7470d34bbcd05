use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use atom_flow::{Atom, AtomError, Ctx, Derived};

#[derive(Debug)]
struct Unavailable(&'static str);

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unavailable: {}", self.0)
    }
}

impl std::error::Error for Unavailable {}

// ==== cycles ==============================================================

#[test]
fn two_node_cycle_reports_the_path() {
    let ctx = Ctx::new();
    let b_cell: Rc<RefCell<Option<Derived<i32>>>> = Rc::default();
    let a = Derived::named(
        {
            let b_cell = b_cell.clone();
            move |spy| {
                let b = b_cell.borrow().clone().expect("registered before first read");
                Ok(*spy.get(&b)? + 1)
            }
        },
        "a",
    );
    let b = Derived::named(
        {
            let a = a.clone();
            move |spy| Ok(*spy.get(&a)? + 1)
        },
        "b",
    );
    *b_cell.borrow_mut() = Some(b);

    let err = ctx.get(&a).unwrap_err();
    assert!(err.is_cycle());
    assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    assert!(ctx.read(&a).is_none());
}

#[test]
fn cyclic_subscription_fails_without_registering() {
    let ctx = Ctx::new();
    let cell: Rc<RefCell<Option<Derived<i32>>>> = Rc::default();
    let loopy = Derived::named(
        {
            let cell = cell.clone();
            move |spy| {
                let me = cell.borrow().clone().expect("registered before first read");
                Ok(*spy.get(&me)?)
            }
        },
        "loopy",
    );
    *cell.borrow_mut() = Some(loopy.clone());

    let calls = Rc::new(RefCell::new(0));
    let counted = calls.clone();
    assert!(ctx.subscribe(&loopy, move |_| *counted.borrow_mut() += 1).is_err());
    assert_eq!(*calls.borrow(), 0);

    // The environment stays usable for healthy nodes.
    let a = Atom::new(1_i32);
    let _sub = ctx.subscribe(&a, |_| {}).unwrap();
}

// ==== propagation failures ================================================

#[test]
fn propagation_failure_surfaces_from_the_write() {
    let ctx = Ctx::new();
    let a = Atom::new(1_i32);
    let fussy = {
        let a = a.clone();
        Derived::new(move |spy| {
            let v = *spy.get(&a)?;
            if v > 1 {
                return Err(Unavailable("threshold exceeded").into());
            }
            Ok(v)
        })
    };
    let seen: Rc<RefCell<Vec<i32>>> = Rc::default();
    let sink = seen.clone();
    let _sub = ctx.subscribe(&fussy, move |v| sink.borrow_mut().push(*v)).unwrap();
    assert_eq!(*seen.borrow(), vec![1]);

    let err = ctx.set(&a, 2).unwrap_err();
    assert_eq!(err.downcast_ref::<Unavailable>().unwrap().0, "threshold exceeded");

    // The subscriber kept the last good value and was not notified.
    assert_eq!(*seen.borrow(), vec![1]);
    let entry = ctx.read(&fussy).unwrap();
    assert_eq!(*entry.value::<i32>().unwrap(), 1);
    assert!(entry.is_stale());

    // A healthy write recovers the whole chain.
    ctx.set(&a, 0).unwrap();
    assert_eq!(*seen.borrow(), vec![1, 0]);
    assert_eq!(*ctx.get(&fussy).unwrap(), 0);
}

#[test]
fn failure_in_one_branch_spares_the_other() {
    let ctx = Ctx::new();
    let a = Atom::new(0_i32);
    let bad = {
        let a = a.clone();
        Derived::named(
            move |spy| {
                let v = *spy.get(&a)?;
                if v > 0 {
                    return Err(anyhow::anyhow!("branch down").into());
                }
                Ok(v)
            },
            "bad",
        )
    };
    let good = {
        let a = a.clone();
        Derived::named(move |spy| Ok(*spy.get(&a)? + 100), "good")
    };
    let seen: Rc<RefCell<Vec<i32>>> = Rc::default();
    let sink = seen.clone();
    let _bad_sub = ctx.subscribe(&bad, |_| {}).unwrap();
    let _good_sub = ctx.subscribe(&good, move |v| sink.borrow_mut().push(*v)).unwrap();
    assert_eq!(*seen.borrow(), vec![100]);

    assert!(ctx.set(&a, 1).is_err());

    // The branch order put `bad` first, so `good` never recomputed in
    // that pass; its next read catches it up.
    assert_eq!(*ctx.get(&good).unwrap(), 101);
}

// ==== scope guards ========================================================

#[test]
fn computations_may_not_mutate_the_environment() {
    let ctx = Ctx::new();
    let victim = Atom::new(0_i32);

    let runs_tx = {
        let ctx = ctx.clone();
        Derived::new(move |_| {
            ctx.run(|| Ok(()))?;
            Ok(0_i32)
        })
    };
    let err = ctx.get(&runs_tx).unwrap_err();
    assert!(matches!(err, AtomError::Scope { operation: "run" }));
    assert_eq!(err.to_string(), "`run` called during an active computation");

    let subscribes = {
        let ctx = ctx.clone();
        let victim = victim.clone();
        Derived::new(move |_| {
            let _sub = ctx.subscribe(&victim, |_| {})?;
            Ok(0_i32)
        })
    };
    let err = ctx.get(&subscribes).unwrap_err();
    assert!(matches!(err, AtomError::Scope { operation: "subscribe" }));

    let updates = {
        let ctx = ctx.clone();
        let victim = victim.clone();
        Derived::new(move |_| {
            ctx.update(&victim, |n| n + 1)?;
            Ok(0_i32)
        })
    };
    let err = ctx.get(&updates).unwrap_err();
    assert!(matches!(err, AtomError::Scope { operation: "update" }));
    assert_eq!(*ctx.get(&victim).unwrap(), 0);
}
