use std::cell::{Cell, RefCell};
use std::rc::Rc;

use atom_flow::{Action, Atom, AtomError, Ctx, Derived};

// ==== batching ============================================================

#[test]
fn writes_batch_into_one_pass() {
    let ctx = Ctx::new();
    let first = Atom::named("John".to_owned(), "first");
    let last = Atom::named("Doe".to_owned(), "last");
    let runs = Rc::new(Cell::new(0));
    let full = {
        let first = first.clone();
        let last = last.clone();
        let runs = runs.clone();
        Derived::named(
            move |spy| {
                runs.set(runs.get() + 1);
                Ok(format!("{} {}", spy.get(&first)?, spy.get(&last)?))
            },
            "full",
        )
    };

    let seen: Rc<RefCell<Vec<String>>> = Rc::default();
    let sink = seen.clone();
    let _sub = ctx.subscribe(&full, move |v| sink.borrow_mut().push(v.clone())).unwrap();
    assert_eq!(runs.get(), 1);

    ctx.run(|| {
        ctx.set(&first, "Jane".to_owned())?;
        ctx.set(&last, "Roe".to_owned())?;
        Ok(())
    })
    .unwrap();

    assert_eq!(runs.get(), 2);
    assert_eq!(*seen.borrow(), vec!["John Doe".to_owned(), "Jane Roe".to_owned()]);
}

#[test]
fn reads_inside_a_transaction_observe_writes() {
    let ctx = Ctx::new();
    let a = Atom::new(1_i32);
    let doubled = {
        let a = a.clone();
        Derived::new(move |spy| Ok(*spy.get(&a)? * 2))
    };

    ctx.run(|| {
        ctx.set(&a, 5)?;
        assert_eq!(*ctx.get(&a)?, 5);
        assert_eq!(*ctx.get(&doubled)?, 10);
        Ok(())
    })
    .unwrap();
}

#[test]
fn n_writes_notify_once_with_the_final_value() {
    let ctx = Ctx::new();
    let a = Atom::new(0_i32);
    let seen: Rc<RefCell<Vec<i32>>> = Rc::default();
    let sink = seen.clone();
    let _sub = ctx.subscribe(&a, move |v| sink.borrow_mut().push(*v)).unwrap();

    ctx.run(|| {
        ctx.set(&a, 1)?;
        ctx.set(&a, 2)?;
        ctx.set(&a, 3)?;
        Ok(())
    })
    .unwrap();

    assert_eq!(*seen.borrow(), vec![0, 3]);
}

// ==== action queues =======================================================

#[test]
fn action_reads_see_the_full_queue() {
    let ctx = Ctx::new();
    let push: Action<i32> = Action::named("push");
    let trace: Rc<RefCell<Vec<i32>>> = Rc::default();
    let numbers = {
        let push = push.clone();
        let trace = trace.clone();
        Derived::named(
            move |spy| {
                let queued = spy.get(&push)?;
                for value in &queued {
                    trace.borrow_mut().push(**value);
                }
                Ok(queued.iter().map(|v| **v).sum::<i32>())
            },
            "numbers",
        )
    };
    let _sub = ctx.subscribe(&numbers, |_| {}).unwrap();

    ctx.dispatch(&push, 1).unwrap();
    ctx.dispatch(&push, 2).unwrap();
    ctx.dispatch(&push, 3).unwrap();
    assert_eq!(*trace.borrow(), vec![1, 2, 3]);

    ctx.run(|| {
        ctx.dispatch(&push, 4)?;
        ctx.get(&numbers)?;
        ctx.dispatch(&push, 5)?;
        Ok(())
    })
    .unwrap();

    assert_eq!(*trace.borrow(), vec![1, 2, 3, 4, 4, 5]);
    assert_eq!(*ctx.get(&numbers).unwrap(), 9);
}

#[test]
fn queues_clear_at_commit_without_waking_dependents() {
    let ctx = Ctx::new();
    let push: Action<i32> = Action::new();
    let runs = Rc::new(Cell::new(0));
    let watcher = {
        let push = push.clone();
        let runs = runs.clone();
        Derived::new(move |spy| {
            runs.set(runs.get() + 1);
            Ok(spy.get(&push)?.len())
        })
    };
    let _sub = ctx.subscribe(&watcher, |_| {}).unwrap();
    assert_eq!(runs.get(), 1);

    ctx.dispatch(&push, 7).unwrap();
    let after_dispatch = runs.get();
    assert_eq!(after_dispatch, 2);

    // The queue is visibly empty afterwards, but clearing it kept the
    // version, so the watcher is not recomputed by the reset itself.
    assert!(ctx.get(&push).unwrap().is_empty());
    assert_eq!(runs.get(), after_dispatch);
}

#[test]
fn queue_is_visible_only_inside_the_transaction() {
    let ctx = Ctx::new();
    let hits: Action<&'static str> = Action::new();
    ctx.run(|| {
        ctx.dispatch(&hits, "a")?;
        ctx.dispatch(&hits, "b")?;
        let queued: Vec<&'static str> = ctx.get(&hits)?.iter().map(|v| **v).collect();
        assert_eq!(queued, vec!["a", "b"]);
        Ok(())
    })
    .unwrap();
    assert!(ctx.get(&hits).unwrap().is_empty());
}

// ==== nesting and failure =================================================

#[test]
fn nested_transactions_deliver_at_the_outermost_exit() {
    let ctx = Ctx::new();
    let a = Atom::new(0_i32);
    let b = Atom::new(0_i32);
    let seen: Rc<RefCell<Vec<(char, i32)>>> = Rc::default();
    let sink_a = seen.clone();
    let sink_b = seen.clone();
    let _sa = ctx.subscribe(&a, move |v| sink_a.borrow_mut().push(('a', *v))).unwrap();
    let _sb = ctx.subscribe(&b, move |v| sink_b.borrow_mut().push(('b', *v))).unwrap();
    seen.borrow_mut().clear();

    ctx.run(|| {
        ctx.set(&a, 1)?;
        ctx.run(|| {
            ctx.set(&b, 2)?;
            Ok(())
        })?;
        assert!(seen.borrow().is_empty());
        Ok(())
    })
    .unwrap();

    assert_eq!(*seen.borrow(), vec![('a', 1), ('b', 2)]);
}

#[test]
fn failed_body_delivers_nothing_but_keeps_writes() {
    let ctx = Ctx::new();
    let a = Atom::new(0_i32);
    let seen: Rc<RefCell<Vec<i32>>> = Rc::default();
    let sink = seen.clone();
    let _sub = ctx.subscribe(&a, move |v| sink.borrow_mut().push(*v)).unwrap();
    let logs = Rc::new(Cell::new(0));
    let counted = logs.clone();
    let _log = ctx.log(move |_| counted.set(counted.get() + 1));

    let result = ctx.run(|| -> Result<(), AtomError> {
        ctx.set(&a, 5)?;
        Err(anyhow::anyhow!("abort").into())
    });
    assert!(result.is_err());

    // The write itself remains, but no notification pass happened.
    assert_eq!(*seen.borrow(), vec![0]);
    assert_eq!(logs.get(), 0);
    assert_eq!(*ctx.read(&a).unwrap().value::<i32>().unwrap(), 5);

    // The next successful commit picks the change up.
    ctx.set(&a, 6).unwrap();
    assert_eq!(*seen.borrow(), vec![0, 6]);
}

#[test]
fn aborted_dispatches_are_discarded() {
    let ctx = Ctx::new();
    let push: Action<i32> = Action::new();
    let seen: Rc<RefCell<Vec<Vec<i32>>>> = Rc::default();
    let batches = {
        let push = push.clone();
        Derived::new(move |spy| Ok(spy.get(&push)?.iter().map(|v| **v).collect::<Vec<i32>>()))
    };
    let sink = seen.clone();
    let _sub = ctx.subscribe(&batches, move |v| sink.borrow_mut().push(v.clone())).unwrap();

    let result = ctx.run(|| -> Result<(), AtomError> {
        ctx.dispatch(&push, 7)?;
        Err(anyhow::anyhow!("abort").into())
    });
    assert!(result.is_err());

    // The aborted payload must not ride along with the next dispatch.
    ctx.dispatch(&push, 8).unwrap();
    assert_eq!(*seen.borrow(), vec![vec![], vec![8]]);
}

#[test]
fn later_writes_reach_dependents_staled_by_a_failed_body() {
    let ctx = Ctx::new();
    let a = Atom::new(1_i32);
    let doubled = {
        let a = a.clone();
        Derived::new(move |spy| Ok(*spy.get(&a)? * 2))
    };
    let quadrupled = {
        let doubled = doubled.clone();
        Derived::new(move |spy| Ok(*spy.get(&doubled)? * 2))
    };
    let seen: Rc<RefCell<Vec<i32>>> = Rc::default();
    let sink = seen.clone();
    let _sub = ctx.subscribe(&quadrupled, move |v| sink.borrow_mut().push(*v)).unwrap();

    let result = ctx.run(|| -> Result<(), AtomError> {
        ctx.set(&a, 2)?;
        Err(anyhow::anyhow!("abort").into())
    });
    assert!(result.is_err());
    assert_eq!(*seen.borrow(), vec![4]);

    // Stale marks left behind by the abort must not cut the next pass
    // short of the subscriber.
    ctx.set(&a, 3).unwrap();
    assert_eq!(*seen.borrow(), vec![4, 12]);
}

#[test]
fn inner_error_can_be_caught_by_the_outer_body() {
    let ctx = Ctx::new();
    let a = Atom::new(0_i32);
    let seen: Rc<RefCell<Vec<i32>>> = Rc::default();
    let sink = seen.clone();
    let _sub = ctx.subscribe(&a, move |v| sink.borrow_mut().push(*v)).unwrap();

    ctx.run(|| {
        ctx.set(&a, 1)?;
        let inner = ctx.run(|| -> Result<(), AtomError> { Err(anyhow::anyhow!("inner").into()) });
        assert!(inner.is_err());
        ctx.set(&a, 2)?;
        Ok(())
    })
    .unwrap();

    assert_eq!(*seen.borrow(), vec![0, 2]);
}
