//! End-to-end coroutine scenarios exercised purely through
//! `corostack`'s public API.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::rc::Rc;

use corostack::{AwaitFailed, Coroutine, Resumed, ResumeFailed, Waiter};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
struct Msg {
    id: u32,
}

#[test]
fn run_once() {
    let flag = Rc::new(RefCell::new(0u32));
    let flag_inner = flag.clone();

    let mut co: Coroutine<(), ()> = Coroutine::spawn(
        move |_w| {
            *flag_inner.borrow_mut() = 1;
        },
        0,
    )
    .unwrap();

    assert_eq!(*flag.borrow(), 0);
    let result = co.resume(()).unwrap();
    assert!(result.is_done());
    assert_eq!(*flag.borrow(), 1);
}

#[test]
fn single_await() {
    let flag = Rc::new(RefCell::new(0u32));
    let flag_inner = flag.clone();

    let mut co: Coroutine<Msg, Msg> = Coroutine::spawn(
        move |w: &mut Waiter<Msg, Msg>| {
            *flag_inner.borrow_mut() = 0x0cfbbead;
            let resumed = w.await_(Msg { id: 0x0cfbbead }).unwrap();
            *flag_inner.borrow_mut() = resumed.id;
        },
        0,
    )
    .unwrap();

    match co.resume(Msg { id: 0 }).unwrap() {
        Resumed::Awaited(msg) => assert_eq!(msg.id, 0x0cfbbead),
        Resumed::Done => panic!("expected an await, not termination"),
    }
    assert_eq!(*flag.borrow(), 0x0cfbbead);

    let result = co.resume(Msg { id: 0x0cfbbeae }).unwrap();
    assert!(result.is_done());
    assert_eq!(*flag.borrow(), 0x0cfbbeae);
}

#[test]
fn six_way_round_robin() {
    let mut coros: Vec<Coroutine<u32, Option<()>>> = Vec::new();
    let mut finals: Vec<Rc<RefCell<Option<u32>>>> = Vec::new();

    for _ in 0..6 {
        let result = Rc::new(RefCell::new(None));
        let result_inner = result.clone();
        finals.push(result);

        let co = Coroutine::spawn(
            move |w: &mut Waiter<u32, Option<()>>| {
                let mut counter = 0u32;
                loop {
                    let wakeup = w.await_(counter).unwrap();
                    match wakeup {
                        Some(()) => counter += 1,
                        None => break,
                    }
                }
                *result_inner.borrow_mut() = Some(counter);
            },
            0,
        )
        .unwrap();
        coros.push(co);
    }

    // Start each coroutine (first resume, ignored wakeup).
    for co in coros.iter_mut() {
        assert!(matches!(co.resume(None).unwrap(), Resumed::Awaited(0)));
    }

    // Staircase: coroutine k gets k non-null resumes, then one null resume.
    for (k, co) in coros.iter_mut().enumerate() {
        let k = k as u32 + 1;
        for _ in 0..k {
            assert!(matches!(co.resume(Some(())), Ok(Resumed::Awaited(_))));
        }
        let result = co.resume(None).unwrap();
        assert!(result.is_done());
    }

    let observed: Vec<u32> = finals.iter().map(|f| f.borrow().unwrap()).collect();
    assert_eq!(observed, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn nesting() {
    let trace: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let trace_a = trace.clone();
    let trace_b = trace.clone();

    let mut a: Coroutine<u32, u32> = Coroutine::spawn(
        move |wa: &mut Waiter<u32, u32>| {
            trace_a.borrow_mut().push("a:start");

            let mut b: Coroutine<u32, u32> = Coroutine::spawn(
                move |wb: &mut Waiter<u32, u32>| {
                    trace_b.borrow_mut().push("b:start");
                    let got = wb.await_(20).unwrap();
                    trace_b.borrow_mut().push("b:resumed");
                    assert_eq!(got, 21);
                },
                0,
            )
            .unwrap();

            match b.resume(0).unwrap() {
                Resumed::Awaited(v) => assert_eq!(v, 20),
                Resumed::Done => panic!("b terminated before awaiting"),
            }
            trace_a.borrow_mut().push("a:got-b");

            let got = wa.await_(10).unwrap();
            trace_a.borrow_mut().push("a:resumed");
            assert_eq!(got, 11);

            assert!(b.resume(21).unwrap().is_done());
            trace_a.borrow_mut().push("a:b-done");
        },
        0,
    )
    .unwrap();

    match a.resume(0).unwrap() {
        Resumed::Awaited(v) => assert_eq!(v, 10),
        Resumed::Done => panic!("a terminated before awaiting"),
    }
    assert!(a.resume(11).unwrap().is_done());

    assert_eq!(
        *trace.borrow(),
        vec!["a:start", "b:start", "a:got-b", "a:resumed", "b:resumed", "a:b-done"]
    );
}

fn build_chain(depth: u32, trace: Rc<RefCell<Vec<u32>>>) -> Coroutine<u32, u32> {
    Coroutine::spawn(
        move |_w: &mut Waiter<u32, u32>| {
            trace.borrow_mut().push(depth);
            if depth > 0 {
                let mut child = build_chain(depth - 1, trace.clone());
                assert!(child.resume(0).unwrap().is_done());
            }
        },
        0,
    )
    .unwrap()
}

#[test]
fn nesting_eight_deep_does_not_corrupt_the_chain() {
    let trace = Rc::new(RefCell::new(Vec::new()));
    let mut root = build_chain(8, trace.clone());
    assert!(root.resume(0).unwrap().is_done());
    assert_eq!(*trace.borrow(), vec![8, 7, 6, 5, 4, 3, 2, 1, 0]);
}

#[test]
fn bad_resume_from_inside() {
    // See the identical note in `coroutine.rs`'s unit test: the handle a
    // coroutine uses to resume itself has to be a raw pointer rather than
    // a `RefCell`-checked borrow, or the reentrant borrow panics before
    // the protocol guard under test ever runs.
    thread_local! {
        static SELF_PTR: Cell<*mut Coroutine<(), ()>> = Cell::new(ptr::null_mut());
    }

    let inner_outcome: Rc<RefCell<Option<Result<Resumed<()>, ResumeFailed>>>> = Rc::new(RefCell::new(None));
    let inner_outcome_inner = inner_outcome.clone();

    let co: Coroutine<(), ()> = Coroutine::spawn(
        move |_w: &mut Waiter<(), ()>| {
            let ptr = SELF_PTR.with(Cell::get);
            let result = unsafe { (*ptr).resume(()) };
            *inner_outcome_inner.borrow_mut() = Some(result);
        },
        0,
    )
    .unwrap();

    let raw = Box::into_raw(Box::new(co));
    SELF_PTR.with(|c| c.set(raw));

    let outer_result = unsafe { (*raw).resume(()) }.unwrap();
    assert!(outer_result.is_done());
    assert!(matches!(*inner_outcome.borrow(), Some(Err(ResumeFailed))));

    unsafe {
        drop(Box::from_raw(raw));
    }
}

#[test]
fn bad_await_outside() {
    let stashed: Rc<RefCell<Option<Waiter<(), ()>>>> = Rc::new(RefCell::new(None));
    let stashed_inner = stashed.clone();

    let mut co: Coroutine<(), ()> = Coroutine::spawn(
        move |w: &mut Waiter<(), ()>| {
            *stashed_inner.borrow_mut() = Some(*w);
            w.await_(()).unwrap();
        },
        0,
    )
    .unwrap();

    // Starts the coroutine; it suspends at its own `await_` with a live
    // stashed copy of its `Waiter` now sitting in `stashed`, while this
    // thread is back at the top level — no coroutine is running here.
    co.resume(()).unwrap();

    let mut outside_copy = stashed.borrow_mut().take().unwrap();
    assert_eq!(outside_copy.await_(()), Err(AwaitFailed));

    assert!(co.resume(()).unwrap().is_done());
}

#[test]
fn bad_alloc() {
    let result: std::io::Result<Coroutine<(), ()>> = Coroutine::spawn(|_w| {}, usize::MAX - 4095);
    assert!(result.is_err());
}
