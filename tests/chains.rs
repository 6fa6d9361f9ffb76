//! Chain semantics on a single thread: ordering, path discipline, late
//! appends and overflow.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use deferred::{downcast, Deferred, Failure, Outcome, Reply};

fn int(d: &Deferred) -> i32 {
    *downcast::<i32>(d.join().unwrap())
}

#[test]
fn links_transform_in_append_order() {
    let d = Deferred::new();
    d.on_success(|x: Arc<i32>| Reply::value(*x * 2));
    d.on_success(|x: Arc<i32>| Reply::value(*x + 1));
    d.complete(Reply::value(10));
    assert_eq!(int(&d), 21);
}

#[test]
fn late_appends_run_on_the_appending_thread() {
    let d = Deferred::new();
    d.complete(Reply::value(7));
    let ran = Arc::new(AtomicUsize::new(0));
    let seen = ran.clone();
    d.on_success(move |x: Arc<i32>| {
        seen.store(1, Ordering::SeqCst);
        Reply::value(*x * *x)
    });
    // The link ran before on_success returned.
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(int(&d), 49);
}

#[test]
fn a_failing_link_diverts_to_the_error_path() {
    let d = Deferred::new();
    d.on_success(|_: Arc<i32>| Reply::failure("boom"));
    d.on_error(|e: Failure| Reply::value(format!("recovered:{}", e)));
    d.complete(Reply::value(1));
    assert_eq!(*downcast::<String>(d.join().unwrap()), "recovered:boom");
}

#[test]
fn recovery_moves_the_chain_back_to_the_success_path() {
    let d = Deferred::new();
    d.on_success(|_: Arc<i32>| Reply::failure("boom"));
    d.on_error(|_| Reply::value(1));
    d.on_success(|x: Arc<i32>| Reply::value(*x + 1));
    d.complete(Reply::value(0));
    assert_eq!(int(&d), 2);
}

#[test]
fn on_success_leaves_the_error_path_untouched() {
    let d = Deferred::new();
    let ran = Arc::new(AtomicUsize::new(0));
    let seen = ran.clone();
    d.on_success(move |_: Arc<i32>| {
        seen.fetch_add(1, Ordering::SeqCst);
        Reply::value(0)
    });
    d.complete(Failure::new("boom"));
    assert_eq!(d.join().unwrap_err().to_string(), "boom");
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn on_error_leaves_the_success_path_untouched() {
    let d = Deferred::new();
    d.on_error(|_| Reply::value(99));
    d.complete(Reply::value(5));
    assert_eq!(int(&d), 5);
}

#[test]
fn add_callbacks_selects_exactly_one_side() {
    let d = Deferred::new();
    d.add_callbacks(|x: Arc<i32>| Reply::value(*x + 1), |_| Reply::value(-1));
    d.complete(Reply::value(1));
    assert_eq!(int(&d), 2);

    let e = Deferred::new();
    e.add_callbacks(
        |_: Arc<i32>| Reply::value(0),
        |err| Reply::value(format!("handled:{}", err)),
    );
    e.complete(Failure::new("boom"));
    assert_eq!(*downcast::<String>(e.join().unwrap()), "handled:boom");
}

#[test]
fn every_link_runs_exactly_once_in_order() {
    let d = Deferred::new();
    let trace = Arc::new(Mutex::new(Vec::new()));
    for i in 0..10usize {
        let trace = trace.clone();
        d.on_both(move |outcome: Outcome| {
            trace.lock().unwrap().push(i);
            Reply::from(outcome)
        });
    }
    d.complete(Reply::value(0));
    assert_eq!(*trace.lock().unwrap(), (0..10).collect::<Vec<usize>>());
}

#[test]
fn a_link_may_append_to_its_own_deferred() {
    let d = Deferred::new();
    let inner = d.clone();
    let last = Arc::new(AtomicUsize::new(0));
    let seen = last.clone();
    d.on_success(move |x: Arc<i32>| {
        inner.on_success(move |y: Arc<i32>| {
            seen.store(*y as usize, Ordering::SeqCst);
            Reply::value(*y)
        });
        Reply::value(*x + 1)
    });
    d.complete(Reply::value(1));
    // The re-entrant append was picked up by the same drain.
    assert_eq!(last.load(Ordering::SeqCst), 2);
}

#[test]
fn chain_completes_the_other_deferred_and_passes_through() {
    let a = Deferred::new();
    let b = Deferred::new();
    a.chain(&b);
    a.on_success(|x: Arc<i32>| Reply::value(*x + 1));
    a.complete(Reply::value(41));
    assert_eq!(int(&b), 41);
    assert_eq!(int(&a), 42);
}

#[test]
fn chain_forwards_failures_too() {
    let a = Deferred::new();
    let b = Deferred::new();
    a.chain(&b);
    a.complete(Failure::new("boom"));
    assert_eq!(b.join().unwrap_err().to_string(), "boom");
}

#[test]
fn chain_overflow_panics_and_keeps_earlier_links() {
    let d = Deferred::new();
    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..16_383 {
        let count = count.clone();
        d.on_both(move |outcome: Outcome| {
            count.fetch_add(1, Ordering::SeqCst);
            Reply::from(outcome)
        });
    }
    let overflow = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        d.on_success(|x: Arc<i32>| Reply::value(*x));
    }));
    assert!(overflow.is_err());
    d.complete(Reply::value(0));
    assert_eq!(count.load(Ordering::SeqCst), 16_383);
}
