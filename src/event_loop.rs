//! The per-thread deferred queue that every settlement is scheduled on.
//!
//! Microtasks run in strict FIFO order. Timers live on a virtual millisecond
//! clock that only moves when the loop has nothing else to do, so tests that
//! use [`set_timeout`] stay deterministic.
//!
//! ```
//! use promise_like::event_loop;
//! use std::{cell::RefCell, rc::Rc};
//!
//! let log = Rc::new(RefCell::new(Vec::new()));
//! let (a, b) = (log.clone(), log.clone());
//! event_loop::set_timeout(5, move || a.borrow_mut().push("timer"));
//! event_loop::defer(move || b.borrow_mut().push("microtask"));
//! event_loop::run();
//! assert_eq!(*log.borrow(), vec!["microtask", "timer"]);
//! assert_eq!(event_loop::now(), 5);
//! ```
use futures::pin_mut;
use futures::task::noop_waker_ref;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::task::{Context, Poll};
use tracing::trace;

type Task = Box<dyn FnOnce()>;

/// Handle returned by [`set_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Default)]
struct EventLoop {
    microtasks: VecDeque<Task>,
    // keyed by (deadline, id) so equal deadlines fire in registration order
    timers: BTreeMap<(u64, u64), Task>,
    // timer id -> deadline, for cancelling without scanning `timers`
    deadlines: HashMap<u64, u64>,
    now: u64,
    next_timer_id: u64,
    draining: bool,
}

thread_local! {
    static EVENT_LOOP: RefCell<EventLoop> = RefCell::new(EventLoop::default());
}

/// Queues `task` behind every microtask already queued.
pub fn defer<F>(task: F)
where
    F: FnOnce() + 'static,
{
    EVENT_LOOP.with(|event_loop| event_loop.borrow_mut().microtasks.push_back(Box::new(task)));
}

/// Runs `task` once the virtual clock has advanced by `delay_ms`.
pub fn set_timeout<F>(delay_ms: u64, task: F) -> TimerId
where
    F: FnOnce() + 'static,
{
    EVENT_LOOP.with(|event_loop| {
        let mut event_loop = event_loop.borrow_mut();
        let id = event_loop.next_timer_id;
        event_loop.next_timer_id += 1;
        let deadline = event_loop.now + delay_ms;
        event_loop.timers.insert((deadline, id), Box::new(task));
        event_loop.deadlines.insert(id, deadline);
        TimerId(id)
    })
}

/// Cancels a timer that has not fired yet. Returns whether it was found.
pub fn clear_timeout(timer: TimerId) -> bool {
    EVENT_LOOP.with(|event_loop| {
        let mut event_loop = event_loop.borrow_mut();
        match event_loop.deadlines.remove(&timer.0) {
            Some(deadline) => event_loop.timers.remove(&(deadline, timer.0)).is_some(),
            None => false,
        }
    })
}

/// Current virtual time in milliseconds.
pub fn now() -> u64 {
    EVENT_LOOP.with(|event_loop| event_loop.borrow().now)
}

/// True when neither microtasks nor timers are queued.
pub fn is_idle() -> bool {
    EVENT_LOOP.with(|event_loop| {
        let event_loop = event_loop.borrow();
        event_loop.microtasks.is_empty() && event_loop.timers.is_empty()
    })
}

struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        EVENT_LOOP.with(|event_loop| event_loop.borrow_mut().draining = false);
    }
}

/// Drains the microtask queue, including tasks queued while draining.
///
/// Called from inside a running task this is a no-op and returns 0.
pub fn run_microtasks() -> usize {
    let already_draining = EVENT_LOOP.with(|event_loop| {
        let mut event_loop = event_loop.borrow_mut();
        std::mem::replace(&mut event_loop.draining, true)
    });
    if already_draining {
        return 0;
    }
    let _guard = DrainGuard;
    let mut ran = 0;
    loop {
        // the borrow must end before the task runs; tasks enqueue more tasks
        let task = EVENT_LOOP.with(|event_loop| event_loop.borrow_mut().microtasks.pop_front());
        match task {
            Some(task) => {
                task();
                ran += 1;
            }
            None => return ran,
        }
    }
}

/// One turn of the loop: drain microtasks, then fire the earliest timer (moving
/// the clock to its deadline) and drain again. Returns whether anything ran.
pub fn turn() -> bool {
    let mut progressed = run_microtasks() > 0;
    let next = EVENT_LOOP.with(|event_loop| {
        let mut event_loop = event_loop.borrow_mut();
        if event_loop.draining {
            return None;
        }
        let ((deadline, id), task) = event_loop.timers.pop_first()?;
        event_loop.deadlines.remove(&id);
        event_loop.now = event_loop.now.max(deadline);
        Some((id, task))
    });
    if let Some((id, task)) = next {
        trace!(timer = id, now = now(), "timer fired");
        task();
        run_microtasks();
        progressed = true;
    }
    progressed
}

/// Turns the loop until nothing is left to run.
pub fn run() {
    while turn() {}
}

/// Drives the loop until `future` completes.
///
/// Returns `None` when the loop goes idle first, which means the future can
/// never complete (for example `Promise::race` over an empty list).
pub fn block_on<F: Future>(future: F) -> Option<F::Output> {
    pin_mut!(future);
    let mut cx = Context::from_waker(noop_waker_ref());
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return Some(output);
        }
        if !turn() {
            return None;
        }
    }
}
