use crate::error::{catch_panic, Error};
use crate::event_loop;
use crate::resolution::{resolve_promise, IntoResolution, Resolution};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use tracing::{debug, trace, warn};

/// Settles a promise as fulfilled. Only the first capability call counts.
pub type Fulfill<T> = Rc<dyn Fn(T)>;
/// Settles a promise as rejected. Only the first capability call counts.
pub type Reject<E> = Rc<dyn Fn(E)>;

type FulfillReaction<T> = Box<dyn FnOnce(T)>;
type RejectReaction<E> = Box<dyn FnOnce(E)>;

/// Which of the three states a promise is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

struct Reactions<T, E> {
    fulfill: Vec<FulfillReaction<T>>,
    reject: Vec<RejectReaction<E>>,
}

struct Inner<T, E> {
    state: State<T, E>,
    // set by the first settlement call; the state flip itself is deferred
    claimed: bool,
    // a `Reactions<T, E>`, erased so `drop` can hand it to `release`
    reactions: Option<Box<dyn Any>>,
    wakers: Vec<Waker>,
}

impl<T, E> Drop for Inner<T, E> {
    fn drop(&mut self) {
        if let Some(reactions) = self.reactions.take() {
            release(reactions);
        }
    }
}

thread_local! {
    static RELEASE_QUEUE: RefCell<Option<Vec<Box<dyn Any>>>> = const { RefCell::new(None) };
}

/// Drops reactions of abandoned promises one at a time.
///
/// A reaction owns the promise derived from it, so dropping a long pending
/// chain would otherwise recurse once per link. Nested calls only queue;
/// the outermost call drains the queue in a loop.
fn release(reactions: Box<dyn Any>) {
    let queued = RELEASE_QUEUE.try_with(|queue| {
        let mut queue = queue.borrow_mut();
        match queue.as_mut() {
            Some(pending) => {
                pending.push(reactions);
                None
            }
            None => {
                *queue = Some(Vec::new());
                Some(reactions)
            }
        }
    });
    let mut next = match queued {
        Ok(Some(reactions)) => reactions,
        Ok(None) => return,
        // thread-local already torn down; drop in place
        Err(_) => return,
    };
    loop {
        drop(next);
        let popped = RELEASE_QUEUE.with(|queue| {
            let mut queue = queue.borrow_mut();
            let popped = queue.as_mut().and_then(Vec::pop);
            if popped.is_none() {
                *queue = None;
            }
            popped
        });
        match popped {
            Some(reactions) => next = reactions,
            None => return,
        }
    }
}

/// A deferred value that is eventually fulfilled with a `T` or rejected with
/// an `E`.
///
/// `Promise` is a handle: clones share one settlement. Settlement and every
/// reaction run on the thread's [`event_loop`], never inside the caller's
/// frame.
///
/// # Examples
///
/// ```
/// use promise_like::{event_loop, Error, Promise};
///
/// let promise = Promise::<i32, Error>::new(|fulfill, _reject| fulfill(20))
///     .then(|value| Ok(value + 1))
///     .then(|value| Ok(value * 2));
/// assert_eq!(event_loop::block_on(promise), Some(Ok(42)));
/// ```
pub struct Promise<T, E = Error> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Promise<T, E> {
    /// True when both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> PromiseState {
        match self.inner.borrow().state {
            State::Pending => PromiseState::Pending,
            State::Fulfilled(_) => PromiseState::Fulfilled,
            State::Rejected(_) => PromiseState::Rejected,
        }
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    pub(crate) fn pending() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                claimed: false,
                reactions: None,
                wakers: Vec::new(),
            })),
        }
    }

    /// Creates a promise and synchronously runs `executor` with its two
    /// settlement capabilities. A panicking executor rejects the promise.
    pub fn new<F>(executor: F) -> Self
    where
        F: FnOnce(Fulfill<T>, Reject<E>),
    {
        let promise = Self::pending();
        let (fulfill, reject) = promise.capabilities();
        if let Err(message) = catch_panic(move || executor(fulfill, reject)) {
            warn!(%message, "promise executor panicked");
            promise.settle(Err(E::from(Error::ExecutorPanicked(message))));
        }
        promise
    }

    /// Like [`Promise::new`], but a missing executor is a construction error
    /// rather than a rejection.
    pub fn try_new<F>(executor: Option<F>) -> Result<Self, Error>
    where
        F: FnOnce(Fulfill<T>, Reject<E>),
    {
        executor.map(Self::new).ok_or(Error::MissingExecutor)
    }

    pub(crate) fn capabilities(&self) -> (Fulfill<T>, Reject<E>) {
        let on_fulfill = self.clone();
        let on_reject = self.clone();
        (
            Rc::new(move |value| on_fulfill.settle(Ok(value))),
            Rc::new(move |reason| on_reject.settle(Err(reason))),
        )
    }

    /// Claims the promise and schedules the state flip. No-op once claimed.
    pub(crate) fn settle(&self, outcome: Result<T, E>) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.claimed {
                debug!("promise already settled, ignoring");
                return;
            }
            inner.claimed = true;
        }
        let promise = self.clone();
        event_loop::defer(move || promise.flip(outcome));
    }

    fn flip(&self, outcome: Result<T, E>) {
        let (reactions, wakers) = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            inner.state = match &outcome {
                Ok(value) => State::Fulfilled(value.clone()),
                Err(reason) => State::Rejected(reason.clone()),
            };
            let reactions = inner
                .reactions
                .take()
                .and_then(|reactions| reactions.downcast::<Reactions<T, E>>().ok());
            (reactions, std::mem::take(&mut inner.wakers))
        };
        let Reactions { fulfill, reject } = match reactions {
            Some(reactions) => *reactions,
            None => Reactions {
                fulfill: Vec::new(),
                reject: Vec::new(),
            },
        };
        trace!(
            fulfilled = outcome.is_ok(),
            reactions = fulfill.len(),
            "promise settled"
        );
        match outcome {
            Ok(value) => fulfill
                .into_iter()
                .for_each(|reaction| reaction(value.clone())),
            Err(reason) => reject
                .into_iter()
                .for_each(|reaction| reaction(reason.clone())),
        }
        wakers.into_iter().for_each(Waker::wake);
    }

    /// Registers one reaction per branch. On an already-settled promise the
    /// matching reaction is deferred, never run inside this call.
    pub(crate) fn subscribe(
        &self,
        on_fulfilled: FulfillReaction<T>,
        on_rejected: RejectReaction<E>,
    ) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        match &inner.state {
            State::Pending => {
                let reactions = inner.reactions.get_or_insert_with(|| {
                    Box::new(Reactions::<T, E> {
                        fulfill: Vec::new(),
                        reject: Vec::new(),
                    })
                });
                if let Some(reactions) = reactions.downcast_mut::<Reactions<T, E>>() {
                    reactions.fulfill.push(on_fulfilled);
                    reactions.reject.push(on_rejected);
                }
            }
            State::Fulfilled(value) => {
                let value = value.clone();
                event_loop::defer(move || on_fulfilled(value));
            }
            State::Rejected(reason) => {
                let reason = reason.clone();
                event_loop::defer(move || on_rejected(reason));
            }
        }
    }

    /// Runs a user handler and resolves `self` with whatever it produced.
    pub(crate) fn react<H, R>(&self, handler: H)
    where
        H: FnOnce() -> R,
        R: IntoResolution<E, Value = T>,
    {
        match catch_panic(handler) {
            Ok(produced) => resolve_promise(self, produced.into_resolution()),
            Err(message) => {
                warn!(%message, "promise handler panicked");
                self.settle(Err(E::from(Error::HandlerPanicked(message))));
            }
        }
    }

    /// Chains both branches. The returned promise follows whatever the
    /// handler that runs returns.
    pub fn then_with<F, G, R, S>(&self, on_fulfilled: F, on_rejected: G) -> Promise<R::Value, E>
    where
        F: FnOnce(T) -> R + 'static,
        G: FnOnce(E) -> S + 'static,
        R: IntoResolution<E>,
        S: IntoResolution<E, Value = R::Value>,
        R::Value: Clone + 'static,
    {
        let derived = Promise::<R::Value, E>::pending();
        let on_fulfilled = {
            let derived = derived.clone();
            move |value: T| derived.react(move || on_fulfilled(value))
        };
        let on_rejected = {
            let derived = derived.clone();
            move |reason: E| derived.react(move || on_rejected(reason))
        };
        self.subscribe(Box::new(on_fulfilled), Box::new(on_rejected));
        derived
    }

    /// Chains the fulfillment branch; rejections pass through unchanged.
    pub fn then<F, R>(&self, on_fulfilled: F) -> Promise<R::Value, E>
    where
        F: FnOnce(T) -> R + 'static,
        R: IntoResolution<E>,
        R::Value: Clone + 'static,
    {
        self.then_with(on_fulfilled, |reason| Err::<R::Value, E>(reason))
    }

    /// Chains the rejection branch; values pass through unchanged.
    pub fn catch<F, R>(&self, on_rejected: F) -> Promise<T, E>
    where
        F: FnOnce(E) -> R + 'static,
        R: IntoResolution<E, Value = T>,
    {
        self.then_with(|value| Ok::<T, E>(value), on_rejected)
    }

    /// Chains one handler that sees either outcome.
    pub fn then_outcome<F, R>(&self, handler: F) -> Promise<R::Value, E>
    where
        F: FnOnce(Result<T, E>) -> R + 'static,
        R: IntoResolution<E>,
        R::Value: Clone + 'static,
    {
        let derived = Promise::<R::Value, E>::pending();
        let slot = Rc::new(RefCell::new(Some(handler)));
        let on_fulfilled = {
            let (derived, slot) = (derived.clone(), slot.clone());
            move |value: T| {
                let handler = slot.borrow_mut().take();
                if let Some(handler) = handler {
                    derived.react(move || handler(Ok(value)));
                }
            }
        };
        let on_rejected = {
            let derived = derived.clone();
            move |reason: E| {
                let handler = slot.borrow_mut().take();
                if let Some(handler) = handler {
                    derived.react(move || handler(Err(reason)));
                }
            }
        };
        self.subscribe(Box::new(on_fulfilled), Box::new(on_rejected));
        derived
    }

    /// Runs `on_settled` on either branch, then forwards the original outcome
    /// once whatever `on_settled` returned has completed. If that rejects, its
    /// reason replaces the original outcome.
    ///
    /// ```
    /// use promise_like::{event_loop, Error, Promise};
    ///
    /// let promise = Promise::<i32, Error>::reject(Error::ChainingCycle)
    ///     .finally(|| Ok::<_, Error>("ignored"));
    /// assert_eq!(event_loop::block_on(promise), Some(Err(Error::ChainingCycle)));
    /// ```
    pub fn finally<F, R>(&self, on_settled: F) -> Promise<T, E>
    where
        F: FnOnce() -> R + 'static,
        R: IntoResolution<E>,
        R::Value: Clone + 'static,
    {
        self.then_outcome(move |outcome| {
            Promise::<R::Value, E>::resolve(on_settled()).then(move |_| outcome)
        })
    }

    /// Normalizes `value` into a promise. A promise passes through unchanged;
    /// thenables are adopted.
    pub fn resolve<R>(value: R) -> Self
    where
        R: IntoResolution<E, Value = T>,
    {
        match value.into_resolution() {
            Resolution::Promise(promise) => promise,
            other => {
                let promise = Self::pending();
                resolve_promise(&promise, other);
                promise
            }
        }
    }

    pub fn reject(reason: E) -> Self {
        let promise = Self::pending();
        promise.settle(Err(reason));
        promise
    }

    /// The settled outcome, if the state has flipped.
    pub fn outcome(&self) -> Option<Result<T, E>> {
        match &self.inner.borrow().state {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    /// True when `value` is a promise of this exact type.
    pub fn is(value: &dyn Any) -> bool {
        value.is::<Self>()
    }
}

impl<T, E> fmt::Display for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[object PromiseLike]")
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        let mut debug = f.debug_struct("Promise");
        match &inner.state {
            State::Pending => debug.field("state", &PromiseState::Pending),
            State::Fulfilled(value) => debug.field("value", value),
            State::Rejected(reason) => debug.field("reason", reason),
        };
        debug.finish()
    }
}

impl<T: Clone, E: Clone> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        match &inner.state {
            State::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(reason) => Poll::Ready(Err(reason.clone())),
            State::Pending => {
                if !inner.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{block_on, run};
    use crate::test_support::Reason;

    type P<T> = Promise<T, Reason>;

    fn recorder<T>() -> Rc<RefCell<Vec<T>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn test_executor_runs_synchronously_but_settles_later() {
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();
        let promise = P::new(move |fulfill, _| {
            *flag.borrow_mut() = true;
            fulfill(1);
        });
        assert!(*ran.borrow());
        assert_eq!(promise.state(), PromiseState::Pending);
        run();
        assert_eq!(promise.outcome(), Some(Ok(1)));
    }

    #[test]
    fn test_first_settlement_wins() {
        let promise = P::new(|fulfill, reject| {
            fulfill(1);
            reject(Reason::Code(2));
            fulfill(3);
        });
        assert_eq!(block_on(promise.clone()), Some(Ok(1)));
        let rejected = P::new(|fulfill, reject| {
            reject(Reason::Code(2));
            fulfill(1);
        });
        assert_eq!(block_on(rejected), Some(Err(Reason::Code(2))));
        assert_eq!(promise.outcome(), Some(Ok(1)));
    }

    #[test]
    fn test_executor_panic_rejects() {
        let promise = P::<i32>::new(|_, _| panic!("bad executor"));
        assert_eq!(
            block_on(promise),
            Some(Err(Reason::Internal(Error::ExecutorPanicked("bad executor".into()))))
        );
        let settled_first = P::new(|fulfill, _| {
            fulfill(5);
            panic!("too late");
        });
        assert_eq!(block_on(settled_first), Some(Ok(5)));
    }

    #[test]
    fn test_try_new_without_executor() {
        let missing = P::<i32>::try_new(None::<fn(Fulfill<i32>, Reject<Reason>)>);
        assert_eq!(missing.err(), Some(Error::MissingExecutor));
        let present = P::try_new(Some(|fulfill: Fulfill<i32>, _: Reject<Reason>| fulfill(1)));
        assert!(present.is_ok());
    }

    #[test]
    fn test_then_runs_after_stack_unwinds() {
        let calls = recorder();
        let seen = calls.clone();
        let _ = P::resolve(Ok(1)).then(move |value| {
            seen.borrow_mut().push(value);
            Ok::<_, Reason>(())
        });
        assert!(calls.borrow().is_empty());
        run();
        assert_eq!(*calls.borrow(), vec![1]);
    }

    #[test]
    fn test_reactions_run_in_registration_order() {
        let calls = recorder();
        let promise = P::new(|fulfill, _| fulfill(0));
        for index in 0..4 {
            let calls = calls.clone();
            let _ = promise.then(move |_| {
                calls.borrow_mut().push(index);
                Ok::<_, Reason>(())
            });
        }
        run();
        assert_eq!(*calls.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_then_on_settled_promise_is_deferred() {
        let promise = P::resolve(Ok(9));
        run();
        assert_eq!(promise.state(), PromiseState::Fulfilled);
        let calls = recorder();
        let seen = calls.clone();
        let _ = promise.then(move |value| {
            seen.borrow_mut().push(value);
            Ok::<_, Reason>(())
        });
        assert!(calls.borrow().is_empty());
        run();
        assert_eq!(*calls.borrow(), vec![9]);
    }

    #[test]
    fn test_passthrough_branches() {
        let rejected = P::<i32>::reject(Reason::Code(4)).then(|value| Ok(value + 1));
        assert_eq!(block_on(rejected), Some(Err(Reason::Code(4))));
        let fulfilled = P::resolve(Ok(4)).catch(|_| Ok(0));
        assert_eq!(block_on(fulfilled), Some(Ok(4)));
    }

    #[test]
    fn test_catch_recovers_and_err_rethrows() {
        let recovered = P::<i32>::reject(Reason::Code(1)).catch(|reason| match reason {
            Reason::Code(code) => Ok(code * 10),
            other => Err(other),
        });
        assert_eq!(block_on(recovered), Some(Ok(10)));
        let rethrown = P::resolve(Ok(1)).then(|_| Err::<i32, _>(Reason::Code(7)));
        assert_eq!(block_on(rethrown), Some(Err(Reason::Code(7))));
    }

    #[test]
    fn test_handler_panic_rejects_derived() {
        let derived = P::resolve(Ok(1)).then(|_| -> Result<i32, Reason> { panic!("boom") });
        assert_eq!(
            block_on(derived),
            Some(Err(Reason::Internal(Error::HandlerPanicked("boom".into()))))
        );
    }

    #[test]
    fn test_handler_returning_promise_is_adopted() {
        let derived = P::resolve(Ok(2)).then(|value| P::new(move |fulfill, _| fulfill(value * 3)));
        assert_eq!(block_on(derived), Some(Ok(6)));
    }

    #[test]
    fn test_self_returning_handler_is_a_cycle() {
        let slot: Rc<RefCell<Option<P<i32>>>> = Rc::new(RefCell::new(None));
        let own = slot.clone();
        let derived = P::resolve(Ok(1)).then(move |_| match own.borrow().clone() {
            Some(promise) => Resolution::Promise(promise),
            None => Resolution::Value(0),
        });
        *slot.borrow_mut() = Some(derived.clone());
        assert_eq!(
            block_on(derived),
            Some(Err(Reason::Internal(Error::ChainingCycle)))
        );
        slot.borrow_mut().take();
    }

    #[test]
    fn test_then_outcome_sees_both_branches() {
        let from_value =
            P::resolve(Ok(1)).then_outcome(|outcome| Ok::<_, Reason>(outcome.is_ok()));
        let from_reason = P::<i32>::reject(Reason::Code(1))
            .then_outcome(|outcome| Ok::<_, Reason>(outcome.is_ok()));
        assert_eq!(block_on(from_value), Some(Ok(true)));
        assert_eq!(block_on(from_reason), Some(Ok(false)));
    }

    #[test]
    fn test_finally_forwards_original_outcome() {
        let calls = recorder();
        let seen = calls.clone();
        let rejected = P::<i32>::reject(Reason::Code(3)).finally(move || {
            seen.borrow_mut().push("finally");
            Ok::<_, Reason>(100)
        });
        assert_eq!(block_on(rejected), Some(Err(Reason::Code(3))));
        assert_eq!(*calls.borrow(), vec!["finally"]);

        let fulfilled = P::resolve(Ok(8)).finally(|| Ok::<_, Reason>("ignored"));
        assert_eq!(block_on(fulfilled), Some(Ok(8)));
    }

    #[test]
    fn test_finally_waits_for_its_own_promise() {
        let order = recorder();
        let (early, late) = (order.clone(), order.clone());
        let chained = P::resolve(Ok(1))
            .finally(move || {
                Promise::<(), Reason>::new(move |fulfill, _| {
                    event_loop::set_timeout(10, move || {
                        early.borrow_mut().push("cleanup");
                        fulfill(());
                    });
                })
            })
            .then(move |value| {
                late.borrow_mut().push("after");
                Ok::<_, Reason>(value)
            });
        assert_eq!(block_on(chained), Some(Ok(1)));
        assert_eq!(*order.borrow(), vec!["cleanup", "after"]);
    }

    #[test]
    fn test_finally_own_rejection_wins() {
        let promise = P::resolve(Ok(1)).finally(|| P::<()>::reject(Reason::Code(5)));
        assert_eq!(block_on(promise), Some(Err(Reason::Code(5))));
    }

    #[test]
    fn test_is_and_display() {
        let promise = P::resolve(Ok(1));
        assert!(P::<i32>::is(&promise));
        assert!(!P::<i32>::is(&1));
        assert!(!P::<u8>::is(&promise));
        assert_eq!(promise.to_string(), "[object PromiseLike]");
        assert_eq!(format!("{:?}", promise), "Promise { state: Pending }");
        run();
        assert_eq!(format!("{:?}", promise), "Promise { value: 1 }");
    }

    #[test]
    fn test_dropping_long_pending_chain() {
        let deferred = P::<i32>::deferred();
        let marker = Rc::new(());
        let held = marker.clone();
        let mut tail = deferred.promise().then(move |value| {
            let _ = &held;
            Ok::<_, Reason>(value)
        });
        for _ in 0..100_000 {
            tail = tail.then(|value| Ok::<_, Reason>(value + 1));
        }
        drop(tail);
        drop(deferred);
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    #[test]
    fn test_long_chain_still_settles() {
        let deferred = P::<i32>::deferred();
        let mut tail = deferred.promise().then(|value| Ok::<_, Reason>(value));
        for _ in 0..1_000 {
            tail = tail.then(|value| Ok::<_, Reason>(value + 1));
        }
        deferred.resolve(0);
        assert_eq!(block_on(tail), Some(Ok(1_000)));
    }

    #[test]
    fn test_await_inside_block_on() {
        let first = P::resolve(Ok(2));
        let second = P::new(|fulfill, _| {
            event_loop::set_timeout(3, move || fulfill(5));
        });
        let sum = block_on(async move {
            let a = first.await?;
            let b = second.await?;
            Ok::<_, Reason>(a + b)
        });
        assert_eq!(sum, Some(Ok(7)));
    }
}
