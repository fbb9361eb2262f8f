//! The Promise/A+ resolution procedure: how a handler's return value settles
//! the promise `then` produced.
use crate::error::{catch_panic, Error};
use crate::promise::Promise;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::{debug, warn};

/// Capability handed to [`Thenable::then`] to resolve the adopting promise.
/// The argument is itself resolved, so it may be another thenable.
pub type ResolvePromise<T, E> = Rc<dyn Fn(Resolution<T, E>)>;
/// Capability handed to [`Thenable::then`] to reject the adopting promise.
pub type RejectPromise<E> = Rc<dyn Fn(E)>;

/// Anything exposing a callable `then`.
///
/// Promises implement it, and so can foreign future-like types, which are then
/// adopted transparently. Only the first capability call has an effect; an
/// `Err` returned after a capability fired is ignored.
///
/// ```
/// use promise_like::{
///     event_loop, Error, Promise, RejectPromise, Resolution, ResolvePromise, Thenable,
/// };
/// use std::rc::Rc;
///
/// struct Five;
///
/// impl Thenable<i32, Error> for Five {
///     fn then(
///         &self,
///         resolve: ResolvePromise<i32, Error>,
///         _: RejectPromise<Error>,
///     ) -> Result<(), Error> {
///         resolve(Resolution::Value(5));
///         Ok(())
///     }
/// }
///
/// let adopted = Promise::<i32, Error>::resolve(Resolution::Thenable(Rc::new(Five)));
/// assert_eq!(event_loop::block_on(adopted), Some(Ok(5)));
/// ```
pub trait Thenable<T, E> {
    fn then(&self, resolve: ResolvePromise<T, E>, reject: RejectPromise<E>) -> Result<(), E>;
}

/// What a handler produced.
pub enum Resolution<T, E> {
    /// A plain value; fulfills.
    Value(T),
    /// The handler failed; rejects.
    Reject(E),
    /// A promise to adopt.
    Promise(Promise<T, E>),
    /// A foreign thenable to adopt.
    Thenable(Rc<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E> {
    /// Builds a resolution from a `then` lookup that may itself fail.
    pub fn from_lookup(lookup: Result<Rc<dyn Thenable<T, E>>, E>) -> Self {
        match lookup {
            Ok(thenable) => Resolution::Thenable(thenable),
            Err(reason) => Resolution::Reject(reason),
        }
    }
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Promise(promise)
    }
}

impl<T, E> From<Result<T, E>> for Resolution<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Resolution::Value(value),
            Err(reason) => Resolution::Reject(reason),
        }
    }
}

/// Types a handler may return.
///
/// `Ok` fulfills, `Err` rejects (the handler "threw"), and promises or
/// [`Resolution`]s are resolved as-is.
pub trait IntoResolution<E> {
    type Value;

    fn into_resolution(self) -> Resolution<Self::Value, E>;
}

impl<T, E> IntoResolution<E> for Result<T, E> {
    type Value = T;

    fn into_resolution(self) -> Resolution<T, E> {
        self.into()
    }
}

impl<T, E> IntoResolution<E> for Promise<T, E> {
    type Value = T;

    fn into_resolution(self) -> Resolution<T, E> {
        Resolution::Promise(self)
    }
}

impl<T, E> IntoResolution<E> for Resolution<T, E> {
    type Value = T;

    fn into_resolution(self) -> Resolution<T, E> {
        self
    }
}

impl<T, E> Thenable<T, E> for Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    fn then(
        &self,
        resolve: ResolvePromise<T, E>,
        reject: RejectPromise<E>,
    ) -> Result<(), E> {
        self.subscribe(
            Box::new(move |value| resolve(Resolution::Value(value))),
            Box::new(move |reason| reject(reason)),
        );
        Ok(())
    }
}

/// Guards one `then` invocation.
struct Adoption<T, E> {
    called: Cell<bool>,
    // true while `then` is still on the stack
    in_then: Cell<bool>,
    handoff: RefCell<Option<Resolution<T, E>>>,
}

impl<T, E> Adoption<T, E> {
    fn new() -> Self {
        Self {
            called: Cell::new(false),
            in_then: Cell::new(true),
            handoff: RefCell::new(None),
        }
    }

    /// True for the first capability call only.
    fn claim(&self) -> bool {
        !self.called.replace(true)
    }
}

/// Settles `promise` from `x`.
///
/// A thenable that calls `resolve` synchronously hands its value back to this
/// loop instead of recursing, so stack depth stays flat however long the
/// adoption chain is. Asynchronous calls start a fresh procedure.
pub(crate) fn resolve_promise<T, E>(promise: &Promise<T, E>, x: Resolution<T, E>)
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    let mut x = x;
    loop {
        let thenable: Rc<dyn Thenable<T, E>> = match x {
            Resolution::Value(value) => return promise.settle(Ok(value)),
            Resolution::Reject(reason) => return promise.settle(Err(reason)),
            Resolution::Promise(other) if other.ptr_eq(promise) => {
                debug!("chaining cycle detected");
                return promise.settle(Err(E::from(Error::ChainingCycle)));
            }
            Resolution::Promise(other) => Rc::new(other),
            Resolution::Thenable(thenable) => thenable,
        };

        let adoption = Rc::new(Adoption::new());
        let resolve: ResolvePromise<T, E> = {
            let (adoption, promise) = (adoption.clone(), promise.clone());
            Rc::new(move |y| {
                if !adoption.claim() {
                    return;
                }
                if adoption.in_then.get() {
                    *adoption.handoff.borrow_mut() = Some(y);
                } else {
                    resolve_promise(&promise, y);
                }
            })
        };
        let reject: RejectPromise<E> = {
            let (adoption, promise) = (adoption.clone(), promise.clone());
            Rc::new(move |reason| {
                if adoption.claim() {
                    promise.settle(Err(reason));
                }
            })
        };

        let failure = match catch_panic(|| thenable.then(resolve, reject)) {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(reason),
            Err(message) => {
                warn!(%message, "thenable panicked");
                Some(E::from(Error::ThenablePanicked(message)))
            }
        };
        adoption.in_then.set(false);
        if let Some(reason) = failure {
            if adoption.claim() {
                return promise.settle(Err(reason));
            }
        }
        let handoff = adoption.handoff.borrow_mut().take();
        match handoff {
            Some(y) => x = y,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{self, block_on};
    use crate::test_support::Reason;

    type P<T> = Promise<T, Reason>;

    /// Resolves synchronously through that many nested thenables.
    struct Nested(u32);

    impl Thenable<u32, Reason> for Nested {
        fn then(
            &self,
            resolve: ResolvePromise<u32, Reason>,
            _: RejectPromise<Reason>,
        ) -> Result<(), Reason> {
            if self.0 == 0 {
                resolve(Resolution::Value(42));
            } else {
                resolve(Resolution::Thenable(Rc::new(Nested(self.0 - 1))));
            }
            Ok(())
        }
    }

    /// Calls every capability it is given, then fails.
    struct Unruly;

    impl Thenable<u32, Reason> for Unruly {
        fn then(
            &self,
            resolve: ResolvePromise<u32, Reason>,
            reject: RejectPromise<Reason>,
        ) -> Result<(), Reason> {
            resolve(Resolution::Value(1));
            reject(Reason::Code(2));
            resolve(Resolution::Value(3));
            Err(Reason::Code(4))
        }
    }

    struct FailsFirst;

    impl Thenable<u32, Reason> for FailsFirst {
        fn then(
            &self,
            resolve: ResolvePromise<u32, Reason>,
            _: RejectPromise<Reason>,
        ) -> Result<(), Reason> {
            event_loop::defer(move || resolve(Resolution::Value(1)));
            Err(Reason::Code(9))
        }
    }

    struct Panics;

    impl Thenable<u32, Reason> for Panics {
        fn then(
            &self,
            _: ResolvePromise<u32, Reason>,
            _: RejectPromise<Reason>,
        ) -> Result<(), Reason> {
            panic!("thenable blew up")
        }
    }

    /// Settles on a later tick, once per capability.
    struct Later(Result<u32, Reason>);

    impl Thenable<u32, Reason> for Later {
        fn then(
            &self,
            resolve: ResolvePromise<u32, Reason>,
            reject: RejectPromise<Reason>,
        ) -> Result<(), Reason> {
            let outcome = self.0.clone();
            event_loop::set_timeout(1, move || match outcome {
                Ok(value) => resolve(Resolution::Thenable(Rc::new(Nested(value)))),
                Err(reason) => reject(reason),
            });
            Ok(())
        }
    }

    fn adopt(thenable: impl Thenable<u32, Reason> + 'static) -> P<u32> {
        P::resolve(Resolution::Thenable(Rc::new(thenable)))
    }

    #[test]
    fn test_adopts_thenable() {
        assert_eq!(block_on(adopt(Nested(0))), Some(Ok(42)));
    }

    #[test]
    fn test_deep_sync_chain_does_not_grow_the_stack() {
        assert_eq!(block_on(adopt(Nested(200_000))), Some(Ok(42)));
    }

    #[test]
    fn test_only_first_capability_counts() {
        assert_eq!(block_on(adopt(Unruly)), Some(Ok(1)));
    }

    #[test]
    fn test_error_before_capability_rejects() {
        assert_eq!(block_on(adopt(FailsFirst)), Some(Err(Reason::Code(9))));
    }

    #[test]
    fn test_thenable_panic_rejects() {
        assert_eq!(
            block_on(adopt(Panics)),
            Some(Err(Reason::Internal(Error::ThenablePanicked("thenable blew up".into()))))
        );
    }

    #[test]
    fn test_async_capabilities() {
        assert_eq!(block_on(adopt(Later(Ok(3)))), Some(Ok(42)));
        assert_eq!(block_on(adopt(Later(Err(Reason::Code(5))))), Some(Err(Reason::Code(5))));
    }

    #[test]
    fn test_failed_lookup_rejects() {
        let promise = P::<u32>::resolve(Resolution::from_lookup(Err(Reason::Code(6))));
        assert_eq!(block_on(promise), Some(Err(Reason::Code(6))));
    }

    #[test]
    fn test_nested_promises_are_adopted() {
        let inner = P::new(|fulfill, _| fulfill(7));
        let outer = P::resolve(Ok(0)).then(move |_| P::resolve(Ok(0)).then(move |_| inner));
        assert_eq!(block_on(outer), Some(Ok(7)));
    }

    #[test]
    fn test_resolve_passes_promises_through() {
        let promise = P::resolve(Ok(1));
        assert!(P::resolve(promise.clone()).ptr_eq(&promise));
    }
}
