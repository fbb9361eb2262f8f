use crate::error::Error;
use crate::promise::{Fulfill, Promise, Reject};
use std::fmt;

/// A promise together with the capabilities that settle it from outside.
///
/// # Examples
///
/// ```
/// use promise_like::{event_loop, Deferred, Error};
///
/// let deferred = Deferred::<i32, Error>::new();
/// let promise = deferred.promise();
/// event_loop::set_timeout(10, move || deferred.resolve(7));
/// assert_eq!(event_loop::block_on(promise), Some(Ok(7)));
/// ```
pub struct Deferred<T, E = Error> {
    promise: Promise<T, E>,
    fulfill: Fulfill<T>,
    reject: Reject<E>,
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    pub fn new() -> Self {
        let promise = Promise::pending();
        let (fulfill, reject) = promise.capabilities();
        Self {
            promise,
            fulfill,
            reject,
        }
    }

    pub fn promise(&self) -> Promise<T, E> {
        self.promise.clone()
    }

    /// Fulfills the paired promise. Ignored once either capability ran.
    pub fn resolve(&self, value: T) {
        (self.fulfill)(value)
    }

    /// Rejects the paired promise. Ignored once either capability ran.
    pub fn reject(&self, reason: E) {
        (self.reject)(reason)
    }

    /// Hands out the raw capabilities, e.g. to move them into separate tasks.
    pub fn into_parts(self) -> (Promise<T, E>, Fulfill<T>, Reject<E>) {
        (self.promise, self.fulfill, self.reject)
    }
}

impl<T, E> Default for Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            fulfill: self.fulfill.clone(),
            reject: self.reject.clone(),
        }
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").field("promise", &self.promise).finish()
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Shorthand for [`Deferred::new`].
    pub fn deferred() -> Deferred<T, E> {
        Deferred::new()
    }
}
