use crate::error::Error;
use crate::promise::Promise;

/// Completion callback handed to a function adapted by [`Promise::wrap`].
pub type Callback<T, E> = Box<dyn FnOnce(Result<T, E>)>;

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Adapts a callback-style function into one returning a promise.
    ///
    /// `f` receives the call's arguments and a [`Callback`]; `Ok` fulfills
    /// and `Err` rejects. Multiple arguments travel as a tuple. A panic in `f`
    /// rejects like a panicking executor.
    ///
    /// ```
    /// use promise_like::{event_loop, Callback, Error, Promise};
    ///
    /// let add = Promise::wrap(|(a, b): (i32, i32), done: Callback<i32, Error>| done(Ok(a + b)));
    /// assert_eq!(event_loop::block_on(add((2, 3))), Some(Ok(5)));
    /// ```
    pub fn wrap<A, F>(f: F) -> impl Fn(A) -> Self
    where
        F: Fn(A, Callback<T, E>),
    {
        move |args| {
            Self::new(|fulfill, reject| {
                let done: Callback<T, E> = Box::new(move |result| match result {
                    Ok(value) => fulfill(value),
                    Err(reason) => reject(reason),
                });
                f(args, done)
            })
        }
    }
}
