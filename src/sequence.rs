//! Running steps strictly one after another.
use crate::error::Error;
use crate::promise::Promise;
use crate::resolution::{IntoResolution, Resolution};
use std::cell::RefCell;
use std::rc::Rc;

/// One unary step of a sequence. `None` passes the value through.
pub type Step<T, E> = Option<Rc<dyn Fn(T) -> Resolution<T, E>>>;

/// Builds a [`Step`] from any handler-shaped closure.
///
/// ```
/// use promise_like::{event_loop, step, Error, Promise};
///
/// let steps = vec![
///     step(|value: i32| Ok::<_, Error>(value + 1)),
///     None,
///     step(|value: i32| Ok(value * 2)),
/// ];
/// let result = Promise::sequence_with_init(steps, 3);
/// assert_eq!(event_loop::block_on(result), Some(Ok(8)));
/// ```
pub fn step<T, E, F, R>(f: F) -> Step<T, E>
where
    F: Fn(T) -> R + 'static,
    R: IntoResolution<E, Value = T>,
{
    Some(Rc::new(move |value| f(value).into_resolution()))
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Threads `init` through `steps`, each waiting for the previous one. A
    /// rejection skips every remaining step.
    pub fn sequence_with_init<I>(steps: I, init: T) -> Self
    where
        I: IntoIterator<Item = Step<T, E>>,
    {
        steps
            .into_iter()
            .fold(Self::resolve(Ok(init)), |acc, next| match next {
                Some(f) => acc.then(move |value| f(value)),
                None => acc.then(|value| Ok::<T, E>(value)),
            })
    }

    /// Composes `steps` into one function from a seed to the final promise.
    pub fn sequence(steps: Vec<Step<T, E>>) -> impl Fn(T) -> Self {
        move |init| Self::sequence_with_init(steps.clone(), init)
    }

    /// Calls each factory with the previous result, strictly in order, and
    /// fulfills with every factory's result. The seed itself is not included.
    pub fn sequence_by_order<I, F, R>(factories: I, init: T) -> Promise<Vec<T>, E>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(T) -> R + 'static,
        R: IntoResolution<E, Value = T>,
    {
        let results = Rc::new(RefCell::new(Vec::new()));
        let chain = factories
            .into_iter()
            .fold(Self::resolve(Ok(init)), |acc, factory| {
                let results = results.clone();
                acc.then(factory).then(move |value: T| {
                    results.borrow_mut().push(value.clone());
                    Ok::<T, E>(value)
                })
            });
        chain.then(move |_| Ok::<Vec<T>, E>(results.take()))
    }
}
