//! Factories composing many promises into one.
//!
//! Every combinator first normalizes its inputs with [`Promise::resolve`], so
//! lists may mix promises, `Ok`/`Err` values and [`Resolution`]s.
//!
//! [`Resolution`]: crate::Resolution
use crate::error::{catch_panic, AggregateError, Error};
use crate::event_loop;
use crate::promise::{Fulfill, Promise, PromiseState};
use crate::resolution::IntoResolution;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::warn;

/// Outcome record produced by [`Promise::all_settled`].
#[derive(Debug, Clone, PartialEq)]
pub enum Settled<T, E> {
    Fulfilled { value: T },
    Rejected { reason: E },
}

impl<T, E> Settled<T, E> {
    pub fn status(&self) -> PromiseState {
        match self {
            Settled::Fulfilled { .. } => PromiseState::Fulfilled,
            Settled::Rejected { .. } => PromiseState::Rejected,
        }
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Settled::Fulfilled { value } => Ok(value),
            Settled::Rejected { reason } => Err(reason),
        }
    }
}

/// Default mapping for [`Promise::map`]: fulfills with the input unchanged.
pub fn passthrough<T>(value: T, fulfill: Fulfill<T>) {
    fulfill(value)
}

/// One slot per input, in input order.
struct Slots<V> {
    values: Vec<Option<V>>,
    remaining: usize,
}

impl<V> Slots<V> {
    fn shared(len: usize) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            values: (0..len).map(|_| None).collect(),
            remaining: len,
        }))
    }

    /// Stores `value` and returns every value once all slots are filled.
    fn fill(&mut self, index: usize, value: V) -> Option<Vec<V>> {
        if self.values[index].replace(value).is_none() {
            self.remaining -= 1;
        }
        if self.remaining == 0 {
            Some(self.values.drain(..).flatten().collect())
        } else {
            None
        }
    }
}

/// Fills `index` and fulfills with the whole list once every slot is set.
fn fill_slot<V>(slots: &Rc<RefCell<Slots<V>>>, fulfill: &Fulfill<Vec<V>>, index: usize, value: V) {
    let done = slots.borrow_mut().fill(index, value);
    if let Some(values) = done {
        fulfill(values);
    }
}

/// Counts settlements for the last-value combinators.
struct Countdown<T> {
    remaining: usize,
    latest_value: Option<T>,
}

impl<T> Countdown<T> {
    fn shared(len: usize) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            remaining: len,
            latest_value: None,
        }))
    }

    /// Counts one settlement; true when it was the last one.
    fn tick(&mut self) -> bool {
        self.remaining -= 1;
        self.remaining == 0
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    fn normalize<I>(items: I) -> Vec<Self>
    where
        I: IntoIterator,
        I::Item: IntoResolution<E, Value = T>,
    {
        items.into_iter().map(Self::resolve).collect()
    }

    /// Fulfills with every value in input order once all inputs fulfill;
    /// rejects with the first rejection. An empty list fulfills with `[]`.
    ///
    /// ```
    /// use promise_like::{event_loop, Error, Promise};
    ///
    /// let all = Promise::<i32, Error>::all(vec![Promise::resolve(Ok(1)), Promise::delay(5, 2)]);
    /// assert_eq!(event_loop::block_on(all), Some(Ok(vec![1, 2])));
    /// ```
    pub fn all<I>(items: I) -> Promise<Vec<T>, E>
    where
        I: IntoIterator,
        I::Item: IntoResolution<E, Value = T>,
    {
        let inputs = Self::normalize(items);
        Promise::new(move |fulfill, reject| {
            if inputs.is_empty() {
                return fulfill(Vec::new());
            }
            let slots = Slots::shared(inputs.len());
            for (index, input) in inputs.into_iter().enumerate() {
                let (slots, fulfill, reject) = (slots.clone(), fulfill.clone(), reject.clone());
                input.subscribe(
                    Box::new(move |value| fill_slot(&slots, &fulfill, index, value)),
                    Box::new(move |reason| reject(reason)),
                );
            }
        })
    }

    /// Settles like whichever input settles first. An empty list never
    /// settles.
    pub fn race<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: IntoResolution<E, Value = T>,
    {
        let inputs = Self::normalize(items);
        Self::new(move |fulfill, reject| {
            for input in inputs {
                let (fulfill, reject) = (fulfill.clone(), reject.clone());
                input.subscribe(
                    Box::new(move |value| fulfill(value)),
                    Box::new(move |reason| reject(reason)),
                );
            }
        })
    }

    /// Fulfills with one [`Settled`] record per input once all have settled.
    /// Never rejects.
    pub fn all_settled<I>(items: I) -> Promise<Vec<Settled<T, E>>, E>
    where
        I: IntoIterator,
        I::Item: IntoResolution<E, Value = T>,
    {
        let inputs = Self::normalize(items);
        Promise::new(move |fulfill, _| {
            if inputs.is_empty() {
                return fulfill(Vec::new());
            }
            let slots = Slots::shared(inputs.len());
            for (index, input) in inputs.into_iter().enumerate() {
                let on_value = (slots.clone(), fulfill.clone());
                let on_reason = (slots.clone(), fulfill.clone());
                input.subscribe(
                    Box::new(move |value| {
                        fill_slot(&on_value.0, &on_value.1, index, Settled::Fulfilled { value })
                    }),
                    Box::new(move |reason| {
                        fill_slot(&on_reason.0, &on_reason.1, index, Settled::Rejected { reason })
                    }),
                );
            }
        })
    }

    /// Fulfills with the first value; rejects with every reason, in input
    /// order, once all inputs reject. An empty list rejects with an empty
    /// aggregate.
    pub fn any<I>(items: I) -> Promise<T, AggregateError<E>>
    where
        I: IntoIterator,
        I::Item: IntoResolution<E, Value = T>,
    {
        let inputs = Self::normalize(items);
        Promise::new(move |fulfill, reject| {
            if inputs.is_empty() {
                return reject(AggregateError::new(Vec::new()));
            }
            let slots = Slots::shared(inputs.len());
            for (index, input) in inputs.into_iter().enumerate() {
                let (slots, fulfill, reject) = (slots.clone(), fulfill.clone(), reject.clone());
                input.subscribe(
                    Box::new(move |value| fulfill(value)),
                    Box::new(move |reason| {
                        let done = slots.borrow_mut().fill(index, reason);
                        if let Some(reasons) = done {
                            reject(AggregateError::new(reasons));
                        }
                    }),
                );
            }
        })
    }

    /// Waits for every input and fulfills with the value that settled last.
    ///
    /// With `ignore_rejected` false the first rejection propagates at once.
    /// With it true a rejection only counts toward completion; if the input
    /// that settled last was rejected, the latest fulfilled value wins, and
    /// if every input rejected the last reason is used. Inputs settling in the
    /// same tick are ordered by registration. An empty list never settles.
    pub fn last<I>(items: I, ignore_rejected: bool) -> Self
    where
        I: IntoIterator,
        I::Item: IntoResolution<E, Value = T>,
    {
        let inputs = Self::normalize(items);
        Self::new(move |fulfill, reject| {
            let countdown = Countdown::shared(inputs.len());
            for input in inputs {
                let on_value = (countdown.clone(), fulfill.clone());
                let on_reason = (countdown.clone(), fulfill.clone(), reject.clone());
                input.subscribe(
                    Box::new(move |value| {
                        let (countdown, fulfill) = on_value;
                        let done = {
                            let mut countdown = countdown.borrow_mut();
                            countdown.latest_value = Some(value.clone());
                            countdown.tick()
                        };
                        if done {
                            fulfill(value);
                        }
                    }),
                    Box::new(move |reason| {
                        let (countdown, fulfill, reject) = on_reason;
                        if !ignore_rejected {
                            return reject(reason);
                        }
                        let finished = {
                            let mut countdown = countdown.borrow_mut();
                            if countdown.tick() {
                                Some(countdown.latest_value.take())
                            } else {
                                None
                            }
                        };
                        match finished {
                            Some(Some(value)) => fulfill(value),
                            Some(None) => reject(reason),
                            None => {}
                        }
                    }),
                );
            }
        })
    }

    /// Waits for every input and adopts the outcome of whichever settled last,
    /// either branch. An empty list never settles.
    pub fn any_last<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: IntoResolution<E, Value = T>,
    {
        let inputs = Self::normalize(items);
        Self::new(move |fulfill, reject| {
            let countdown = Countdown::<T>::shared(inputs.len());
            for input in inputs {
                let on_value = (countdown.clone(), fulfill.clone());
                let on_reason = (countdown.clone(), reject.clone());
                input.subscribe(
                    Box::new(move |value| {
                        let done = on_value.0.borrow_mut().tick();
                        if done {
                            (on_value.1)(value);
                        }
                    }),
                    Box::new(move |reason| {
                        let done = on_reason.0.borrow_mut().tick();
                        if done {
                            (on_reason.1)(reason);
                        }
                    }),
                );
            }
        })
    }

    /// Maps every input through `f`, which receives the fulfilled value and
    /// the capability that fulfills its mapped slot, then combines the
    /// results with [`Promise::all`]. Use [`passthrough`] for the identity
    /// mapping.
    ///
    /// ```
    /// use promise_like::{event_loop, Error, Fulfill, Promise};
    ///
    /// let doubled =
    ///     Promise::<i32, Error>::map(vec![Ok(1), Ok(2)], |value, fulfill: Fulfill<i32>| {
    ///         fulfill(value * 2)
    ///     });
    /// assert_eq!(event_loop::block_on(doubled), Some(Ok(vec![2, 4])));
    /// ```
    pub fn map<I, F, U>(items: I, f: F) -> Promise<Vec<U>, E>
    where
        I: IntoIterator,
        I::Item: IntoResolution<E, Value = T>,
        F: Fn(T, Fulfill<U>) + 'static,
        U: Clone + 'static,
    {
        let f = Rc::new(f);
        let mapped: Vec<Promise<U, E>> = Self::normalize(items)
            .into_iter()
            .map(|input| {
                let f = f.clone();
                Promise::new(move |fulfill, reject| {
                    let on_reason = reject.clone();
                    input.subscribe(
                        Box::new(move |value| {
                            if let Err(message) = catch_panic(|| f(value, fulfill)) {
                                warn!(%message, "map function panicked");
                                reject(E::from(Error::HandlerPanicked(message)));
                            }
                        }),
                        Box::new(move |reason| on_reason(reason)),
                    );
                })
            })
            .collect();
        Promise::<U, E>::all(mapped)
    }

    /// Taps `promise` without changing its outcome. `f` runs on a later tick
    /// with a copy of the outcome; its panics are logged and dropped.
    pub fn observe<F>(promise: &Self, f: F) -> Self
    where
        F: FnOnce(Result<T, E>) + 'static,
    {
        let slot = Rc::new(RefCell::new(Some(f)));
        let on_reason = slot.clone();
        promise.subscribe(
            Box::new(move |value| notify(&slot, Ok(value))),
            Box::new(move |reason| notify(&on_reason, Err(reason))),
        );
        promise.clone()
    }

    /// Fulfills with `value` after `delay_ms` of event loop time.
    pub fn delay(delay_ms: u64, value: T) -> Self {
        Self::new(move |fulfill, _| {
            event_loop::set_timeout(delay_ms, move || fulfill(value));
        })
    }

    /// Rejects with `reason` unless `self` settles within `delay_ms`.
    pub fn timeout(&self, delay_ms: u64, reason: E) -> Self {
        let expired = Self::pending();
        let (_, expire) = expired.capabilities();
        let timer = event_loop::set_timeout(delay_ms, move || expire(reason));
        Self::observe(&Self::race([self.clone(), expired]), move |_| {
            event_loop::clear_timeout(timer);
        })
    }
}

fn notify<T, E, F>(slot: &Rc<RefCell<Option<F>>>, outcome: Result<T, E>)
where
    T: 'static,
    E: 'static,
    F: FnOnce(Result<T, E>) + 'static,
{
    let f = slot.borrow_mut().take();
    if let Some(f) = f {
        event_loop::defer(move || {
            if let Err(message) = catch_panic(move || f(outcome)) {
                warn!(%message, "observer panicked");
            }
        });
    }
}
