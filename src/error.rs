use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// Reasons the crate itself rejects a promise with.
///
/// A promise's reason type `E` must implement `From<Error>` so these can be
/// injected into user chains.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Promise resolver is not a function")]
    MissingExecutor,
    #[error("Chaining cycle detected for promise")]
    ChainingCycle,
    #[error("executor panicked: {0}")]
    ExecutorPanicked(String),
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),
    #[error("thenable panicked: {0}")]
    ThenablePanicked(String),
}

/// Every input of [`Promise::any`](crate::Promise::any) was rejected.
///
/// `errors` holds the reasons in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateError<E> {
    pub errors: Vec<E>,
}

impl<E> AggregateError<E> {
    pub fn new(errors: Vec<E>) -> Self {
        Self { errors }
    }
}

impl<E> fmt::Display for AggregateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "All promises were rejected ({} reasons)", self.errors.len())
    }
}

impl<E: fmt::Debug> std::error::Error for AggregateError<E> {}

/// An internal failure inside an `any` chain surfaces as a one-reason aggregate.
impl<E: From<Error>> From<Error> for AggregateError<E> {
    fn from(err: Error) -> Self {
        Self {
            errors: vec![E::from(err)],
        }
    }
}

/// Runs `f`, turning a panic into its message.
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(&*payload))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
