//! Promise/A+ deferred values for single-threaded Rust, plus the usual
//! combinators over them.
//!
//! A [`Promise`] settles at most once, always on the thread's
//! [`event_loop`]. Handlers return anything implementing [`IntoResolution`]:
//! `Ok`/`Err`, another promise, or a foreign [`Thenable`], which is adopted.
//!
//! # Examples
//!
//! ```
//! use promise_like::{event_loop, Error, Promise};
//!
//! let slow = Promise::<&str, Error>::delay(10, "a");
//! let fast = Promise::delay(5, "b");
//! let winner = Promise::<&str, Error>::race(vec![slow, fast])
//!     .then(|value| Ok(value.to_uppercase()));
//! assert_eq!(event_loop::block_on(winner), Some(Ok("B".to_owned())));
//! ```
pub mod combinator;
pub mod deferred;
pub mod error;
pub mod event_loop;
pub mod promise;
pub mod resolution;
pub mod sequence;
pub mod wrap;

#[cfg(test)]
mod test_support;

pub use combinator::{passthrough, Settled};
pub use deferred::Deferred;
pub use error::{AggregateError, Error};
pub use promise::{Fulfill, Promise, PromiseState, Reject};
pub use resolution::{IntoResolution, RejectPromise, Resolution, ResolvePromise, Thenable};
pub use sequence::{step, Step};
pub use wrap::Callback;
