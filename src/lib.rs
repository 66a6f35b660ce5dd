//! # pullflow: backpressure-aware pull-based stream operators
//!
//! A library of composable asynchronous stream operators built on a
//! pull-based publish/subscribe protocol: producers emit values only in
//! response to explicit numeric [`Demand`], and demand, values,
//! cancellation and completion each flow through a stage in a fixed
//! direction, exactly once where the protocol says exactly once.
//!
//! ## Quick Start
//!
//! ```rust
//! use pullflow::prelude::*;
//! use std::sync::{Arc, Mutex};
//!
//! let doubled = Arc::new(Mutex::new(Vec::new()));
//! let sink = {
//!   let doubled = doubled.clone();
//!   SteadyDemand::new(move |v: i32| doubled.lock().unwrap().push(v), |_| {})
//! };
//!
//! publisher::from_iter(1..=3)
//!   .async_map(|v, promise: Promise<i32, std::convert::Infallible>| {
//!     promise.deliver_last(v * 2);
//!   })
//!   .subscribe(sink);
//!
//! assert_eq!(*doubled.lock().unwrap(), vec![2, 4, 6]);
//! ```
//!
//! ## Key Concepts
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Demand`] | How many more values a consumer will accept |
//! | [`Publisher`] / [`Subscriber`] | The two halves of the pull protocol |
//! | [`Subscription`] | The consumer's handle for demand and cancellation |
//! | [`ConduitCell`] | The guarded state machine custom stages are built from |
//! | [`Scheduler`] | Injected timer capability (deterministic in tests) |
//!
//! ## Custom stages
//!
//! Every operator in [`ops`] is built from the same discipline: a
//! [`ConduitCell`] moving `AwaitingSubscription -> Active -> Terminated`
//! under one lock, side effects computed under the lock and performed
//! after it, and a terminal event claimed by exactly one thread through
//! the cell's atomic swap. The three shipped stages (the sequential
//! transform, the sequential flattener and the delayed retry) are the
//! reference implementations of that discipline.
//!
//! [`Demand`]: demand::Demand
//! [`Publisher`]: publisher::Publisher
//! [`Subscriber`]: subscriber::Subscriber
//! [`Subscription`]: subscription::Subscription
//! [`ConduitCell`]: conduit::ConduitCell
//! [`Scheduler`]: scheduler::Scheduler
//! [`ops`]: ops

pub mod conduit;
pub mod demand;
pub mod ops;
pub mod prelude;
pub mod publisher;
pub mod rc;
pub mod scheduler;
pub mod sink;
pub mod subscriber;
pub mod subscription;
pub mod testing;

pub use prelude::*;
