use crate::ops::{
  async_map::{AsyncMapOp, Promise},
  concat_all::ConcatAllOp,
  into_stream::PublisherStream,
  retry_delayed::{RetryDelayedOp, RetryDelays},
};
use crate::prelude::*;
use std::marker::PhantomData;

mod deferred;
mod from_future;
mod from_iter;
mod just;
mod trivial;

pub use deferred::{deferred, Deferred};
pub use from_future::{from_future, FromFuture};
pub use from_iter::{from_iter, FromIter};
pub use just::{just, Just};
pub use trivial::{empty, fail, Empty, Fail};

/// The producer half of the pull protocol.
///
/// A publisher is an inert blueprint: nothing happens until
/// [`subscribe`](Publisher::subscribe) hands it a [`Subscriber`]. From then
/// on the subscriber drives it through the [`Subscription`] it is given,
/// and receives values only in response to demand.
///
/// ```rust
/// use pullflow::prelude::*;
/// use std::sync::{Arc, Mutex};
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = {
///   let seen = seen.clone();
///   SteadyDemand::new(move |v: i32| seen.lock().unwrap().push(v), |_: Completion<()>| {})
/// };
/// publisher::from_iter(1..=3).subscribe(sink);
/// assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
/// ```
pub trait Publisher {
  type Item;
  type Err;

  /// Starts the subscription. The subscriber receives `on_subscribe`
  /// exactly once before anything else.
  fn subscribe<S>(self, subscriber: S)
  where
    Self: Sized,
    S: Subscriber<Item = Self::Item, Err = Self::Err> + Send + 'static;

  /// Transforms every value through an asynchronous closure, one value in
  /// flight at a time.
  ///
  /// The closure receives each upstream value together with a
  /// [`Promise`]; it may resolve the promise immediately or from any other
  /// thread, and may deliver several results per input before finishing.
  /// The next upstream value is not pulled until the current promise has
  /// finished. See [`AsyncMapOp`] for the full contract.
  ///
  /// ```rust
  /// use pullflow::prelude::*;
  /// use std::sync::{Arc, Mutex};
  ///
  /// let seen = Arc::new(Mutex::new(Vec::new()));
  /// let sink = {
  ///   let seen = seen.clone();
  ///   SteadyDemand::new(move |v: i32| seen.lock().unwrap().push(v), |_| {})
  /// };
  /// publisher::from_iter(1..=2)
  ///   .async_map(|v, promise: Promise<i32, std::convert::Infallible>| {
  ///     promise.deliver(v * 10);
  ///     promise.deliver_last(v * 10 + 1);
  ///   })
  ///   .subscribe(sink);
  /// assert_eq!(*seen.lock().unwrap(), vec![10, 11, 20, 21]);
  /// ```
  fn async_map<T, F>(self, transform: F) -> AsyncMapOp<Self, F, T>
  where
    Self: Sized,
    F: Fn(Self::Item, Promise<T, Self::Err>),
  {
    AsyncMapOp { source: self, transform, _t: PhantomData }
  }

  /// Flattens a publisher of publishers, draining exactly one child at a
  /// time and buffering children that arrive early. See [`ConcatAllOp`].
  fn concat_all(self) -> ConcatAllOp<Self>
  where
    Self: Sized,
    Self::Item: Publisher<Err = Self::Err>,
  {
    ConcatAllOp { source: self }
  }

  /// Re-subscribes to this publisher after a failure, waiting the next
  /// interval from `delays` before each attempt. Once the list is
  /// exhausted the final failure is forwarded. See [`RetryDelayedOp`].
  ///
  /// The scheduler is an explicit capability so callers can drive retries
  /// with a deterministic clock in tests.
  fn retry_delayed<Sch>(
    self,
    delays: RetryDelays,
    scheduler: Sch,
  ) -> RetryDelayedOp<Self, Sch>
  where
    Self: Sized + Clone,
    Sch: Scheduler,
  {
    RetryDelayedOp { source: self, delays, scheduler }
  }

  /// Erases the concrete publisher type.
  fn boxed(self) -> BoxPublisher<Self::Item, Self::Err>
  where
    Self: Sized + Send + 'static,
  {
    BoxPublisher(Box::new(self))
  }

  /// Bridges this publisher into a `futures` [`Stream`](futures::Stream)
  /// of `Result<Item, Err>`. Each poll with an empty buffer requests one
  /// more value; dropping the stream cancels the subscription.
  fn into_stream(self) -> PublisherStream<Self::Item, Self::Err>
  where
    Self: Sized,
    Self::Item: Send + 'static,
    Self::Err: Send + 'static,
  {
    PublisherStream::subscribe_to(self)
  }
}

/// Object-safe subscription entry used by [`BoxPublisher`].
trait DynPublisher<Item, Err> {
  fn dyn_subscribe(self: Box<Self>, subscriber: BoxSubscriber<Item, Err>);
}

impl<P> DynPublisher<P::Item, P::Err> for P
where
  P: Publisher,
  P::Item: 'static,
  P::Err: 'static,
{
  fn dyn_subscribe(
    self: Box<Self>,
    subscriber: BoxSubscriber<P::Item, P::Err>,
  ) {
    (*self).subscribe(subscriber)
  }
}

/// A type-erased [`Publisher`], so publishers of different concrete types
/// can share one item type; a publisher of children handed to
/// [`concat_all`](Publisher::concat_all) usually needs this.
pub struct BoxPublisher<Item, Err>(
  Box<dyn DynPublisher<Item, Err> + Send + 'static>,
);

impl<Item: 'static, Err: 'static> Publisher for BoxPublisher<Item, Err> {
  type Item = Item;
  type Err = Err;

  fn subscribe<S>(self, subscriber: S)
  where
    S: Subscriber<Item = Item, Err = Err> + Send + 'static,
  {
    self.0.dyn_subscribe(Box::new(subscriber))
  }
}
