use crate::prelude::*;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Creates a publisher that produces no values and completes immediately
/// after acknowledging the subscription.
pub fn empty<Item, Err>() -> Empty<Item, Err> {
  Empty(PhantomData)
}

/// Creates a publisher that produces no values and fails immediately with
/// the given error.
pub fn fail<Item, Err>(error: Err) -> Fail<Item, Err> {
  Fail { error, _i: PhantomData }
}

#[derive(Clone)]
pub struct Empty<Item, Err>(PhantomData<(Item, Err)>);

#[derive(Clone)]
pub struct Fail<Item, Err> {
  error: Err,
  _i: PhantomData<Item>,
}

/// Completion needs no demand: only values are gated by backpressure, so
/// both trivial publishers terminate straight after the acknowledgment,
/// unless the subscriber cancelled from inside it.
fn terminate_immediately<S>(mut subscriber: S, completion: Completion<S::Err>)
where
  S: Subscriber,
{
  let cancelled = Arc::new(AtomicBool::new(false));
  subscriber.on_subscribe(Box::new(TrivialSubscription(cancelled.clone())));
  if !cancelled.load(Ordering::SeqCst) {
    subscriber.on_complete(completion);
  }
}

impl<Item, Err> Publisher for Empty<Item, Err>
where
  Item: Send + 'static,
  Err: Send + 'static,
{
  type Item = Item;
  type Err = Err;

  fn subscribe<S>(self, subscriber: S)
  where
    S: Subscriber<Item = Item, Err = Err> + Send + 'static,
  {
    terminate_immediately(subscriber, Completion::Finished);
  }
}

impl<Item, Err> Publisher for Fail<Item, Err>
where
  Item: Send + 'static,
  Err: Send + 'static,
{
  type Item = Item;
  type Err = Err;

  fn subscribe<S>(self, subscriber: S)
  where
    S: Subscriber<Item = Item, Err = Err> + Send + 'static,
  {
    terminate_immediately(subscriber, Completion::Failed(self.error));
  }
}

struct TrivialSubscription(Arc<AtomicBool>);

impl Subscription for TrivialSubscription {
  fn request(&mut self, _: Demand) {}

  fn cancel(&mut self) { self.0.store(true, Ordering::SeqCst); }
}

#[cfg(test)]
mod test {
  use crate::prelude::*;
  use crate::testing::TestSubscriber;

  #[test]
  fn empty_completes_without_demand() {
    let sub = TestSubscriber::<i32, ()>::withhold();
    publisher::empty().subscribe(sub.clone());
    assert!(sub.values().is_empty());
    assert_eq!(sub.completion(), Some(Completion::Finished));
  }

  #[test]
  fn fail_forwards_the_error() {
    let sub = TestSubscriber::<i32, &str>::unlimited();
    publisher::fail::<i32, _>("boom").subscribe(sub.clone());
    assert_eq!(sub.completion(), Some(Completion::Failed("boom")));
  }
}
