//! In-process instruments for exercising publishers and subscribers.
//!
//! [`TestSubscriber`] is a recording consumer with a scriptable demand
//! policy; [`ManualPublisher`] is a push-only producer driven from test
//! code, for exercising stages under an upstream that disregards
//! backpressure. Both are ordinary protocol citizens, so they compose with
//! every operator in the crate.

use crate::prelude::*;
use std::sync::{Arc, Mutex};

struct TestSubscriberInner<Item, Err> {
  initial: Demand,
  replenish: Demand,
  values: Vec<Item>,
  completions: Vec<Completion<Err>>,
  subscription: Option<BoxSubscription>,
  acknowledgments: usize,
  cancelled: bool,
}

/// A recording subscriber for tests.
///
/// Clones share the same record, so a test keeps one handle and hands a
/// clone to [`Publisher::subscribe`]. The demand policy is fixed at
/// construction: an initial grant plus an optional per-value replenishment
/// returned through `on_next`.
///
/// ```rust
/// use pullflow::prelude::*;
/// use pullflow::testing::TestSubscriber;
///
/// let sub = TestSubscriber::<i32, ()>::unlimited();
/// publisher::from_iter(0..3).subscribe(sub.clone());
/// assert_eq!(sub.values(), vec![0, 1, 2]);
/// assert_eq!(sub.completion(), Some(Completion::Finished));
/// ```
pub struct TestSubscriber<Item, Err> {
  inner: Arc<Mutex<TestSubscriberInner<Item, Err>>>,
}

impl<Item, Err> Clone for TestSubscriber<Item, Err> {
  fn clone(&self) -> Self {
    TestSubscriber { inner: self.inner.clone() }
  }
}

impl<Item, Err> TestSubscriber<Item, Err> {
  fn with_policy(initial: Demand, replenish: Demand) -> Self {
    TestSubscriber {
      inner: Arc::new(Mutex::new(TestSubscriberInner {
        initial,
        replenish,
        values: Vec::new(),
        completions: Vec::new(),
        subscription: None,
        acknowledgments: 0,
        cancelled: false,
      })),
    }
  }

  /// Requests unlimited demand at subscription time.
  pub fn unlimited() -> Self {
    Self::with_policy(Demand::UNLIMITED, Demand::NONE)
  }

  /// Requests nothing until the test calls
  /// [`request`](TestSubscriber::request).
  pub fn withhold() -> Self { Self::with_policy(Demand::NONE, Demand::NONE) }

  /// Requests `demand` once at subscription time.
  pub fn prefetch(demand: Demand) -> Self {
    Self::with_policy(demand, Demand::NONE)
  }

  /// Additionally grants `demand` through the return value of every
  /// `on_next`.
  pub fn replenish(self, demand: Demand) -> Self {
    self.inner.lock().unwrap().replenish = demand;
    self
  }

  /// Requests more demand through the captured subscription.
  pub fn request(&self, demand: Demand) {
    let sub = self.inner.lock().unwrap().subscription.take();
    if let Some(mut sub) = sub {
      sub.request(demand);
      let mut inner = self.inner.lock().unwrap();
      if !inner.cancelled && inner.subscription.is_none() {
        inner.subscription = Some(sub);
      }
    }
  }

  /// Cancels the captured subscription.
  pub fn cancel(&self) {
    let sub = {
      let mut inner = self.inner.lock().unwrap();
      inner.cancelled = true;
      inner.subscription.take()
    };
    if let Some(mut sub) = sub {
      sub.cancel();
    }
  }

  /// Snapshot of every value received so far.
  pub fn values(&self) -> Vec<Item>
  where
    Item: Clone,
  {
    self.inner.lock().unwrap().values.clone()
  }

  /// The first terminal event, if any arrived.
  pub fn completion(&self) -> Option<Completion<Err>>
  where
    Err: Clone,
  {
    self.inner.lock().unwrap().completions.first().cloned()
  }

  /// How many terminal events arrived. Anything above one is a protocol
  /// bug in the producer under test.
  pub fn terminal_count(&self) -> usize {
    self.inner.lock().unwrap().completions.len()
  }

  pub fn is_terminated(&self) -> bool { self.terminal_count() > 0 }

  /// How many `on_subscribe` acknowledgments arrived.
  pub fn acknowledgments(&self) -> usize {
    self.inner.lock().unwrap().acknowledgments
  }
}

impl<Item, Err> Subscriber for TestSubscriber<Item, Err>
where
  Item: Send + 'static,
  Err: Send + 'static,
{
  type Item = Item;
  type Err = Err;

  fn on_subscribe(&mut self, subscription: BoxSubscription) {
    let initial = {
      let mut inner = self.inner.lock().unwrap();
      inner.acknowledgments += 1;
      inner.subscription = Some(subscription);
      inner.initial
    };
    if initial.has_any() {
      self.request(initial);
    }
  }

  fn on_next(&mut self, value: Item) -> Demand {
    let mut inner = self.inner.lock().unwrap();
    inner.values.push(value);
    inner.replenish
  }

  fn on_complete(&mut self, completion: Completion<Err>) {
    self.inner.lock().unwrap().completions.push(completion);
  }
}

struct ManualBook {
  requested: Demand,
  request_calls: usize,
  attempts: usize,
  cancelled: bool,
}

struct ManualShared<Item, Err> {
  book: Mutex<ManualBook>,
  // Kept apart from the bookkeeping lock: delivery holds this cell's lock
  // while the consumer runs, and the consumer may synchronously call
  // `request` back into the bookkeeping side. A plain option rather than
  // a conduit slot so re-subscription (the retry stage does this)
  // replaces the consumer.
  down: MutArc<Option<BoxSubscriber<Item, Err>>>,
}

/// A push-only producer driven from test code.
///
/// It acknowledges subscriptions and records the demand it is granted, but
/// [`emit`](ManualPublisher::emit) pushes values regardless of demand:
/// exactly the misbehaving upstream the buffering stages have to survive.
pub struct ManualPublisher<Item, Err> {
  shared: Arc<ManualShared<Item, Err>>,
}

impl<Item, Err> Clone for ManualPublisher<Item, Err> {
  fn clone(&self) -> Self {
    ManualPublisher { shared: self.shared.clone() }
  }
}

impl<Item, Err> Default for ManualPublisher<Item, Err> {
  fn default() -> Self { Self::new() }
}

impl<Item, Err> ManualPublisher<Item, Err> {
  pub fn new() -> Self {
    ManualPublisher {
      shared: Arc::new(ManualShared {
        book: Mutex::new(ManualBook {
          requested: Demand::NONE,
          request_calls: 0,
          attempts: 0,
          cancelled: false,
        }),
        down: MutArc::own(None),
      }),
    }
  }

  /// Clears the cancelled flag, so a re-subscription after a failure (the
  /// retry stage does this) gets a live producer again.
  fn revive(&self) { self.shared.book.lock().unwrap().cancelled = false; }

  /// Pushes one value to the current subscriber, ignoring demand. The
  /// extra demand the consumer grants in response is still recorded.
  pub fn emit(&self, value: Item) {
    if self.is_cancelled() {
      return;
    }
    let extra = match self.shared.down.rc_deref_mut().as_mut() {
      Some(down) => down.on_next(value),
      None => return,
    };
    if extra.has_any() {
      self.shared.book.lock().unwrap().requested += extra;
    }
  }

  /// Completes the current subscriber.
  pub fn finish(&self) { self.terminate(Completion::Finished); }

  /// Fails the current subscriber.
  pub fn fail(&self, error: Err) {
    self.terminate(Completion::Failed(error));
  }

  fn terminate(&self, completion: Completion<Err>) {
    if self.is_cancelled() {
      return;
    }
    let taken = self.shared.down.rc_deref_mut().take();
    if let Some(mut down) = taken {
      down.on_complete(completion);
    }
  }

  /// Cumulative demand granted across `request` calls and `on_next`
  /// returns.
  pub fn requested(&self) -> Demand {
    self.shared.book.lock().unwrap().requested
  }

  /// Number of `request` calls received.
  pub fn request_calls(&self) -> usize {
    self.shared.book.lock().unwrap().request_calls
  }

  /// Number of times this publisher has been subscribed.
  pub fn attempts(&self) -> usize {
    self.shared.book.lock().unwrap().attempts
  }

  pub fn is_cancelled(&self) -> bool {
    self.shared.book.lock().unwrap().cancelled
  }

  /// `true` while a subscriber is attached and neither cancelled nor
  /// completed.
  pub fn is_subscribed(&self) -> bool {
    !self.is_cancelled() && self.shared.down.rc_deref_mut().is_some()
  }
}

impl<Item, Err> Publisher for ManualPublisher<Item, Err>
where
  Item: Send + 'static,
  Err: Send + 'static,
{
  type Item = Item;
  type Err = Err;

  fn subscribe<S>(self, mut subscriber: S)
  where
    S: Subscriber<Item = Item, Err = Err> + Send + 'static,
  {
    self.revive();
    self.shared.book.lock().unwrap().attempts += 1;
    subscriber.on_subscribe(Box::new(ManualSubscription {
      shared: self.shared.clone(),
    }));
    let boxed: BoxSubscriber<Item, Err> = Box::new(subscriber);
    *self.shared.down.rc_deref_mut() = Some(boxed);
  }
}

struct ManualSubscription<Item, Err> {
  shared: Arc<ManualShared<Item, Err>>,
}

impl<Item, Err> Subscription for ManualSubscription<Item, Err> {
  fn request(&mut self, demand: Demand) {
    let mut book = self.shared.book.lock().unwrap();
    book.requested += demand;
    book.request_calls += 1;
  }

  fn cancel(&mut self) {
    // Flag only: cancellation may arrive from inside a delivery, while
    // this very thread holds the consumer cell's lock.
    self.shared.book.lock().unwrap().cancelled = true;
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn manual_publisher_records_demand_and_cancel() {
    let source = ManualPublisher::<i32, ()>::new();
    let sub = TestSubscriber::<i32, ()>::prefetch(Demand::finite(2))
      .replenish(Demand::finite(1));
    source.clone().subscribe(sub.clone());

    assert_eq!(source.attempts(), 1);
    assert_eq!(source.requested(), Demand::finite(2));

    source.emit(5);
    assert_eq!(source.requested(), Demand::finite(3));
    assert_eq!(sub.values(), vec![5]);

    sub.cancel();
    assert!(source.is_cancelled());
    assert!(!source.is_subscribed());
    source.emit(6);
    assert_eq!(sub.values(), vec![5]);
  }

  #[test]
  fn terminal_events_stop_after_the_first() {
    let source = ManualPublisher::<i32, &str>::new();
    let sub = TestSubscriber::<i32, &str>::unlimited();
    source.clone().subscribe(sub.clone());

    source.finish();
    source.fail("late");
    assert_eq!(sub.terminal_count(), 1);
    assert_eq!(sub.completion(), Some(Completion::Finished));
  }
}
