use crate::prelude::*;

/// The single terminal signal of a subscription: a producer finishes
/// successfully or fails with an error, exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion<Err> {
  /// The producer delivered every value it ever will.
  Finished,
  /// The producer stopped early with an error.
  Failed(Err),
}

impl<Err> Completion<Err> {
  /// `true` for [`Completion::Failed`].
  #[inline]
  pub const fn is_failure(&self) -> bool {
    matches!(self, Completion::Failed(_))
  }

  /// Maps the error carried by a failure, leaving `Finished` untouched.
  pub fn map_err<F, E2>(self, f: F) -> Completion<E2>
  where
    F: FnOnce(Err) -> E2,
  {
    match self {
      Completion::Finished => Completion::Finished,
      Completion::Failed(e) => Completion::Failed(f(e)),
    }
  }
}

/// The consumer half of the pull protocol.
///
/// A subscriber is handed to [`Publisher::subscribe`]; the producer answers
/// with exactly one [`on_subscribe`](Subscriber::on_subscribe) carrying the
/// [`Subscription`] handle, then zero or more
/// [`on_next`](Subscriber::on_next) calls, never more than the cumulative
/// demand the subscriber granted, and finally at most one
/// [`on_complete`](Subscriber::on_complete). A cancelled subscription
/// receives no terminal event.
///
/// Every method may be invoked from an arbitrary thread.
pub trait Subscriber {
  type Item;
  type Err;

  /// Acknowledges the subscription. Called exactly once; a second
  /// acknowledgment on the same subscriber is a protocol violation.
  fn on_subscribe(&mut self, subscription: BoxSubscription);

  /// Delivers one value. The returned demand is additional: it is granted
  /// on top of whatever is still outstanding, and producers that track
  /// cumulative demand fold it in.
  fn on_next(&mut self, value: Self::Item) -> Demand;

  /// Delivers the terminal signal. Never called twice, and never after
  /// cancellation took effect.
  fn on_complete(&mut self, completion: Completion<Self::Err>);
}

/// A type-erased subscriber.
pub type BoxSubscriber<Item, Err> =
  Box<dyn Subscriber<Item = Item, Err = Err> + Send>;

impl<S: Subscriber + ?Sized> Subscriber for Box<S> {
  type Item = S::Item;
  type Err = S::Err;

  #[inline]
  fn on_subscribe(&mut self, subscription: BoxSubscription) {
    (**self).on_subscribe(subscription)
  }

  #[inline]
  fn on_next(&mut self, value: Self::Item) -> Demand {
    (**self).on_next(value)
  }

  #[inline]
  fn on_complete(&mut self, completion: Completion<Self::Err>) {
    (**self).on_complete(completion)
  }
}
