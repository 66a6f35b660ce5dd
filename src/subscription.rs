use crate::prelude::*;
use std::sync::{Arc, Mutex};

/// Handle returned to a consumer when a producer acknowledges a
/// subscription. The consumer owns it exclusively and uses it to control
/// the flow rate.
///
/// After [`cancel`](Subscription::cancel) or a terminal completion the
/// handle is dead: every later call is a no-op.
pub trait Subscription {
  /// Permits the producer to send up to `demand` additional values.
  /// May be called repeatedly; demands accumulate. Values already in
  /// flight are not revoked.
  fn request(&mut self, demand: Demand);

  /// Declares that no further values or completion are wanted.
  /// Idempotent. The producer must release its resources promptly.
  fn cancel(&mut self);
}

/// A type-erased subscription handle.
pub type BoxSubscription = Box<dyn Subscription + Send>;

impl<S: Subscription + ?Sized> Subscription for Box<S> {
  #[inline]
  fn request(&mut self, demand: Demand) { (**self).request(demand) }

  #[inline]
  fn cancel(&mut self) { (**self).cancel() }
}

/// A clone-able subscription wrapper shared between the threads that need
/// to drive the same upstream handle.
///
/// `cancel` takes the inner handle out, so the first cancellation wins and
/// every subsequent `request` or `cancel` is a no-op.
pub struct SharedSubscription(Arc<Mutex<Option<BoxSubscription>>>);

impl SharedSubscription {
  pub fn new<S>(subscription: S) -> Self
  where
    S: Subscription + Send + 'static,
  {
    SharedSubscription(Arc::new(Mutex::new(Some(Box::new(subscription)))))
  }

  /// `true` once the handle has been cancelled.
  pub fn is_cancelled(&self) -> bool { self.0.lock().unwrap().is_none() }
}

impl Clone for SharedSubscription {
  #[inline]
  fn clone(&self) -> Self { SharedSubscription(self.0.clone()) }
}

impl Subscription for SharedSubscription {
  fn request(&mut self, demand: Demand) {
    if demand.is_none() {
      return;
    }
    if let Some(inner) = self.0.lock().unwrap().as_mut() {
      inner.request(demand);
    }
  }

  fn cancel(&mut self) {
    // Take the handle out first so the cancel call itself runs without the
    // wrapper lock held; the producer may synchronously call back in.
    let inner = self.0.lock().unwrap().take();
    if let Some(mut inner) = inner {
      inner.cancel();
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::atomic::{AtomicU64, Ordering};

  struct Counting {
    requested: Arc<AtomicU64>,
    cancelled: Arc<AtomicU64>,
  }

  impl Subscription for Counting {
    fn request(&mut self, demand: Demand) {
      if let Demand::Finite(n) = demand {
        self.requested.fetch_add(n, Ordering::SeqCst);
      }
    }

    fn cancel(&mut self) { self.cancelled.fetch_add(1, Ordering::SeqCst); }
  }

  #[test]
  fn shared_cancel_is_idempotent() {
    let requested = Arc::new(AtomicU64::new(0));
    let cancelled = Arc::new(AtomicU64::new(0));
    let mut shared = SharedSubscription::new(Counting {
      requested: requested.clone(),
      cancelled: cancelled.clone(),
    });
    let mut other = shared.clone();

    shared.request(Demand::finite(3));
    shared.cancel();
    other.cancel();
    other.request(Demand::finite(5));

    assert_eq!(requested.load(Ordering::SeqCst), 3);
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    assert!(shared.is_cancelled());
  }
}
