use crate::demand::Demand;
use crate::subscriber::{Completion, Subscriber};
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared mutable cell used wherever a conduit and the handles it gives out
/// must touch the same state from arbitrary threads.
///
/// The inner mutex is non-reentrant; callers never hold a guard across a
/// call that could re-enter the same cell.
pub struct MutArc<T>(Arc<Mutex<T>>);

impl<T> MutArc<T> {
  pub fn own(t: T) -> Self { MutArc(Arc::new(Mutex::new(t))) }

  #[inline]
  pub fn rc_deref_mut(&self) -> MutexGuard<'_, T> { self.0.lock().unwrap() }
}

impl<T> Clone for MutArc<T> {
  #[inline]
  fn clone(&self) -> Self { MutArc(self.0.clone()) }
}

enum DownSlot<D: Subscriber> {
  /// Acknowledgment still running; the consumer is not reachable yet.
  Vacant,
  /// The consumer is armed and receiving.
  Occupied(D),
  /// A terminal event arrived before the consumer was armed; it is handed
  /// over the moment arming happens.
  Parked(Completion<D::Err>),
  /// The terminal event has been delivered.
  Closed,
}

/// The conduit-to-consumer reference.
///
/// The downstream subscriber is armed into the slot only after its
/// `on_subscribe` has returned, so nothing is delivered into a consumer a
/// stage still holds a `&mut` to. Values go through
/// [`deliver`](DownstreamRef::deliver); the terminal event goes through
/// [`finish`](DownstreamRef::finish), which closes the slot so a second
/// terminal, no matter which thread races it in, finds it already gone.
/// A terminal that beats the arming is parked and handed over by
/// [`arm`](DownstreamRef::arm) itself.
pub struct DownstreamRef<D: Subscriber>(MutArc<DownSlot<D>>);

impl<D: Subscriber> Clone for DownstreamRef<D> {
  #[inline]
  fn clone(&self) -> Self { DownstreamRef(self.0.clone()) }
}

impl<D: Subscriber> DownstreamRef<D> {
  pub fn vacant() -> Self { DownstreamRef(MutArc::own(DownSlot::Vacant)) }

  /// Installs the consumer. If a terminal event arrived while the slot was
  /// vacant it is delivered here, exactly once.
  pub fn arm(&self, subscriber: D) {
    let parked = {
      let mut slot = self.0.rc_deref_mut();
      match std::mem::replace(&mut *slot, DownSlot::Closed) {
        DownSlot::Vacant => {
          *slot = DownSlot::Occupied(subscriber);
          None
        }
        DownSlot::Parked(completion) => Some((subscriber, completion)),
        // Closed (or, impossibly, occupied): the subscriber is dropped
        // without a terminal event, which is the cancelled outcome.
        other => {
          *slot = other;
          None
        }
      }
    };
    if let Some((mut subscriber, completion)) = parked {
      subscriber.on_complete(completion);
    }
  }

  /// Delivers one value if the consumer is armed, returning the additional
  /// demand it granted.
  pub fn deliver(&self, value: D::Item) -> Demand {
    match &mut *self.0.rc_deref_mut() {
      DownSlot::Occupied(down) => down.on_next(value),
      _ => Demand::NONE,
    }
  }

  /// Hands the consumer the terminal signal, or parks it if the consumer
  /// is not armed yet. Only the first call does anything.
  pub fn finish(&self, completion: Completion<D::Err>) {
    let taken = {
      let mut slot = self.0.rc_deref_mut();
      match std::mem::replace(&mut *slot, DownSlot::Closed) {
        DownSlot::Occupied(down) => Some(down),
        DownSlot::Vacant => {
          *slot = DownSlot::Parked(completion);
          return;
        }
        other => {
          *slot = other;
          return;
        }
      }
    };
    if let Some(mut down) = taken {
      down.on_complete(completion);
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::prelude::*;

  struct Recorder {
    values: Vec<i32>,
    completions: u32,
  }

  impl Subscriber for MutArc<Recorder> {
    type Item = i32;
    type Err = ();

    fn on_subscribe(&mut self, _: BoxSubscription) {}

    fn on_next(&mut self, value: i32) -> Demand {
      self.rc_deref_mut().values.push(value);
      Demand::NONE
    }

    fn on_complete(&mut self, _: Completion<()>) {
      self.rc_deref_mut().completions += 1;
    }
  }

  #[test]
  fn finish_hands_over_once() {
    let recorder = MutArc::own(Recorder { values: vec![], completions: 0 });
    let cell: DownstreamRef<MutArc<Recorder>> = DownstreamRef::vacant();
    cell.arm(recorder.clone());

    cell.deliver(1);
    cell.finish(Completion::Finished);
    cell.finish(Completion::Finished);
    assert_eq!(cell.deliver(2), Demand::NONE);

    let inner = recorder.rc_deref_mut();
    assert_eq!(inner.values, vec![1]);
    assert_eq!(inner.completions, 1);
  }

  #[test]
  fn early_terminal_is_parked_until_armed() {
    let recorder = MutArc::own(Recorder { values: vec![], completions: 0 });
    let cell: DownstreamRef<MutArc<Recorder>> = DownstreamRef::vacant();

    cell.finish(Completion::Finished);
    assert_eq!(recorder.rc_deref_mut().completions, 0);

    cell.arm(recorder.clone());
    assert_eq!(recorder.rc_deref_mut().completions, 1);

    // Armed-after-parked slots stay closed.
    cell.finish(Completion::Finished);
    assert_eq!(cell.deliver(3), Demand::NONE);
    assert_eq!(recorder.rc_deref_mut().completions, 1);
  }
}
