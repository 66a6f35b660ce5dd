use crate::prelude::*;
use std::sync::{Arc, Mutex};

/// Lifecycle of a stage's conduit: the single value every custom stage
/// guards behind its lock.
///
/// The machine moves `AwaitingSubscription -> Active -> Terminated`, each
/// transition exactly once and never backwards. `W` is the configuration
/// held while waiting for the upstream acknowledgment (typically the
/// downstream subscriber plus stage parameters); `A` is the working state
/// of an acknowledged subscription (upstream handle, buffers, counters).
pub enum ConduitState<W, A> {
  /// Subscribed to upstream, acknowledgment not yet received.
  AwaitingSubscription(W),
  /// Upstream acknowledged; values may flow.
  Active(A),
  /// A terminal event has been claimed. Nothing flows anymore.
  Terminated,
}

impl<W, A> ConduitState<W, A> {
  /// The active payload, if the conduit is still live.
  pub fn into_active(self) -> Option<A> {
    match self {
      ConduitState::Active(active) => Some(active),
      _ => None,
    }
  }
}

/// Result of [`ConduitCell::activate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
  /// The conduit moved to `Active`.
  Activated,
  /// The conduit had already terminated; the caller must cancel the
  /// freshly received upstream subscription instead of using it.
  Gone,
}

/// The lock-guarded conduit state every stage is built from.
///
/// One non-reentrant mutex guards all reads and writes of the state. The
/// lock is held only long enough to compute a transition; calls into
/// upstream, downstream or user closures always happen after the guard is
/// released, because any of them may synchronously call back into the same
/// conduit.
///
/// The cell guarantees three things for the stages built on it:
/// upstream is only used while `Active`; the terminal event is claimed by
/// exactly one caller of [`terminate`](ConduitCell::terminate), no matter
/// how many threads race; cancellation and normal completion are resolved
/// by that same atomic swap.
pub struct ConduitCell<W, A> {
  state: Mutex<ConduitState<W, A>>,
}

impl<W, A> ConduitCell<W, A> {
  /// A cell waiting for its upstream acknowledgment.
  pub fn awaiting(wait: W) -> Self {
    ConduitCell {
      state: Mutex::new(ConduitState::AwaitingSubscription(wait)),
    }
  }

  /// Moves `AwaitingSubscription` to `Active`, building the active payload
  /// from the waiting configuration.
  ///
  /// Returns [`Activation::Gone`] if the conduit terminated before the
  /// acknowledgment arrived. Panics if the conduit is already `Active`:
  /// a second acknowledgment means the upstream's protocol implementation
  /// is broken, which is not a runtime condition to recover from.
  pub fn activate<F>(&self, to_active: F) -> Activation
  where
    F: FnOnce(W) -> A,
  {
    let mut guard = self.state.lock().unwrap();
    match std::mem::replace(&mut *guard, ConduitState::Terminated) {
      ConduitState::AwaitingSubscription(wait) => {
        *guard = ConduitState::Active(to_active(wait));
        Activation::Activated
      }
      ConduitState::Terminated => Activation::Gone,
      ConduitState::Active(_) => {
        panic!("conduit activated twice: upstream acknowledged a subscription it had already acknowledged");
      }
    }
  }

  /// Swaps the state to `Terminated` and returns what was there before.
  ///
  /// Only the first terminator observes a non-`Terminated` prior state; it
  /// alone releases the resources held in it (cancel upstream, flush
  /// buffers, hand the downstream its completion). Every later caller gets
  /// `Terminated` back and must do nothing.
  pub fn terminate(&self) -> ConduitState<W, A> {
    let mut guard = self.state.lock().unwrap();
    std::mem::replace(&mut *guard, ConduitState::Terminated)
  }

  /// Terminates only if `pred` approves the current active payload, all
  /// under one acquisition of the lock. Returns the released payload when
  /// the swap happened.
  ///
  /// This is how a caller holding a staleness token (a promise serial, a
  /// child generation, a retry attempt) claims the terminal event without
  /// racing a newer incarnation: the check and the swap are atomic.
  pub fn terminate_if<F>(&self, pred: F) -> Option<A>
  where
    F: FnOnce(&mut A) -> bool,
  {
    let mut guard = self.state.lock().unwrap();
    let approved = match &mut *guard {
      ConduitState::Active(active) => pred(active),
      _ => false,
    };
    if approved {
      std::mem::replace(&mut *guard, ConduitState::Terminated).into_active()
    } else {
      None
    }
  }

  /// Runs `f` on the active payload under the lock. Returns `None` when
  /// the conduit is not (or no longer) active.
  ///
  /// `f` must only compute: it runs with the conduit lock held, so calling
  /// out to upstream, downstream or user code from inside it would invite
  /// the reentrancy deadlock the whole discipline exists to avoid.
  pub fn visit_active<R, F>(&self, f: F) -> Option<R>
  where
    F: FnOnce(&mut A) -> R,
  {
    match &mut *self.state.lock().unwrap() {
      ConduitState::Active(active) => Some(f(active)),
      _ => None,
    }
  }

  /// `true` once a terminal event has been claimed.
  pub fn is_terminated(&self) -> bool {
    matches!(*self.state.lock().unwrap(), ConduitState::Terminated)
  }
}

/// The conduit side of the downstream-facing [`Subscription`] handle.
///
/// Each stage's conduit implements this pair of entry points; the handle
/// the downstream consumer owns is a [`ConduitSubscription`] pointing back
/// at it. Shared ownership keeps the conduit alive from `subscribe()` until
/// a terminal event, independent of whether the original stage value is
/// still reachable.
pub trait ConduitControl: Send + Sync {
  /// Receivers are `Arc<Self>` so a conduit can hand fresh clones of
  /// itself to the work a call sets in motion (promises, child
  /// subscribers, scheduled retries).
  fn request(self: Arc<Self>, demand: Demand);
  fn cancel(self: Arc<Self>);
}

/// The [`Subscription`] handed to a stage's downstream consumer.
pub struct ConduitSubscription(Arc<dyn ConduitControl>);

impl ConduitSubscription {
  pub fn new(conduit: Arc<dyn ConduitControl>) -> Self {
    ConduitSubscription(conduit)
  }
}

impl Subscription for ConduitSubscription {
  #[inline]
  fn request(&mut self, demand: Demand) { self.0.clone().request(demand); }

  #[inline]
  fn cancel(&mut self) { self.0.clone().cancel(); }
}
