use crate::prelude::*;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

/// The sequential transform stage behind
/// [`Publisher::async_map`].
///
/// Exactly one upstream value is in flight at a time: the stage requests
/// the next value only after the current closure has finished its
/// [`Promise`]. A closure may deliver several results per input (each
/// delivery consumes one unit of downstream demand) or none at all.
/// Upstream values that arrive while a transform is running (an upstream
/// that disregards backpressure) are queued in arrival order; the queue is
/// unbounded, so a misbehaving producer trades memory for values, never
/// correctness.
///
/// Completion policy: an upstream failure or a [`Promise::fail`] forwards
/// immediately, discarding the queue and anything the in-flight closure
/// still wanted to deliver. Upstream success is held back until the queue
/// is drained and no transform is in flight.
pub struct AsyncMapOp<S, F, T> {
  pub(crate) source: S,
  pub(crate) transform: F,
  pub(crate) _t: PhantomData<T>,
}

/// Whether a [`Promise`] delivery was accepted.
///
/// `Forbidden` closes the promise: it is returned once downstream demand
/// is exhausted, once the promise already finished, or once the conduit
/// terminated, and every call after it is a silent no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
  Allowed,
  Forbidden,
}

/// The callback through which an [`async_map`](Publisher::async_map)
/// closure delivers its results.
///
/// A promise is clone-able and `Send`; the closure may resolve it
/// synchronously or hand it to another thread. Deliveries beyond the
/// downstream's demand are refused, not buffered: the closure sees
/// [`Delivery::Forbidden`] and the value is dropped.
pub struct Promise<T, E> {
  hub: Arc<dyn PromiseHub<T, E>>,
  serial: u64,
}

impl<T, E> Clone for Promise<T, E> {
  fn clone(&self) -> Self {
    Promise { hub: self.hub.clone(), serial: self.serial }
  }
}

impl<T, E> Promise<T, E> {
  /// Delivers one result and keeps the promise open for more.
  pub fn deliver(&self, value: T) -> Delivery {
    self.hub.clone().emit(self.serial, value, false)
  }

  /// Delivers one final result and finishes the promise.
  pub fn deliver_last(&self, value: T) -> Delivery {
    self.hub.clone().emit(self.serial, value, true)
  }

  /// Finishes the promise without another result, letting the stage move
  /// on to the next upstream value.
  pub fn finish(&self) { self.hub.clone().finish(self.serial); }

  /// Fails the whole stream, exactly as an upstream failure would.
  pub fn fail(&self, error: E) { self.hub.clone().fail(self.serial, error); }
}

/// Conduit side of a [`Promise`]; the serial number identifies which
/// transform the call belongs to, so promises outlive their turn safely.
trait PromiseHub<T, E>: Send + Sync {
  fn emit(self: Arc<Self>, serial: u64, value: T, last: bool) -> Delivery;
  fn finish(self: Arc<Self>, serial: u64);
  fn fail(self: Arc<Self>, serial: u64, error: E);
}

struct AsyncMapWait<D, F> {
  downstream: D,
  transform: Arc<F>,
}

struct AsyncMapActive<In, D: Subscriber, F> {
  upstream: SharedSubscription,
  down: DownstreamRef<D>,
  transform: Arc<F>,
  queue: VecDeque<In>,
  demand: Demand,
  /// Serial of the transform currently in flight; bumped whenever one
  /// finishes, so stale promise calls can be told apart.
  serial: u64,
  in_flight: bool,
  /// One value has been requested upstream and not yet delivered.
  awaiting_value: bool,
  upstream_finished: bool,
  /// Reentrancy guard for [`AsyncMapConduit::advance`]: the frame that set
  /// it owns the progress loop.
  advancing: bool,
  /// False until the downstream consumer's `on_subscribe` has returned
  /// and it is armed; demand accumulates but nothing moves before that.
  ready: bool,
}

struct AsyncMapConduit<In, D: Subscriber, F> {
  cell: ConduitCell<AsyncMapWait<D, F>, AsyncMapActive<In, D, F>>,
}

enum Plan<In, F> {
  Start(In, Arc<F>, u64),
  Request(SharedSubscription),
  Complete,
  Hold,
}

impl<In, D, F> AsyncMapConduit<In, D, F>
where
  In: Send + 'static,
  D: Subscriber + Send + 'static,
  F: Fn(In, Promise<D::Item, D::Err>) + Send + Sync + 'static,
  D::Item: Send + 'static,
  D::Err: Send + 'static,
{
  /// Drives the stage forward until nothing more can happen without a new
  /// event: starts queued transforms while demand lasts, requests the next
  /// upstream value, or claims the deferred completion.
  ///
  /// Iterative on purpose: a closure that finishes its promise
  /// synchronously would otherwise recurse one stack frame per queued
  /// value. The inner `advancing` flag parks reentrant calls; the owning
  /// frame loops and picks their work up. `claimed` says the caller
  /// already took the flag under its own critical section.
  fn advance(conduit: &Arc<Self>, claimed: bool) {
    let mut clear_guard = claimed;
    loop {
      let plan = conduit
        .cell
        .visit_active(|a| {
          if clear_guard {
            a.advancing = false;
          }
          if a.advancing || a.in_flight || !a.ready {
            return Plan::Hold;
          }
          if a.upstream_finished && a.queue.is_empty() {
            return Plan::Complete;
          }
          if !a.demand.has_any() {
            return Plan::Hold;
          }
          if let Some(value) = a.queue.pop_front() {
            a.in_flight = true;
            a.advancing = true;
            Plan::Start(value, a.transform.clone(), a.serial)
          } else if a.upstream_finished || a.awaiting_value {
            Plan::Hold
          } else {
            a.awaiting_value = true;
            Plan::Request(a.upstream.clone())
          }
        })
        .unwrap_or(Plan::Hold);

      match plan {
        Plan::Start(value, transform, serial) => {
          let promise = Promise {
            hub: conduit.clone() as Arc<dyn PromiseHub<D::Item, D::Err>>,
            serial,
          };
          transform(value, promise);
          clear_guard = true;
        }
        Plan::Request(mut upstream) => {
          upstream.request(Demand::finite(1));
          return;
        }
        Plan::Complete => {
          if let Some(active) = conduit.cell.terminate().into_active() {
            active.down.finish(Completion::Finished);
          }
          return;
        }
        Plan::Hold => return,
      }
    }
  }
}

impl<In, D, F> ConduitControl for AsyncMapConduit<In, D, F>
where
  In: Send + 'static,
  D: Subscriber + Send + 'static,
  F: Fn(In, Promise<D::Item, D::Err>) + Send + Sync + 'static,
  D::Item: Send + 'static,
  D::Err: Send + 'static,
{
  fn request(self: Arc<Self>, demand: Demand) {
    if demand.is_none() {
      return;
    }
    self.cell.visit_active(|a| a.demand += demand);
    Self::advance(&self, false);
  }

  fn cancel(self: Arc<Self>) {
    if let Some(active) = self.cell.terminate().into_active() {
      let mut upstream = active.upstream.clone();
      upstream.cancel();
      // Queue and in-flight results are discarded; no completion follows
      // a cancellation.
    }
  }
}

enum Gate<D: Subscriber> {
  Deliver { down: DownstreamRef<D>, claimed: bool },
  Closed { claimed: bool },
  Stale,
}

impl<In, D, F> PromiseHub<D::Item, D::Err> for AsyncMapConduit<In, D, F>
where
  In: Send + 'static,
  D: Subscriber + Send + 'static,
  F: Fn(In, Promise<D::Item, D::Err>) + Send + Sync + 'static,
  D::Item: Send + 'static,
  D::Err: Send + 'static,
{
  fn emit(self: Arc<Self>, serial: u64, value: D::Item, last: bool) -> Delivery {
    let gate = self
      .cell
      .visit_active(|a| {
        if !a.in_flight || a.serial != serial {
          return Gate::Stale;
        }
        if a.demand.take_one() {
          let mut claimed = false;
          if last {
            a.in_flight = false;
            a.serial += 1;
            // Claim the progress loop in the same critical section, so a
            // consumer that re-enters `request` from inside its `on_next`
            // cannot start the next transform while we still hold the
            // consumer cell.
            if !a.advancing {
              a.advancing = true;
              claimed = true;
            }
          }
          Gate::Deliver { down: a.down.clone(), claimed }
        } else {
          // Demand ran out mid-fan-out: the delivery is refused and the
          // promise closes, as if `finish` had been signaled.
          a.in_flight = false;
          a.serial += 1;
          let claimed = !a.advancing;
          if claimed {
            a.advancing = true;
          }
          Gate::Closed { claimed }
        }
      })
      .unwrap_or(Gate::Stale);

    match gate {
      Gate::Deliver { down, claimed } => {
        let extra = down.deliver(value);
        if extra.has_any() {
          self.cell.visit_active(|a| a.demand += extra);
        }
        if claimed {
          Self::advance(&self, true);
        }
        Delivery::Allowed
      }
      Gate::Closed { claimed } => {
        if claimed {
          Self::advance(&self, true);
        }
        Delivery::Forbidden
      }
      Gate::Stale => Delivery::Forbidden,
    }
  }

  fn finish(self: Arc<Self>, serial: u64) {
    let claimed = self
      .cell
      .visit_active(|a| {
        if a.in_flight && a.serial == serial {
          a.in_flight = false;
          a.serial += 1;
          if a.advancing {
            // The frame that owns the loop will see the transform is done
            // and move on; nothing to do here.
            false
          } else {
            a.advancing = true;
            true
          }
        } else {
          false
        }
      })
      .unwrap_or(false);
    if claimed {
      Self::advance(&self, true);
    }
  }

  fn fail(self: Arc<Self>, serial: u64, error: D::Err) {
    let claimed = self
      .cell
      .terminate_if(|a| a.in_flight && a.serial == serial);
    if let Some(active) = claimed {
      let mut upstream = active.upstream.clone();
      upstream.cancel();
      active.down.finish(Completion::Failed(error));
    }
  }
}

struct AsyncMapUpstream<In, D: Subscriber, F> {
  conduit: Arc<AsyncMapConduit<In, D, F>>,
}

impl<In, D, F> Subscriber for AsyncMapUpstream<In, D, F>
where
  In: Send + 'static,
  D: Subscriber + Send + 'static,
  F: Fn(In, Promise<D::Item, D::Err>) + Send + Sync + 'static,
  D::Item: Send + 'static,
  D::Err: Send + 'static,
{
  type Item = In;
  type Err = D::Err;

  fn on_subscribe(&mut self, subscription: BoxSubscription) {
    let mut shared = SharedSubscription::new(subscription);
    let upstream = shared.clone();
    let down = DownstreamRef::vacant();
    let down_in_active = down.clone();
    let mut downstream_out = None;
    let activation = self.conduit.cell.activate(|wait| {
      downstream_out = Some(wait.downstream);
      AsyncMapActive {
        upstream,
        down: down_in_active,
        transform: wait.transform,
        queue: VecDeque::new(),
        demand: Demand::NONE,
        serial: 0,
        in_flight: false,
        awaiting_value: false,
        upstream_finished: false,
        advancing: false,
        ready: false,
      }
    });
    match activation {
      Activation::Activated => {
        let mut downstream = downstream_out.unwrap();
        let subscription = ConduitSubscription::new(
          self.conduit.clone() as Arc<dyn ConduitControl>,
        );
        // The acknowledgment runs with no conduit lock held; demand it
        // requests is latched behind `ready`. Arming afterwards releases
        // that demand (or hands over a terminal event that raced in).
        downstream.on_subscribe(Box::new(subscription));
        down.arm(downstream);
        self.conduit.cell.visit_active(|a| a.ready = true);
        AsyncMapConduit::advance(&self.conduit, false);
      }
      Activation::Gone => shared.cancel(),
    }
  }

  fn on_next(&mut self, value: In) -> Demand {
    self.conduit.cell.visit_active(|a| {
      a.awaiting_value = false;
      a.queue.push_back(value);
    });
    AsyncMapConduit::advance(&self.conduit, false);
    Demand::NONE
  }

  fn on_complete(&mut self, completion: Completion<D::Err>) {
    match completion {
      Completion::Failed(error) => match self.conduit.cell.terminate() {
        ConduitState::Active(active) => {
          active.down.finish(Completion::Failed(error));
        }
        ConduitState::AwaitingSubscription(mut wait) => {
          // Upstream died before acknowledging; the consumer still gets
          // exactly one terminal event.
          wait.downstream.on_complete(Completion::Failed(error));
        }
        ConduitState::Terminated => {}
      },
      Completion::Finished => {
        self.conduit.cell.visit_active(|a| a.upstream_finished = true);
        AsyncMapConduit::advance(&self.conduit, false);
      }
    }
  }
}

impl<S, F, T> Publisher for AsyncMapOp<S, F, T>
where
  S: Publisher,
  S::Item: Send + 'static,
  S::Err: Send + 'static,
  T: Send + 'static,
  F: Fn(S::Item, Promise<T, S::Err>) + Send + Sync + 'static,
{
  type Item = T;
  type Err = S::Err;

  fn subscribe<D>(self, subscriber: D)
  where
    D: Subscriber<Item = T, Err = S::Err> + Send + 'static,
  {
    let conduit = Arc::new(AsyncMapConduit {
      cell: ConduitCell::awaiting(AsyncMapWait {
        downstream: subscriber,
        transform: Arc::new(self.transform),
      }),
    });
    self.source.subscribe(AsyncMapUpstream { conduit });
  }
}

#[cfg(test)]
mod test {
  use crate::prelude::*;
  use crate::testing::{ManualPublisher, TestSubscriber};
  use std::sync::{Arc, Mutex};
  use std::thread;

  #[test]
  fn fans_out_in_order() {
    let sub = TestSubscriber::<i32, ()>::unlimited();
    publisher::from_iter(vec![1, 2, 3])
      .async_map(|v, promise: Promise<i32, ()>| {
        assert_eq!(promise.deliver(v * 10), Delivery::Allowed);
        assert_eq!(promise.deliver(v * 10 + 1), Delivery::Allowed);
        assert_eq!(promise.deliver_last(v * 10 + 2), Delivery::Allowed);
      })
      .subscribe(sub.clone());
    assert_eq!(sub.values(), vec![10, 11, 12, 20, 21, 22, 30, 31, 32]);
    assert_eq!(sub.completion(), Some(Completion::Finished));
  }

  #[test]
  fn a_promise_may_deliver_nothing() {
    let sub = TestSubscriber::<i32, ()>::unlimited();
    publisher::from_iter(0..6)
      .async_map(|v, promise: Promise<i32, ()>| {
        if v % 2 == 0 {
          promise.deliver_last(v);
        } else {
          promise.finish();
        }
      })
      .subscribe(sub.clone());
    assert_eq!(sub.values(), vec![0, 2, 4]);
    assert_eq!(sub.completion(), Some(Completion::Finished));
  }

  #[test]
  fn one_value_in_flight_at_a_time() {
    let source = ManualPublisher::<i32, ()>::new();
    let parked = Arc::new(Mutex::new(Vec::<Promise<i32, ()>>::new()));
    let sub = TestSubscriber::<i32, ()>::unlimited();
    let stash = parked.clone();
    source
      .clone()
      .async_map(move |v, promise: Promise<i32, ()>| {
        // Park the promise; the test resolves it later.
        promise.deliver(v);
        stash.lock().unwrap().push(promise);
      })
      .subscribe(sub.clone());

    // Unlimited downstream demand still asks upstream for exactly one.
    assert_eq!(source.requested(), Demand::finite(1));

    source.emit(1);
    source.emit(2); // pushed uninvited; must queue
    assert_eq!(sub.values(), vec![1]);
    assert_eq!(source.requested(), Demand::finite(1));

    // Finishing the first transform starts the queued value; the stage
    // still does not over-request while that one is in flight.
    parked.lock().unwrap().remove(0).finish();
    assert_eq!(sub.values(), vec![1, 2]);
    assert_eq!(source.requested(), Demand::finite(1));

    // Only once the queue is empty and nothing is in flight is the next
    // upstream value pulled.
    parked.lock().unwrap().remove(0).finish();
    assert_eq!(source.requested(), Demand::finite(2));
  }

  #[test]
  fn late_promise_calls_are_silent() {
    let sub = TestSubscriber::<i32, ()>::unlimited();
    let parked = Arc::new(Mutex::new(Vec::<Promise<i32, ()>>::new()));
    let stash = parked.clone();
    publisher::from_iter(vec![7])
      .async_map(move |v, promise: Promise<i32, ()>| {
        promise.deliver_last(v);
        stash.lock().unwrap().push(promise);
      })
      .subscribe(sub.clone());
    assert_eq!(sub.completion(), Some(Completion::Finished));

    let promise = parked.lock().unwrap().remove(0);
    assert_eq!(promise.deliver(99), Delivery::Forbidden);
    promise.fail(());
    assert_eq!(sub.values(), vec![7]);
    assert_eq!(sub.terminal_count(), 1);
  }

  #[test]
  fn demand_exhaustion_refuses_and_drops() {
    let sub = TestSubscriber::<i32, ()>::prefetch(Demand::finite(2));
    publisher::from_iter(vec![1])
      .async_map(|v, promise: Promise<i32, ()>| {
        assert_eq!(promise.deliver(v), Delivery::Allowed);
        assert_eq!(promise.deliver(v + 1), Delivery::Allowed);
        // Third delivery exceeds the downstream's demand of two.
        assert_eq!(promise.deliver(v + 2), Delivery::Forbidden);
        assert_eq!(promise.deliver(v + 3), Delivery::Forbidden);
      })
      .subscribe(sub.clone());
    assert_eq!(sub.values(), vec![1, 2]);
  }

  #[test]
  fn closure_failure_terminates_like_upstream_failure() {
    let sub = TestSubscriber::<i32, &str>::unlimited();
    let source = ManualPublisher::<i32, &str>::new();
    source
      .clone()
      .async_map(|v, promise: Promise<i32, &str>| {
        if v < 0 {
          promise.fail("negative input");
        } else {
          promise.deliver_last(v);
        }
      })
      .subscribe(sub.clone());

    source.emit(1);
    source.emit(-1);
    source.emit(3);
    assert_eq!(sub.values(), vec![1]);
    assert_eq!(sub.completion(), Some(Completion::Failed("negative input")));
    assert!(source.is_cancelled());
  }

  #[test]
  fn upstream_failure_discards_in_flight_results() {
    let source = ManualPublisher::<i32, &str>::new();
    let parked = Arc::new(Mutex::new(Vec::<Promise<i32, &str>>::new()));
    let sub = TestSubscriber::<i32, &str>::unlimited();
    let stash = parked.clone();
    source
      .clone()
      .async_map(move |_, promise| stash.lock().unwrap().push(promise))
      .subscribe(sub.clone());

    source.emit(1);
    source.fail("upstream broke");
    assert_eq!(sub.completion(), Some(Completion::Failed("upstream broke")));

    // The transform resolves afterwards; everything is inert.
    let promise = parked.lock().unwrap().remove(0);
    assert_eq!(promise.deliver(5), Delivery::Forbidden);
    promise.finish();
    assert!(sub.values().is_empty());
    assert_eq!(sub.terminal_count(), 1);
  }

  #[test]
  fn upstream_success_waits_for_the_queue() {
    let source = ManualPublisher::<i32, ()>::new();
    let parked = Arc::new(Mutex::new(Vec::<Promise<i32, ()>>::new()));
    let sub = TestSubscriber::<i32, ()>::unlimited();
    let stash = parked.clone();
    source
      .clone()
      .async_map(move |v, promise: Promise<i32, ()>| {
        promise.deliver(v);
        stash.lock().unwrap().push(promise);
      })
      .subscribe(sub.clone());

    source.emit(1);
    source.emit(2);
    source.finish();
    assert!(!sub.is_terminated());

    parked.lock().unwrap().remove(0).finish();
    assert!(!sub.is_terminated());
    parked.lock().unwrap().remove(0).finish();
    assert_eq!(sub.values(), vec![1, 2]);
    assert_eq!(sub.completion(), Some(Completion::Finished));
  }

  #[test]
  fn cancel_mid_flight_reaches_upstream_and_mutes_downstream() {
    let source = ManualPublisher::<i32, ()>::new();
    let parked = Arc::new(Mutex::new(Vec::<Promise<i32, ()>>::new()));
    let sub = TestSubscriber::<i32, ()>::unlimited();
    let stash = parked.clone();
    source
      .clone()
      .async_map(move |_, promise: Promise<i32, ()>| {
        stash.lock().unwrap().push(promise)
      })
      .subscribe(sub.clone());

    source.emit(1);
    sub.cancel();
    assert!(source.is_cancelled());

    parked.lock().unwrap().remove(0).finish();
    assert!(!sub.is_terminated());
  }

  #[test]
  fn promise_resolution_from_another_thread() {
    let sub = TestSubscriber::<i32, ()>::unlimited();
    publisher::from_iter(0..4)
      .async_map(|v, promise: Promise<i32, ()>| {
        thread::spawn(move || {
          promise.deliver(v * 2);
          promise.deliver_last(v * 2 + 1);
        });
      })
      .subscribe(sub.clone());

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !sub.is_terminated() {
      assert!(std::time::Instant::now() < deadline);
      thread::yield_now();
    }
    assert_eq!(sub.values(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
  }
}
