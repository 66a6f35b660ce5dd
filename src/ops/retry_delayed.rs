use crate::prelude::*;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;

/// Wait intervals for [`Publisher::retry_delayed`], in floating-point
/// seconds, tried in order. Negative entries clamp to zero. The optional
/// tolerance is handed through to the scheduler with every wait.
///
/// ```rust
/// use pullflow::prelude::*;
/// use std::time::Duration;
///
/// let delays = RetryDelays::from_secs([0.2, 0.4, 0.6])
///   .tolerance(Duration::from_millis(10));
/// ```
#[derive(Clone, Debug)]
pub struct RetryDelays {
  delays: SmallVec<[f64; 4]>,
  tolerance: Duration,
}

impl RetryDelays {
  pub fn from_secs<I>(delays: I) -> Self
  where
    I: IntoIterator<Item = f64>,
  {
    RetryDelays {
      delays: delays.into_iter().collect(),
      tolerance: Duration::ZERO,
    }
  }

  /// Grants the scheduler slack when firing the re-subscription.
  pub fn tolerance(mut self, tolerance: Duration) -> Self {
    self.tolerance = tolerance;
    self
  }

  pub fn len(&self) -> usize { self.delays.len() }

  pub fn is_empty(&self) -> bool { self.delays.is_empty() }

  /// The wait before retry number `index`, or `None` once the list is
  /// exhausted. Negative waits clamp to zero.
  fn delay_at(&self, index: usize) -> Option<Duration> {
    self
      .delays
      .get(index)
      .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
  }
}

/// The delayed-retry stage behind [`Publisher::retry_delayed`].
///
/// On failure the stage re-subscribes to a fresh clone of its source after
/// the next interval from the configured list, until the list runs out and
/// the final failure is forwarded. Values seen before a failure are
/// forwarded immediately and never replayed; each attempt restarts the
/// producer from scratch. Demand the downstream granted while between
/// attempts is preserved and reissued to the new subscription once it is
/// acknowledged.
pub struct RetryDelayedOp<S, Sch> {
  pub(crate) source: S,
  pub(crate) delays: RetryDelays,
  pub(crate) scheduler: Sch,
}

struct RetryWait<S, Sch, D> {
  downstream: D,
  source: S,
  scheduler: Sch,
  delays: RetryDelays,
}

enum AttemptPhase<H> {
  /// Upstream acknowledged; the handle drives it.
  Subscribed(SharedSubscription),
  /// Re-subscription issued, acknowledgment pending.
  AwaitingAck,
  /// Waiting out an interval; the slot holds the timer handle once the
  /// scheduling call returns.
  WaitingRetry(Option<H>),
}

struct RetryActive<S, Sch: Scheduler, D: Subscriber> {
  source: S,
  scheduler: Sch,
  delays: RetryDelays,
  /// Index of the next interval to wait.
  index: usize,
  /// Downstream demand not yet satisfied, carried across attempts.
  demand: Demand,
  /// Attempt serial; events carrying an older serial are stale.
  serial: u64,
  phase: AttemptPhase<Sch::Handle>,
  down: DownstreamRef<D>,
  /// A value is being handed to the consumer right now; demand increments
  /// arriving meanwhile are parked instead of re-entering the delivery.
  delivering: bool,
  pending_upstream: Demand,
  /// False until the downstream consumer's `on_subscribe` has returned
  /// and it is armed.
  ready: bool,
}

struct RetryConduit<S, Sch: Scheduler, D: Subscriber> {
  cell: ConduitCell<RetryWait<S, Sch, D>, RetryActive<S, Sch, D>>,
}

impl<S, Sch, D> RetryConduit<S, Sch, D>
where
  S: Publisher + Clone + Send + 'static,
  S::Item: Send + 'static,
  S::Err: Send + 'static,
  Sch: Scheduler + Clone + Send + 'static,
  Sch::Handle: Send + 'static,
  D: Subscriber<Item = S::Item, Err = S::Err> + Send + 'static,
{
  /// Timer callback: starts the attempt the failure scheduled, unless the
  /// conduit has terminated or moved on since.
  fn resubscribe(conduit: Arc<Self>, serial: u64) {
    let source = conduit
      .cell
      .visit_active(|a| {
        if a.serial == serial
          && matches!(a.phase, AttemptPhase::WaitingRetry(_))
        {
          a.phase = AttemptPhase::AwaitingAck;
          Some(a.source.clone())
        } else {
          None
        }
      })
      .flatten();
    if let Some(source) = source {
      source.subscribe(RetryAttempt { conduit, serial, prime: false });
    }
  }
}

impl<S, Sch, D> ConduitControl for RetryConduit<S, Sch, D>
where
  S: Publisher + Clone + Send + 'static,
  S::Item: Send + 'static,
  S::Err: Send + 'static,
  Sch: Scheduler + Clone + Send + 'static,
  Sch::Handle: Send + 'static,
  D: Subscriber<Item = S::Item, Err = S::Err> + Send + 'static,
{
  fn request(self: Arc<Self>, demand: Demand) {
    if demand.is_none() {
      return;
    }
    let forward = self.cell.visit_active(|a| {
      a.demand += demand;
      if !a.ready {
        return None;
      }
      match &a.phase {
        AttemptPhase::Subscribed(subscription) => {
          if a.delivering {
            a.pending_upstream += demand;
            None
          } else {
            Some(subscription.clone())
          }
        }
        // Between attempts the demand is only accumulated; the next
        // acknowledgment reissues it wholesale.
        _ => None,
      }
    });
    if let Some(Some(mut subscription)) = forward {
      subscription.request(demand);
    }
  }

  fn cancel(self: Arc<Self>) {
    if let Some(active) = self.cell.terminate().into_active() {
      match active.phase {
        AttemptPhase::Subscribed(subscription) => {
          let mut subscription = subscription;
          subscription.cancel();
        }
        AttemptPhase::WaitingRetry(handle) => {
          if let Some(mut handle) = handle {
            handle.cancel();
          }
        }
        // The acknowledgment in flight will find the conduit terminated
        // and cancel the fresh subscription itself.
        AttemptPhase::AwaitingAck => {}
      }
    }
  }
}

/// Subscriber role for one subscription attempt (prime or retry).
struct RetryAttempt<S, Sch: Scheduler, D: Subscriber> {
  conduit: Arc<RetryConduit<S, Sch, D>>,
  serial: u64,
  prime: bool,
}

enum FailPlan<Sch> {
  Forward,
  Schedule { scheduler: Sch, delay: Duration, tolerance: Duration, serial: u64 },
  Stale,
}

impl<S, Sch, D> Subscriber for RetryAttempt<S, Sch, D>
where
  S: Publisher + Clone + Send + 'static,
  S::Item: Send + 'static,
  S::Err: Send + 'static,
  Sch: Scheduler + Clone + Send + 'static,
  Sch::Handle: Send + 'static,
  D: Subscriber<Item = S::Item, Err = S::Err> + Send + 'static,
{
  type Item = S::Item;
  type Err = S::Err;

  fn on_subscribe(&mut self, subscription: BoxSubscription) {
    let mut shared = SharedSubscription::new(subscription);
    let handle = shared.clone();

    if self.prime {
      let down = DownstreamRef::vacant();
      let down_in_active = down.clone();
      let mut downstream_out = None;
      let activation = self.conduit.cell.activate(|wait| {
        downstream_out = Some(wait.downstream);
        RetryActive {
          source: wait.source,
          scheduler: wait.scheduler,
          delays: wait.delays,
          index: 0,
          demand: Demand::NONE,
          serial: 0,
          phase: AttemptPhase::Subscribed(handle),
          down: down_in_active,
          delivering: false,
          pending_upstream: Demand::NONE,
          ready: false,
        }
      });
      match activation {
        Activation::Activated => {
          let mut downstream = downstream_out.unwrap();
          let subscription = ConduitSubscription::new(
            self.conduit.clone() as Arc<dyn ConduitControl>,
          );
          downstream.on_subscribe(Box::new(subscription));
          down.arm(downstream);
          // Demand latched during the acknowledgment goes upstream now.
          let snapshot = self.conduit.cell.visit_active(|a| {
            a.ready = true;
            a.demand
          });
          if let Some(demand) = snapshot {
            if demand.has_any() {
              shared.request(demand);
            }
          }
        }
        Activation::Gone => shared.cancel(),
      }
      return;
    }

    let serial = self.serial;
    let snapshot = self.conduit.cell.visit_active(|a| {
      if a.serial != serial {
        return None;
      }
      if !matches!(a.phase, AttemptPhase::AwaitingAck) {
        panic!(
          "retry attempt acknowledged twice: upstream's protocol implementation is broken"
        );
      }
      a.phase = AttemptPhase::Subscribed(handle);
      Some(a.demand)
    });
    match snapshot {
      Some(Some(demand)) => {
        if demand.has_any() {
          shared.request(demand);
        }
      }
      _ => shared.cancel(),
    }
  }

  fn on_next(&mut self, value: S::Item) -> Demand {
    let serial = self.serial;
    let down = self
      .conduit
      .cell
      .visit_active(|a| {
        if a.serial == serial && a.demand.take_one() {
          a.delivering = true;
          Some(a.down.clone())
        } else {
          None
        }
      })
      .flatten();
    match down {
      Some(down) => {
        let extra = down.deliver(value);
        let flush = self
          .conduit
          .cell
          .visit_active(|a| {
            a.delivering = false;
            if extra.has_any() {
              a.demand += extra;
            }
            let pending = std::mem::take(&mut a.pending_upstream);
            if pending.has_any() {
              if let AttemptPhase::Subscribed(subscription) = &a.phase {
                return Some((subscription.clone(), pending));
              }
            }
            None
          })
          .flatten();
        if let Some((mut subscription, pending)) = flush {
          subscription.request(pending);
        }
        extra
      }
      None => Demand::NONE,
    }
  }

  fn on_complete(&mut self, completion: Completion<S::Err>) {
    let serial = self.serial;
    match completion {
      Completion::Finished => {
        let claimed = self.conduit.cell.terminate_if(|a| a.serial == serial);
        if let Some(active) = claimed {
          active.down.finish(Completion::Finished);
        }
      }
      Completion::Failed(error) => {
        let plan = self
          .conduit
          .cell
          .visit_active(|a| {
            if a.serial != serial {
              return FailPlan::Stale;
            }
            match a.delays.delay_at(a.index) {
              None => FailPlan::Forward,
              Some(delay) => {
                a.index += 1;
                a.serial += 1;
                a.phase = AttemptPhase::WaitingRetry(None);
                FailPlan::Schedule {
                  scheduler: a.scheduler.clone(),
                  delay,
                  tolerance: a.delays.tolerance,
                  serial: a.serial,
                }
              }
            }
          })
          .unwrap_or(FailPlan::Stale);

        match plan {
          FailPlan::Forward => {
            let claimed =
              self.conduit.cell.terminate_if(|a| a.serial == serial);
            if let Some(active) = claimed {
              active.down.finish(Completion::Failed(error));
            }
          }
          FailPlan::Schedule { scheduler, delay, tolerance, serial } => {
            let conduit = self.conduit.clone();
            let timer = scheduler.schedule_after(
              delay,
              tolerance,
              Box::new(move || RetryConduit::resubscribe(conduit, serial)),
            );
            // Stash the handle so cancellation can retire the timer. If
            // the conduit terminated in the meantime the callback's own
            // staleness check makes it a no-op.
            let leftover = self
              .conduit
              .cell
              .visit_active(|a| {
                if a.serial == serial {
                  if let AttemptPhase::WaitingRetry(slot) = &mut a.phase {
                    *slot = Some(timer);
                    return None;
                  }
                }
                Some(timer)
              })
              .flatten();
            if let Some(mut timer) = leftover {
              timer.cancel();
            }
          }
          FailPlan::Stale => {}
        }
      }
    }
  }
}

impl<S, Sch> Publisher for RetryDelayedOp<S, Sch>
where
  S: Publisher + Clone + Send + 'static,
  S::Item: Send + 'static,
  S::Err: Send + 'static,
  Sch: Scheduler + Clone + Send + 'static,
  Sch::Handle: Send + 'static,
{
  type Item = S::Item;
  type Err = S::Err;

  fn subscribe<D>(self, subscriber: D)
  where
    D: Subscriber<Item = S::Item, Err = S::Err> + Send + 'static,
  {
    let attempt_source = self.source.clone();
    let conduit = Arc::new(RetryConduit {
      cell: ConduitCell::awaiting(RetryWait {
        downstream: subscriber,
        source: self.source,
        scheduler: self.scheduler,
        delays: self.delays,
      }),
    });
    attempt_source.subscribe(RetryAttempt { conduit, serial: 0, prime: true });
  }
}

#[cfg(test)]
mod test {
  use crate::prelude::*;
  use crate::testing::{ManualPublisher, TestSubscriber};
  use float_cmp::approx_eq;
  use std::sync::{Arc, Mutex};
  use std::time::Duration;

  /// A clone-able source whose n-th subscription plays the n-th script
  /// entry: some values, then a terminal event.
  #[derive(Clone)]
  struct Scripted {
    attempts: Arc<Mutex<usize>>,
    script: Arc<Vec<(Vec<i32>, Completion<&'static str>)>>,
  }

  impl Scripted {
    fn new(script: Vec<(Vec<i32>, Completion<&'static str>)>) -> Self {
      Scripted {
        attempts: Arc::new(Mutex::new(0)),
        script: Arc::new(script),
      }
    }

    fn attempts(&self) -> usize { *self.attempts.lock().unwrap() }
  }

  impl Publisher for Scripted {
    type Item = i32;
    type Err = &'static str;

    fn subscribe<Sub>(self, mut subscriber: Sub)
    where
      Sub: Subscriber<Item = i32, Err = &'static str> + Send + 'static,
    {
      let attempt = {
        let mut attempts = self.attempts.lock().unwrap();
        *attempts += 1;
        *attempts - 1
      };
      let (values, outcome) = self.script[attempt.min(self.script.len() - 1)].clone();
      let slot = Arc::new(Mutex::new(Some((values, outcome))));
      subscriber.on_subscribe(Box::new(ScriptedSubscription(slot.clone())));
      // Push-only playback, like a hot producer: the script runs straight
      // through unless the acknowledgment was answered with a cancel.
      let play = slot.lock().unwrap().take();
      if let Some((values, outcome)) = play {
        for v in values {
          subscriber.on_next(v);
        }
        subscriber.on_complete(outcome);
      }
    }
  }

  struct ScriptedSubscription(
    Arc<Mutex<Option<(Vec<i32>, Completion<&'static str>)>>>,
  );

  impl Subscription for ScriptedSubscription {
    fn request(&mut self, _: Demand) {}

    fn cancel(&mut self) { self.0.lock().unwrap().take(); }
  }

  #[test]
  fn fail_once_then_succeed_takes_two_attempts() {
    let scheduler = TestScheduler::new();
    let source = Scripted::new(vec![
      (vec![1, 2], Completion::Failed("first try broke")),
      (vec![3], Completion::Finished),
    ]);
    let sub = TestSubscriber::<i32, &'static str>::unlimited();
    source
      .clone()
      .retry_delayed(RetryDelays::from_secs([0.2, 0.4, 0.6]), scheduler.clone())
      .subscribe(sub.clone());

    // Values before the failure forward immediately; nothing resubscribes
    // before the interval has fully elapsed.
    assert_eq!(sub.values(), vec![1, 2]);
    assert_eq!(source.attempts(), 1);
    scheduler.advance_by(Duration::from_millis(199));
    assert_eq!(source.attempts(), 1);
    assert!(!sub.is_terminated());

    scheduler.advance_by(Duration::from_millis(1));
    assert_eq!(source.attempts(), 2);
    assert_eq!(sub.values(), vec![1, 2, 3]);
    assert_eq!(sub.completion(), Some(Completion::Finished));
  }

  #[test]
  fn exhausted_delays_forward_the_final_failure() {
    let scheduler = TestScheduler::new();
    let source =
      Scripted::new(vec![(vec![], Completion::Failed("always broke"))]);
    let sub = TestSubscriber::<i32, &'static str>::unlimited();
    source
      .clone()
      .retry_delayed(RetryDelays::from_secs([0.2, 0.4, 0.6]), scheduler.clone())
      .subscribe(sub.clone());

    for _ in 0..3 {
      scheduler.advance_by(Duration::from_millis(600));
    }
    // One prime attempt plus one per interval.
    assert_eq!(source.attempts(), 4);
    assert_eq!(sub.completion(), Some(Completion::Failed("always broke")));
    assert_eq!(sub.terminal_count(), 1);
  }

  #[test]
  fn demand_is_carried_across_attempts() {
    let scheduler = TestScheduler::new();
    let source = ManualPublisher::<i32, &'static str>::new();
    let sub = TestSubscriber::<i32, &'static str>::prefetch(Demand::finite(5));
    source
      .clone()
      .retry_delayed(RetryDelays::from_secs([1.0]), scheduler.clone())
      .subscribe(sub.clone());
    assert_eq!(source.requested(), Demand::finite(5));

    source.emit(1);
    source.emit(2);
    source.fail("hiccup");
    assert_eq!(sub.values(), vec![1, 2]);
    assert!(!sub.is_terminated());

    // Demand granted while waiting is preserved too.
    sub.request(Demand::finite(2));
    scheduler.advance_by(Duration::from_secs(1));
    assert_eq!(source.attempts(), 2);
    // Five granted minus two delivered, plus two more: the new attempt is
    // asked for exactly what is still outstanding.
    assert_eq!(source.requested(), Demand::finite(5 + 5 - 2 + 2));
  }

  #[test]
  fn cancel_while_waiting_retires_the_timer() {
    let scheduler = TestScheduler::new();
    let source =
      Scripted::new(vec![(vec![], Completion::Failed("always broke"))]);
    let sub = TestSubscriber::<i32, &'static str>::unlimited();
    source
      .clone()
      .retry_delayed(RetryDelays::from_secs([0.5]), scheduler.clone())
      .subscribe(sub.clone());
    assert_eq!(source.attempts(), 1);

    sub.cancel();
    scheduler.advance_by(Duration::from_secs(5));
    assert_eq!(source.attempts(), 1);
    assert!(!sub.is_terminated());
  }

  #[test]
  fn negative_delays_clamp_to_zero() {
    assert!(approx_eq!(
      f64,
      RetryDelays::from_secs([-3.5]).delay_at(0).unwrap().as_secs_f64(),
      0.0
    ));
    assert!(approx_eq!(
      f64,
      RetryDelays::from_secs([0.25]).delay_at(0).unwrap().as_secs_f64(),
      0.25
    ));
    assert!(RetryDelays::from_secs(Vec::<f64>::new()).delay_at(0).is_none());
  }
}
