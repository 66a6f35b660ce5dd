use crate::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;

/// The sequential flattening stage behind
/// [`Publisher::concat_all`].
///
/// Every upstream value is itself a publisher, a child stream. Exactly
/// one child is live at a time; its values pass straight through to the
/// downstream consumer. Children that arrive while one is live (an
/// upstream that ignores backpressure) are buffered in arrival order and
/// started strictly FIFO once the live child finishes. The buffer is
/// unbounded by design; callers needing a memory bound put an explicit
/// bounded-buffer stage upstream.
///
/// Upstream completion with a live child or a non-empty buffer is held
/// back until both are exhausted. Any failure, upstream's or any
/// child's, forwards immediately, cancels the live child, and discards
/// the buffer without starting the children in it.
pub struct ConcatAllOp<S> {
  pub(crate) source: S,
}

struct ConcatAllWait<D> {
  downstream: D,
}

enum ChildPhase {
  /// No child live; the next one starts when demand and a child meet.
  Idle,
  /// A child has been subscribed to, acknowledgment pending.
  Awaiting { generation: u64 },
  /// A child is live and holds the conduit's forwarded demand.
  Running { generation: u64, subscription: SharedSubscription },
}

impl ChildPhase {
  fn matches(&self, generation: u64) -> bool {
    match self {
      ChildPhase::Idle => false,
      ChildPhase::Awaiting { generation: g }
      | ChildPhase::Running { generation: g, .. } => *g == generation,
    }
  }
}

struct ConcatAllActive<P, D: Subscriber> {
  upstream: SharedSubscription,
  down: DownstreamRef<D>,
  buffer: VecDeque<P>,
  child: ChildPhase,
  demand: Demand,
  /// Generation handed to the next child; child callbacks carrying an
  /// older generation are stale and ignored.
  next_generation: u64,
  /// One child has been requested from upstream and not yet delivered.
  awaiting_child: bool,
  upstream_finished: bool,
  /// Reentrancy guard for the launch loop.
  launching: bool,
  /// A child value is being handed to the consumer right now; demand
  /// increments arriving meanwhile are parked in `pending_child_demand`
  /// instead of being forwarded into the delivery underneath us.
  delivering: bool,
  pending_child_demand: Demand,
  /// False until the downstream consumer's `on_subscribe` has returned
  /// and it is armed.
  ready: bool,
}

struct ConcatAllConduit<P, D: Subscriber> {
  cell: ConduitCell<ConcatAllWait<D>, ConcatAllActive<P, D>>,
}

enum Next<P> {
  Launch(P, u64),
  RequestChild(SharedSubscription),
  Complete,
  Hold,
}

impl<P, D> ConcatAllConduit<P, D>
where
  P: Publisher + Send + 'static,
  P::Item: Send + 'static,
  P::Err: Send + 'static,
  D: Subscriber<Item = P::Item, Err = P::Err> + Send + 'static,
{
  /// Moves the conduit forward: starts the next buffered child, asks
  /// upstream for one more, or claims the deferred completion. Iterative
  /// for the same reason as the transform stage: a chain of children
  /// that subscribe, emit and complete synchronously must not grow the
  /// stack per child.
  fn launch_loop(conduit: &Arc<Self>) {
    let mut clear_guard = false;
    loop {
      let next = conduit
        .cell
        .visit_active(|a| {
          if clear_guard {
            a.launching = false;
          }
          // `delivering` holds the loop off while a value is on its way
          // into the consumer; the deliverer re-runs the loop afterwards.
          if a.launching
            || a.delivering
            || !a.ready
            || !matches!(a.child, ChildPhase::Idle)
          {
            return Next::Hold;
          }
          if a.demand.has_any() {
            if let Some(child) = a.buffer.pop_front() {
              let generation = a.next_generation;
              a.next_generation += 1;
              a.child = ChildPhase::Awaiting { generation };
              a.launching = true;
              return Next::Launch(child, generation);
            }
          }
          if a.buffer.is_empty() && a.upstream_finished {
            return Next::Complete;
          }
          if a.buffer.is_empty()
            && a.demand.has_any()
            && !a.awaiting_child
          {
            a.awaiting_child = true;
            return Next::RequestChild(a.upstream.clone());
          }
          Next::Hold
        })
        .unwrap_or(Next::Hold);

      match next {
        Next::Launch(child, generation) => {
          child.subscribe(ConcatAllChild {
            conduit: conduit.clone(),
            generation,
          });
          clear_guard = true;
        }
        Next::RequestChild(mut upstream) => {
          upstream.request(Demand::finite(1));
          return;
        }
        Next::Complete => {
          if let Some(active) = conduit.cell.terminate().into_active() {
            active.down.finish(Completion::Finished);
          }
          return;
        }
        Next::Hold => return,
      }
    }
  }

  /// Claims the terminal event for a failure, releasing the live child,
  /// the upstream handle and the buffered children that never started.
  fn fail_now(active: ConcatAllActive<P, D>, error: P::Err) {
    let mut upstream = active.upstream.clone();
    upstream.cancel();
    if let ChildPhase::Running { subscription, .. } = active.child {
      let mut child = subscription;
      child.cancel();
    }
    drop(active.buffer);
    active.down.finish(Completion::Failed(error));
  }
}

impl<P, D> ConduitControl for ConcatAllConduit<P, D>
where
  P: Publisher + Send + 'static,
  P::Item: Send + 'static,
  P::Err: Send + 'static,
  D: Subscriber<Item = P::Item, Err = P::Err> + Send + 'static,
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
      match &a.child {
        ChildPhase::Running { subscription, .. } => {
          if a.delivering {
            // A delivery is on the stack; forwarding now could re-enter
            // the consumer cell this thread already holds. Parked for the
            // deliverer to flush.
            a.pending_child_demand += demand;
            None
          } else {
            Some(subscription.clone())
          }
        }
        _ => None,
      }
    });
    match forward {
      // A live child gets every increment as it happens.
      Some(Some(mut child)) => child.request(demand),
      Some(None) => Self::launch_loop(&self),
      None => {}
    }
  }

  fn cancel(self: Arc<Self>) {
    if let Some(active) = self.cell.terminate().into_active() {
      let mut upstream = active.upstream.clone();
      upstream.cancel();
      if let ChildPhase::Running { subscription, .. } = active.child {
        let mut child = subscription;
        child.cancel();
      }
      // Buffered children are dropped unstarted; no completion follows.
    }
  }
}

/// Subscriber role the conduit plays towards one child stream.
struct ConcatAllChild<P, D: Subscriber> {
  conduit: Arc<ConcatAllConduit<P, D>>,
  generation: u64,
}

impl<P, D> Subscriber for ConcatAllChild<P, D>
where
  P: Publisher + Send + 'static,
  P::Item: Send + 'static,
  P::Err: Send + 'static,
  D: Subscriber<Item = P::Item, Err = P::Err> + Send + 'static,
{
  type Item = P::Item;
  type Err = P::Err;

  fn on_subscribe(&mut self, subscription: BoxSubscription) {
    let mut shared = SharedSubscription::new(subscription);
    let handle = shared.clone();
    let generation = self.generation;
    let snapshot = self.conduit.cell.visit_active(|a| {
      if a.child.matches(generation) {
        a.child = ChildPhase::Running {
          generation,
          subscription: handle,
        };
        Some(a.demand)
      } else {
        None
      }
    });
    match snapshot {
      Some(Some(demand)) => {
        if demand.has_any() {
          shared.request(demand);
        }
      }
      // Stale child or terminated conduit: the fresh subscription is the
      // only resource to release.
      _ => shared.cancel(),
    }
  }

  fn on_next(&mut self, value: P::Item) -> Demand {
    let generation = self.generation;
    let down = self
      .conduit
      .cell
      .visit_active(|a| {
        if a.child.matches(generation) && a.demand.take_one() {
          a.delivering = true;
          Some(a.down.clone())
        } else {
          // A child pushing beyond demand gets its value dropped rather
          // than the downstream its contract broken.
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
            let pending = std::mem::take(&mut a.pending_child_demand);
            if pending.has_any() {
              if let ChildPhase::Running { subscription, .. } = &a.child {
                return Some((subscription.clone(), pending));
              }
            }
            None
          })
          .flatten();
        if let Some((mut subscription, pending)) = flush {
          subscription.request(pending);
        }
        // The delivery may have been the hold-off for a launch decided
        // meanwhile (the child completed on another thread, or demand for
        // a buffered child arrived mid-delivery).
        ConcatAllConduit::launch_loop(&self.conduit);
        extra
      }
      None => Demand::NONE,
    }
  }

  fn on_complete(&mut self, completion: Completion<P::Err>) {
    let generation = self.generation;
    match completion {
      Completion::Finished => {
        let advanced = self
          .conduit
          .cell
          .visit_active(|a| {
            if a.child.matches(generation) {
              a.child = ChildPhase::Idle;
              true
            } else {
              false
            }
          })
          .unwrap_or(false);
        if advanced {
          ConcatAllConduit::launch_loop(&self.conduit);
        }
      }
      Completion::Failed(error) => {
        let claimed = self
          .conduit
          .cell
          .terminate_if(|a| a.child.matches(generation));
        if let Some(active) = claimed {
          ConcatAllConduit::fail_now(active, error);
        }
      }
    }
  }
}

/// Subscriber role the conduit plays towards the upstream of children.
struct ConcatAllUpstream<P, D: Subscriber> {
  conduit: Arc<ConcatAllConduit<P, D>>,
}

impl<P, D> Subscriber for ConcatAllUpstream<P, D>
where
  P: Publisher + Send + 'static,
  P::Item: Send + 'static,
  P::Err: Send + 'static,
  D: Subscriber<Item = P::Item, Err = P::Err> + Send + 'static,
{
  type Item = P;
  type Err = P::Err;

  fn on_subscribe(&mut self, subscription: BoxSubscription) {
    let mut shared = SharedSubscription::new(subscription);
    let upstream = shared.clone();
    let down = DownstreamRef::vacant();
    let down_in_active = down.clone();
    let mut downstream_out = None;
    let activation = self.conduit.cell.activate(|wait| {
      downstream_out = Some(wait.downstream);
      ConcatAllActive {
        upstream,
        down: down_in_active,
        buffer: VecDeque::new(),
        child: ChildPhase::Idle,
        demand: Demand::NONE,
        next_generation: 0,
        awaiting_child: false,
        upstream_finished: false,
        launching: false,
        delivering: false,
        pending_child_demand: Demand::NONE,
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
        self.conduit.cell.visit_active(|a| a.ready = true);
        ConcatAllConduit::launch_loop(&self.conduit);
      }
      Activation::Gone => shared.cancel(),
    }
  }

  fn on_next(&mut self, child: P) -> Demand {
    self.conduit.cell.visit_active(|a| {
      a.awaiting_child = false;
      a.buffer.push_back(child);
    });
    ConcatAllConduit::launch_loop(&self.conduit);
    Demand::NONE
  }

  fn on_complete(&mut self, completion: Completion<P::Err>) {
    match completion {
      Completion::Failed(error) => match self.conduit.cell.terminate() {
        ConduitState::Active(active) => {
          ConcatAllConduit::fail_now(active, error);
        }
        ConduitState::AwaitingSubscription(mut wait) => {
          wait.downstream.on_complete(Completion::Failed(error));
        }
        ConduitState::Terminated => {}
      },
      Completion::Finished => {
        self.conduit.cell.visit_active(|a| a.upstream_finished = true);
        ConcatAllConduit::launch_loop(&self.conduit);
      }
    }
  }
}

impl<S> Publisher for ConcatAllOp<S>
where
  S: Publisher,
  S::Item: Publisher<Err = S::Err> + Send + 'static,
  <S::Item as Publisher>::Item: Send + 'static,
  S::Err: Send + 'static,
{
  type Item = <S::Item as Publisher>::Item;
  type Err = S::Err;

  fn subscribe<D>(self, subscriber: D)
  where
    D: Subscriber<Item = Self::Item, Err = Self::Err> + Send + 'static,
  {
    let conduit = Arc::new(ConcatAllConduit {
      cell: ConduitCell::awaiting(ConcatAllWait { downstream: subscriber }),
    });
    self.source.subscribe(ConcatAllUpstream { conduit });
  }
}

#[cfg(test)]
mod test {
  use crate::prelude::*;
  use crate::testing::{ManualPublisher, TestSubscriber};

  fn children() -> Vec<BoxPublisher<i32, ()>> {
    vec![
      publisher::just(0).boxed(),
      publisher::from_iter(1..10).boxed(),
      publisher::empty().boxed(),
      publisher::from_iter(10..16).boxed(),
    ]
  }

  #[test]
  fn flattens_in_child_order() {
    let sub = TestSubscriber::<i32, ()>::unlimited();
    publisher::from_iter(children())
      .concat_all()
      .subscribe(sub.clone());
    assert_eq!(sub.values(), (0..16).collect::<Vec<_>>());
    assert_eq!(sub.completion(), Some(Completion::Finished));
  }

  #[test]
  fn buffers_children_pushed_without_demand() {
    let outer = ManualPublisher::<BoxPublisher<i32, ()>, ()>::new();
    let gate = ManualPublisher::<i32, ()>::new();
    let sub = TestSubscriber::<i32, ()>::unlimited();
    outer.clone().concat_all().subscribe(sub.clone());

    // The first child stays open while five more are shoved in, far past
    // the single child the stage asked for.
    outer.emit(gate.clone().boxed());
    for base in 1..6 {
      outer.emit(publisher::from_iter(base * 10..base * 10 + 3).boxed());
    }
    outer.finish();
    assert!(!sub.is_terminated());

    gate.emit(1);
    gate.emit(2);
    gate.finish();

    // Buffered children drain strictly in arrival order afterwards.
    let mut expected = vec![1, 2];
    expected.extend((1..6).flat_map(|base| base * 10..base * 10 + 3));
    assert_eq!(sub.values(), expected);
    assert_eq!(sub.completion(), Some(Completion::Finished));
  }

  #[test]
  fn respects_downstream_demand() {
    let sub = TestSubscriber::<i32, ()>::withhold();
    publisher::from_iter(children())
      .concat_all()
      .subscribe(sub.clone());
    assert!(sub.values().is_empty());

    sub.request(Demand::finite(3));
    assert_eq!(sub.values(), vec![0, 1, 2]);

    sub.request(Demand::finite(4));
    assert_eq!(sub.values(), vec![0, 1, 2, 3, 4, 5, 6]);
    assert!(!sub.is_terminated());

    sub.request(Demand::UNLIMITED);
    assert_eq!(sub.values(), (0..16).collect::<Vec<_>>());
    assert_eq!(sub.completion(), Some(Completion::Finished));
  }

  #[test]
  fn upstream_completion_waits_for_live_child_and_buffer() {
    let outer = ManualPublisher::<BoxPublisher<i32, ()>, ()>::new();
    let inner = ManualPublisher::<i32, ()>::new();
    let sub = TestSubscriber::<i32, ()>::unlimited();
    outer.clone().concat_all().subscribe(sub.clone());

    outer.emit(inner.clone().boxed());
    outer.emit(publisher::just(99).boxed());
    outer.finish();
    assert!(!sub.is_terminated());

    inner.emit(1);
    inner.finish();
    assert_eq!(sub.values(), vec![1, 99]);
    assert_eq!(sub.completion(), Some(Completion::Finished));
  }

  #[test]
  fn child_failure_forwards_and_drops_the_buffer() {
    let outer = ManualPublisher::<BoxPublisher<i32, &str>, &str>::new();
    let inner = ManualPublisher::<i32, &str>::new();
    let survivor = ManualPublisher::<i32, &str>::new();
    let sub = TestSubscriber::<i32, &str>::unlimited();
    outer.clone().concat_all().subscribe(sub.clone());

    outer.emit(inner.clone().boxed());
    outer.emit(survivor.clone().boxed());

    inner.emit(5);
    inner.fail("child broke");
    assert_eq!(sub.values(), vec![5]);
    assert_eq!(sub.completion(), Some(Completion::Failed("child broke")));
    assert!(outer.is_cancelled());
    // The buffered child never started.
    assert_eq!(survivor.attempts(), 0);
  }

  #[test]
  fn upstream_failure_cancels_the_live_child() {
    let outer = ManualPublisher::<BoxPublisher<i32, &str>, &str>::new();
    let inner = ManualPublisher::<i32, &str>::new();
    let sub = TestSubscriber::<i32, &str>::unlimited();
    outer.clone().concat_all().subscribe(sub.clone());

    outer.emit(inner.clone().boxed());
    inner.emit(1);
    outer.fail("outer broke");

    assert_eq!(sub.values(), vec![1]);
    assert_eq!(sub.completion(), Some(Completion::Failed("outer broke")));
    assert!(inner.is_cancelled());
  }

  #[test]
  fn cancel_reaches_upstream_and_live_child() {
    let outer = ManualPublisher::<BoxPublisher<i32, ()>, ()>::new();
    let inner = ManualPublisher::<i32, ()>::new();
    let sub = TestSubscriber::<i32, ()>::unlimited();
    outer.clone().concat_all().subscribe(sub.clone());

    outer.emit(inner.clone().boxed());
    inner.emit(1);
    sub.cancel();

    assert!(outer.is_cancelled());
    assert!(inner.is_cancelled());
    inner.finish();
    assert!(!sub.is_terminated());
  }
}
