use crate::prelude::*;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

/// Creates a publisher emitting the items of an iterator, exactly as fast
/// as they are demanded.
///
/// The iterator is advanced once per unit of demand; it completes the
/// subscription when exhausted. Demand granted through the return value of
/// `on_next` is folded into the emission loop.
///
/// ```rust
/// use pullflow::prelude::*;
/// use pullflow::testing::TestSubscriber;
///
/// let sub = TestSubscriber::<i32, ()>::prefetch(Demand::finite(2));
/// publisher::from_iter(1..=10).subscribe(sub.clone());
/// assert_eq!(sub.values(), vec![1, 2]);
/// assert!(!sub.is_terminated());
///
/// sub.request(Demand::UNLIMITED);
/// assert_eq!(sub.values().len(), 10);
/// assert_eq!(sub.completion(), Some(Completion::Finished));
/// ```
pub fn from_iter<I, Err>(iter: I) -> FromIter<I, Err>
where
  I: IntoIterator,
{
  FromIter { iter, _e: PhantomData }
}

#[derive(Clone)]
pub struct FromIter<I, Err> {
  iter: I,
  _e: PhantomData<Err>,
}

struct IterState<I> {
  // `None` once exhausted or cancelled.
  iter: Option<I>,
  demand: Demand,
  // Reentrancy guard: only one thread drains at a time; everyone else
  // just tops the demand up and leaves.
  emitting: bool,
  armed: bool,
}

enum Step<Item> {
  Emit(Item),
  Complete,
  Stop,
}

impl<I, Err> Publisher for FromIter<I, Err>
where
  I: IntoIterator + Send + 'static,
  I::IntoIter: Send + 'static,
  I::Item: Send + 'static,
  Err: Send + 'static,
{
  type Item = I::Item;
  type Err = Err;

  fn subscribe<S>(self, mut subscriber: S)
  where
    S: Subscriber<Item = I::Item, Err = Err> + Send + 'static,
  {
    let state = Arc::new(Mutex::new(IterState {
      iter: Some(self.iter.into_iter()),
      demand: Demand::NONE,
      emitting: false,
      armed: false,
    }));
    let down: DownstreamRef<S> = DownstreamRef::vacant();
    let subscription = IterSubscription {
      state: state.clone(),
      down: down.clone(),
    };
    subscriber.on_subscribe(Box::new(IterSubscription {
      state: state.clone(),
      down: down.clone(),
    }));

    if state.lock().unwrap().iter.is_none() {
      // Cancelled from inside the acknowledgment; never armed.
      drop(subscriber);
      return;
    }
    // Arm first; nothing drains until `armed` flips, and the state lock
    // is never held while the consumer cell's lock is taken.
    down.arm(subscriber);
    let drain = {
      let mut st = state.lock().unwrap();
      st.armed = true;
      if st.iter.is_some() && st.demand.has_any() && !st.emitting {
        st.emitting = true;
        true
      } else {
        false
      }
    };
    if drain {
      subscription.drain();
    }
  }
}

struct IterSubscription<I, D: Subscriber> {
  state: Arc<Mutex<IterState<I>>>,
  down: DownstreamRef<D>,
}

impl<I, D> IterSubscription<I, D>
where
  I: Iterator,
  D: Subscriber<Item = I::Item>,
{
  fn drain(&self) {
    loop {
      let step = {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        match st.iter.as_mut() {
          None => {
            st.emitting = false;
            Step::Stop
          }
          Some(iter) => {
            if st.demand.take_one() {
              match iter.next() {
                Some(v) => Step::Emit(v),
                None => {
                  st.iter = None;
                  st.emitting = false;
                  Step::Complete
                }
              }
            } else {
              st.emitting = false;
              Step::Stop
            }
          }
        }
      };
      match step {
        Step::Emit(v) => {
          let extra = self.down.deliver(v);
          if extra.has_any() {
            self.state.lock().unwrap().demand += extra;
          }
        }
        Step::Complete => {
          self.down.finish(Completion::Finished);
          return;
        }
        Step::Stop => return,
      }
    }
  }
}

impl<I, D> Subscription for IterSubscription<I, D>
where
  I: Iterator,
  D: Subscriber<Item = I::Item>,
{
  fn request(&mut self, demand: Demand) {
    let drain = {
      let mut st = self.state.lock().unwrap();
      st.demand += demand;
      if st.armed
        && !st.emitting
        && st.demand.has_any()
        && st.iter.is_some()
      {
        st.emitting = true;
        true
      } else {
        false
      }
    };
    if drain {
      self.drain();
    }
  }

  fn cancel(&mut self) {
    // Only the iterator is released here. Cancellation can arrive from
    // inside a delivery (a stage cancelling upstream while its consumer
    // runs), so the consumer cell, whose lock that delivery still holds,
    // must not be touched; it is freed when the subscription handles drop.
    drop(self.state.lock().unwrap().iter.take());
  }
}

#[cfg(test)]
mod test {
  use crate::prelude::*;
  use crate::testing::TestSubscriber;

  #[test]
  fn respects_demand_exactly() {
    let sub = TestSubscriber::<i32, ()>::withhold();
    publisher::from_iter(0..100).subscribe(sub.clone());
    assert!(sub.values().is_empty());

    sub.request(Demand::finite(3));
    assert_eq!(sub.values(), vec![0, 1, 2]);

    sub.request(Demand::finite(2));
    assert_eq!(sub.values(), vec![0, 1, 2, 3, 4]);
    assert!(!sub.is_terminated());
  }

  #[test]
  fn completes_on_exhaustion() {
    let sub = TestSubscriber::<i32, ()>::unlimited();
    publisher::from_iter(0..4).subscribe(sub.clone());
    assert_eq!(sub.values(), vec![0, 1, 2, 3]);
    assert_eq!(sub.completion(), Some(Completion::Finished));
  }

  #[test]
  fn replenishing_consumer_pulls_one_at_a_time() {
    let sub = TestSubscriber::<i32, ()>::prefetch(Demand::finite(1))
      .replenish(Demand::finite(1));
    publisher::from_iter(0..5).subscribe(sub.clone());
    assert_eq!(sub.values(), vec![0, 1, 2, 3, 4]);
    assert_eq!(sub.completion(), Some(Completion::Finished));
  }

  #[test]
  fn cancel_stops_emission() {
    let sub = TestSubscriber::<i32, ()>::withhold();
    publisher::from_iter(0..).subscribe(sub.clone());
    sub.request(Demand::finite(2));
    sub.cancel();
    sub.request(Demand::finite(2));
    assert_eq!(sub.values(), vec![0, 1]);
    assert!(!sub.is_terminated());
  }
}
