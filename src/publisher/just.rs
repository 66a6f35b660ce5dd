use crate::prelude::*;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

/// Creates a publisher producing a single value.
///
/// The value is emitted on the first demand, then the publisher completes.
///
/// ```rust
/// use pullflow::prelude::*;
/// use pullflow::testing::TestSubscriber;
///
/// let sub = TestSubscriber::<i32, ()>::unlimited();
/// publisher::just(7).subscribe(sub.clone());
/// assert_eq!(sub.values(), vec![7]);
/// ```
pub fn just<Item, Err>(value: Item) -> Just<Item, Err> {
  Just { value, _e: PhantomData }
}

#[derive(Clone)]
pub struct Just<Item, Err> {
  value: Item,
  _e: PhantomData<Err>,
}

struct JustState<Item, D> {
  value: Option<Item>,
  // Absent until `on_subscribe` has returned, so demand requested from
  // inside the acknowledgment is latched instead of fired into a consumer
  // we still hold a `&mut` to.
  down: Option<D>,
  pending: Demand,
  cancelled: bool,
}

impl<Item, D> JustState<Item, D> {
  /// Takes value and consumer out together once both are available and
  /// demand has arrived. Single-shot: after this the subscription is dead.
  fn fire(&mut self) -> Option<(Item, D)> {
    if self.pending.has_any() && self.down.is_some() && self.value.is_some()
    {
      Some((self.value.take().unwrap(), self.down.take().unwrap()))
    } else {
      None
    }
  }
}

impl<Item, Err> Publisher for Just<Item, Err>
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
    let state = Arc::new(Mutex::new(JustState {
      value: Some(self.value),
      down: None,
      pending: Demand::NONE,
      cancelled: false,
    }));
    subscriber.on_subscribe(Box::new(JustSubscription(state.clone())));

    let fired = {
      let mut st = state.lock().unwrap();
      if st.cancelled {
        None
      } else {
        st.down = Some(subscriber);
        st.fire()
      }
    };
    if let Some((value, mut down)) = fired {
      down.on_next(value);
      down.on_complete(Completion::Finished);
    }
  }
}

struct JustSubscription<Item, D>(Arc<Mutex<JustState<Item, D>>>);

impl<Item, D> Subscription for JustSubscription<Item, D>
where
  D: Subscriber<Item = Item>,
{
  fn request(&mut self, demand: Demand) {
    let fired = {
      let mut st = self.0.lock().unwrap();
      st.pending += demand;
      st.fire()
    };
    if let Some((value, mut down)) = fired {
      down.on_next(value);
      down.on_complete(Completion::Finished);
    }
  }

  fn cancel(&mut self) {
    let dropped = {
      let mut st = self.0.lock().unwrap();
      st.cancelled = true;
      (st.value.take(), st.down.take())
    };
    drop(dropped);
  }
}

#[cfg(test)]
mod test {
  use crate::prelude::*;
  use crate::testing::TestSubscriber;

  #[test]
  fn emits_only_on_demand() {
    let sub = TestSubscriber::<i32, ()>::withhold();
    publisher::just(42).subscribe(sub.clone());
    assert!(sub.values().is_empty());
    assert!(!sub.is_terminated());

    sub.request(Demand::finite(1));
    assert_eq!(sub.values(), vec![42]);
    assert_eq!(sub.completion(), Some(Completion::Finished));
  }

  #[test]
  fn cancel_before_demand_suppresses_everything() {
    let sub = TestSubscriber::<i32, ()>::withhold();
    publisher::just(42).subscribe(sub.clone());
    sub.cancel();
    sub.request(Demand::finite(1));
    assert!(sub.values().is_empty());
    assert!(!sub.is_terminated());
  }
}
