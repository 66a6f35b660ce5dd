use crate::prelude::*;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

/// Creates a single-shot publisher that runs `supplier` on the first
/// demand, emits its value (or forwards its error) and completes.
///
/// Nothing runs at subscription time; a consumer that never requests never
/// pays for the computation.
///
/// ```rust
/// use pullflow::prelude::*;
/// use pullflow::testing::TestSubscriber;
///
/// let sub = TestSubscriber::<String, ()>::withhold();
/// publisher::deferred(|| Ok("computed".to_string()))
///   .subscribe(sub.clone());
/// assert!(sub.values().is_empty());
///
/// sub.request(Demand::finite(1));
/// assert_eq!(sub.values(), vec!["computed".to_string()]);
/// assert_eq!(sub.completion(), Some(Completion::Finished));
/// ```
pub fn deferred<F, Item, Err>(supplier: F) -> Deferred<F, Item, Err>
where
  F: FnOnce() -> Result<Item, Err>,
{
  Deferred { supplier, _t: PhantomData }
}

#[derive(Clone)]
pub struct Deferred<F, Item, Err> {
  supplier: F,
  _t: PhantomData<(Item, Err)>,
}

struct DeferredState<F, D> {
  supplier: Option<F>,
  down: Option<D>,
  pending: Demand,
  cancelled: bool,
}

impl<F, D> DeferredState<F, D> {
  fn fire(&mut self) -> Option<(F, D)> {
    if self.pending.has_any()
      && self.down.is_some()
      && self.supplier.is_some()
    {
      Some((self.supplier.take().unwrap(), self.down.take().unwrap()))
    } else {
      None
    }
  }
}

fn run<F, D>(supplier: F, mut down: D)
where
  D: Subscriber,
  F: FnOnce() -> Result<D::Item, D::Err>,
{
  match supplier() {
    Ok(value) => {
      down.on_next(value);
      down.on_complete(Completion::Finished);
    }
    Err(e) => down.on_complete(Completion::Failed(e)),
  }
}

impl<F, Item, Err> Publisher for Deferred<F, Item, Err>
where
  F: FnOnce() -> Result<Item, Err> + Send + 'static,
  Item: Send + 'static,
  Err: Send + 'static,
{
  type Item = Item;
  type Err = Err;

  fn subscribe<S>(self, mut subscriber: S)
  where
    S: Subscriber<Item = Item, Err = Err> + Send + 'static,
  {
    let state = Arc::new(Mutex::new(DeferredState {
      supplier: Some(self.supplier),
      down: None,
      pending: Demand::NONE,
      cancelled: false,
    }));
    subscriber.on_subscribe(Box::new(DeferredSubscription(state.clone())));

    let fired = {
      let mut st = state.lock().unwrap();
      if st.cancelled {
        None
      } else {
        st.down = Some(subscriber);
        st.fire()
      }
    };
    if let Some((supplier, down)) = fired {
      run(supplier, down);
    }
  }
}

struct DeferredSubscription<F, D>(Arc<Mutex<DeferredState<F, D>>>);

impl<F, D> Subscription for DeferredSubscription<F, D>
where
  D: Subscriber,
  F: FnOnce() -> Result<D::Item, D::Err>,
{
  fn request(&mut self, demand: Demand) {
    let fired = {
      let mut st = self.0.lock().unwrap();
      st.pending += demand;
      st.fire()
    };
    if let Some((supplier, down)) = fired {
      run(supplier, down);
    }
  }

  fn cancel(&mut self) {
    let dropped = {
      let mut st = self.0.lock().unwrap();
      st.cancelled = true;
      (st.supplier.take(), st.down.take())
    };
    drop(dropped);
  }
}
