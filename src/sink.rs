use crate::prelude::*;
use std::marker::PhantomData;

/// A consumer that requests a fixed amount of demand once at subscription
/// time and never again.
///
/// Useful as a bounded sink: the producer can never deliver more than the
/// initial grant.
///
/// ```rust
/// use pullflow::prelude::*;
/// use std::sync::{Arc, Mutex};
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = {
///   let seen = seen.clone();
///   FixedDemand::new(Demand::finite(3), move |v: i32| {
///     seen.lock().unwrap().push(v)
///   }, |_: Completion<()>| {})
/// };
/// publisher::from_iter(0..100).subscribe(sink);
/// assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
/// ```
pub struct FixedDemand<Item, Err, FN, FC> {
  demand: Demand,
  on_next: FN,
  on_complete: FC,
  _t: PhantomData<(Item, Err)>,
}

impl<Item, Err, FN, FC> FixedDemand<Item, Err, FN, FC>
where
  FN: FnMut(Item),
  FC: FnMut(Completion<Err>),
{
  pub fn new(demand: Demand, on_next: FN, on_complete: FC) -> Self {
    FixedDemand { demand, on_next, on_complete, _t: PhantomData }
  }
}

impl<Item, Err, FN, FC> Subscriber for FixedDemand<Item, Err, FN, FC>
where
  FN: FnMut(Item),
  FC: FnMut(Completion<Err>),
{
  type Item = Item;
  type Err = Err;

  fn on_subscribe(&mut self, mut subscription: BoxSubscription) {
    subscription.request(self.demand);
  }

  fn on_next(&mut self, value: Item) -> Demand {
    (self.on_next)(value);
    Demand::NONE
  }

  fn on_complete(&mut self, completion: Completion<Err>) {
    (self.on_complete)(completion);
  }
}

/// A consumer that keeps exactly one value in flight: it requests one
/// value up front and grants one more as each value arrives.
pub struct SteadyDemand<Item, Err, FN, FC> {
  on_next: FN,
  on_complete: FC,
  _t: PhantomData<(Item, Err)>,
}

impl<Item, Err, FN, FC> SteadyDemand<Item, Err, FN, FC>
where
  FN: FnMut(Item),
  FC: FnMut(Completion<Err>),
{
  pub fn new(on_next: FN, on_complete: FC) -> Self {
    SteadyDemand { on_next, on_complete, _t: PhantomData }
  }
}

impl<Item, Err, FN, FC> Subscriber for SteadyDemand<Item, Err, FN, FC>
where
  FN: FnMut(Item),
  FC: FnMut(Completion<Err>),
{
  type Item = Item;
  type Err = Err;

  fn on_subscribe(&mut self, mut subscription: BoxSubscription) {
    subscription.request(Demand::finite(1));
  }

  fn on_next(&mut self, value: Item) -> Demand {
    (self.on_next)(value);
    Demand::finite(1)
  }

  fn on_complete(&mut self, completion: Completion<Err>) {
    (self.on_complete)(completion);
  }
}
