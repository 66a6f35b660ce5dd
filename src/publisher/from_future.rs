use crate::prelude::*;
use futures::task::{Spawn, SpawnExt};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

/// Converts a `Future` into a single-shot publisher.
///
/// The future is spawned on the given executor when the first demand
/// arrives; its output is delivered as the one value, followed by
/// completion. Cancelling before the future resolves drops the emission.
///
/// ```rust
/// use futures::executor::ThreadPool;
/// use pullflow::prelude::*;
/// use pullflow::testing::TestSubscriber;
/// use std::time::Duration;
///
/// let pool = ThreadPool::new().unwrap();
/// let sub = TestSubscriber::<i32, ()>::unlimited();
/// publisher::from_future(async { 1 + 2 }, pool).subscribe(sub.clone());
///
/// while !sub.is_terminated() {
///   std::thread::sleep(Duration::from_millis(1));
/// }
/// assert_eq!(sub.values(), vec![3]);
/// ```
pub fn from_future<F, Sp, Err>(future: F, spawner: Sp) -> FromFuture<F, Sp, Err>
where
  F: Future,
  Sp: Spawn,
{
  FromFuture { future, spawner, _e: PhantomData }
}

pub struct FromFuture<F, Sp, Err> {
  future: F,
  spawner: Sp,
  _e: PhantomData<Err>,
}

struct FutureState<F, Sp> {
  armed: Option<(F, Sp)>,
  pending: Demand,
  subscribed: bool,
  cancelled: bool,
}

impl<F, Sp> FutureState<F, Sp> {
  fn fire(&mut self) -> Option<(F, Sp)> {
    if self.subscribed && self.pending.has_any() {
      self.armed.take()
    } else {
      None
    }
  }
}

impl<F, Sp, Err> Publisher for FromFuture<F, Sp, Err>
where
  F: Future + Send + 'static,
  F::Output: Send + 'static,
  Sp: Spawn + Send + 'static,
  Err: Send + 'static,
{
  type Item = F::Output;
  type Err = Err;

  fn subscribe<S>(self, mut subscriber: S)
  where
    S: Subscriber<Item = F::Output, Err = Err> + Send + 'static,
  {
    let state = Arc::new(Mutex::new(FutureState {
      armed: Some((self.future, self.spawner)),
      pending: Demand::NONE,
      subscribed: false,
      cancelled: false,
    }));
    let down: DownstreamRef<S> = DownstreamRef::vacant();
    subscriber.on_subscribe(Box::new(FutureSubscription {
      state: state.clone(),
      down: down.clone(),
    }));

    down.arm(subscriber);
    let fired = {
      let mut st = state.lock().unwrap();
      st.subscribed = true;
      if st.cancelled { None } else { st.fire() }
    };
    if let Some((future, spawner)) = fired {
      spawn_delivery(future, spawner, state, down);
    }
  }
}

fn spawn_delivery<F, Sp, D>(
  future: F,
  spawner: Sp,
  state: Arc<Mutex<FutureState<F, Sp>>>,
  down: DownstreamRef<D>,
) where
  F: Future + Send + 'static,
  F::Output: Send + 'static,
  Sp: Spawn + Send + 'static,
  D: Subscriber<Item = F::Output> + Send + 'static,
  D::Err: Send + 'static,
{
  spawner
    .spawn(async move {
      let value = future.await;
      if state.lock().unwrap().cancelled {
        return;
      }
      down.deliver(value);
      down.finish(Completion::Finished);
    })
    .unwrap();
}

struct FutureSubscription<F, Sp, D: Subscriber> {
  state: Arc<Mutex<FutureState<F, Sp>>>,
  down: DownstreamRef<D>,
}

impl<F, Sp, D> Subscription for FutureSubscription<F, Sp, D>
where
  F: Future + Send + 'static,
  F::Output: Send + 'static,
  Sp: Spawn + Send + 'static,
  D: Subscriber<Item = F::Output> + Send + 'static,
  D::Err: Send + 'static,
{
  fn request(&mut self, demand: Demand) {
    let fired = {
      let mut st = self.state.lock().unwrap();
      st.pending += demand;
      st.fire()
    };
    if let Some((future, spawner)) = fired {
      spawn_delivery(future, spawner, self.state.clone(), self.down.clone());
    }
  }

  fn cancel(&mut self) {
    // Flag plus disarm only; the consumer cell is left for the spawned
    // task (which re-checks the flag) and the handle drops to free.
    let armed = {
      let mut st = self.state.lock().unwrap();
      st.cancelled = true;
      st.armed.take()
    };
    drop(armed);
  }
}
