use crate::scheduler::{ScheduleHandle, Scheduler};
use futures::task::{Spawn, SpawnExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A [`Scheduler`] running tasks on any `futures` executor.
///
/// The delay is awaited with a `futures-time` sleep on the executor, so no
/// thread blocks while waiting. Cancellation is checked when the sleep
/// elapses; a cancelled task is dropped without running.
#[derive(Clone)]
pub struct SpawnScheduler<Sp> {
  spawner: Sp,
}

impl<Sp: Spawn> SpawnScheduler<Sp> {
  pub fn new(spawner: Sp) -> Self { SpawnScheduler { spawner } }
}

impl<Sp: Spawn> Scheduler for SpawnScheduler<Sp> {
  type Handle = SpawnHandle;

  fn schedule_after(
    &self,
    delay: Duration,
    _tolerance: Duration,
    task: Box<dyn FnOnce() + Send>,
  ) -> SpawnHandle {
    let cancelled = Arc::new(AtomicBool::new(false));
    let guard = cancelled.clone();
    self
      .spawner
      .spawn(async move {
        futures_time::task::sleep(delay.into()).await;
        if !guard.load(Ordering::SeqCst) {
          task();
        }
      })
      .unwrap();
    SpawnHandle(cancelled)
  }
}

/// Handle to a task scheduled on a [`SpawnScheduler`].
pub struct SpawnHandle(Arc<AtomicBool>);

impl ScheduleHandle for SpawnHandle {
  fn cancel(&mut self) { self.0.store(true, Ordering::SeqCst); }
}

/// A [`SpawnScheduler`] backed by a fresh `futures` thread pool.
#[cfg(feature = "futures-scheduler")]
pub fn pool_scheduler() -> SpawnScheduler<futures::executor::ThreadPool> {
  SpawnScheduler::new(futures::executor::ThreadPool::new().unwrap())
}

#[cfg(all(test, feature = "futures-scheduler"))]
mod test {
  use super::*;
  use std::thread;
  use std::time::Instant;

  #[test]
  fn fires_on_the_pool() {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let scheduler = pool_scheduler();
    let started = Instant::now();
    scheduler.schedule_after(
      Duration::from_millis(20),
      Duration::ZERO,
      Box::new(move || flag.store(true, Ordering::SeqCst)),
    );
    while !fired.load(Ordering::SeqCst) {
      assert!(started.elapsed() < Duration::from_secs(5));
      thread::sleep(Duration::from_millis(1));
    }
  }

  #[test]
  fn cancel_prevents_the_task() {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let scheduler = pool_scheduler();
    let mut handle = scheduler.schedule_after(
      Duration::from_millis(20),
      Duration::ZERO,
      Box::new(move || flag.store(true, Ordering::SeqCst)),
    );
    handle.cancel();
    thread::sleep(Duration::from_millis(80));
    assert!(!fired.load(Ordering::SeqCst));
  }
}
