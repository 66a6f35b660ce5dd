use crate::scheduler::{ScheduleHandle, Scheduler};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Returns a [`Scheduler`] that runs each scheduled task on a thread of
/// its own.
pub fn new_thread() -> NewThreadScheduler { NewThreadScheduler }

/// A wall-clock [`Scheduler`] spawning one thread per task.
///
/// The thread waits on a condition variable, so cancellation wakes and
/// retires it promptly instead of letting it sleep the delay out. Tasks
/// fire as close to `delay` as the platform timer allows; the tolerance is
/// not needed.
#[derive(Clone, Copy, Default)]
pub struct NewThreadScheduler;

impl Scheduler for NewThreadScheduler {
  type Handle = ThreadHandle;

  fn schedule_after(
    &self,
    delay: Duration,
    _tolerance: Duration,
    task: Box<dyn FnOnce() + Send>,
  ) -> ThreadHandle {
    let shared = Arc::new((Mutex::new(false), Condvar::new()));
    let waiter = shared.clone();
    thread::spawn(move || {
      let (lock, cvar) = &*waiter;
      let deadline = Instant::now() + delay;
      let mut cancelled = lock.lock().unwrap();
      loop {
        if *cancelled {
          return;
        }
        let now = Instant::now();
        if now >= deadline {
          break;
        }
        let (guard, _) =
          cvar.wait_timeout(cancelled, deadline - now).unwrap();
        cancelled = guard;
      }
      drop(cancelled);
      task();
    });
    ThreadHandle(shared)
  }
}

/// Handle to a task scheduled on a [`NewThreadScheduler`].
pub struct ThreadHandle(Arc<(Mutex<bool>, Condvar)>);

impl ScheduleHandle for ThreadHandle {
  fn cancel(&mut self) {
    let (lock, cvar) = &*self.0;
    *lock.lock().unwrap() = true;
    cvar.notify_all();
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};

  #[test]
  fn fires_after_the_delay() {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let started = Instant::now();
    new_thread().schedule_after(
      Duration::from_millis(30),
      Duration::ZERO,
      Box::new(move || flag.store(true, Ordering::SeqCst)),
    );
    while !fired.load(Ordering::SeqCst) {
      assert!(started.elapsed() < Duration::from_secs(5));
      thread::sleep(Duration::from_millis(1));
    }
    assert!(started.elapsed() >= Duration::from_millis(30));
  }

  #[test]
  fn cancel_prevents_the_task() {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let mut handle = new_thread().schedule_after(
      Duration::from_millis(20),
      Duration::ZERO,
      Box::new(move || flag.store(true, Ordering::SeqCst)),
    );
    handle.cancel();
    thread::sleep(Duration::from_millis(60));
    assert!(!fired.load(Ordering::SeqCst));
  }
}
