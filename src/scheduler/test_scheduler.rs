//! Deterministic virtual-time scheduler for tests.
//!
//! Virtual time only advances when a test says so, and due tasks run
//! synchronously inside [`TestScheduler::advance_by`], in due-time order,
//! ties broken by scheduling order. Clones share one clock, so the
//! scheduler can be handed to a stage and kept by the test.

use crate::scheduler::{ScheduleHandle, Scheduler};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ScheduledTask {
  due: Duration,
  seq: usize,
  task: Option<Box<dyn FnOnce() + Send>>,
  cancelled: Arc<AtomicBool>,
}

impl PartialEq for ScheduledTask {
  fn eq(&self, other: &Self) -> bool {
    self.due == other.due && self.seq == other.seq
  }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for ScheduledTask {
  fn cmp(&self, other: &Self) -> Ordering {
    // Min-heap: earliest due time first, then FIFO by sequence number.
    other
      .due
      .cmp(&self.due)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

struct TestSchedulerState {
  now: Duration,
  queue: BinaryHeap<ScheduledTask>,
  next_seq: usize,
}

/// A [`Scheduler`] running on virtual time.
///
/// The configured tolerance is ignored: tasks fire exactly `delay` after
/// the moment they were scheduled, which is what deterministic tests want.
///
/// ```rust
/// use pullflow::prelude::*;
/// use std::sync::{Arc, Mutex};
/// use std::time::Duration;
///
/// let scheduler = TestScheduler::new();
/// let fired = Arc::new(Mutex::new(false));
/// let flag = fired.clone();
/// scheduler.schedule_after(
///   Duration::from_millis(100),
///   Duration::ZERO,
///   Box::new(move || *flag.lock().unwrap() = true),
/// );
///
/// scheduler.advance_by(Duration::from_millis(99));
/// assert!(!*fired.lock().unwrap());
/// scheduler.advance_by(Duration::from_millis(1));
/// assert!(*fired.lock().unwrap());
/// ```
pub struct TestScheduler(Arc<Mutex<TestSchedulerState>>);

impl Default for TestScheduler {
  fn default() -> Self { Self::new() }
}

impl Clone for TestScheduler {
  fn clone(&self) -> Self { TestScheduler(self.0.clone()) }
}

impl TestScheduler {
  pub fn new() -> Self {
    TestScheduler(Arc::new(Mutex::new(TestSchedulerState {
      now: Duration::ZERO,
      queue: BinaryHeap::new(),
      next_seq: 0,
    })))
  }

  /// The current virtual time.
  pub fn now(&self) -> Duration { self.0.lock().unwrap().now }

  /// Number of scheduled tasks that are neither run nor cancelled.
  pub fn pending(&self) -> usize {
    self
      .0
      .lock()
      .unwrap()
      .queue
      .iter()
      .filter(|t| !t.cancelled.load(AtomicOrdering::SeqCst))
      .count()
  }

  /// Moves virtual time forward by `delta`, running every task that comes
  /// due on the way, in order.
  pub fn advance_by(&self, delta: Duration) {
    let target = self.0.lock().unwrap().now + delta;
    self.advance_to(target);
  }

  /// Moves virtual time forward to `target`, running every task that comes
  /// due on the way, in order. Time never moves backwards.
  pub fn advance_to(&self, target: Duration) {
    loop {
      // Pop the next due task under the lock, run it outside: a task may
      // schedule follow-up work on this same scheduler.
      let task = {
        let mut state = self.0.lock().unwrap();
        match state.queue.peek() {
          Some(head) if head.due <= target => {
            let mut entry = state.queue.pop().unwrap();
            state.now = state.now.max(entry.due);
            entry.task.take()
          }
          _ => {
            state.now = state.now.max(target);
            return;
          }
        }
      };
      if let Some(task) = task {
        task();
      }
    }
  }
}

impl Scheduler for TestScheduler {
  type Handle = TestHandle;

  fn schedule_after(
    &self,
    delay: Duration,
    _tolerance: Duration,
    task: Box<dyn FnOnce() + Send>,
  ) -> TestHandle {
    let cancelled = Arc::new(AtomicBool::new(false));
    let guard = cancelled.clone();
    let mut state = self.0.lock().unwrap();
    let due = state.now + delay;
    let seq = state.next_seq;
    state.next_seq += 1;
    state.queue.push(ScheduledTask {
      due,
      seq,
      task: Some(Box::new(move || {
        if !guard.load(AtomicOrdering::SeqCst) {
          task();
        }
      })),
      cancelled: cancelled.clone(),
    });
    TestHandle(cancelled)
  }
}

/// Handle to a task scheduled on a [`TestScheduler`].
pub struct TestHandle(Arc<AtomicBool>);

impl ScheduleHandle for TestHandle {
  fn cancel(&mut self) { self.0.store(true, AtomicOrdering::SeqCst); }
}
