use crate::scheduler::{ScheduleHandle, Scheduler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A [`Scheduler`] running tasks on a tokio runtime.
#[derive(Clone)]
pub struct TokioScheduler {
  handle: tokio::runtime::Handle,
}

impl TokioScheduler {
  pub fn new(handle: tokio::runtime::Handle) -> Self {
    TokioScheduler { handle }
  }

  /// Binds to the runtime the caller is currently on.
  ///
  /// # Panics
  ///
  /// Panics when called outside a tokio runtime context.
  pub fn current() -> Self {
    TokioScheduler { handle: tokio::runtime::Handle::current() }
  }
}

impl Scheduler for TokioScheduler {
  type Handle = TokioHandle;

  fn schedule_after(
    &self,
    delay: Duration,
    _tolerance: Duration,
    task: Box<dyn FnOnce() + Send>,
  ) -> TokioHandle {
    let cancelled = Arc::new(AtomicBool::new(false));
    let guard = cancelled.clone();
    let join = self.handle.spawn(async move {
      tokio::time::sleep(delay).await;
      if !guard.load(Ordering::SeqCst) {
        task();
      }
    });
    TokioHandle { cancelled, join }
  }
}

/// Handle to a task scheduled on a [`TokioScheduler`].
pub struct TokioHandle {
  cancelled: Arc<AtomicBool>,
  join: tokio::task::JoinHandle<()>,
}

impl ScheduleHandle for TokioHandle {
  fn cancel(&mut self) {
    self.cancelled.store(true, Ordering::SeqCst);
    self.join.abort();
  }
}
