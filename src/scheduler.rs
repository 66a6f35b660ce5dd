use std::time::Duration;

mod new_thread_scheduler;
pub mod test_scheduler;
#[cfg(feature = "timer")]
mod spawn_scheduler;
#[cfg(feature = "tokio-scheduler")]
mod tokio_scheduler;

pub use new_thread_scheduler::{new_thread, NewThreadScheduler};
#[cfg(all(feature = "futures-scheduler", feature = "timer"))]
pub use spawn_scheduler::pool_scheduler;
#[cfg(feature = "timer")]
pub use spawn_scheduler::SpawnScheduler;
pub use test_scheduler::TestScheduler;
#[cfg(feature = "tokio-scheduler")]
pub use tokio_scheduler::TokioScheduler;

/// A capability for running a task once, later, on some other thread.
///
/// Stages that need time never own threads or look a clock up from ambient
/// context; they are handed a `Scheduler` explicitly, which keeps them
/// testable against [`TestScheduler`]'s deterministic virtual time.
pub trait Scheduler {
  type Handle: ScheduleHandle + Send;

  /// Runs `task` once, no earlier than `delay` from now and ideally no
  /// later than `delay + tolerance`. The tolerance is slack the caller
  /// grants the implementation, not a guarantee.
  ///
  /// The returned handle lets the caller ignore a callback that has become
  /// stale: after [`ScheduleHandle::cancel`] the task will not run.
  fn schedule_after(
    &self,
    delay: Duration,
    tolerance: Duration,
    task: Box<dyn FnOnce() + Send>,
  ) -> Self::Handle;
}

/// Cancellation side of a scheduled task.
pub trait ScheduleHandle {
  /// Prevents the task from running if it has not run yet. Idempotent.
  fn cancel(&mut self);
}

impl<H: ScheduleHandle + ?Sized> ScheduleHandle for Box<H> {
  #[inline]
  fn cancel(&mut self) { (**self).cancel() }
}
