//! Prelude module for convenient imports
//!
//! Re-exports the protocol traits, the conduit building blocks and the
//! operator types most code touches.

pub use crate::conduit::{
  Activation, ConduitCell, ConduitControl, ConduitState, ConduitSubscription,
};
pub use crate::demand::Demand;
pub use crate::ops::async_map::{AsyncMapOp, Delivery, Promise};
pub use crate::ops::concat_all::ConcatAllOp;
pub use crate::ops::into_stream::PublisherStream;
pub use crate::ops::retry_delayed::{RetryDelayedOp, RetryDelays};
pub use crate::publisher;
pub use crate::publisher::{BoxPublisher, Publisher};
pub use crate::rc::{DownstreamRef, MutArc};
pub use crate::scheduler::{
  new_thread, NewThreadScheduler, ScheduleHandle, Scheduler, TestScheduler,
};
#[cfg(all(feature = "futures-scheduler", feature = "timer"))]
pub use crate::scheduler::pool_scheduler;
#[cfg(feature = "timer")]
pub use crate::scheduler::SpawnScheduler;
#[cfg(feature = "tokio-scheduler")]
pub use crate::scheduler::TokioScheduler;
pub use crate::sink::{FixedDemand, SteadyDemand};
pub use crate::subscriber::{BoxSubscriber, Completion, Subscriber};
pub use crate::subscription::{
  BoxSubscription, SharedSubscription, Subscription,
};
