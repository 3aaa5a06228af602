//! Transport boundary.
//!
//! - [`bus`]: the [`ServiceBus`] sending contract and the typed [`BusHandle`]
//! - [`local`]: the in-process queue and its consumer
//! - [`retry`]: delayed re-sends, run on a [`BackgroundWorker`]
//! - [`shutdown`]: health state and in-flight tracking
//! - [`worker`]: generic background worker

pub mod bus;
pub mod local;
pub mod retry;
pub mod shutdown;
pub mod worker;

pub use bus::{BusHandle, ServiceBus};
pub use local::{LocalBus, LocalInbox, LocalTransport, QueuedDelivery};
pub use retry::{RetryScheduler, ScheduledResend};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
pub use worker::{BackgroundRunnable, BackgroundWorker, WorkerHandle, WorkerStopped};
