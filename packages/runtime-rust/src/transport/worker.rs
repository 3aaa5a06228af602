//! Single-task background worker.
//!
//! A [`BackgroundRunnable`] owns some state (the retry scheduler's parked
//! deliveries, for one) and is driven from one spawned task: submitted work
//! arrives over a bounded channel and a fixed-period tick lets it act on
//! time. Because one task runs everything, the runnable needs no locking.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Capacity of a worker's submission channel.
const SUBMIT_CAPACITY: usize = 256;

/// The worker's task has ended; the submission was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("background worker `{0}` has stopped")]
pub struct WorkerStopped(pub &'static str);

/// State driven by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Name used in logs and errors.
    const NAME: &'static str;

    /// Accepts one submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Runs once per tick period, starting one period after the worker
    /// starts.
    async fn on_tick(&mut self) {}

    /// Runs once after the worker was asked to stop.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// WorkerHandle
// ---------------------------------------------------------------------------

/// Cloneable submission side of a worker.
#[derive(Debug)]
pub struct WorkerHandle<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
}

impl<T> Clone for WorkerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> WorkerHandle<T> {
    /// Queues `task`, waiting while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerStopped`] once the worker's task has ended.
    pub async fn submit(&self, task: T) -> Result<(), WorkerStopped> {
        self.tx.send(task).await.map_err(|_| WorkerStopped(self.name))
    }
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Owner of a running [`BackgroundRunnable`].
pub struct BackgroundWorker<R: BackgroundRunnable> {
    submitter: WorkerHandle<R::Task>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker task. Must be called inside a tokio runtime.
    pub fn start(runnable: R, tick: Duration) -> Self {
        let (tx, rx) = mpsc::channel(SUBMIT_CAPACITY);
        let (stop, stopped) = oneshot::channel();
        debug!(worker = R::NAME, tick_ms = tick.as_millis(), "background worker started");

        Self {
            submitter: WorkerHandle { name: R::NAME, tx },
            stop: Some(stop),
            task: Some(tokio::spawn(drive(runnable, rx, stopped, tick))),
        }
    }

    /// A submitter that outlives borrows of the worker. Fails once the
    /// worker has stopped.
    #[must_use]
    pub fn handle(&self) -> WorkerHandle<R::Task> {
        self.submitter.clone()
    }

    /// Shorthand for `handle().submit(task)`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerStopped`] once the worker has stopped.
    pub async fn submit(&self, task: R::Task) -> Result<(), WorkerStopped> {
        self.submitter.submit(task).await
    }

    /// Signals the worker, waits for `shutdown` to finish, and drops the
    /// runnable. Calling it again does nothing.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(worker = R::NAME, error = %e, "background worker task ended abnormally");
            }
        }
    }
}

async fn drive<R: BackgroundRunnable>(
    mut runnable: R,
    mut rx: mpsc::Receiver<R::Task>,
    mut stopped: oneshot::Receiver<()>,
    tick: Duration,
) {
    let mut ticks = tokio::time::interval_at(Instant::now() + tick, tick);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            task = rx.recv() => match task {
                Some(task) => runnable.run(task).await,
                None => break,
            },
            _ = ticks.tick() => runnable.on_tick().await,
        }
    }

    runnable.shutdown().await;
    debug!(worker = R::NAME, "background worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Records resend ids as they are accepted and as ticks flush them.
    #[derive(Default)]
    struct ResendLog {
        accepted: Vec<u64>,
        flushed: Vec<u64>,
        ticks: u32,
        shut_down: u32,
    }

    struct ResendRecorder(Arc<Mutex<ResendLog>>);

    #[async_trait]
    impl BackgroundRunnable for ResendRecorder {
        type Task = u64;
        const NAME: &'static str = "resend-recorder";

        async fn run(&mut self, delivery_id: u64) {
            self.0.lock().accepted.push(delivery_id);
        }

        async fn on_tick(&mut self) {
            let mut log = self.0.lock();
            log.ticks += 1;
            let accepted = std::mem::take(&mut log.accepted);
            log.flushed.extend(accepted);
        }

        async fn shutdown(&mut self) {
            self.0.lock().shut_down += 1;
        }
    }

    fn recorder() -> (Arc<Mutex<ResendLog>>, ResendRecorder) {
        let log = Arc::new(Mutex::new(ResendLog::default()));
        (Arc::clone(&log), ResendRecorder(log))
    }

    #[tokio::test(start_paused = true)]
    async fn submissions_from_several_handles_are_flushed_on_tick() {
        let (log, runnable) = recorder();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_millis(50));
        let bus_side = worker.handle();
        let transport_side = worker.handle();

        bus_side.submit(1).await.unwrap();
        transport_side.submit(2).await.unwrap();
        worker.submit(3).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(log.lock().accepted, vec![1, 2, 3]);
        assert!(log.lock().flushed.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.lock().flushed, vec![1, 2, 3]);
        assert_eq!(log.lock().ticks, 1);
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_period() {
        let (log, runnable) = recorder();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(log.lock().ticks, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.lock().ticks, 3);
        worker.stop().await;
    }

    #[tokio::test]
    async fn stopped_worker_rejects_resends() {
        let (log, runnable) = recorder();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_secs(60));
        let handle = worker.handle();

        worker.stop().await;
        worker.stop().await;

        assert_eq!(log.lock().shut_down, 1);
        assert_eq!(handle.submit(9).await, Err(WorkerStopped("resend-recorder")));
        assert!(worker.submit(10).await.is_err());
    }
}
