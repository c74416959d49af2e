use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::WorkerError;

/// A unit of background work run on a fixed interval.
///
/// `tick` is awaited to completion before the next tick may start, so ticks of
/// one task never overlap. A tick error is fatal for the current run.
#[async_trait::async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    async fn tick(&self) -> Result<(), WorkerError>;
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    /// Successful ticks, across restarts.
    pub ticks: u64,
    /// Ticks that returned an error.
    pub failures: u64,
    pub restarts: u64,
}

pub(crate) type SharedStats = Arc<Mutex<WorkerStats>>;

pub(crate) fn update(stats: &SharedStats, f: impl FnOnce(&mut WorkerStats)) {
    f(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}

/// Run `task` until `shutdown` is notified (`Ok`) or a tick fails (`Err`).
///
/// The first tick fires immediately. Shutdown is only observed between
/// ticks; a running tick always completes.
pub(crate) async fn run_periodic<T>(
    task: &T,
    shutdown: &Notify,
    stats: &SharedStats,
) -> Result<(), WorkerError>
where
    T: PeriodicTask + ?Sized,
{
    let mut interval = tokio::time::interval(task.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!(worker = %task.name(), "worker stopping");
                return Ok(());
            }
            _ = interval.tick() => {}
        }

        match task.tick().await {
            Ok(()) => update(stats, |s| s.ticks += 1),
            Err(err) => {
                update(stats, |s| s.failures += 1);
                error!(worker = %task.name(), error = %err, "worker tick failed");
                return Err(err);
            }
        }
    }
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: Arc<Notify>,
    join: JoinHandle<Result<(), WorkerError>>,
    stats: SharedStats,
}

impl WorkerHandle {
    pub(crate) fn new(
        name: String,
        shutdown: Arc<Notify>,
        join: JoinHandle<Result<(), WorkerError>>,
        stats: SharedStats,
    ) -> Self {
        Self {
            name,
            shutdown,
            join,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Signal used to request shutdown; a notification sent while a tick is
    /// running is kept until the loop next checks.
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Wait for the worker to finish.
    pub async fn join(self) -> Result<(), WorkerError> {
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(WorkerError::Panicked {
                worker: self.name,
                reason: err.to_string(),
            }),
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) -> Result<(), WorkerError> {
        self.shutdown.notify_one();
        self.join().await
    }
}
