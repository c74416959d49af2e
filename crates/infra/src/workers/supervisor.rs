use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tracing::{error, warn};

use super::periodic::{SharedStats, WorkerHandle, WorkerStats, run_periodic, update};
use super::{PeriodicTask, WorkerError};
use crate::jobs::RetryPolicy;

/// Restarts failed workers with backoff.
///
/// A worker that returns an error is restarted from scratch (it re-reads the
/// queue, so no in-flight state is carried over). Consecutive failures are
/// counted; a run that completed at least one tick resets the count. When the
/// policy allows no further retry the supervisor returns
/// [`WorkerError::RestartsExhausted`].
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    policy: RetryPolicy,
}

impl Supervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Spawn `task` on the tokio runtime under supervision.
    pub fn spawn<T: PeriodicTask>(&self, task: Arc<T>) -> WorkerHandle {
        let name = task.name().to_string();
        let shutdown = Arc::new(Notify::new());
        let stats: SharedStats = Arc::new(Mutex::new(WorkerStats::default()));

        let join = tokio::spawn(supervise(
            task,
            self.policy.clone(),
            shutdown.clone(),
            stats.clone(),
        ));
        WorkerHandle::new(name, shutdown, join, stats)
    }
}

async fn supervise<T: PeriodicTask>(
    task: Arc<T>,
    policy: RetryPolicy,
    shutdown: Arc<Notify>,
    stats: SharedStats,
) -> Result<(), WorkerError> {
    let mut consecutive = 0_u32;

    loop {
        let ticks_before = ticks(&stats);
        let err = match run_periodic(task.as_ref(), &shutdown, &stats).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if ticks(&stats) > ticks_before {
            consecutive = 0;
        }

        if !policy.should_retry(consecutive) {
            error!(
                worker = %task.name(),
                restarts = consecutive,
                error = %err,
                "worker restart budget exhausted"
            );
            return Err(WorkerError::RestartsExhausted {
                worker: task.name().to_string(),
                restarts: consecutive,
                last: Box::new(err),
            });
        }

        consecutive += 1;
        let delay = policy.delay_for_attempt(consecutive);
        update(&stats, |s| s.restarts += 1);
        warn!(
            worker = %task.name(),
            attempt = consecutive,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "restarting worker"
        );

        tokio::select! {
            _ = shutdown.notified() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn ticks(stats: &SharedStats) -> u64 {
    stats.lock().unwrap_or_else(PoisonError::into_inner).ticks
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::jobs::QueueError;

    /// Fails the first `fail_first` ticks, then succeeds.
    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait::async_trait]
    impl PeriodicTask for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn tick(&self) -> Result<(), WorkerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(QueueError::Backend(format!("boom {n}")).into());
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_until_the_task_recovers() {
        let task = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let supervisor = Supervisor::new(RetryPolicy::fixed(3, Duration::from_millis(50)));

        let handle = supervisor.spawn(task.clone());
        tokio::time::sleep(Duration::from_millis(500)).await;

        let stats = handle.stats();
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.restarts, 2);
        assert!(stats.ticks > 0);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_the_budget_is_spent() {
        let task = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        let supervisor = Supervisor::new(RetryPolicy::fixed(2, Duration::from_millis(5)));

        let err = supervisor.spawn(task.clone()).join().await.unwrap_err();

        match err {
            WorkerError::RestartsExhausted { worker, restarts, last } => {
                assert_eq!(worker, "flaky");
                assert_eq!(restarts, 2);
                assert!(matches!(*last, WorkerError::Queue(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(task.calls.load(Ordering::SeqCst), 3);
    }
}
