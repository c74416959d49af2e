use std::convert::Infallible;
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use anyhow::Context;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tracing::{info, warn};

use ingest_core::{AnalyticsEventRecord, Clock, RequestLogRecord, SystemClock};
use ingest_events::{EventBus, InMemoryEventBus, Notification, NotificationPublisher, Subscription};
use ingest_infra::{
    dedup::{DedupLedger, InMemoryDedupLedger, RedisDedupLedger},
    event_bus::{DEFAULT_NOTIFICATION_CHANNEL, RedisPubSubNotificationBus},
    files::LocalFileStore,
    jobs::{InMemoryJobStore, JobStore, QueueStats, RedisJobStore},
    redis_conn::RedisConnection,
    session::{InMemorySessionStore, RedisSessionStore, SessionStore},
    sinks::{
        EventSink, InMemorySink, PostgresAnalyticsSink, PostgresRequestLogSink, ensure_schema,
    },
    sweep::Sweeper,
    sync::{AnalyticsSync, LogSync, SyncWorker},
    uploads::{ChunkReassembler, MERGE_QUEUE, MergeWorker},
    workers::{Supervisor, WorkerHandle},
};

use crate::config::AppConfig;

/// Queue the request-log and analytics jobs share.
pub const LOG_QUEUE: &str = "redis";

/// Which backend family the services are wired against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    InMemory,
    Persistent,
}

/// Everything the HTTP handlers and the background workers share.
pub struct AppServices {
    pub config: AppConfig,
    pub backend: Backend,
    pub clock: Arc<dyn Clock>,
    pub log_queue: Arc<dyn JobStore>,
    pub merge_queue: Arc<dyn JobStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub ledger: Arc<dyn DedupLedger>,
    pub reassembler: Arc<ChunkReassembler>,
    pub request_logs: Arc<dyn EventSink<RequestLogRecord>>,
    pub analytics: Arc<dyn EventSink<AnalyticsEventRecord>>,
    pub notifier: Arc<dyn NotificationPublisher>,
    pub sweeper: Arc<Sweeper>,
    pool: Option<PgPool>,
    realtime_tx: broadcast::Sender<Notification>,
}

/// Shared stores before the derived components are built on top.
struct Backends {
    log_queue: Arc<dyn JobStore>,
    merge_queue: Arc<dyn JobStore>,
    sessions: Arc<dyn SessionStore>,
    ledger: Arc<dyn DedupLedger>,
    request_logs: Arc<dyn EventSink<RequestLogRecord>>,
    analytics: Arc<dyn EventSink<AnalyticsEventRecord>>,
    notifier: Arc<dyn NotificationPublisher>,
    subscription: Subscription<Notification>,
    pool: Option<PgPool>,
}

pub async fn build_services(config: AppConfig) -> anyhow::Result<AppServices> {
    if config.use_persistent_stores {
        build_persistent_services(config).await
    } else {
        Ok(build_in_memory_services(config))
    }
}

/// In-memory wiring (dev/test). Must be called inside a tokio runtime.
pub fn build_in_memory_services(config: AppConfig) -> AppServices {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus: Arc<InMemoryEventBus<Notification>> = Arc::new(InMemoryEventBus::new());
    let subscription = bus.subscribe();

    let backends = Backends {
        log_queue: Arc::new(InMemoryJobStore::with_clock(LOG_QUEUE, clock.clone())),
        merge_queue: Arc::new(InMemoryJobStore::with_clock(MERGE_QUEUE, clock.clone())),
        sessions: Arc::new(InMemorySessionStore::with_clock(clock.clone())),
        ledger: Arc::new(InMemoryDedupLedger::with_clock(clock.clone())),
        request_logs: Arc::new(InMemorySink::<RequestLogRecord>::new("request_logs")),
        analytics: Arc::new(InMemorySink::<AnalyticsEventRecord>::new("analytics_events")),
        notifier: bus,
        subscription,
        pool: None,
    };
    info!(backend = "in_memory", "services wired");
    assemble(config, Backend::InMemory, clock, backends)
}

async fn build_persistent_services(config: AppConfig) -> anyhow::Result<AppServices> {
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    ensure_schema(&pool)
        .await
        .context("failed to create sink tables")?;

    let redis = RedisConnection::connect(&config.redis_url)
        .await
        .with_context(|| format!("failed to connect to Redis at {}", config.redis_url))?;
    let bus = Arc::new(RedisPubSubNotificationBus::new(
        redis.clone(),
        DEFAULT_NOTIFICATION_CHANNEL,
    ));
    let subscription = bus.subscribe();

    let backends = Backends {
        log_queue: Arc::new(RedisJobStore::new(redis.clone(), LOG_QUEUE, clock.clone())),
        merge_queue: Arc::new(RedisJobStore::new(redis.clone(), MERGE_QUEUE, clock.clone())),
        sessions: Arc::new(RedisSessionStore::new(redis.clone(), clock.clone())),
        ledger: Arc::new(RedisDedupLedger::new(redis, clock.clone())),
        request_logs: Arc::new(PostgresRequestLogSink::new(pool.clone())),
        analytics: Arc::new(PostgresAnalyticsSink::new(pool.clone())),
        notifier: bus,
        subscription,
        pool: Some(pool),
    };
    info!(backend = "persistent", redis = %config.redis_url, "services wired");
    Ok(assemble(config, Backend::Persistent, clock, backends))
}

fn assemble(
    config: AppConfig,
    backend: Backend,
    clock: Arc<dyn Clock>,
    backends: Backends,
) -> AppServices {
    let reassembler = Arc::new(ChunkReassembler::new(
        backends.sessions.clone(),
        backends.merge_queue.clone(),
        Arc::new(LocalFileStore::new(config.upload_root.clone())),
        config.reassembler(),
    ));
    let sweeper = Arc::new(Sweeper::new(
        vec![backends.log_queue.clone(), backends.merge_queue.clone()],
        backends.ledger.clone(),
        clock.clone(),
        config.sweep(),
    ));

    let (realtime_tx, _) = broadcast::channel::<Notification>(256);
    forward_notifications(backends.subscription, realtime_tx.clone());

    AppServices {
        config,
        backend,
        clock,
        log_queue: backends.log_queue,
        merge_queue: backends.merge_queue,
        sessions: backends.sessions,
        ledger: backends.ledger,
        reassembler,
        request_logs: backends.request_logs,
        analytics: backends.analytics,
        notifier: backends.notifier,
        sweeper,
        pool: backends.pool,
        realtime_tx,
    }
}

/// Pump bus messages into the SSE broadcast channel until the bus goes away.
///
/// Runs on a plain thread: the subscription blocks, and a blocking-pool task
/// would hold up runtime shutdown.
fn forward_notifications(subscription: Subscription<Notification>, tx: broadcast::Sender<Notification>) {
    std::thread::spawn(move || {
        loop {
            match subscription.recv_timeout(Duration::from_secs(1)) {
                // No SSE client connected is fine.
                Ok(notification) => {
                    let _ = tx.send(notification);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    });
}

impl AppServices {
    /// Start every background worker under `supervisor`.
    pub fn spawn_workers(&self, supervisor: &Supervisor) -> Vec<WorkerHandle> {
        let log_sync = SyncWorker::new(
            Arc::new(LogSync::new(self.request_logs.clone())),
            self.log_queue.clone(),
            self.ledger.clone(),
            self.notifier.clone(),
            self.clock.clone(),
            self.config.sync_worker(),
        );
        let event_sync = SyncWorker::new(
            Arc::new(AnalyticsSync::new(self.analytics.clone())),
            self.log_queue.clone(),
            self.ledger.clone(),
            self.notifier.clone(),
            self.clock.clone(),
            self.config.sync_worker(),
        );
        let merge = MergeWorker::new(
            self.merge_queue.clone(),
            self.reassembler.clone(),
            self.config.merge_worker(),
        );

        vec![
            supervisor.spawn(Arc::new(log_sync)),
            supervisor.spawn(Arc::new(event_sync)),
            supervisor.spawn(Arc::new(merge)),
            supervisor.spawn(self.sweeper.clone()),
        ]
    }

    pub async fn queue_stats(&self) -> anyhow::Result<Vec<QueueStats>> {
        let mut stats = Vec::with_capacity(2);
        for queue in [&self.log_queue, &self.merge_queue] {
            stats.push(
                queue
                    .stats()
                    .await
                    .with_context(|| format!("stats for queue {}", queue.queue_name()))?,
            );
        }
        Ok(stats)
    }

    /// Ping every backend; `(component, error)` for each that failed.
    pub async fn readiness(&self) -> Vec<(&'static str, String)> {
        let mut failures = Vec::new();
        if let Err(err) = self.log_queue.ping().await {
            failures.push(("log_queue", err.to_string()));
        }
        if let Err(err) = self.merge_queue.ping().await {
            failures.push(("merge_queue", err.to_string()));
        }
        if let Err(err) = self.sessions.ping().await {
            failures.push(("sessions", err.to_string()));
        }
        if let Err(err) = self.ledger.ping().await {
            failures.push(("dedup_ledger", err.to_string()));
        }
        if let Some(pool) = &self.pool {
            if let Err(err) = sqlx::query("SELECT 1").execute(pool).await {
                failures.push(("postgres", err.to_string()));
            }
        }
        if !failures.is_empty() {
            warn!(?failures, "readiness check failed");
        }
        failures
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.realtime_tx.subscribe()
    }
}

/// SSE stream of bus notifications; the event name is the notification name.
pub fn notification_sse_stream(
    services: &AppServices,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>> + use<>> {
    let rx = services.subscribe_notifications();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(notification) => {
            let data = serde_json::to_string(&notification).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event(notification.name()).data(data)))
        }
        // Lagged receivers skip what they missed.
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ingest_events::SyncComplete;

    #[tokio::test]
    async fn bus_notifications_reach_sse_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let services = build_in_memory_services(AppConfig {
            upload_root: dir.path().to_path_buf(),
            ..AppConfig::default()
        });
        let mut rx = services.subscribe_notifications();

        services
            .notifier
            .publish_notification(Notification::SyncComplete(SyncComplete::empty(
                "log-sync",
                Utc::now(),
            )))
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.name(), "syncComplete");
    }

    #[tokio::test]
    async fn in_memory_services_are_ready() {
        let dir = tempfile::tempdir().unwrap();
        let services = build_in_memory_services(AppConfig {
            upload_root: dir.path().to_path_buf(),
            ..AppConfig::default()
        });

        assert!(services.readiness().await.is_empty());
        let stats = services.queue_stats().await.unwrap();
        assert_eq!(stats[0].queue, LOG_QUEUE);
        assert_eq!(stats[1].queue, MERGE_QUEUE);
    }
}
