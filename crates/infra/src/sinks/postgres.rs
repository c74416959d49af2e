//! Postgres sinks.
//!
//! Rows are written with multi-row `INSERT ... VALUES` statements of at most
//! [`INSERT_CHUNK`] rows. `job_id` is unique in both tables and conflicts are
//! ignored, so replaying a batch after a crash between the insert and the
//! ledger mark does not duplicate rows.
//!
//! ## Error Mapping
//!
//! Every `sqlx::Error` becomes a [`SinkError`] whose `rows_written` is the sum
//! of the rows that completed before the failing statement. A data exception
//! (SQLSTATE class 22) or integrity violation (class 23) rejects the whole
//! chunk, so the chunk is replayed row by row to find the refused row, which
//! is reported as `failed_row`. Connection and pool errors carry no row.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::instrument;

use ingest_core::{AnalyticsEventRecord, JobRecord, RequestLogRecord};

use super::{EventSink, SinkError};

/// Rows per statement; 500 rows × 10 columns stays far below the bind limit.
pub const INSERT_CHUNK: usize = 500;

/// Create the sink tables if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request_logs (
            id           BIGSERIAL PRIMARY KEY,
            job_id       UUID NOT NULL UNIQUE,
            method       TEXT NOT NULL,
            url          TEXT NOT NULL,
            body         TEXT NULL,
            response     TEXT NULL,
            error        TEXT NULL,
            status_code  INTEGER NOT NULL,
            duration_ms  BIGINT NOT NULL,
            timestamp    TIMESTAMPTZ NOT NULL,
            query        TEXT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analytics_events (
            id                  BIGSERIAL PRIMARY KEY,
            job_id              UUID NOT NULL UNIQUE,
            event_id            TEXT NOT NULL,
            event_time          TIMESTAMPTZ NULL,
            user_id             TEXT NULL,
            session_id          TEXT NULL,
            device_fingerprint  TEXT NULL,
            properties          JSONB NULL,
            sdk_version         TEXT NULL,
            app_id              TEXT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Debug, Clone)]
pub struct PostgresRequestLogSink {
    pool: Arc<PgPool>,
}

impl PostgresRequestLogSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn request_log_insert(chunk: &[JobRecord<RequestLogRecord>]) -> QueryBuilder<'static, Postgres> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO request_logs \
         (job_id, method, url, body, response, error, status_code, duration_ms, timestamp, query) ",
    );
    qb.push_values(chunk, |mut b, row| {
        let r = &row.record;
        b.push_bind(*row.job_id.as_uuid())
            .push_bind(r.method.clone())
            .push_bind(r.url.clone())
            .push_bind(r.body.clone())
            .push_bind(r.response.clone())
            .push_bind(r.error.clone())
            .push_bind(i32::from(r.status_code))
            .push_bind(i64::try_from(r.duration).unwrap_or(i64::MAX))
            .push_bind(r.timestamp)
            .push_bind(r.query.clone());
    });
    qb.push(" ON CONFLICT (job_id) DO NOTHING");
    qb
}

#[async_trait::async_trait]
impl EventSink<RequestLogRecord> for PostgresRequestLogSink {
    fn name(&self) -> &str {
        "request_logs"
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()), err)]
    async fn insert_batch(&self, rows: &[JobRecord<RequestLogRecord>]) -> Result<(), SinkError> {
        insert_chunked(&self.pool, "insert request_logs", rows, request_log_insert).await
    }
}

#[derive(Debug, Clone)]
pub struct PostgresAnalyticsSink {
    pool: Arc<PgPool>,
}

impl PostgresAnalyticsSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn analytics_insert(chunk: &[JobRecord<AnalyticsEventRecord>]) -> QueryBuilder<'static, Postgres> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO analytics_events \
         (job_id, event_id, event_time, user_id, session_id, device_fingerprint, properties, sdk_version, app_id) ",
    );
    qb.push_values(chunk, |mut b, row| {
        let r = &row.record;
        b.push_bind(*row.job_id.as_uuid())
            .push_bind(r.event_id.clone())
            .push_bind(r.event_time)
            .push_bind(r.user_id.clone())
            .push_bind(r.session_id.clone())
            .push_bind(r.device_fingerprint.clone())
            .push_bind(r.properties.clone())
            .push_bind(r.sdk_version.clone())
            .push_bind(r.app_id.clone());
    });
    qb.push(" ON CONFLICT (job_id) DO NOTHING");
    qb
}

#[async_trait::async_trait]
impl EventSink<AnalyticsEventRecord> for PostgresAnalyticsSink {
    fn name(&self) -> &str {
        "analytics_events"
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()), err)]
    async fn insert_batch(
        &self,
        rows: &[JobRecord<AnalyticsEventRecord>],
    ) -> Result<(), SinkError> {
        insert_chunked(&self.pool, "insert analytics_events", rows, analytics_insert).await
    }
}

type InsertBuilder<R> = fn(&[JobRecord<R>]) -> QueryBuilder<'static, Postgres>;

async fn insert_chunked<R: Sync>(
    pool: &PgPool,
    operation: &str,
    rows: &[JobRecord<R>],
    build: InsertBuilder<R>,
) -> Result<(), SinkError> {
    let mut written = 0;
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut qb = build(chunk);
        match qb.build().execute(pool).await {
            Ok(_) => written += chunk.len(),
            Err(err) if sqlstate(&err).as_deref().is_some_and(rejects_row) => {
                // The statement is atomic: nothing of this chunk was written.
                for row in chunk {
                    let mut qb = build(std::slice::from_ref(row));
                    qb.build()
                        .execute(pool)
                        .await
                        .map_err(|e| map_sqlx_error(operation, written, e))?;
                    written += 1;
                }
            }
            Err(err) => return Err(map_sqlx_error(operation, written, err)),
        }
    }
    Ok(())
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// SQLSTATE classes a single row can cause. `job_id` conflicts never surface
/// (`ON CONFLICT DO NOTHING`), so a unique violation is a table fault.
fn rejects_row(code: &str) -> bool {
    code.starts_with("22") || (code.starts_with("23") && code != "23505")
}

fn map_sqlx_error(operation: &str, rows_written: usize, err: sqlx::Error) -> SinkError {
    let attributable = sqlstate(&err).as_deref().is_some_and(rejects_row);
    let reason = match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!("database error in {operation} ({code}): {}", db_err.message()),
            None => format!("database error in {operation}: {}", db_err.message()),
        },
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        other => format!("sqlx error in {operation}: {other}"),
    };
    if attributable {
        SinkError::rejected(rows_written, reason)
    } else {
        SinkError::new(rows_written, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_row_level_sqlstates_pin_a_row() {
        // 22001 string too long, 22P02 bad text representation, 23502 not null.
        for code in ["22001", "22P02", "23502", "23514"] {
            assert!(rejects_row(code), "{code}");
        }
        // Unique violation, connection failure, admin shutdown, serialization.
        for code in ["23505", "08006", "57P01", "40001"] {
            assert!(!rejects_row(code), "{code}");
        }
    }

    #[test]
    fn pool_errors_leave_every_row_retryable() {
        let err = map_sqlx_error("insert request_logs", 500, sqlx::Error::PoolClosed);
        assert_eq!(err.rows_written, 500);
        assert_eq!(err.failed_row, None);

        let err = map_sqlx_error("insert request_logs", 0, sqlx::Error::PoolTimedOut);
        assert_eq!(err.failed_row, None);
    }
}
