//! Process configuration, read once from the environment at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

use ingest_infra::jobs::RetryPolicy;
use ingest_infra::redis_conn::DEFAULT_REDIS_URL;
use ingest_infra::sweep::SweepConfig;
use ingest_infra::sync::SyncWorkerConfig;
use ingest_infra::uploads::{MergeWorkerConfig, ReassemblerConfig};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Redis/Postgres wiring instead of the in-memory backends.
    pub use_persistent_stores: bool,
    pub redis_url: String,
    pub database_url: Option<String>,
    pub upload_root: PathBuf,
    pub upload_ttl: Duration,
    pub sync_batch_size: usize,
    pub sync_interval: Duration,
    /// Publish a `monitorUpdate` per persisted log bucket.
    pub sync_bucket_updates: bool,
    pub merge_interval: Duration,
    pub sweep_interval: Duration,
    pub sweep_max_age: Duration,
    pub dedup_retention: Duration,
    pub supervisor_max_restarts: u32,
    /// Request/response bodies above this size are not captured in request logs.
    pub request_log_body_limit: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            use_persistent_stores: false,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            database_url: None,
            upload_root: PathBuf::from("./data"),
            upload_ttl: Duration::from_secs(30 * 60),
            sync_batch_size: 10,
            sync_interval: Duration::from_secs(10),
            sync_bucket_updates: false,
            merge_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(10 * 60),
            sweep_max_age: Duration::from_secs(2 * 60 * 60),
            dedup_retention: Duration::from_secs(7 * 24 * 60 * 60),
            supervisor_max_restarts: 5,
            request_log_body_limit: 64 * 1024,
        }
    }
}

impl AppConfig {
    /// Read the environment, falling back to defaults for unset variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let d = Self::default();
        let config = Self {
            bind_addr: parse_or(&lookup, "INGEST_BIND_ADDR", d.bind_addr)?,
            use_persistent_stores: parse_or(&lookup, "USE_PERSISTENT_STORES", d.use_persistent_stores)?,
            redis_url: lookup("REDIS_URL").unwrap_or(d.redis_url),
            database_url: lookup("DATABASE_URL").filter(|s| !s.is_empty()),
            upload_root: lookup("UPLOAD_ROOT").map(PathBuf::from).unwrap_or(d.upload_root),
            upload_ttl: secs_or(&lookup, "UPLOAD_TTL_SECS", d.upload_ttl)?,
            sync_batch_size: parse_or(&lookup, "SYNC_BATCH_SIZE", d.sync_batch_size)?,
            sync_interval: millis_or(&lookup, "SYNC_INTERVAL_MS", d.sync_interval)?,
            sync_bucket_updates: parse_or(&lookup, "SYNC_BUCKET_UPDATES", d.sync_bucket_updates)?,
            merge_interval: millis_or(&lookup, "MERGE_INTERVAL_MS", d.merge_interval)?,
            sweep_interval: secs_or(&lookup, "SWEEP_INTERVAL_SECS", d.sweep_interval)?,
            sweep_max_age: secs_or(&lookup, "SWEEP_MAX_AGE_SECS", d.sweep_max_age)?,
            dedup_retention: secs_or(&lookup, "DEDUP_RETENTION_SECS", d.dedup_retention)?,
            supervisor_max_restarts: parse_or(&lookup, "SUPERVISOR_MAX_RESTARTS", d.supervisor_max_restarts)?,
            request_log_body_limit: parse_or(&lookup, "REQUEST_LOG_BODY_LIMIT", d.request_log_body_limit)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.use_persistent_stores && self.database_url.is_none() {
            bail!("DATABASE_URL must be set when USE_PERSISTENT_STORES=true");
        }
        if self.sync_batch_size == 0 {
            bail!("SYNC_BATCH_SIZE must be at least 1");
        }
        if self.upload_ttl.is_zero() {
            bail!("UPLOAD_TTL_SECS must be positive");
        }
        for (name, interval) in [
            ("SYNC_INTERVAL_MS", self.sync_interval),
            ("MERGE_INTERVAL_MS", self.merge_interval),
            ("SWEEP_INTERVAL_SECS", self.sweep_interval),
        ] {
            if interval.is_zero() {
                bail!("{name} must be positive");
            }
        }
        // A dedup record must outlive any job that could still be delivered.
        if self.dedup_retention <= self.sweep_max_age {
            bail!("DEDUP_RETENTION_SECS must be greater than SWEEP_MAX_AGE_SECS");
        }
        Ok(())
    }

    pub fn sync_worker(&self) -> SyncWorkerConfig {
        SyncWorkerConfig {
            batch_size: self.sync_batch_size,
            interval: self.sync_interval,
            bucket_updates: self.sync_bucket_updates,
        }
    }

    pub fn merge_worker(&self) -> MergeWorkerConfig {
        MergeWorkerConfig {
            interval: self.merge_interval,
            ..MergeWorkerConfig::default()
        }
    }

    pub fn reassembler(&self) -> ReassemblerConfig {
        ReassemblerConfig { ttl: self.upload_ttl }
    }

    pub fn sweep(&self) -> SweepConfig {
        SweepConfig {
            interval: self.sweep_interval,
            max_age: self.sweep_max_age,
            dedup_retention: self.dedup_retention,
        }
    }

    pub fn restart_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.supervisor_max_restarts,
            Duration::from_millis(500),
            Duration::from_secs(30),
        )
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> anyhow::Result<Duration> {
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> anyhow::Result<Duration> {
    parse_or(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let c = config(&[]).unwrap();
        assert_eq!(c.bind_addr.port(), 8080);
        assert!(!c.use_persistent_stores);
        assert_eq!(c.upload_ttl, Duration::from_secs(1800));
        assert_eq!(c.sync_batch_size, 10);
        assert_eq!(c.sync_interval, Duration::from_millis(10_000));
        assert_eq!(c.request_log_body_limit, 65536);
    }

    #[test]
    fn overrides_are_parsed() {
        let c = config(&[
            ("INGEST_BIND_ADDR", "127.0.0.1:9000"),
            ("SYNC_BATCH_SIZE", "50"),
            ("SYNC_INTERVAL_MS", "250"),
            ("UPLOAD_TTL_SECS", "60"),
        ])
        .unwrap();
        assert_eq!(c.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(c.sync_worker().batch_size, 50);
        assert_eq!(c.sync_worker().interval, Duration::from_millis(250));
        assert_eq!(c.reassembler().ttl, Duration::from_secs(60));
    }

    #[test]
    fn rejects_garbage_and_inconsistent_values() {
        let err = config(&[("SYNC_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("SYNC_BATCH_SIZE"));

        assert!(config(&[("SYNC_BATCH_SIZE", "0")]).is_err());
        assert!(config(&[("USE_PERSISTENT_STORES", "true")]).is_err());
        assert!(
            config(&[("SWEEP_MAX_AGE_SECS", "3600"), ("DEDUP_RETENTION_SECS", "3600")]).is_err()
        );
    }

    #[test]
    fn persistent_mode_needs_a_database() {
        let c = config(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/ingest"),
        ])
        .unwrap();
        assert!(c.use_persistent_stores);
    }
}
