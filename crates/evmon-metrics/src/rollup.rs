use crate::cold::ColdStore;
use crate::store::BucketedMetricsStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Buckets younger than this may still receive writes and are left for
    /// the next run.
    #[serde(default = "default_lag_secs")]
    pub lag_secs: u64,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    60
}

fn default_lag_secs() -> u64 {
    60
}

fn default_data_dir() -> String {
    "data/cold".to_string()
}

fn default_retention_days() -> u32 {
    30
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            lag_secs: default_lag_secs(),
            data_dir: default_data_dir(),
            retention_days: default_retention_days(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// Periodically copies completed, non-empty hot buckets into the cold store.
///
/// Each run exports `[watermark, align(now - lag))` and only then moves the
/// watermark forward, so a failed or late run is retried in full next time.
pub struct RollupTask {
    store: Arc<BucketedMetricsStore>,
    cold: Arc<dyn ColdStore>,
    config: RollupConfig,
    watermark: Mutex<Option<DateTime<Utc>>>,
}

impl RollupTask {
    pub fn new(store: Arc<BucketedMetricsStore>, cold: Arc<dyn ColdStore>, config: RollupConfig) -> Self {
        Self {
            store,
            cold,
            config,
            watermark: Mutex::new(None),
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        *self.watermark.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub async fn run(&self) {
        tracing::info!(
            interval_secs = self.config.interval_secs,
            lag_secs = self.config.lag_secs,
            "rollup scheduler started"
        );
        let mut tick = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            match self.run_once(Utc::now()).await {
                Ok(0) => {}
                Ok(exported) => tracing::info!(exported, "rolled up metrics buckets"),
                Err(e) => tracing::error!(error = %e, "metrics rollup failed"),
            }
        }
    }

    /// Export one range ending at `align(now - lag)`. Returns the number of
    /// buckets handed to the cold store.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let lag = chrono::Duration::seconds(self.config.lag_secs as i64);
        let end = self.store.align(now - lag);
        let oldest_live = self
            .store
            .align(now - chrono::Duration::from_std(self.store.retention())?);
        let start = match self.watermark() {
            Some(mark) => mark.max(oldest_live),
            None => end - chrono::Duration::seconds(self.config.interval_secs as i64),
        };
        if start >= end {
            return Ok(0);
        }

        let buckets = self.store.buckets_in_range(start, end).await?;
        let exported = buckets.len();
        if !buckets.is_empty() {
            let cold = self.cold.clone();
            let inserted = tokio::task::spawn_blocking(move || cold.insert_buckets(&buckets)).await??;
            tracing::debug!(exported, inserted, from = %start, to = %end, "cold store insert");
        }

        *self.watermark.lock().unwrap_or_else(|p| p.into_inner()) = Some(end);
        Ok(exported)
    }

    /// Remove cold partitions past `retention_days`.
    pub async fn cleanup_once(&self) -> Result<u32> {
        let cold = self.cold.clone();
        let retention_days = self.config.retention_days;
        tokio::task::spawn_blocking(move || cold.cleanup(retention_days)).await?
    }
}
