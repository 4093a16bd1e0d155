use crate::error::{MetricsError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const BUCKETS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metrics_buckets (
    bucket_start INTEGER NOT NULL,
    bucket_end INTEGER NOT NULL,
    total_events INTEGER NOT NULL,
    total_errors INTEGER NOT NULL,
    latency_sum INTEGER NOT NULL,
    latency_count INTEGER NOT NULL,
    latency_min INTEGER,
    latency_max INTEGER,
    p50 REAL,
    p95 REAL,
    p99 REAL,
    unique_users INTEGER,
    by_source TEXT NOT NULL DEFAULT '{}',
    by_event_type TEXT NOT NULL DEFAULT '{}',
    by_severity TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    UNIQUE (bucket_start, bucket_end)
);
CREATE INDEX IF NOT EXISTS idx_buckets_start ON metrics_buckets(bucket_start);
";

/// One day-partition file on disk.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionInfo {
    pub date: String,
    pub size_bytes: u64,
    pub path: String,
}

/// Daily SQLite files (`YYYY-MM-DD.db`, WAL mode) under one directory, with
/// connections opened lazily and cached.
pub struct PartitionManager {
    data_dir: PathBuf,
    connections: Mutex<HashMap<String, Connection>>,
}

impl PartitionManager {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Lock the connections map, recovering from a poisoned Mutex if necessary.
    fn lock_connections(&self) -> MutexGuard<'_, HashMap<String, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn partition_key(ts: DateTime<Utc>) -> String {
        ts.format("%Y-%m-%d").to_string()
    }

    fn partition_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{key}.db"))
    }

    fn open(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(BUCKETS_SCHEMA)?;
        Ok(conn)
    }

    /// Run `f` against the partition for `ts`, creating it on first use.
    pub fn with_partition_for<F, R>(&self, ts: DateTime<Utc>, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R>,
    {
        let key = Self::partition_key(ts);
        let mut conns = self.lock_connections();
        if !conns.contains_key(&key) {
            let conn = Self::open(&self.partition_path(&key))?;
            tracing::info!(partition = %key, "created cold store partition");
            conns.insert(key.clone(), conn);
        }
        let conn = conns
            .get_mut(&key)
            .ok_or_else(|| MetricsError::Other(format!("partition {key} not found")))?;
        f(conn)
    }

    /// Run `f` against every existing partition whose day overlaps
    /// `[from, to]`, oldest first.
    pub fn for_each_in_range<F>(&self, from: DateTime<Utc>, to: DateTime<Utc>, mut f: F) -> Result<()>
    where
        F: FnMut(&Connection) -> Result<()>,
    {
        let mut date = from.date_naive();
        let to_date = to.date_naive();
        while date <= to_date {
            let key = date.format("%Y-%m-%d").to_string();
            let path = self.partition_path(&key);
            if path.exists() {
                let mut conns = self.lock_connections();
                if !conns.contains_key(&key) {
                    conns.insert(key.clone(), Self::open(&path)?);
                }
                if let Some(conn) = conns.get(&key) {
                    f(conn)?;
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        Ok(())
    }

    pub fn cleanup_older_than(&self, retention_days: u32) -> Result<u32> {
        let cutoff_date = (Utc::now() - chrono::Duration::days(retention_days as i64)).date_naive();
        let mut removed = 0u32;

        for (date_str, db_path) in self.partition_files()? {
            let Ok(date) = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d") else {
                continue;
            };
            if date >= cutoff_date {
                continue;
            }
            // Dropping the connection checkpoints the WAL before removal.
            self.lock_connections().remove(&date_str);

            if let Err(e) = std::fs::remove_file(&db_path) {
                tracing::error!(partition = %date_str, error = %e, "failed to remove partition file");
                continue;
            }
            for suffix in ["db-wal", "db-shm"] {
                let aux = self.data_dir.join(format!("{date_str}.{suffix}"));
                if aux.exists() {
                    if let Err(e) = std::fs::remove_file(&aux) {
                        tracing::warn!(path = %aux.display(), error = %e, "failed to remove SQLite auxiliary file");
                    }
                }
            }
            tracing::info!(partition = %date_str, "removed expired cold store partition");
            removed += 1;
        }

        Ok(removed)
    }

    pub fn list_partition_info(&self) -> Result<Vec<PartitionInfo>> {
        let mut infos = Vec::new();
        for (date, path) in self.partition_files()? {
            let metadata = std::fs::metadata(&path)?;
            infos.push(PartitionInfo {
                date,
                size_bytes: metadata.len(),
                path: path.to_string_lossy().to_string(),
            });
        }
        infos.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(infos)
    }

    /// `(date, path)` of every well-named `.db` file in the data directory.
    fn partition_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(date_str) = name.strip_suffix(".db") {
                if NaiveDate::parse_from_str(date_str, "%Y-%m-%d").is_ok() {
                    files.push((date_str.to_string(), entry.path()));
                }
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    #[test]
    fn cleanup_removes_expired_partitions_and_wal_files() {
        let tmp = TempDir::new().unwrap();
        let pm = PartitionManager::new(tmp.path()).unwrap();

        let old_ts = Utc::now() - Duration::days(10);
        pm.with_partition_for(old_ts, |_| Ok(())).unwrap();
        let old_key = PartitionManager::partition_key(old_ts);
        let old_db = tmp.path().join(format!("{old_key}.db"));

        pm.with_partition_for(Utc::now(), |_| Ok(())).unwrap();
        let today_db = tmp
            .path()
            .join(format!("{}.db", PartitionManager::partition_key(Utc::now())));

        let old_wal = tmp.path().join(format!("{old_key}.db-wal"));
        let old_shm = tmp.path().join(format!("{old_key}.db-shm"));
        std::fs::write(&old_wal, b"wal data").unwrap();
        std::fs::write(&old_shm, b"shm data").unwrap();

        let removed = pm.cleanup_older_than(7).unwrap();

        assert_eq!(removed, 1);
        assert!(!old_db.exists());
        assert!(!old_wal.exists());
        assert!(!old_shm.exists());
        assert!(today_db.exists());
    }

    #[test]
    fn stray_files_are_not_partitions() {
        let tmp = TempDir::new().unwrap();
        let pm = PartitionManager::new(tmp.path()).unwrap();
        std::fs::write(tmp.path().join("notes.db"), b"").unwrap();
        pm.with_partition_for(Utc::now(), |_| Ok(())).unwrap();

        let infos = pm.list_partition_info().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].date, PartitionManager::partition_key(Utc::now()));
    }
}
