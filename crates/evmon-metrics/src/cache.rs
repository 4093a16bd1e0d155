use crate::error::{MetricsError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// One write against the metrics cache. Every op touches exactly one key and
/// is atomic at that key.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOp {
    HashIncr {
        key: String,
        field: String,
        delta: i64,
    },
    SortedAdd {
        key: String,
        member: String,
        score: f64,
    },
    UniqueAdd {
        key: String,
        element: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

/// The TTL-capable key/value store holding the hot buckets and cooldown
/// markers. Redis in production; [`MemoryCache`] for a single instance.
#[async_trait]
pub trait MetricsCache: Send + Sync {
    /// Apply a batch of writes. Backends send the batch in one round trip.
    async fn apply(&self, ops: &[CacheOp]) -> Result<()>;

    /// All fields of a hash; empty when the key is missing.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, i64>>;

    /// Scores of a sorted set in ascending order.
    async fn sorted_scores(&self, key: &str) -> Result<Vec<f64>>;

    /// Cardinality estimate of the union of the given unique sets.
    async fn unique_count(&self, keys: &[String]) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}

#[derive(Debug)]
enum Value {
    Hash(HashMap<String, i64>),
    Sorted(HashMap<String, f64>),
    Unique(HashSet<String>),
    Plain(String),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    /// `None` never expires, including TTLs past the clock's range.
    expires_at: Option<Instant>,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

const PURGE_EVERY_OPS: u64 = 4096;

/// In-process cache with per-key TTL, for single-instance deployments and
/// tests. Expired keys are invisible immediately and physically dropped by a
/// periodic sweep during writes.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Slot>,
    ops: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value written with [`MetricsCache::set_with_ttl`], if still live.
    pub fn get_plain(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let slot = self.entries.get(key)?;
        match &slot.value {
            Value::Plain(v) if slot.live(now) => Some(v.clone()),
            _ => None,
        }
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.live(now));
        before.saturating_sub(self.entries.len())
    }

    fn apply_one(&self, op: &CacheOp, now: Instant) -> Result<()> {
        match op {
            CacheOp::HashIncr { key, field, delta } => {
                let mut slot = self.live_slot(key, now, || Value::Hash(HashMap::new()));
                match &mut slot.value {
                    Value::Hash(map) => *map.entry(field.clone()).or_insert(0) += delta,
                    _ => return Err(wrong_type(key)),
                }
            }
            CacheOp::SortedAdd { key, member, score } => {
                let mut slot = self.live_slot(key, now, || Value::Sorted(HashMap::new()));
                match &mut slot.value {
                    Value::Sorted(set) => {
                        set.insert(member.clone(), *score);
                    }
                    _ => return Err(wrong_type(key)),
                }
            }
            CacheOp::UniqueAdd { key, element } => {
                let mut slot = self.live_slot(key, now, || Value::Unique(HashSet::new()));
                match &mut slot.value {
                    Value::Unique(set) => {
                        set.insert(element.clone());
                    }
                    _ => return Err(wrong_type(key)),
                }
            }
            CacheOp::Expire { key, ttl } => {
                if let Some(mut slot) = self.entries.get_mut(key) {
                    if slot.live(now) {
                        slot.expires_at = now.checked_add(*ttl);
                    }
                }
            }
        }
        Ok(())
    }

    /// Entry for `key`, replacing an expired value with a fresh one.
    fn live_slot(
        &self,
        key: &str,
        now: Instant,
        init: impl Fn() -> Value,
    ) -> dashmap::mapref::one::RefMut<'_, String, Slot> {
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| Slot {
            value: init(),
            expires_at: None,
        });
        if !slot.live(now) {
            *slot = Slot {
                value: init(),
                expires_at: None,
            };
        }
        slot
    }
}

fn wrong_type(key: &str) -> MetricsError {
    MetricsError::WrongType {
        key: key.to_string(),
    }
}

#[async_trait]
impl MetricsCache for MemoryCache {
    async fn apply(&self, ops: &[CacheOp]) -> Result<()> {
        let now = Instant::now();
        for op in ops {
            self.apply_one(op, now)?;
        }
        let total = self.ops.fetch_add(ops.len() as u64, Ordering::Relaxed);
        if total / PURGE_EVERY_OPS != (total + ops.len() as u64) / PURGE_EVERY_OPS {
            let removed = self.purge_expired();
            tracing::trace!(removed, "purged expired cache keys");
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, i64>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(slot) if slot.live(now) => match &slot.value {
                Value::Hash(map) => Ok(map.clone()),
                _ => Err(wrong_type(key)),
            },
            _ => Ok(HashMap::new()),
        }
    }

    async fn sorted_scores(&self, key: &str) -> Result<Vec<f64>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(slot) if slot.live(now) => match &slot.value {
                Value::Sorted(set) => {
                    let mut scores: Vec<f64> = set.values().copied().collect();
                    scores.sort_by(|a, b| a.total_cmp(b));
                    Ok(scores)
                }
                _ => Err(wrong_type(key)),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn unique_count(&self, keys: &[String]) -> Result<u64> {
        let now = Instant::now();
        let mut union: HashSet<String> = HashSet::new();
        for key in keys {
            if let Some(slot) = self.entries.get(key) {
                if !slot.live(now) {
                    continue;
                }
                match &slot.value {
                    Value::Unique(set) => union.extend(set.iter().cloned()),
                    _ => return Err(wrong_type(key)),
                }
            }
        }
        Ok(union.len() as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self.entries.get(key).is_some_and(|slot| slot.live(now)))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Slot {
                value: Value::Plain(value.to_string()),
                expires_at: Instant::now().checked_add(ttl),
            },
        );
        Ok(())
    }
}
