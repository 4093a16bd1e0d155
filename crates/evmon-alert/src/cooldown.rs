use chrono::Utc;
use dashmap::DashMap;
use evmon_metrics::MetricsCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct LocalMark {
    /// `None` when the TTL runs past the clock's range.
    until: Option<Instant>,
    /// False when the shared marker could not be written.
    shared: bool,
}

/// Per-rule "already alerted" markers.
///
/// The marker lives in the shared metrics cache with a TTL, so every
/// evaluator instance sees it and expiry needs no timer here. A local copy
/// is kept for when the cache is unreachable; it only suppresses alerts
/// fired by this instance.
pub struct CooldownStore {
    cache: Arc<dyn MetricsCache>,
    prefix: String,
    local: DashMap<String, LocalMark>,
}

impl CooldownStore {
    pub fn new(cache: Arc<dyn MetricsCache>, prefix: &str) -> Self {
        Self {
            cache,
            prefix: prefix.to_string(),
            local: DashMap::new(),
        }
    }

    fn key(&self, rule_id: &str) -> String {
        format!("{}:rule:cooldown:{rule_id}", self.prefix)
    }

    pub async fn is_in_cooldown(&self, rule_id: &str) -> bool {
        match self.cache.exists(&self.key(rule_id)).await {
            Ok(true) => true,
            Ok(false) => self.local_active(rule_id, false),
            Err(e) => {
                tracing::warn!(
                    rule_id,
                    error = %e,
                    "cooldown lookup failed, using local cooldown state"
                );
                self.local_active(rule_id, true)
            }
        }
    }

    pub async fn set_cooldown(&self, rule_id: &str, ttl: Duration) {
        let value = Utc::now().timestamp_millis().to_string();
        let shared = match self.cache.set_with_ttl(&self.key(rule_id), &value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    rule_id,
                    error = %e,
                    "failed to store cooldown marker, suppression is local only"
                );
                false
            }
        };
        self.local.insert(
            rule_id.to_string(),
            LocalMark {
                until: Instant::now().checked_add(ttl),
                shared,
            },
        );
    }

    /// Local marks written while the cache was down always count. Marks
    /// mirrored to the cache only count when the cache cannot be asked.
    fn local_active(&self, rule_id: &str, cache_down: bool) -> bool {
        let now = Instant::now();
        let Some(mark) = self.local.get(rule_id).map(|m| *m) else {
            return false;
        };
        if mark.until.is_some_and(|until| until <= now) {
            self.local.remove(rule_id);
            return false;
        }
        cache_down || !mark.shared
    }
}
