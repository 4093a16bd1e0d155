use crate::cooldown::CooldownStore;
use crate::handlers::HandlerRegistry;
use crate::key::EvaluationKey;
use crate::monitor::{EventRateMonitor, Tier, TierIntervals, TierThresholds};
use crate::rule_config::{self, RuleScope};
use crate::{EvalContext, EvaluationResult, RuleHandler};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evmon_common::types::{AlertRule, FiredAlert};
use evmon_metrics::{MetricsBucket, MetricsReader};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

/// Where active rules come from. Only ever read.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn active_rules(&self) -> anyhow::Result<Vec<AlertRule>>;
}

/// Receives every alert that passes cooldown.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn fire(&self, alert: &FiredAlert) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Period of the scheduling check, not of evaluation itself.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_rule_cache_ttl_secs")]
    pub rule_cache_ttl_secs: u64,
    /// Used when a rule has no `cooldownMinutes`.
    #[serde(default = "default_cooldown_minutes")]
    pub default_cooldown_minutes: u64,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default)]
    pub thresholds: TierThresholds,
    #[serde(default)]
    pub intervals: TierIntervals,
}

fn default_enabled() -> bool {
    true
}

fn default_heartbeat_ms() -> u64 {
    100
}

fn default_rule_cache_ttl_secs() -> u64 {
    60
}

fn default_cooldown_minutes() -> u64 {
    5
}

fn default_initial_interval_ms() -> u64 {
    10_000
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            heartbeat_ms: default_heartbeat_ms(),
            rule_cache_ttl_secs: default_rule_cache_ttl_secs(),
            default_cooldown_minutes: default_cooldown_minutes(),
            initial_interval_ms: default_initial_interval_ms(),
            thresholds: TierThresholds::default(),
            intervals: TierIntervals::default(),
        }
    }
}

/// Counters for one evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub rules: usize,
    pub groups: usize,
    pub reads: usize,
    pub fired: usize,
    pub suppressed: usize,
    pub failed: usize,
}

/// What a heartbeat did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Disabled,
    /// The current interval has not elapsed yet.
    NotDue,
    /// No events since the last pass.
    Idle,
    /// Another pass is still running.
    Busy,
    Evaluated(PassStats),
}

struct RuleCache {
    rules: Arc<Vec<AlertRule>>,
    loaded_at: Option<Instant>,
}

/// Holds the single-flight flag for the lifetime of one pass.
struct EvaluatingGuard<'a>(&'a AtomicBool);

impl<'a> EvaluatingGuard<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for EvaluatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Member<'r> {
    rule: &'r AlertRule,
    handler: &'r Arc<dyn RuleHandler>,
    cooldown: Duration,
}

/// Rule scheduler whose evaluation interval follows the event rate.
///
/// The ingest path only calls [`AdaptiveRuleEvaluator::on_event_ingested`].
/// A fixed-rate heartbeat runs a pass when the current interval has elapsed
/// and events arrived since the previous pass; afterwards the interval is
/// re-derived from the smoothed events/sec tier.
pub struct AdaptiveRuleEvaluator {
    config: EvaluationConfig,
    max_window_minutes: u32,
    monitor: Arc<EventRateMonitor>,
    rules: Arc<dyn RuleSource>,
    reader: Arc<dyn MetricsReader>,
    sink: Arc<dyn AlertSink>,
    cooldowns: CooldownStore,
    registry: HandlerRegistry,
    origin: Instant,
    dirty: AtomicBool,
    evaluating: AtomicBool,
    current_interval_ms: AtomicU64,
    last_evaluation_ms: AtomicU64,
    rule_cache: ArcSwap<RuleCache>,
}

impl AdaptiveRuleEvaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EvaluationConfig,
        max_window_minutes: u32,
        monitor: Arc<EventRateMonitor>,
        rules: Arc<dyn RuleSource>,
        reader: Arc<dyn MetricsReader>,
        sink: Arc<dyn AlertSink>,
        cooldowns: CooldownStore,
        registry: HandlerRegistry,
    ) -> Self {
        let initial_interval = config.initial_interval_ms;
        Self {
            config,
            max_window_minutes: max_window_minutes.max(1),
            monitor,
            rules,
            reader,
            sink,
            cooldowns,
            registry,
            origin: Instant::now(),
            dirty: AtomicBool::new(false),
            evaluating: AtomicBool::new(false),
            current_interval_ms: AtomicU64::new(initial_interval),
            last_evaluation_ms: AtomicU64::new(0),
            rule_cache: ArcSwap::from_pointee(RuleCache {
                rules: Arc::new(Vec::new()),
                loaded_at: None,
            }),
        }
    }

    /// Load rules once up front so the first pass does not pay for it.
    pub async fn init(&self) {
        if !self.config.enabled {
            tracing::info!("adaptive rule evaluator disabled via configuration");
            return;
        }
        let _ = self.refresh_rule_cache().await;
        tracing::info!(
            handlers = self.registry.len(),
            rules = self.rule_count(),
            initial_interval_ms = self.current_interval_ms(),
            "adaptive rule evaluator initialized"
        );
    }

    /// Hot path, called once per ingested event.
    pub fn on_event_ingested(&self, is_error: bool) {
        if !self.config.enabled {
            return;
        }
        self.monitor.record_event(is_error);
        self.dirty.store(true, Ordering::Release);
    }

    /// Drive heartbeats until `shutdown` flips to true. A pass already
    /// running when shutdown arrives is finished first.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            heartbeat_ms = self.config.heartbeat_ms,
            initial_interval_ms = self.current_interval_ms(),
            "adaptive rule scheduler started"
        );
        let mut tick = interval(Duration::from_millis(self.config.heartbeat_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let HeartbeatOutcome::Evaluated(stats) = self.heartbeat().await {
                        tracing::debug!(?stats, "evaluation pass finished");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("adaptive rule scheduler stopped");
    }

    pub async fn heartbeat(&self) -> HeartbeatOutcome {
        if !self.config.enabled {
            return HeartbeatOutcome::Disabled;
        }
        let now_ms = self.elapsed_ms();
        let since_last = now_ms.saturating_sub(self.last_evaluation_ms.load(Ordering::Acquire));
        if since_last < self.current_interval_ms.load(Ordering::Acquire) {
            return HeartbeatOutcome::NotDue;
        }
        if !self.dirty.load(Ordering::Acquire) {
            return HeartbeatOutcome::Idle;
        }
        let Some(_guard) = EvaluatingGuard::claim(&self.evaluating) else {
            return HeartbeatOutcome::Busy;
        };
        if self
            .dirty
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return HeartbeatOutcome::Idle;
        }

        self.last_evaluation_ms.store(now_ms, Ordering::Release);
        let stats = self.evaluate_pass(Utc::now()).await;
        self.adjust_interval();
        HeartbeatOutcome::Evaluated(stats)
    }

    /// One grouped pass over every active rule, reading metrics as of `now`.
    pub async fn evaluate_pass(&self, now: DateTime<Utc>) -> PassStats {
        let rules = self.active_rules().await;
        let mut stats = PassStats {
            rules: rules.len(),
            ..Default::default()
        };
        if rules.is_empty() {
            return stats;
        }

        let mut groups: HashMap<EvaluationKey, Vec<Member<'_>>> = HashMap::new();
        for rule in rules.iter() {
            let Some(handler) = self.registry.find(rule) else {
                tracing::warn!(
                    rule_id = %rule.id,
                    metric_type = rule.metric_type().unwrap_or(""),
                    "no handler accepts rule, skipping"
                );
                stats.failed += 1;
                continue;
            };
            let scope: RuleScope = match rule_config::parse(rule) {
                Ok(scope) => scope,
                Err(e) => {
                    tracing::error!(rule_id = %rule.id, error = %e, "invalid rule configuration, skipping");
                    stats.failed += 1;
                    continue;
                }
            };
            let cooldown = match scope.cooldown(self.config.default_cooldown_minutes) {
                Ok(cooldown) => cooldown,
                Err(e) => {
                    tracing::error!(rule_id = %rule.id, error = %e, "invalid cooldown, skipping");
                    stats.failed += 1;
                    continue;
                }
            };
            let key = EvaluationKey::from_scope(&scope, self.max_window_minutes);
            groups.entry(key).or_default().push(Member {
                rule,
                handler,
                cooldown,
            });
        }
        stats.groups = groups.len();
        tracing::debug!(rules = stats.rules, groups = stats.groups, "evaluating rules");

        for (key, members) in &groups {
            let bucket = if members.iter().any(|m| m.handler.uses_group_bucket()) {
                stats.reads += 1;
                self.reader.read(key.window_minutes, &key.filter(), now).await
            } else {
                MetricsBucket::empty(now, now)
            };
            let ctx = EvalContext {
                reader: self.reader.as_ref(),
                key,
                now,
            };

            for member in members {
                match member.handler.evaluate(member.rule, &bucket, &ctx).await {
                    Ok(Some(result)) => self.fire_if_allowed(member, result, &mut stats).await,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(
                            rule_id = %member.rule.id,
                            handler = member.handler.name(),
                            error = %e,
                            "rule evaluation failed"
                        );
                        stats.failed += 1;
                    }
                }
            }
        }
        stats
    }

    async fn fire_if_allowed(&self, member: &Member<'_>, result: EvaluationResult, stats: &mut PassStats) {
        let rule = member.rule;
        if self.cooldowns.is_in_cooldown(&rule.id).await {
            tracing::debug!(rule_id = %rule.id, "threshold crossed during cooldown, suppressed");
            stats.suppressed += 1;
            return;
        }

        let alert = FiredAlert {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            threshold: result.threshold,
            current_value: result.current_value,
            details: result.details,
            fired_at: Utc::now(),
        };
        tracing::info!(
            rule_id = %alert.rule_id,
            rule_name = %alert.rule_name,
            severity = %alert.severity,
            current_value = alert.current_value,
            threshold = alert.threshold,
            details = %alert.details,
            "alert fired"
        );

        match self.sink.fire(&alert).await {
            Ok(()) => {
                self.cooldowns.set_cooldown(&rule.id, member.cooldown).await;
                stats.fired += 1;
            }
            Err(e) => {
                tracing::error!(rule_id = %rule.id, error = %e, "alert sink rejected alert");
                stats.failed += 1;
            }
        }
    }

    /// Re-derive the evaluation interval from the current event rate.
    /// Returns the new interval in milliseconds.
    pub fn adjust_interval(&self) -> u64 {
        let eps = self.monitor.sample_and_get_eps();
        let tier = self.config.thresholds.tier_for(eps);
        let next = self.config.intervals.interval_ms(tier);
        let previous = self.current_interval_ms.swap(next, Ordering::AcqRel);
        if previous != next {
            tracing::info!(
                eps = %format!("{eps:.1}"),
                previous_ms = previous,
                next_ms = next,
                tier = %tier,
                "traffic changed, adjusted evaluation interval"
            );
        }
        next
    }

    async fn active_rules(&self) -> Arc<Vec<AlertRule>> {
        let ttl = Duration::from_secs(self.config.rule_cache_ttl_secs);
        let fresh = self
            .rule_cache
            .load()
            .loaded_at
            .is_some_and(|at| at.elapsed() < ttl);
        if !fresh {
            let _ = self.refresh_rule_cache().await;
        }
        self.rule_cache.load().rules.clone()
    }

    /// Reload active rules now. On failure the previous rules stay in use
    /// and the reload is retried on the next pass.
    pub async fn refresh_rule_cache(&self) -> anyhow::Result<usize> {
        match self.rules.active_rules().await {
            Ok(rules) => {
                let active: Vec<AlertRule> = rules.into_iter().filter(AlertRule::is_active).collect();
                let count = active.len();
                self.rule_cache.store(Arc::new(RuleCache {
                    rules: Arc::new(active),
                    loaded_at: Some(Instant::now()),
                }));
                tracing::debug!(rules = count, "rule cache refreshed");
                Ok(count)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    cached = self.rule_count(),
                    "failed to refresh rule cache, keeping previous rules"
                );
                Err(e)
            }
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn current_eps(&self) -> f64 {
        self.monitor.current_eps()
    }

    pub fn current_interval_ms(&self) -> u64 {
        self.current_interval_ms.load(Ordering::Acquire)
    }

    pub fn current_tier(&self) -> Tier {
        self.config.thresholds.tier_for(self.current_eps())
    }

    pub fn rule_count(&self) -> usize {
        self.rule_cache.load().rules.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_evaluating(&self) -> bool {
        self.evaluating.load(Ordering::Acquire)
    }

    pub fn monitor(&self) -> &Arc<EventRateMonitor> {
        &self.monitor
    }
}
