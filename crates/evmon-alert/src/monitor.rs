use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Smoothing factor of the events/sec moving average.
pub const EMA_ALPHA: f64 = 0.3;

/// Samples closer together than this return the previous estimate.
pub const MIN_SAMPLE_INTERVAL_MS: u64 = 100;

/// Named throughput band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Idle,
    Low,
    Medium,
    High,
    Burst,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Idle => write!(f, "idle"),
            Tier::Low => write!(f, "low"),
            Tier::Medium => write!(f, "medium"),
            Tier::High => write!(f, "high"),
            Tier::Burst => write!(f, "burst"),
        }
    }
}

/// Exclusive upper bounds, in events/sec, of each tier below burst.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierThresholds {
    #[serde(default = "default_idle")]
    pub idle: f64,
    #[serde(default = "default_low")]
    pub low: f64,
    #[serde(default = "default_medium")]
    pub medium: f64,
    #[serde(default = "default_high")]
    pub high: f64,
}

fn default_idle() -> f64 {
    0.1
}

fn default_low() -> f64 {
    1.0
}

fn default_medium() -> f64 {
    10.0
}

fn default_high() -> f64 {
    100.0
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            idle: default_idle(),
            low: default_low(),
            medium: default_medium(),
            high: default_high(),
        }
    }
}

/// Evaluation interval used while in each tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierIntervals {
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    #[serde(default = "default_low_ms")]
    pub low_ms: u64,
    #[serde(default = "default_medium_ms")]
    pub medium_ms: u64,
    #[serde(default = "default_high_ms")]
    pub high_ms: u64,
    #[serde(default = "default_burst_ms")]
    pub burst_ms: u64,
}

fn default_idle_ms() -> u64 {
    30_000
}

fn default_low_ms() -> u64 {
    10_000
}

fn default_medium_ms() -> u64 {
    2_000
}

fn default_high_ms() -> u64 {
    500
}

fn default_burst_ms() -> u64 {
    100
}

impl Default for TierIntervals {
    fn default() -> Self {
        Self {
            idle_ms: default_idle_ms(),
            low_ms: default_low_ms(),
            medium_ms: default_medium_ms(),
            high_ms: default_high_ms(),
            burst_ms: default_burst_ms(),
        }
    }
}

impl TierThresholds {
    /// # Examples
    ///
    /// ```
    /// use evmon_alert::monitor::{Tier, TierThresholds};
    ///
    /// let t = TierThresholds::default();
    /// assert_eq!(t.tier_for(0.0), Tier::Idle);
    /// assert_eq!(t.tier_for(1.0), Tier::Medium);
    /// assert_eq!(t.tier_for(5_000.0), Tier::Burst);
    /// ```
    pub fn tier_for(&self, eps: f64) -> Tier {
        if eps < self.idle {
            Tier::Idle
        } else if eps < self.low {
            Tier::Low
        } else if eps < self.medium {
            Tier::Medium
        } else if eps < self.high {
            Tier::High
        } else {
            Tier::Burst
        }
    }
}

impl TierIntervals {
    pub fn interval_ms(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Idle => self.idle_ms,
            Tier::Low => self.low_ms,
            Tier::Medium => self.medium_ms,
            Tier::High => self.high_ms,
            Tier::Burst => self.burst_ms,
        }
    }
}

/// Lock-free event counters plus smoothed events/sec and error events/sec.
///
/// `record_event` is safe from any number of producers. Sampling swaps the
/// counters to zero, so concurrent samplers never double-count; a sampler
/// that loses the race on the sample timestamp just reads the current
/// estimate.
#[derive(Debug)]
pub struct EventRateMonitor {
    origin: Instant,
    events: AtomicU64,
    errors: AtomicU64,
    total_events: AtomicU64,
    last_sample_ms: AtomicU64,
    smoothed_eps: AtomicU64,
    smoothed_error_eps: AtomicU64,
}

impl Default for EventRateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRateMonitor {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            events: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_events: AtomicU64::new(0),
            last_sample_ms: AtomicU64::new(0),
            smoothed_eps: AtomicU64::new(0f64.to_bits()),
            smoothed_error_eps: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn record_event(&self, is_error: bool) {
        self.events.fetch_add(1, Ordering::Relaxed);
        self.total_events.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sample_and_get_eps(&self) -> f64 {
        self.sample_at(Instant::now())
    }

    /// Fold the events counted since the previous sample into the moving
    /// averages and return the smoothed events/sec.
    pub fn sample_at(&self, now: Instant) -> f64 {
        let now_ms = now.saturating_duration_since(self.origin).as_millis() as u64;
        let last = self.last_sample_ms.load(Ordering::Acquire);
        let elapsed = now_ms.saturating_sub(last);
        if elapsed < MIN_SAMPLE_INTERVAL_MS {
            return self.current_eps();
        }
        if self
            .last_sample_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.current_eps();
        }

        let events = self.events.swap(0, Ordering::AcqRel);
        let errors = self.errors.swap(0, Ordering::AcqRel);
        let secs = elapsed as f64 / 1000.0;

        let eps = smooth(&self.smoothed_eps, events as f64 / secs);
        smooth(&self.smoothed_error_eps, errors as f64 / secs);
        eps
    }

    pub fn current_eps(&self) -> f64 {
        f64::from_bits(self.smoothed_eps.load(Ordering::Acquire))
    }

    pub fn current_error_eps(&self) -> f64 {
        f64::from_bits(self.smoothed_error_eps.load(Ordering::Acquire))
    }

    /// Events recorded since the last sample.
    pub fn pending_events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Events recorded since construction or the last reset.
    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.events.store(0, Ordering::Release);
        self.errors.store(0, Ordering::Release);
        self.total_events.store(0, Ordering::Release);
        self.smoothed_eps.store(0f64.to_bits(), Ordering::Release);
        self.smoothed_error_eps.store(0f64.to_bits(), Ordering::Release);
        let now_ms = Instant::now()
            .saturating_duration_since(self.origin)
            .as_millis() as u64;
        self.last_sample_ms.store(now_ms, Ordering::Release);
    }
}

/// `smoothed = α·instant + (1-α)·previous`, stored back as bits.
fn smooth(cell: &AtomicU64, instant: f64) -> f64 {
    let previous = f64::from_bits(cell.load(Ordering::Acquire));
    let next = EMA_ALPHA * instant + (1.0 - EMA_ALPHA) * previous;
    cell.store(next.to_bits(), Ordering::Release);
    next
}
