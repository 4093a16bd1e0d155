use evmon_alert::evaluator::EvaluationConfig;
use evmon_metrics::{MetricsConfig, RollupConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Replaces the default `evmon=info` directive when set.
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default = "default_rules_file")]
    pub rules_file: String,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub rollup: RollupConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Empty means the in-process cache, which only works for a single
    /// instance.
    #[serde(default)]
    pub redis_url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_rules_file() -> String {
    "config/rules.json".to_string()
}

fn default_key_prefix() -> String {
    "evmon".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:7070".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            rules_file: default_rules_file(),
            cache: CacheConfig::default(),
            metrics: MetricsConfig::default(),
            rollup: RollupConfig::default(),
            evaluation: EvaluationConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{path}': {e}"))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn uses_redis(&self) -> bool {
        !self.cache.redis_url.trim().is_empty()
    }

    /// Longest window a rule may read; older buckets have already expired.
    pub fn max_window_minutes(&self) -> u32 {
        self.metrics.retention_minutes.max(1)
    }
}
