use async_trait::async_trait;
use evmon_alert::evaluator::RuleSource;
use evmon_common::types::AlertRule;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<AlertRule>,
}

/// Parse a `{"rules": [...]}` document. Inactive rules are kept.
pub fn parse_rules(content: &str) -> anyhow::Result<Vec<AlertRule>> {
    let file: RulesFile = serde_json::from_str(content)?;
    Ok(file.rules)
}

/// Rules read from a JSON file, re-read on every rule cache reload.
pub struct JsonFileRuleSource {
    path: PathBuf,
}

impl JsonFileRuleSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every rule in the file, active or not.
    pub async fn load_all(&self) -> anyhow::Result<Vec<AlertRule>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read rules file '{}': {e}", self.path.display()))?;
        parse_rules(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse rules file '{}': {e}", self.path.display()))
    }
}

#[async_trait]
impl RuleSource for JsonFileRuleSource {
    async fn active_rules(&self) -> anyhow::Result<Vec<AlertRule>> {
        let rules = self.load_all().await?;
        let total = rules.len();
        let active: Vec<AlertRule> = rules.into_iter().filter(AlertRule::is_active).collect();
        tracing::debug!(
            path = %self.path.display(),
            total,
            active = active.len(),
            "loaded alert rules"
        );
        Ok(active)
    }
}
