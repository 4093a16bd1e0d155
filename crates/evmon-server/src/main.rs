use anyhow::Result;
use evmon_alert::cooldown::CooldownStore;
use evmon_alert::evaluator::AdaptiveRuleEvaluator;
use evmon_alert::handlers::HandlerRegistry;
use evmon_alert::key::EvaluationKey;
use evmon_alert::monitor::EventRateMonitor;
use evmon_metrics::{
    BucketedMetricsStore, MemoryCache, MetricsCache, RedisCache, RollupTask, SqliteColdStore,
};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

use evmon_server::config::ServerConfig;
use evmon_server::ingest::EventIngest;
use evmon_server::rule_source::JsonFileRuleSource;
use evmon_server::sink::LogAlertSink;

const DEFAULT_CONFIG: &str = "config/evmon.toml";

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  evmon-server [config.toml]                 Start the server");
    eprintln!("  evmon-server check-rules [config.toml]     Validate the configured rules file and exit");
}

fn init_tracing(log_level: Option<&str>) -> Result<()> {
    let directive = format!("evmon={}", log_level.unwrap_or("info"));
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("check-rules") => {
            let config_path = args.get(2).map(|s| s.as_str()).unwrap_or(DEFAULT_CONFIG);
            let config = ServerConfig::load(config_path)?;
            init_tracing(config.log_level.as_deref())?;
            run_check_rules(&config).await
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args.get(1).map(|s| s.as_str()).unwrap_or(DEFAULT_CONFIG);
            let config = ServerConfig::load(config_path)?;
            init_tracing(config.log_level.as_deref())?;
            run_server(config).await
        }
    }
}

/// Report, for every rule in the rules file, which handler would evaluate it
/// and which metrics read it would share.
async fn run_check_rules(config: &ServerConfig) -> Result<()> {
    let source = JsonFileRuleSource::new(&config.rules_file);
    let rules = source.load_all().await?;
    let registry = HandlerRegistry::with_defaults();

    let mut problems = 0u32;
    for rule in &rules {
        let Some(handler) = registry.find(rule) else {
            tracing::error!(rule_id = %rule.id, name = %rule.name, "no handler accepts rule");
            problems += 1;
            continue;
        };
        match EvaluationKey::from_rule(rule, config.max_window_minutes()) {
            Ok(key) => tracing::info!(
                rule_id = %rule.id,
                name = %rule.name,
                status = ?rule.status,
                handler = handler.name(),
                key = %key,
                "rule ok"
            ),
            Err(e) => {
                tracing::error!(rule_id = %rule.id, error = %e, "invalid rule scope");
                problems += 1;
            }
        }
    }

    tracing::info!(
        path = %source.path().display(),
        rules = rules.len(),
        problems,
        "rule check complete"
    );
    if problems > 0 {
        anyhow::bail!("{problems} rule(s) cannot be evaluated");
    }
    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<()> {
    tracing::info!(
        rules_file = %config.rules_file,
        redis = config.uses_redis(),
        listen = %config.ingest.listen_addr,
        "evmon-server starting"
    );

    // Hot metrics cache, shared with the cooldown markers
    let cache: Arc<dyn MetricsCache> = if config.uses_redis() {
        Arc::new(RedisCache::connect(&config.cache.redis_url).await?)
    } else {
        tracing::info!("No redis_url configured, using in-process metrics cache");
        Arc::new(MemoryCache::new())
    };
    let prefix = config.cache.key_prefix.as_str();
    let store = Arc::new(BucketedMetricsStore::new(cache.clone(), prefix, &config.metrics));

    // Adaptive evaluator
    let evaluator = Arc::new(AdaptiveRuleEvaluator::new(
        config.evaluation.clone(),
        config.max_window_minutes(),
        Arc::new(EventRateMonitor::new()),
        Arc::new(JsonFileRuleSource::new(&config.rules_file)),
        store.clone(),
        Arc::new(LogAlertSink),
        CooldownStore::new(cache.clone(), prefix),
        HandlerRegistry::with_defaults(),
    ));
    evaluator.init().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let evaluator_handle = tokio::spawn(evaluator.clone().run(shutdown_rx));

    // Rollup into the cold store, plus cold retention
    let (rollup_handle, cleanup_handle) = if config.rollup.enabled {
        let cold = Arc::new(SqliteColdStore::new(Path::new(&config.rollup.data_dir))?);
        let rollup = Arc::new(RollupTask::new(store.clone(), cold, config.rollup.clone()));

        let runner = rollup.clone();
        let rollup_handle = tokio::spawn(async move {
            runner.run().await;
        });

        let cleanup_every = Duration::from_secs(config.rollup.cleanup_interval_secs.max(1));
        let cleanup_handle = tokio::spawn(async move {
            let mut tick = interval(cleanup_every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match rollup.cleanup_once().await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "Cleaned up expired cold partitions")
                    }
                    Err(e) => tracing::error!(error = %e, "Cold store cleanup failed"),
                    _ => {}
                }
            }
        });
        (Some(rollup_handle), Some(cleanup_handle))
    } else {
        tracing::info!("Metrics rollup disabled");
        (None, None)
    };

    // Event feed
    let listener = TcpListener::bind(&config.ingest.listen_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind event feed on {}: {e}", config.ingest.listen_addr))?;
    let ingest = Arc::new(EventIngest::new(store.clone(), evaluator.clone()));
    let ingest_handle = tokio::spawn(ingest.clone().serve(listener));

    tracing::info!(
        rules = evaluator.rule_count(),
        interval_ms = evaluator.current_interval_ms(),
        "Server started"
    );

    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down gracefully");

    ingest_handle.abort();
    // Stops new heartbeats; a pass already running is finished.
    let _ = shutdown_tx.send(true);
    if let Err(e) = evaluator_handle.await {
        tracing::error!(error = %e, "Evaluator task ended abnormally");
    }
    if let Some(h) = rollup_handle {
        h.abort();
    }
    if let Some(h) = cleanup_handle {
        h.abort();
    }

    tracing::info!(
        accepted = ingest.accepted(),
        rejected = ingest.rejected(),
        "Server stopped"
    );
    Ok(())
}
