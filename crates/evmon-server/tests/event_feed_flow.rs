use async_trait::async_trait;
use chrono::Utc;
use evmon_alert::cooldown::CooldownStore;
use evmon_alert::evaluator::{AdaptiveRuleEvaluator, AlertSink, EvaluationConfig, RuleSource};
use evmon_alert::handlers::HandlerRegistry;
use evmon_alert::monitor::EventRateMonitor;
use evmon_common::types::FiredAlert;
use evmon_metrics::{BucketedMetricsStore, MemoryCache, MetricsConfig, MetricsFilter, MetricsReader};
use evmon_server::ingest::EventIngest;
use evmon_server::rule_source::JsonFileRuleSource;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

const RULES: &str = r#"{
  "rules": [
    {
      "id": "errors-high",
      "name": "Error rate above 50%",
      "severity": "CRITICAL",
      "status": "active",
      "ruleConfig": {
        "metricType": "ERROR_RATE",
        "condition": "GREATER_THAN",
        "thresholdValue": 50,
        "timeWindowMinutes": 5
      }
    },
    {
      "id": "disabled",
      "name": "Never evaluated",
      "status": "inactive",
      "ruleConfig": {
        "metricType": "TOTAL_EVENTS",
        "condition": "GREATER_THAN",
        "thresholdValue": 0
      }
    }
  ]
}"#;

#[derive(Default)]
struct CollectingSink {
    alerts: Mutex<Vec<FiredAlert>>,
}

#[async_trait]
impl AlertSink for CollectingSink {
    async fn fire(&self, alert: &FiredAlert) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

struct TestContext {
    store: Arc<BucketedMetricsStore>,
    evaluator: Arc<AdaptiveRuleEvaluator>,
    sink: Arc<CollectingSink>,
}

fn build_test_context(rules_path: &Path) -> TestContext {
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(BucketedMetricsStore::new(
        cache.clone(),
        "it",
        &MetricsConfig::default(),
    ));
    let sink = Arc::new(CollectingSink::default());
    let evaluator = Arc::new(AdaptiveRuleEvaluator::new(
        EvaluationConfig::default(),
        60,
        Arc::new(EventRateMonitor::new()),
        Arc::new(JsonFileRuleSource::new(rules_path)),
        store.clone(),
        sink.clone(),
        CooldownStore::new(cache, "it"),
        HandlerRegistry::with_defaults(),
    ));
    TestContext {
        store,
        evaluator,
        sink,
    }
}

#[tokio::test]
async fn file_rule_source_skips_inactive_rules() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");
    std::fs::write(&path, RULES).unwrap();

    let source = JsonFileRuleSource::new(&path);
    assert_eq!(source.load_all().await.unwrap().len(), 2);
    let active = source.active_rules().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, "errors-high");
    assert_eq!(active[0].metric_type(), Some("ERROR_RATE"));
}

#[tokio::test]
async fn file_rule_source_reports_missing_and_malformed_files() {
    let dir = tempfile::tempdir().unwrap();
    let missing = JsonFileRuleSource::new(dir.path().join("absent.json"));
    assert!(missing.active_rules().await.is_err());

    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();
    let broken = JsonFileRuleSource::new(&path);
    let err = broken.active_rules().await.unwrap_err();
    assert!(err.to_string().contains("broken.json"));
}

#[tokio::test]
async fn handle_line_records_events_and_skips_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");
    std::fs::write(&path, RULES).unwrap();
    let ctx = build_test_context(&path);
    let ingest = EventIngest::new(ctx.store.clone(), ctx.evaluator.clone());

    assert!(ingest.handle_line(r#"{"source":"api","eventType":"login","severity":"error"}"#).await);
    assert!(ingest.handle_line(r#"{"source":"api","eventType":"login","latencyMs":120}"#).await);
    assert!(!ingest.handle_line("   ").await);
    assert!(!ingest.handle_line("{oops").await);

    assert_eq!(ingest.accepted(), 2);
    assert_eq!(ingest.rejected(), 1);
    assert!(ctx.evaluator.is_dirty());
    assert_eq!(ctx.evaluator.monitor().pending_events(), 2);

    let bucket = ctx.store.read(5, &MetricsFilter::Global, Utc::now()).await;
    assert_eq!(bucket.total_events, 2);
    assert_eq!(bucket.total_errors, 1);
    assert_eq!(bucket.latency_max, Some(120));
}

#[tokio::test]
async fn tcp_feed_drives_an_alert() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");
    std::fs::write(&path, RULES).unwrap();
    let ctx = build_test_context(&path);
    let ingest = Arc::new(EventIngest::new(ctx.store.clone(), ctx.evaluator.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(ingest.clone().serve(listener));

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut payload = String::new();
    for i in 0..4 {
        payload.push_str(&format!(
            "{{\"eventId\":\"e{i}\",\"source\":\"checkout\",\"eventType\":\"pay\",\"isError\":true}}\n"
        ));
    }
    payload.push_str("{\"source\":\"checkout\",\"eventType\":\"pay\"}\n");
    payload.push_str("definitely not json\n");
    client.write_all(payload.as_bytes()).await.unwrap();
    client.shutdown().await.unwrap();

    for _ in 0..200 {
        if ingest.accepted() + ingest.rejected() == 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ingest.accepted(), 5);
    assert_eq!(ingest.rejected(), 1);

    let stats = ctx.evaluator.evaluate_pass(Utc::now()).await;
    assert_eq!(stats.rules, 1);
    assert_eq!(stats.fired, 1);

    let alerts = ctx.sink.alerts.lock().unwrap();
    assert_eq!(alerts[0].rule_id, "errors-high");
    assert_eq!(alerts[0].current_value, 80.0);

    server.abort();
}
