use evmon_alert::evaluator::AdaptiveRuleEvaluator;
use evmon_common::types::EventRecord;
use evmon_metrics::BucketedMetricsStore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Event feed entry point: one call per event into the evaluator's hot path
/// and the bucket store.
pub struct EventIngest {
    store: Arc<BucketedMetricsStore>,
    evaluator: Arc<AdaptiveRuleEvaluator>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl EventIngest {
    pub fn new(store: Arc<BucketedMetricsStore>, evaluator: Arc<AdaptiveRuleEvaluator>) -> Self {
        Self {
            store,
            evaluator,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub async fn record(&self, event: &EventRecord) {
        self.evaluator.on_event_ingested(event.counts_as_error());
        self.store.write(event).await;
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one NDJSON line. Blank lines are ignored; malformed ones are
    /// logged and dropped. Returns whether an event was recorded.
    pub async fn handle_line(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }
        match serde_json::from_str::<EventRecord>(line) {
            Ok(event) => {
                self.record(&event).await;
                true
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "malformed event line, skipping");
                false
            }
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Accept connections until the task is aborted. Each connection is
    /// served on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => tracing::info!(addr = %addr, "event feed listening"),
            Err(e) => tracing::warn!(error = %e, "event feed listening on unknown address"),
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let ingest = self.clone();
                    tokio::spawn(async move {
                        ingest.handle_connection(stream, peer).await;
                    });
                }
                Err(e) => tracing::error!(error = %e, "failed to accept event feed connection"),
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        tracing::debug!(peer = %peer, "event feed connection opened");
        let mut lines = BufReader::new(stream).lines();
        let mut count = 0u64;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if self.handle_line(&line).await {
                        count += 1;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "event feed read failed");
                    break;
                }
            }
        }
        tracing::debug!(peer = %peer, events = count, "event feed connection closed");
    }
}
