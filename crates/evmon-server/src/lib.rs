pub mod config;
pub mod ingest;
pub mod rule_source;
pub mod sink;
