//! Value types shared by the metrics store, the rule evaluator and the
//! server binary.

pub mod types;
