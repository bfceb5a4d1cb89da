//! Argus Core - rule matching, traffic records and hourly statistics.
//!
//! This crate holds the I/O-free pieces of the Argus filtering engine:
//!
//! - [`rules`]: domain/keyword block rules and the request matcher
//! - [`traffic`]: traffic log entries and body capture
//! - [`stats`]: hourly buckets, zero-filling and dashboard snapshots

pub mod error;
pub mod rules;
pub mod stats;
pub mod traffic;

pub use error::RuleError;
pub use rules::{normalize, BlockDecision, Rule, RuleKind, RuleSet, Settings};
pub use stats::{
    zero_fill, HourBucket, HourlyStat, StatsTotals, StatsUpdate, DEFAULT_RANGE_HOURS,
    RECENT_LOGS_LEN,
};
pub use traffic::{
    capture_body, Headers, NewTrafficEntry, TrafficLogEntry, TrafficSummary, TransactionFailure,
    DEFAULT_BODY_CAPTURE_LIMIT,
};
