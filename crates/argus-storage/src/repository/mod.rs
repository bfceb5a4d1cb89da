//! Database repositories for each table.

pub mod config;
pub mod rules;
pub mod stats;
pub mod traffic;

pub use config::ConfigRepo;
pub use rules::RulesRepo;
pub use stats::StatsRepo;
pub use traffic::TrafficRepo;

use chrono::{DateTime, SecondsFormat, Utc};

/// Formats a timestamp for storage. Fixed-width nanosecond RFC 3339 keeps
/// lexical order equal to time order and round-trips exactly.
pub(crate) fn format_datetime(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}
