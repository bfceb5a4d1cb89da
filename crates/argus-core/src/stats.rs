//! Hourly traffic statistics.
//!
//! Buckets are keyed by the UTC date and hour of each log entry. Charts need
//! a contiguous series, so [`zero_fill`] expands the stored (sparse) buckets
//! into one entry per hour of the requested window.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::traffic::TrafficSummary;

/// Default chart window, in hours.
pub const DEFAULT_RANGE_HOURS: u32 = 24;

/// Number of entries carried in [`StatsUpdate::recent_logs`].
pub const RECENT_LOGS_LEN: usize = 10;

/// Aggregation key: a UTC date and hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HourBucket {
    pub date: NaiveDate,
    pub hour: u32,
}

impl HourBucket {
    /// Returns the bucket containing `timestamp`.
    pub fn containing(timestamp: DateTime<Utc>) -> Self {
        Self {
            date: timestamp.date_naive(),
            hour: timestamp.hour(),
        }
    }

    /// Start of the bucket.
    pub fn start(&self) -> DateTime<Utc> {
        let naive = self
            .date
            .and_hms_opt(self.hour, 0, 0)
            .unwrap_or_else(|| self.date.and_time(chrono::NaiveTime::MIN));
        Utc.from_utc_datetime(&naive)
    }

    /// The bucket `hours` hours earlier.
    pub fn hours_before(&self, hours: u32) -> Self {
        Self::containing(self.start() - Duration::hours(i64::from(hours)))
    }

    /// Date formatted for storage (`YYYY-MM-DD`).
    pub fn date_key(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

/// Aggregated counters for one hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyStat {
    pub date: NaiveDate,
    pub hour: u32,
    pub total_requests: i64,
    pub blocked_requests: i64,
    pub total_bytes: i64,
}

impl HourlyStat {
    /// An empty bucket.
    pub fn zero(bucket: HourBucket) -> Self {
        Self {
            date: bucket.date,
            hour: bucket.hour,
            total_requests: 0,
            blocked_requests: 0,
            total_bytes: 0,
        }
    }

    pub fn bucket(&self) -> HourBucket {
        HourBucket {
            date: self.date,
            hour: self.hour,
        }
    }
}

/// Expands sparse buckets into `range_hours` contiguous buckets ending at the
/// hour containing `now`, oldest first. Buckets outside the window are dropped.
pub fn zero_fill(stats: Vec<HourlyStat>, now: DateTime<Utc>, range_hours: u32) -> Vec<HourlyStat> {
    if range_hours == 0 {
        return Vec::new();
    }

    let mut by_bucket: HashMap<HourBucket, HourlyStat> =
        stats.into_iter().map(|s| (s.bucket(), s)).collect();

    let newest = HourBucket::containing(now);
    (0..range_hours)
        .rev()
        .map(|offset| {
            let bucket = newest.hours_before(offset);
            by_bucket
                .remove(&bucket)
                .unwrap_or_else(|| HourlyStat::zero(bucket))
        })
        .collect()
}

/// All-time totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsTotals {
    pub total_requests: i64,
    pub total_blocked: i64,
    pub total_bytes: i64,
}

/// Dashboard snapshot: served by the statistics endpoint and pushed as
/// `stats_update` after every committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsUpdate {
    pub total_requests: i64,
    pub total_blocked: i64,
    pub total_bytes: i64,
    pub recent_logs: Vec<TrafficSummary>,
    pub stats: Vec<HourlyStat>,
}

impl StatsUpdate {
    pub fn new(totals: StatsTotals, recent_logs: Vec<TrafficSummary>, stats: Vec<HourlyStat>) -> Self {
        Self {
            total_requests: totals.total_requests,
            total_blocked: totals.total_blocked,
            total_bytes: totals.total_bytes,
            recent_logs,
            stats,
        }
    }
}
