//! Hourly statistics repository.

use argus_core::{HourBucket, HourlyStat, StatsTotals};
use chrono::NaiveDate;
use rusqlite::{params, Connection};

use crate::error::Result;

/// Repository for hourly statistics.
pub struct StatsRepo;

impl StatsRepo {
    /// Count one transaction in its bucket.
    pub fn record(conn: &Connection, bucket: HourBucket, blocked: bool, bytes: u64) -> Result<()> {
        conn.execute(
            "INSERT INTO hourly_stats (date, hour, total_requests, blocked_requests, total_bytes)
             VALUES (?1, ?2, 1, ?3, ?4)
             ON CONFLICT(date, hour) DO UPDATE SET
                total_requests = total_requests + 1,
                blocked_requests = blocked_requests + excluded.blocked_requests,
                total_bytes = total_bytes + excluded.total_bytes",
            params![bucket.date_key(), bucket.hour, blocked as i64, bytes as i64],
        )?;

        Ok(())
    }

    /// Get stored buckets between `start` and `end` inclusive, oldest first.
    pub fn get_range(conn: &Connection, start: HourBucket, end: HourBucket) -> Result<Vec<HourlyStat>> {
        let mut stmt = conn.prepare(
            "SELECT date, hour, total_requests, blocked_requests, total_bytes
             FROM hourly_stats
             WHERE (date > ?1 OR (date = ?1 AND hour >= ?2))
               AND (date < ?3 OR (date = ?3 AND hour <= ?4))
             ORDER BY date ASC, hour ASC",
        )?;

        let stats = stmt
            .query_map(
                params![start.date_key(), start.hour, end.date_key(), end.hour],
                |row| {
                    let date_str: String = row.get(0)?;
                    Ok((
                        date_str,
                        row.get::<_, u32>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )?
            .filter_map(|r| r.ok())
            .filter_map(|(date, hour, total_requests, blocked_requests, total_bytes)| {
                Some(HourlyStat {
                    date: NaiveDate::parse_from_str(&date, "%Y-%m-%d").ok()?,
                    hour,
                    total_requests,
                    blocked_requests,
                    total_bytes,
                })
            })
            .collect();

        Ok(stats)
    }

    /// All-time totals across every bucket.
    pub fn get_totals(conn: &Connection) -> Result<StatsTotals> {
        let totals = conn.query_row(
            "SELECT COALESCE(SUM(total_requests), 0),
                    COALESCE(SUM(blocked_requests), 0),
                    COALESCE(SUM(total_bytes), 0)
             FROM hourly_stats",
            [],
            |row| {
                Ok(StatsTotals {
                    total_requests: row.get(0)?,
                    total_blocked: row.get(1)?,
                    total_bytes: row.get(2)?,
                })
            },
        )?;

        Ok(totals)
    }

    /// Recompute every bucket from the traffic log. Returns the bucket count.
    ///
    /// Relies on the stored timestamp format: `YYYY-MM-DDTHH:...Z` in UTC.
    pub fn rebuild_from_log(conn: &Connection) -> Result<usize> {
        conn.execute("DELETE FROM hourly_stats", [])?;
        let buckets = conn.execute(
            "INSERT INTO hourly_stats (date, hour, total_requests, blocked_requests, total_bytes)
             SELECT substr(timestamp, 1, 10),
                    CAST(substr(timestamp, 12, 2) AS INTEGER),
                    COUNT(*),
                    SUM(is_blocked),
                    SUM(response_size)
             FROM traffic_log
             GROUP BY 1, 2",
            [],
        )?;

        Ok(buckets)
    }

    /// Delete every bucket.
    pub fn clear(conn: &Connection) -> Result<usize> {
        let deleted = conn.execute("DELETE FROM hourly_stats", [])?;
        Ok(deleted)
    }
}
