//! High-level database interface.

use std::path::PathBuf;

use argus_core::{
    zero_fill, HourBucket, HourlyStat, NewTrafficEntry, Rule, Settings, StatsTotals, StatsUpdate,
    TrafficLogEntry, TrafficSummary, RECENT_LOGS_LEN,
};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::models::StoredRule;
use crate::pool::ConnectionPool;
use crate::repository::{ConfigRepo, RulesRepo, StatsRepo, TrafficRepo};

/// Config key holding [`Settings::filtering_enabled`].
const FILTERING_ENABLED_KEY: &str = "filtering_enabled";

/// High-level database interface for Argus.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Create a new database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Create a new database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Default directory for the database and CA material.
    pub fn default_data_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "argus", "argus")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().to_path_buf())
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        Ok(Self::default_data_dir()?.join("argus.db"))
    }

    // === Rules ===

    /// Persist a normalized rule.
    pub fn add_rule(&self, rule: &Rule) -> Result<i64> {
        let conn = self.pool.get()?;
        RulesRepo::insert(&conn, rule)
    }

    /// Delete a rule. Returns false if it was not stored.
    pub fn remove_rule(&self, rule: &Rule) -> Result<bool> {
        let conn = self.pool.get()?;
        RulesRepo::delete(&conn, rule)
    }

    /// All stored rules in insertion order.
    pub fn list_rules(&self) -> Result<Vec<StoredRule>> {
        let conn = self.pool.get()?;
        RulesRepo::get_all(&conn)
    }

    // === Settings ===

    /// Current settings, defaulting to filtering enabled.
    pub fn settings(&self) -> Result<Settings> {
        let conn = self.pool.get()?;
        let filtering_enabled = ConfigRepo::get(&conn, FILTERING_ENABLED_KEY)?
            .and_then(|c| c.value.as_bool())
            .unwrap_or(true);

        Ok(Settings { filtering_enabled })
    }

    /// Persist settings.
    pub fn set_settings(&self, settings: Settings) -> Result<()> {
        let conn = self.pool.get()?;
        ConfigRepo::set(
            &conn,
            FILTERING_ENABLED_KEY,
            &serde_json::Value::Bool(settings.filtering_enabled),
        )
    }

    // === Traffic ===

    /// Append a completed transaction and count it in its hourly bucket.
    ///
    /// Both writes share one transaction, so the log and the aggregates never
    /// disagree.
    pub fn record_transaction(&self, entry: NewTrafficEntry) -> Result<TrafficLogEntry> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;

        let id = TrafficRepo::insert(&tx, &entry)?;
        StatsRepo::record(
            &tx,
            HourBucket::containing(entry.timestamp),
            entry.is_blocked,
            entry.response_size,
        )?;

        tx.commit()?;
        debug!(id, url = %entry.url, blocked = entry.is_blocked, "Recorded transaction");

        Ok(TrafficLogEntry::from_new(id, entry))
    }

    /// Get one entry with headers and bodies.
    pub fn get_traffic_entry(&self, id: i64) -> Result<TrafficLogEntry> {
        let conn = self.pool.get()?;
        TrafficRepo::get_by_id(&conn, id)?
            .ok_or_else(|| StorageError::NotFound(format!("traffic entry {}", id)))
    }

    /// Newest entries first.
    pub fn recent_traffic(&self, limit: usize) -> Result<Vec<TrafficSummary>> {
        let conn = self.pool.get()?;
        TrafficRepo::get_recent(&conn, limit as i64)
    }

    /// Number of logged transactions.
    pub fn count_traffic(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        TrafficRepo::count(&conn)
    }

    /// Delete the traffic log and the aggregates derived from it.
    pub fn clear_traffic(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;

        let deleted = TrafficRepo::clear(&tx)?;
        StatsRepo::clear(&tx)?;

        tx.commit()?;
        info!("Cleared {} traffic log entries", deleted);
        Ok(deleted)
    }

    // === Statistics ===

    /// `range_hours` contiguous buckets ending at the hour containing `now`,
    /// oldest first, zero-filled.
    pub fn hourly_stats(&self, range_hours: u32, now: DateTime<Utc>) -> Result<Vec<HourlyStat>> {
        if range_hours == 0 {
            return Ok(Vec::new());
        }

        let end = HourBucket::containing(now);
        let start = end.hours_before(range_hours - 1);

        let conn = self.pool.get()?;
        let stored = StatsRepo::get_range(&conn, start, end)?;
        Ok(zero_fill(stored, now, range_hours))
    }

    /// All-time totals.
    pub fn stats_totals(&self) -> Result<StatsTotals> {
        let conn = self.pool.get()?;
        StatsRepo::get_totals(&conn)
    }

    /// Dashboard snapshot: totals, the newest entries and the hourly series.
    pub fn stats_snapshot(&self, range_hours: u32, now: DateTime<Utc>) -> Result<StatsUpdate> {
        let totals = self.stats_totals()?;
        let recent = self.recent_traffic(RECENT_LOGS_LEN)?;
        let stats = self.hourly_stats(range_hours, now)?;

        Ok(StatsUpdate::new(totals, recent, stats))
    }

    /// Recompute hourly aggregates from the traffic log.
    pub fn rebuild_stats(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;

        let buckets = StatsRepo::rebuild_from_log(&tx)?;

        tx.commit()?;
        info!("Rebuilt {} hourly stat buckets", buckets);
        Ok(buckets)
    }
}
