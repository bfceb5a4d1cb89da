//! Traffic log repository.

use argus_core::{Headers, NewTrafficEntry, TrafficLogEntry, TrafficSummary};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_datetime, parse_datetime};
use crate::error::Result;

const SUMMARY_COLUMNS: &str = "id, timestamp, client_ip, method, url, host, status_code, \
     content_type, is_blocked, block_reason, error, response_size";

const ENTRY_COLUMNS: &str = "id, timestamp, client_ip, method, url, host, status_code, \
     content_type, is_blocked, block_reason, error, response_size, \
     request_headers, request_body, response_headers, response_body";

/// Repository for the traffic log.
pub struct TrafficRepo;

impl TrafficRepo {
    /// Append an entry. Returns the assigned id.
    pub fn insert(conn: &Connection, entry: &NewTrafficEntry) -> Result<i64> {
        let request_headers = serde_json::to_string(&entry.request_headers)?;
        let response_headers = entry
            .response_headers
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO traffic_log (
                timestamp, client_ip, method, url, host, status_code, content_type,
                is_blocked, block_reason, error, request_headers, request_body,
                response_headers, response_body, response_size
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                format_datetime(&entry.timestamp),
                entry.client_ip,
                entry.method,
                entry.url,
                entry.host,
                entry.status_code,
                entry.content_type,
                entry.is_blocked,
                entry.block_reason,
                entry.error,
                request_headers,
                entry.request_body,
                response_headers,
                entry.response_body,
                entry.response_size as i64,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Get a full entry by id.
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<TrafficLogEntry>> {
        let sql = format!("SELECT {} FROM traffic_log WHERE id = ?1", ENTRY_COLUMNS);
        let entry = conn.query_row(&sql, [id], entry_from_row).optional()?;
        Ok(entry)
    }

    /// Get the newest entries, newest first.
    pub fn get_recent(conn: &Connection, limit: i64) -> Result<Vec<TrafficSummary>> {
        let sql = format!(
            "SELECT {} FROM traffic_log ORDER BY id DESC LIMIT ?1",
            SUMMARY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;

        let entries = stmt
            .query_map([limit], summary_from_row)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(entries)
    }

    /// Count entries.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM traffic_log", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Delete every entry. Returns the number removed.
    pub fn clear(conn: &Connection) -> Result<usize> {
        let deleted = conn.execute("DELETE FROM traffic_log", [])?;
        Ok(deleted)
    }
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<TrafficSummary> {
    Ok(TrafficSummary {
        id: row.get(0)?,
        timestamp: parse_datetime(&row.get::<_, String>(1)?),
        client_ip: row.get(2)?,
        method: row.get(3)?,
        url: row.get(4)?,
        host: row.get(5)?,
        status_code: row.get(6)?,
        content_type: row.get(7)?,
        is_blocked: row.get(8)?,
        block_reason: row.get(9)?,
        error: row.get(10)?,
        response_size: row.get::<_, i64>(11)?.max(0) as u64,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<TrafficLogEntry> {
    let summary = summary_from_row(row)?;
    let request_headers: String = row.get(12)?;
    let response_headers: Option<String> = row.get(14)?;

    Ok(TrafficLogEntry {
        id: summary.id,
        timestamp: summary.timestamp,
        client_ip: summary.client_ip,
        method: summary.method,
        url: summary.url,
        host: summary.host,
        status_code: summary.status_code,
        content_type: summary.content_type,
        is_blocked: summary.is_blocked,
        block_reason: summary.block_reason,
        error: summary.error,
        request_headers: serde_json::from_str(&request_headers).unwrap_or_default(),
        request_body: row.get(13)?,
        response_headers: response_headers
            .map(|h| serde_json::from_str::<Headers>(&h).unwrap_or_default()),
        response_body: row.get(15)?,
        response_size: summary.response_size,
    })
}
