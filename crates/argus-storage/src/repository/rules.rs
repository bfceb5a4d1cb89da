//! Block rule repository.

use argus_core::{Rule, RuleError, RuleKind};
use rusqlite::{params, Connection, ErrorCode};

use super::parse_datetime;
use crate::error::{Result, StorageError};
use crate::models::StoredRule;

/// Repository for block rules.
pub struct RulesRepo;

impl RulesRepo {
    /// Insert an already-normalized rule. Fails with
    /// [`RuleError::DuplicateRule`] if the same kind and value exist.
    pub fn insert(conn: &Connection, rule: &Rule) -> Result<i64> {
        let inserted = conn.execute(
            "INSERT INTO rules (kind, value) VALUES (?1, ?2)",
            params![rule.kind.as_str(), rule.value],
        );

        match inserted {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StorageError::Rule(RuleError::DuplicateRule {
                    kind: rule.kind,
                    value: rule.value.clone(),
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a rule. Returns false if it did not exist.
    pub fn delete(conn: &Connection, rule: &Rule) -> Result<bool> {
        let deleted = conn.execute(
            "DELETE FROM rules WHERE kind = ?1 AND value = ?2",
            params![rule.kind.as_str(), rule.value],
        )?;
        Ok(deleted > 0)
    }

    /// Get all rules in insertion order.
    pub fn get_all(conn: &Connection) -> Result<Vec<StoredRule>> {
        let mut stmt =
            conn.prepare("SELECT id, kind, value, created_at FROM rules ORDER BY id ASC")?;

        let rules = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let kind: String = row.get(1)?;
                let value: String = row.get(2)?;
                let created_at: String = row.get(3)?;
                Ok((kind, id, value, created_at))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(kind, id, value, created_at)| {
                Some(StoredRule {
                    id,
                    kind: RuleKind::parse(&kind)?,
                    value,
                    created_at: parse_datetime(&created_at),
                })
            })
            .collect();

        Ok(rules)
    }
}
