//! Rule store: the durable rule set plus the in-memory copy the proxy reads.
//!
//! Every mutation is written to SQLite before the cached [`RuleSet`] changes,
//! so a rule visible to the proxy is always one that survives a restart.
//! Mutations hold the write lock across the database write; readers only ever
//! see the state before or after a change.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use argus_core::{BlockDecision, Rule, RuleError, RuleKind, RuleSet, Settings};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};
use crate::Database;

/// Rules grouped by kind, as served by the rules listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleListing {
    pub domains: Vec<String>,
    pub keywords: Vec<String>,
    pub settings: Settings,
}

/// Shared handle over the persisted rules and settings.
#[derive(Clone)]
pub struct RuleStore {
    db: Arc<Database>,
    rules: Arc<RwLock<RuleSet>>,
    filtering_enabled: Arc<AtomicBool>,
    /// Held across the settings write and the in-memory switch.
    settings_lock: Arc<Mutex<()>>,
}

impl RuleStore {
    /// Loads rules and settings from the database.
    pub fn load(db: Arc<Database>) -> Result<Self> {
        let stored = db.list_rules()?;
        let rules = RuleSet::from_rules(stored.iter().map(|r| r.rule()));
        let settings = db.settings()?;

        info!(
            rules = rules.len(),
            filtering_enabled = settings.filtering_enabled,
            "Loaded rule store"
        );

        Ok(Self {
            db,
            rules: Arc::new(RwLock::new(rules)),
            filtering_enabled: Arc::new(AtomicBool::new(settings.filtering_enabled)),
            settings_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Adds a domain rule.
    pub fn add_domain(&self, raw: &str) -> Result<Rule> {
        self.add_rule(RuleKind::Domain, raw)
    }

    /// Adds a keyword rule.
    pub fn add_keyword(&self, raw: &str) -> Result<Rule> {
        self.add_rule(RuleKind::Keyword, raw)
    }

    /// Normalizes, persists and caches a rule.
    pub fn add_rule(&self, kind: RuleKind, raw: &str) -> Result<Rule> {
        let rule = Rule::new(kind, raw)?;

        let mut rules = self.rules.write();
        if rules.contains(&rule) {
            return Err(RuleError::DuplicateRule {
                kind,
                value: rule.value,
            }
            .into());
        }

        self.db.add_rule(&rule)?;
        rules.insert(rule.clone())?;

        debug!(kind = %rule.kind, value = %rule.value, "Added rule");
        Ok(rule)
    }

    /// Removes a rule. The value is normalized the same way as on insert.
    pub fn remove_rule(&self, kind: RuleKind, raw: &str) -> Result<Rule> {
        let rule = Rule::new(kind, raw)?;

        let mut rules = self.rules.write();
        if !rules.contains(&rule) {
            return Err(RuleError::NotFound {
                kind,
                value: rule.value,
            }
            .into());
        }

        self.db.remove_rule(&rule)?;
        rules.remove(&rule)?;

        debug!(kind = %rule.kind, value = %rule.value, "Removed rule");
        Ok(rule)
    }

    /// Current rules and settings.
    pub fn list_rules(&self) -> RuleListing {
        let rules = self.rules.read();
        RuleListing {
            domains: rules.domains().map(str::to_string).collect(),
            keywords: rules.keywords().map(str::to_string).collect(),
            settings: self.settings(),
        }
    }

    /// Copy of the current rule set.
    pub fn snapshot(&self) -> RuleSet {
        self.rules.read().clone()
    }

    /// Whether rule evaluation is active.
    pub fn filtering_enabled(&self) -> bool {
        self.filtering_enabled.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> Settings {
        Settings {
            filtering_enabled: self.filtering_enabled(),
        }
    }

    /// Persists and applies the filtering switch.
    pub fn set_filtering_enabled(&self, enabled: bool) -> Result<Settings> {
        let settings = Settings {
            filtering_enabled: enabled,
        };

        let _guard = self.settings_lock.lock();
        self.db.set_settings(settings)?;
        self.filtering_enabled.store(enabled, Ordering::SeqCst);

        info!(filtering_enabled = enabled, "Updated settings");
        Ok(settings)
    }

    /// Evaluates a request against the cached rules. Always `None` while
    /// filtering is disabled.
    pub fn evaluate(&self, host: &str, url: &str) -> Option<BlockDecision> {
        if !self.filtering_enabled() {
            return None;
        }
        self.rules.read().evaluate(host, url)
    }

    /// Imports domain rules from a text file, one per line. Blank lines and
    /// `#` comments are ignored, as are invalid or already-present entries.
    /// Returns the number of rules added.
    pub fn import_domains(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        let mut added = 0;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match self.add_domain(line) {
                Ok(_) => added += 1,
                Err(StorageError::Rule(RuleError::DuplicateRule { .. })) => {}
                Err(StorageError::Rule(e)) => warn!("Skipping blocklist entry {:?}: {}", line, e),
                Err(e) => return Err(e),
            }
        }

        info!("Imported {} domain rules from {:?}", added, path);
        Ok(added)
    }
}

/// A blocklist file re-imported whenever its modification time changes.
///
/// Reloading only adds domains; entries deleted from the file stay in the
/// rule store until removed through the API.
#[derive(Debug)]
pub struct BlocklistWatch {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl BlocklistWatch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Imports the file if it changed since the last successful import.
    /// Returns `None` when the file is unchanged or does not exist.
    pub fn poll(&mut self, rules: &RuleStore) -> Result<Option<usize>> {
        let modified = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if self.last_modified == Some(modified) {
            return Ok(None);
        }

        let added = rules.import_domains(&self.path)?;
        self.last_modified = Some(modified);
        Ok(Some(added))
    }
}
