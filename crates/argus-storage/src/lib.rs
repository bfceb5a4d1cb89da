//! Argus Storage - SQLite persistence layer.
//!
//! This crate provides durable state for the Argus filtering engine:
//!
//! - Block rules and the filtering switch, cached in memory by [`RuleStore`]
//! - The traffic log, one row per completed transaction
//! - Hourly statistics, updated in the same transaction as the log
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use argus_storage::{Database, RuleStore};
//!
//! let db = Arc::new(Database::in_memory().unwrap());
//! let rules = RuleStore::load(db.clone()).unwrap();
//!
//! rules.add_domain("ads.example.com").unwrap();
//! assert!(rules.evaluate("cdn.ads.example.com", "http://cdn.ads.example.com/").is_some());
//! ```

mod database;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
pub mod rule_store;
mod schema;

pub use database::Database;
pub use error::{Result, StorageError};
pub use models::{Config, StoredRule};
pub use pool::ConnectionPool;
pub use rule_store::{BlocklistWatch, RuleListing, RuleStore};
