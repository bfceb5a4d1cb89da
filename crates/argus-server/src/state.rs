//! Application state for the API server.

use std::sync::Arc;

use argus_proxy::{CertificateAuthority, TrafficRecorder};
use argus_storage::{Database, RuleStore};

/// Shared application state.
///
/// The rule store and recorder are the same handles the proxy holds, so rule
/// changes reach the proxy immediately and committed transactions reach the
/// WebSocket subscribers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection.
    pub db: Arc<Database>,
    /// Persisted rules and filtering flag.
    pub rules: RuleStore,
    /// Traffic log writer and stats publisher.
    pub recorder: TrafficRecorder,
    /// Root CA served for download.
    pub ca: CertificateAuthority,
}

impl AppState {
    pub fn new(rules: RuleStore, recorder: TrafficRecorder, ca: CertificateAuthority) -> Self {
        Self {
            db: recorder.database().clone(),
            rules,
            recorder,
            ca,
        }
    }
}
