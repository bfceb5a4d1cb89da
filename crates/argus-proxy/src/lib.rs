//! Argus Proxy - intercepting HTTP/HTTPS proxy.
//!
//! Every request passing through the proxy is evaluated against the rule
//! store, then either answered with a block page or forwarded upstream. The
//! outcome is committed to the traffic log together with its hourly
//! statistics, and a fresh snapshot is pushed to live subscribers.
//!
//! ## Architecture
//!
//! ```text
//! Client → Proxy ─ CONNECT? ── issue leaf ──fail──→ 502 + log
//!                  │                │
//!                  │                └─ ok → TLS terminated, inner requests ↓
//!                  ▼
//!            Rule evaluation (domain, then keyword)
//!                  │
//!         ┌────────┴────────┐
//!         │ match           │ no match / filtering off
//!         ▼                 ▼
//!    403 block page    Forward upstream ──timeout/refused──→ 504/502
//!         │                 │
//!         └──────┬──────────┘
//!                ▼
//!     Traffic log + hourly stats (one transaction) → stats_update
//! ```

mod ca;
mod error;
mod handler;
mod proxy;
mod recorder;
mod upstream;

pub use ca::{
    CaManager, CaManagerError, CertificateAuthority, DEFAULT_LEAF_CACHE_SIZE, ROOT_COMMON_NAME,
};
pub use error::{ProxyError, Result};
pub use handler::{HandlerConfig, ProxyHandler, BLOCK_REASON_HEADER};
pub use proxy::{
    ProxyConfig, ProxyHandle, ProxyServer, DEFAULT_MAX_BODY_SIZE, DEFAULT_UPSTREAM_TIMEOUT,
};
pub use recorder::TrafficRecorder;
pub use upstream::{build_client, UpstreamClient};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_proxy_port() {
        assert_eq!(DEFAULT_PROXY_PORT, 8080);
    }
}
