//! Argus Server - HTTP and WebSocket API server.
//!
//! Serves the dashboard's view of the filtering engine: rules, settings,
//! traffic history, statistics and the root certificate.
//!
//! ## Endpoints
//!
//! - `GET /api/statistics` - Totals, recent traffic and 24 hourly buckets
//! - `GET /api/traffic-logs?limit=N` - Newest traffic entries
//! - `DELETE /api/traffic-logs` - Clear traffic and statistics
//! - `GET /api/traffic-detail/{id}` - One entry with headers and bodies
//! - `GET /api/rules` - Domains, keywords and settings
//! - `GET|POST /api/rules/domains`, `GET|POST /api/rules/keywords`
//! - `DELETE /api/rules/{domains|keywords}/{value}` - Remove a rule
//! - `POST /api/settings` - Toggle filtering
//! - `GET /api/certificate` - Root CA download
//! - `GET /api/health` - Liveness check
//! - `GET /ws` - Live `stats_update` stream
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use argus_proxy::{CaManager, TrafficRecorder};
//! use argus_server::{AppState, Server, ServerConfig};
//! use argus_storage::{Database, RuleStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let db = Arc::new(Database::new().unwrap());
//!     let rules = RuleStore::load(db.clone()).unwrap();
//!     let recorder = TrafficRecorder::new(db);
//!     let ca = CaManager::with_default_dir().unwrap().ensure_ca().unwrap();
//!
//!     let state = AppState::new(rules, recorder, ca);
//!     let server = Server::with_state(ServerConfig::default(), state).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;
mod ws;

use std::net::SocketAddr;

use axum::routing::{delete, get, post};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use error::{ApiError, Result};
pub use handlers::CERTIFICATE_FILENAME;
pub use state::AppState;
pub use ws::HEARTBEAT_INTERVAL;

/// Default API port.
pub const DEFAULT_PORT: u16 = 5000;

/// Default server host (localhost only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 5000).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// The HTTP API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a server over shared application state.
    pub fn with_state(
        config: ServerConfig,
        state: AppState,
    ) -> std::result::Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self {
            router: build_router(state),
            addr,
        })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server until shutdown.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        info!("Starting Argus API server on {}", self.addr);

        let domain = if self.addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        // SO_REUSEADDR lets a restart bind while old sockets linger in TIME_WAIT.
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(128)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        axum::serve(listener, self.router)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        Ok(())
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

fn build_router(state: AppState) -> Router {
    // Open CORS for the browser dashboard.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/statistics", get(handlers::get_statistics))
        .route(
            "/api/traffic-logs",
            get(handlers::get_traffic_logs).delete(handlers::clear_traffic_logs),
        )
        .route("/api/traffic-detail/{id}", get(handlers::get_traffic_detail))
        .route("/api/rules", get(handlers::get_rules))
        .route(
            "/api/rules/domains",
            get(handlers::get_domains).post(handlers::add_domain),
        )
        .route(
            "/api/rules/keywords",
            get(handlers::get_keywords).post(handlers::add_keyword),
        )
        .route("/api/rules/{kind}/{value}", delete(handlers::delete_rule))
        .route("/api/settings", post(handlers::update_settings))
        .route("/api/certificate", get(handlers::get_certificate))
        .route("/ws", get(ws::stats_socket))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use argus_core::{Headers, NewTrafficEntry};
    use argus_proxy::{CaManager, TrafficRecorder};
    use argus_storage::{Database, RuleStore};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use futures::StreamExt;
    use serde_json::{json, Value};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tempfile::TempDir;
    use tokio_test::assert_ok;
    use tower::ServiceExt;

    struct TestApp {
        state: AppState,
        router: Router,
        _ca_dir: TempDir,
    }

    fn create_test_app() -> TestApp {
        let ca_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        let rules = RuleStore::load(db.clone()).unwrap();
        let recorder = TrafficRecorder::new(db);
        let ca = CaManager::new(ca_dir.path()).ensure_ca().unwrap();

        let state = AppState::new(rules, recorder, ca);
        let router = Server::with_state(ServerConfig::default().with_port(0), state.clone())
            .unwrap()
            .router();

        TestApp {
            state,
            router,
            _ca_dir: ca_dir,
        }
    }

    async fn send(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn record(app: &TestApp, url: &str, host: &str) -> i64 {
        let entry = NewTrafficEntry::request("127.0.0.1", "GET", url, host).with_response(
            200,
            Headers::new(),
            Some("hello".to_string()),
            5,
        );
        app.state.db.record_transaction(entry).unwrap().id
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_test_app();
        let (status, json) = send(&app, "GET", "/api/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert!(json["version"].is_string());
    }

    #[tokio::test]
    async fn test_statistics_zero_filled() {
        let app = create_test_app();
        record(&app, "http://good.com/", "good.com");

        let (status, json) = send(&app, "GET", "/api/statistics", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total_requests"], 1);
        assert_eq!(json["total_blocked"], 0);
        assert_eq!(json["total_bytes"], 5);
        let stats = json["stats"].as_array().unwrap();
        assert_eq!(stats.len(), 24);
        assert_eq!(stats[23]["total_requests"], 1);
        assert_eq!(json["recent_logs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_and_list_domain() {
        let app = create_test_app();

        let (status, json) =
            send(&app, "POST", "/api/rules/domains", Some(json!({"domain": "Bad.com"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["message"], "Added domain rule: bad.com");

        let (status, json) = send(&app, "GET", "/api/rules", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["domains"], json!(["bad.com"]));
        assert_eq!(json["keywords"], json!([]));
        assert_eq!(json["settings"]["filtering_enabled"], true);

        let (_, json) = send(&app, "GET", "/api/rules/domains", None).await;
        assert_eq!(json, json!(["bad.com"]));

        // The proxy reads the same store.
        assert!(app.state.rules.evaluate("ads.bad.com", "http://ads.bad.com/").is_some());
    }

    #[tokio::test]
    async fn test_duplicate_rule_conflicts() {
        let app = create_test_app();
        let body = json!({"keyword": "casino"});

        let (status, _) = send(&app, "POST", "/api/rules/keywords", Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, json) = send(&app, "POST", "/api/rules/keywords", Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], "duplicate_rule");

        let (_, json) = send(&app, "GET", "/api/rules/keywords", None).await;
        assert_eq!(json, json!(["casino"]));
    }

    #[tokio::test]
    async fn test_invalid_rule_rejected() {
        let app = create_test_app();

        let (status, json) =
            send(&app, "POST", "/api/rules/domains", Some(json!({"domain": "   "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "invalid_rule");

        let (status, json) = send(&app, "POST", "/api/rules/keywords", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "invalid_rule");
    }

    #[tokio::test]
    async fn test_delete_rule() {
        let app = create_test_app();
        app.state.rules.add_domain("bad.com").unwrap();

        let (status, json) = send(&app, "DELETE", "/api/rules/domains/bad.com", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Removed domain rule: bad.com");
        assert!(app.state.rules.list_rules().domains.is_empty());
        assert!(assert_ok!(app.state.db.list_rules()).is_empty());

        let (status, json) = send(&app, "DELETE", "/api/rules/domains/bad.com", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "rule_not_found");

        let (status, json) = send(&app, "DELETE", "/api/rules/hosts/bad.com", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_update_settings() {
        let app = create_test_app();

        let (status, json) = send(
            &app,
            "POST",
            "/api/settings",
            Some(json!({"filtering_enabled": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["settings"]["filtering_enabled"], false);
        assert!(!app.state.rules.filtering_enabled());
        assert!(!app.state.db.settings().unwrap().filtering_enabled);

        let (status, json) = send(&app, "POST", "/api/settings", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_traffic_logs_newest_first() {
        let app = create_test_app();
        record(&app, "http://good.com/1", "good.com");
        record(&app, "http://good.com/2", "good.com");
        record(&app, "http://good.com/3", "good.com");

        let (status, json) = send(&app, "GET", "/api/traffic-logs", None).await;
        assert_eq!(status, StatusCode::OK);
        let logs = json.as_array().unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0]["url"], "http://good.com/3");
        assert!(logs[0].get("response_body").is_none());

        let (_, json) = send(&app, "GET", "/api/traffic-logs?limit=0", None).await;
        assert_eq!(json.as_array().unwrap().len(), 1);

        let (_, json) = send(&app, "GET", "/api/traffic-logs?limit=2", None).await;
        assert_eq!(json.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_traffic_detail() {
        let app = create_test_app();
        let id = record(&app, "http://good.com/page", "good.com");

        let (status, json) = send(&app, "GET", &format!("/api/traffic-detail/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["id"], id);
        assert_eq!(json["response_body"], "hello");
        assert_eq!(json["status_code"], 200);

        let (status, json) = send(&app, "GET", "/api/traffic-detail/9999", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["error"].as_str().unwrap().contains("9999"));
    }

    #[tokio::test]
    async fn test_clear_traffic_logs() {
        let app = create_test_app();
        record(&app, "http://good.com/1", "good.com");
        record(&app, "http://good.com/2", "good.com");

        let (status, json) = send(&app, "DELETE", "/api/traffic-logs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["deleted"], 2);

        let (_, json) = send(&app, "GET", "/api/statistics", None).await;
        assert_eq!(json["total_requests"], 0);
        assert!(json["recent_logs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_certificate_download() {
        let app = create_test_app();

        let request = Request::builder()
            .method("GET")
            .uri("/api/certificate")
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/x-x509-ca-cert"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"argus-ca.crt\""
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            app.state.ca.root_certificate_pem()
        );
    }

    #[test]
    fn test_invalid_address() {
        let app = create_test_app();
        let result = Server::with_state(
            ServerConfig::default().with_host("not an address"),
            app.state.clone(),
        );
        assert!(matches!(result, Err(ServerError::Runtime(_))));
    }

    /// Reads text frames until one parses, skipping pings.
    async fn next_stats<S>(socket: &mut S) -> Value
    where
        S: futures::Stream<
                Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
            > + Unpin,
    {
        loop {
            let message = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_ws_pushes_snapshot_on_connect_and_per_transaction() {
        let app = create_test_app();
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = ServerConfig::default().with_host("127.0.0.1").with_port(port);
        let server = Server::with_state(config, app.state.clone()).unwrap();
        let handle = tokio::spawn(server.run());

        let url = format!("ws://127.0.0.1:{}/ws", port);
        let mut socket = None;
        for _ in 0..100 {
            if let Ok((stream, _)) = tokio_tungstenite::connect_async(url.as_str()).await {
                socket = Some(stream);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let mut socket = socket.expect("API server did not start");

        let first = next_stats(&mut socket).await;
        assert_eq!(first["event"], "stats_update");
        assert_eq!(first["data"]["total_requests"], 0);

        let entry = NewTrafficEntry::request("127.0.0.1", "GET", "http://good.com/", "good.com")
            .with_response(200, Headers::new(), None, 5);
        app.state.recorder.record(entry).await.unwrap();

        let pushed = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let frame = next_stats(&mut socket).await;
                if frame["data"]["total_requests"] == 1 {
                    return frame;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(pushed["data"]["total_bytes"], 5);
        assert_eq!(pushed["data"]["recent_logs"][0]["url"], "http://good.com/");

        handle.abort();
    }
}
