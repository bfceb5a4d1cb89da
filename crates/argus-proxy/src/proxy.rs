//! Intercepting proxy server.
//!
//! Accepts plain HTTP proxy requests and CONNECT tunnels, terminating TLS
//! with leaves issued by the Argus CA.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use argus_core::DEFAULT_BODY_CAPTURE_LIMIT;
use argus_storage::RuleStore;
use hudsucker::Proxy;
use rustls::crypto::aws_lc_rs::default_provider;
use tokio::sync::broadcast;

use crate::ca::{CaManager, CertificateAuthority};
use crate::error::{ProxyError, Result};
use crate::handler::{HandlerConfig, ProxyHandler};
use crate::recorder::TrafficRecorder;
use crate::upstream;
use crate::DEFAULT_PROXY_PORT;

/// Default bound on upstream connect, response head and body reads.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on a buffered request or response body.
pub const DEFAULT_MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA files used for interception.
    pub ca_manager: CaManager,
    /// Upstream timeout.
    pub upstream_timeout: Duration,
    /// Bytes of each request/response body kept in the log.
    pub max_body_capture: usize,
    /// Largest request or response body the proxy buffers; larger exchanges
    /// fail with `body_too_large`.
    pub max_body_size: usize,
}

impl ProxyConfig {
    /// Creates a configuration with defaults, storing CA files in `ca_dir`.
    pub fn new(ca_dir: impl Into<PathBuf>) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_manager: CaManager::new(ca_dir.into()),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            max_body_capture: DEFAULT_BODY_CAPTURE_LIMIT,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the upstream timeout.
    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Sets the body capture limit.
    pub fn with_max_body_capture(mut self, bytes: usize) -> Self {
        self.max_body_capture = bytes;
        self
    }

    /// Sets the body buffering limit.
    pub fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }
}

/// Intercepting proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    ca: CertificateAuthority,
    handler: ProxyHandler,
}

impl ProxyServer {
    /// Creates a proxy server, loading (or generating) the CA.
    pub fn new(config: ProxyConfig, rules: RuleStore, recorder: TrafficRecorder) -> Result<Self> {
        let ca = config.ca_manager.ensure_ca()?;
        let client = upstream::build_client(config.upstream_timeout)?;

        let handler = ProxyHandler::new(HandlerConfig {
            rules,
            recorder,
            ca: ca.clone(),
            client,
            upstream_timeout: config.upstream_timeout,
            max_body_capture: config.max_body_capture,
            max_body_size: config.max_body_size,
        });

        Ok(Self {
            config,
            ca,
            handler,
        })
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for user installation.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.config.ca_manager.cert_path()
    }

    /// Returns the certificate authority, shared with the running proxy.
    pub fn certificate_authority(&self) -> CertificateAuthority {
        self.ca.clone()
    }

    /// Starts the proxy server.
    ///
    /// This will block until the server is shut down.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting proxy on {}", self.config.addr);
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());

        serve(self.config.addr, self.ca, self.handler).await?;

        tracing::info!("Proxy server stopped");
        Ok(())
    }

    /// Starts the proxy server in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> ProxyHandle {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let addr = self.config.addr;

        tracing::info!("Starting proxy on {}", addr);

        let handle = tokio::spawn(async move {
            tokio::select! {
                result = serve(addr, self.ca, self.handler) => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            };
        });

        ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        }
    }
}

async fn serve(addr: SocketAddr, ca: CertificateAuthority, handler: ProxyHandler) -> Result<()> {
    let proxy = Proxy::builder()
        .with_addr(addr)
        .with_ca(ca)
        .with_rustls_connector(default_provider())
        .with_http_handler(handler)
        .build()
        .map_err(|e| ProxyError::Proxy(e.to_string()))?;

    proxy
        .start()
        .await
        .map_err(|e| ProxyError::Proxy(e.to_string()))
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
