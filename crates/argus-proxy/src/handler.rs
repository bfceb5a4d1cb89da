//! HTTP request handler with rule evaluation, forwarding and logging.
//!
//! Every request that reaches the handler ends in exactly one log entry:
//! blocked by a rule, answered by the upstream, or failed in the engine.

use std::error::Error as StdError;
use std::time::Duration;

use argus_core::{capture_body, BlockDecision, Headers, NewTrafficEntry, TransactionFailure};
use argus_storage::RuleStore;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hudsucker::{
    hyper::{Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode, Uri};

use crate::ca::CertificateAuthority;
use crate::recorder::TrafficRecorder;
use crate::upstream::{self, UpstreamClient};

/// Header carrying the block reason on block pages.
pub const BLOCK_REASON_HEADER: &str = "x-argus-block-reason";

/// Helper to convert bytes to Body
fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

/// Block page HTML template.
const BLOCK_PAGE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Blocked by A.R.G.U.S.</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            min-height: 100vh;
            margin: 0;
            background: #0f172a;
            color: #e2e8f0;
        }
        .container {
            text-align: center;
            padding: 2rem;
            max-width: 560px;
        }
        h1 {
            margin: 0 0 1rem 0;
            font-size: 2rem;
            color: #f87171;
        }
        .reason {
            background: rgba(255,255,255,0.08);
            padding: 1rem;
            border-radius: 8px;
            margin-top: 1rem;
            word-break: break-all;
        }
    </style>
</head>
<body>
    <div class="container">
        <h1>Access Blocked</h1>
        <p>This request was blocked by the A.R.G.U.S. filtering engine.</p>
        <div class="reason">
            <p><strong>Reason:</strong> {{REASON}}</p>
            <p><strong>URL:</strong> {{URL}}</p>
        </div>
    </div>
</body>
</html>"#;

/// Handler configuration.
#[derive(Clone)]
pub struct HandlerConfig {
    /// Rules and the filtering switch.
    pub rules: RuleStore,
    /// Traffic log writer.
    pub recorder: TrafficRecorder,
    /// Issues leaves for intercepted CONNECT targets.
    pub ca: CertificateAuthority,
    /// Origin client.
    pub client: UpstreamClient,
    /// Bound on reading the request body and on waiting for the upstream
    /// response head and body.
    pub upstream_timeout: Duration,
    /// Bytes of each body kept in the log.
    pub max_body_capture: usize,
    /// Largest request or response body buffered in memory.
    pub max_body_size: usize,
}

impl std::fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("filtering_enabled", &self.rules.filtering_enabled())
            .field("upstream_timeout", &self.upstream_timeout)
            .field("max_body_capture", &self.max_body_capture)
            .field("max_body_size", &self.max_body_size)
            .finish()
    }
}

/// HTTP handler for the intercepting proxy.
///
/// hudsucker clones the handler for every request, so `pending` belongs to a
/// single transaction.
#[derive(Clone, Debug)]
pub struct ProxyHandler {
    config: HandlerConfig,
    /// Entry of an upgrade request answered through hudsucker's client,
    /// completed in `handle_response` or `handle_error`.
    pending: Option<NewTrafficEntry>,
}

/// What the handler knows about a request once its head has arrived.
struct RequestInfo {
    client_ip: String,
    method: String,
    url: String,
    host: String,
}

impl RequestInfo {
    fn entry(&self) -> NewTrafficEntry {
        NewTrafficEntry::request(
            self.client_ip.clone(),
            self.method.clone(),
            self.url.clone(),
            self.host.clone(),
        )
    }
}

/// Why the client request body was not read.
#[derive(Debug)]
struct RequestBodyFailure {
    status: StatusCode,
    kind: TransactionFailure,
    detail: String,
}

impl ProxyHandler {
    /// Creates a new proxy handler with the given configuration.
    pub fn new(config: HandlerConfig) -> Self {
        Self {
            config,
            pending: None,
        }
    }

    /// Issues the leaf for a CONNECT target up front so a failure can be
    /// answered and logged instead of surfacing as a broken handshake.
    async fn handle_connect(&self, ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        let Some(authority) = req.uri().authority().cloned() else {
            return RequestOrResponse::Request(req);
        };

        match self.config.ca.issue_leaf(authority.host()).await {
            Ok(_) => RequestOrResponse::Request(req),
            Err(e) => {
                tracing::warn!("CONNECT {} refused: {}", authority, e);

                let info = RequestInfo {
                    client_ip: ctx.client_addr.ip().to_string(),
                    method: Method::CONNECT.to_string(),
                    url: authority.to_string(),
                    host: authority.host().to_string(),
                };
                let entry = info
                    .entry()
                    .with_request(header_map(req.headers()), None)
                    .failed(TransactionFailure::CertificateIssuance, &e);
                self.config.recorder.record(entry).await;

                RequestOrResponse::Response(create_failure_response(
                    StatusCode::BAD_GATEWAY,
                    TransactionFailure::CertificateIssuance,
                    &e.to_string(),
                ))
            }
        }
    }

    /// Evaluates, forwards and logs a plain or decrypted request.
    async fn handle_http(&mut self, ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        let info = RequestInfo {
            client_ip: ctx.client_addr.ip().to_string(),
            method: req.method().to_string(),
            url: display_url(req.uri()),
            host: extract_host(&req).unwrap_or_default(),
        };

        let (parts, body) = req.into_parts();
        let request_headers = header_map(&parts.headers);

        let body_bytes = match read_request_body(
            body,
            self.config.max_body_size,
            self.config.upstream_timeout,
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(failure) => {
                tracing::warn!(
                    "{} {} rejected: {}: {}",
                    info.method,
                    info.url,
                    failure.kind,
                    failure.detail
                );
                let entry = info
                    .entry()
                    .with_request(request_headers, None)
                    .failed(failure.kind, &failure.detail);
                self.config.recorder.record(entry).await;

                return RequestOrResponse::Response(create_failure_response(
                    failure.status,
                    failure.kind,
                    &failure.detail,
                ));
            }
        };

        let entry = info.entry().with_request(
            request_headers,
            capture_body(&body_bytes, self.config.max_body_capture),
        );

        if let Some(decision) = self.config.rules.evaluate(&info.host, &info.url) {
            tracing::info!("Blocked {} {} - {}", info.method, info.url, decision.reason);
            self.config.recorder.record(entry.blocked(&decision)).await;
            return RequestOrResponse::Response(create_block_response(&decision, &info.url));
        }

        if parts.headers.contains_key(header::UPGRADE) {
            // Protocol upgrades stay on hudsucker's own client.
            tracing::debug!("Passing through upgrade request to {}", info.url);
            if is_websocket_upgrade(&parts.headers) {
                // hudsucker answers the handshake itself and never reports
                // back, so the outcome is known now.
                let status = websocket_handshake_status(&parts.headers);
                let entry = entry.with_response(status.as_u16(), Headers::new(), None, 0);
                self.config.recorder.record(entry).await;
            } else {
                self.pending = Some(entry);
            }
            return RequestOrResponse::Request(Request::from_parts(
                parts,
                bytes_to_body(body_bytes),
            ));
        }

        match upstream::forward(
            &self.config.client,
            parts,
            body_bytes,
            self.config.upstream_timeout,
            self.config.max_body_size,
        )
        .await
        {
            Ok(res) => {
                let entry = entry.with_response(
                    res.parts.status.as_u16(),
                    header_map(&res.parts.headers),
                    capture_body(&res.body, self.config.max_body_capture),
                    res.body.len() as u64,
                );
                tracing::debug!("{} {} -> {}", info.method, info.url, res.parts.status);
                self.config.recorder.record(entry).await;

                RequestOrResponse::Response(upstream::into_client_response(res))
            }
            Err(failure) => {
                tracing::warn!(
                    "{} {} failed: {}: {}",
                    info.method,
                    info.url,
                    failure.kind,
                    failure.detail
                );
                self.config
                    .recorder
                    .record(entry.failed(failure.kind, &failure.detail))
                    .await;

                RequestOrResponse::Response(create_failure_response(
                    upstream_failure_status(failure.kind),
                    failure.kind,
                    &failure.detail,
                ))
            }
        }
    }
}

impl HttpHandler for ProxyHandler {
    async fn handle_request(&mut self, ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        if req.method() == Method::CONNECT {
            return self.handle_connect(ctx, req).await;
        }
        self.handle_http(ctx, req).await
    }

    /// Only upgrade requests reach hudsucker's client and come back here.
    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        if let Some(entry) = self.pending.take() {
            let size = res
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let entry = entry.with_response(res.status().as_u16(), header_map(res.headers()), None, size);
            self.config.recorder.record(entry).await;
        }
        res
    }

    async fn handle_error(
        &mut self,
        _ctx: &HttpContext,
        err: hyper_util::client::legacy::Error,
    ) -> Response<Body> {
        let kind = upstream::classify(&err);
        let detail = upstream::error_chain(&err);
        tracing::warn!("Upgrade request failed: {}: {}", kind, detail);

        if let Some(entry) = self.pending.take() {
            self.config.recorder.record(entry.failed(kind, &detail)).await;
        }
        create_failure_response(upstream_failure_status(kind), kind, &detail)
    }
}

/// Reads the whole client body, bounded in size and time.
async fn read_request_body<B>(
    body: B,
    max_size: usize,
    timeout: Duration,
) -> Result<Bytes, RequestBodyFailure>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    match tokio::time::timeout(timeout, Limited::new(body, max_size).collect()).await {
        Ok(Ok(collected)) => Ok(collected.to_bytes()),
        Ok(Err(e)) if e.downcast_ref::<LengthLimitError>().is_some() => Err(RequestBodyFailure {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            kind: TransactionFailure::BodyTooLarge,
            detail: format!("request body exceeds {} bytes", max_size),
        }),
        Ok(Err(e)) => Err(RequestBodyFailure {
            status: StatusCode::BAD_REQUEST,
            kind: TransactionFailure::ClientRequest,
            detail: format!("request body: {}", e),
        }),
        Err(_) => Err(RequestBodyFailure {
            status: StatusCode::REQUEST_TIMEOUT,
            kind: TransactionFailure::ClientRequest,
            detail: format!(
                "request body not received within {}s",
                timeout.as_secs_f64()
            ),
        }),
    }
}

/// Creates the 403 block page.
fn create_block_response(decision: &BlockDecision, url: &str) -> Response<Body> {
    let html = BLOCK_PAGE_HTML
        .replace("{{REASON}}", &escape_html(&decision.reason))
        .replace("{{URL}}", &escape_html(url));

    let mut res = Response::new(bytes_to_body(Bytes::from(html)));
    *res.status_mut() = StatusCode::FORBIDDEN;

    let headers = res.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    headers.insert(
        BLOCK_REASON_HEADER,
        HeaderValue::from_str(&decision.reason)
            .unwrap_or_else(|_| HeaderValue::from_static("blocked")),
    );
    res
}

/// Status returned to the client when the upstream exchange fails: 504 for
/// timeouts, 502 otherwise.
fn upstream_failure_status(kind: TransactionFailure) -> StatusCode {
    match kind {
        TransactionFailure::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Creates the synthetic response for an engine failure.
fn create_failure_response(
    status: StatusCode,
    kind: TransactionFailure,
    detail: &str,
) -> Response<Body> {
    let mut res = Response::new(bytes_to_body(Bytes::from(format!("{}: {}\n", kind, detail))));
    *res.status_mut() = status;

    let headers = res.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    res
}

/// The URL as logged and matched: absolute URIs lose their scheme's default
/// port, so intercepted requests read `https://host/path`.
fn display_url(uri: &Uri) -> String {
    let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) else {
        return uri.to_string();
    };

    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return uri.to_string(),
    };
    if authority.port_u16() != Some(default_port) {
        return uri.to_string();
    }

    let host = authority
        .as_str()
        .rsplit_once(':')
        .map_or(authority.as_str(), |(host, _)| host);
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    format!("{}://{}{}", scheme, host, path)
}

/// Matches the check hudsucker uses to take over a WebSocket handshake.
fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    header_has_token(headers, header::CONNECTION, "upgrade")
        && header_has_token(headers, header::UPGRADE, "websocket")
}

/// Status hudsucker answers a WebSocket handshake with.
fn websocket_handshake_status(headers: &HeaderMap) -> StatusCode {
    let has_key = headers.contains_key(header::SEC_WEBSOCKET_KEY);
    let version_13 = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .is_some_and(|v| v.as_bytes() == b"13");

    if has_key && version_13 {
        StatusCode::SWITCHING_PROTOCOLS
    } else {
        StatusCode::BAD_REQUEST
    }
}

fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Extracts host from request URI or Host header, without port.
fn extract_host(req: &Request<Body>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_lowercase());
    }

    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|s| argus_core::rules::strip_port(s.trim()).to_lowercase())
}

/// Flattens a header map; repeated headers are joined with `", "`.
fn header_map(headers: &HeaderMap) -> Headers {
    let mut map = Headers::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        map.entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
