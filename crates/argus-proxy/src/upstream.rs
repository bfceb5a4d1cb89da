//! Upstream forwarding with timeouts and failure classification.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use argus_core::TransactionFailure;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hudsucker::Body;
use hyper::body::Bytes;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::http::request::Parts as RequestParts;
use hyper::http::response::Parts as ResponseParts;
use hyper::{Request, Version};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::crypto::aws_lc_rs::default_provider;

use crate::error::{ProxyError, Result};

/// HTTP client used to reach origin servers.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Builds the origin client. `connect_timeout` bounds TCP connection setup.
pub fn build_client(connect_timeout: Duration) -> Result<UpstreamClient> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(connect_timeout));

    let https = HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(default_provider())
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Ok(Client::builder(TokioExecutor::new()).build(https))
}

/// A completed upstream exchange with the body fully read.
pub struct UpstreamResponse {
    pub parts: ResponseParts,
    pub body: Bytes,
}

/// Why an exchange did not complete.
#[derive(Debug)]
pub struct UpstreamFailure {
    pub kind: TransactionFailure,
    pub detail: String,
}

impl UpstreamFailure {
    fn new(kind: TransactionFailure, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Sends a request upstream and reads the whole response body.
///
/// Waiting for the response head and reading the body are each bounded by
/// `timeout`. Bodies longer than `max_body` bytes fail the exchange.
pub async fn forward(
    client: &UpstreamClient,
    parts: RequestParts,
    body: Bytes,
    timeout: Duration,
    max_body: usize,
) -> std::result::Result<UpstreamResponse, UpstreamFailure> {
    let req = prepare_request(parts, body);

    let res = match tokio::time::timeout(timeout, client.request(req)).await {
        Ok(Ok(res)) => res,
        Ok(Err(e)) => return Err(UpstreamFailure::new(classify(&e), error_chain(&e))),
        Err(_) => {
            return Err(UpstreamFailure::new(
                TransactionFailure::UpstreamTimeout,
                format!("no response within {}s", timeout.as_secs_f64()),
            ))
        }
    };

    let (mut parts, incoming) = res.into_parts();
    let limited = Limited::new(incoming, max_body);
    let body = match tokio::time::timeout(timeout, limited.collect()).await {
        Ok(Ok(collected)) => collected.to_bytes(),
        Ok(Err(e)) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Err(UpstreamFailure::new(
                TransactionFailure::BodyTooLarge,
                format!("response body exceeds {} bytes", max_body),
            ))
        }
        Ok(Err(e)) => {
            return Err(UpstreamFailure::new(
                TransactionFailure::UpstreamConnect,
                format!("response body: {}", e),
            ))
        }
        Err(_) => {
            return Err(UpstreamFailure::new(
                TransactionFailure::UpstreamTimeout,
                format!("response body not received within {}s", timeout.as_secs_f64()),
            ))
        }
    };

    strip_hop_by_hop(&mut parts.headers);
    Ok(UpstreamResponse { parts, body })
}

/// Rebuilds a client-bound response from a buffered upstream response.
pub fn into_client_response(upstream: UpstreamResponse) -> hyper::Response<Body> {
    hyper::Response::from_parts(upstream.parts, Body::from(Full::new(upstream.body)))
}

/// Normalizes a request for HTTP/1.1 forwarding. The client sets `Host` from
/// the absolute URI.
fn prepare_request(mut parts: RequestParts, body: Bytes) -> Request<Body> {
    strip_hop_by_hop(&mut parts.headers);
    parts.headers.remove(header::HOST);
    join_cookies(&mut parts.headers);
    parts.version = Version::HTTP_11;

    Request::from_parts(parts, Body::from(Full::new(body)))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop as well.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// HTTP/2 clients may split cookies across headers; HTTP/1.1 needs one.
fn join_cookies(headers: &mut HeaderMap) {
    let cookies: Vec<String> = headers
        .get_all(header::COOKIE)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .collect();

    if cookies.len() > 1 {
        if let Ok(joined) = HeaderValue::from_str(&cookies.join("; ")) {
            headers.insert(header::COOKIE, joined);
        }
    }
}

/// Timeouts anywhere in the error chain count as `UpstreamTimeout`,
/// everything else as `UpstreamConnect`.
pub fn classify(err: &(dyn StdError + 'static)) -> TransactionFailure {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                return TransactionFailure::UpstreamTimeout;
            }
        }
        source = e.source();
    }
    TransactionFailure::UpstreamConnect
}

/// Flattens an error and its sources into one line.
pub(crate) fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "client error")
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn classify_walks_source_chain() {
        let timeout = Wrapped(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
        assert_eq!(classify(&timeout), TransactionFailure::UpstreamTimeout);

        let refused = Wrapped(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(classify(&refused), TransactionFailure::UpstreamConnect);
        assert_eq!(error_chain(&refused), "client error: refused");
    }

    #[test]
    fn hop_by_hop_headers_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn prepare_request_normalizes() {
        let req = Request::builder()
            .method("GET")
            .uri("https://example.com/a")
            .version(Version::HTTP_2)
            .header(header::HOST, "example.com")
            .header(header::COOKIE, "a=1")
            .header(header::COOKIE, "b=2")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();

        let req = prepare_request(parts, Bytes::new());

        assert_eq!(req.version(), Version::HTTP_11);
        assert!(req.headers().get(header::HOST).is_none());
        assert_eq!(req.headers().get(header::COOKIE).unwrap(), "a=1; b=2");
        assert_eq!(req.uri(), "https://example.com/a");
    }
}
