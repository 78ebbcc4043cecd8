//! HTTP/1.1 over any [`TlsDialer`]
//!
//! One request per connection. Used for reachability pings and report
//! uploads, and by callers that need plain HTTP through the dialer stack.

use crate::address::uri_address;
use crate::cancel::CancelToken;
use crate::task::spawn_supervised;
use crate::tls::TlsDialer;
use crate::{Error, Result};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

/// Response with a fully collected body
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Body bytes
    pub body: Bytes,
}

impl HttpResponse {
    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// HTTP transport dialing every request through a [`TlsDialer`].
///
/// Clones share the tracker owning the connection drivers.
#[derive(Clone)]
pub struct HttpTransport {
    dialer: Arc<dyn TlsDialer>,
    timeout: Duration,
    connections: TaskTracker,
}

impl HttpTransport {
    /// Create a transport; `timeout` bounds dial + exchange
    pub fn new(dialer: Arc<dyn TlsDialer>, timeout: Duration) -> Self {
        Self {
            dialer,
            timeout,
            connections: TaskTracker::new(),
        }
    }

    /// Connection drivers still running
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Wait until every connection driver has finished
    pub async fn drain(&self) {
        self.connections.close();
        self.connections.wait().await;
        self.connections.reopen();
    }

    /// Request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a request with an absolute `https` URI
    pub async fn send(&self, cancel: &CancelToken, request: Request<Bytes>) -> Result<HttpResponse> {
        let uri = request.uri().clone();
        if uri.scheme_str() != Some("https") {
            return Err(Error::InvalidAddress(format!(
                "only https URLs are supported: {}",
                uri
            )));
        }
        let address = uri_address(&uri)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(self.timeout, self.exchange(cancel, &address, request)) => {
                res.map_err(|_| {
                    Error::Timeout(format!("request to {} exceeded {:?}", uri, self.timeout))
                })?
            }
        }
    }

    /// GET a URL
    pub async fn get(&self, cancel: &CancelToken, url: &str) -> Result<HttpResponse> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(url)
            .body(Bytes::new())
            .map_err(|e| Error::Http(format!("Failed to build request: {}", e)))?;
        self.send(cancel, request).await
    }

    /// POST a JSON body with extra headers
    pub async fn post_json(
        &self,
        cancel: &CancelToken,
        url: &str,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<HttpResponse> {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(url)
            .body(Bytes::from(body))
            .map_err(|e| Error::Http(format!("Failed to build request: {}", e)))?;

        request.headers_mut().extend(headers);
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        self.send(cancel, request).await
    }

    async fn exchange(
        &self,
        cancel: &CancelToken,
        address: &str,
        request: Request<Bytes>,
    ) -> Result<HttpResponse> {
        let (mut parts, body) = request.into_parts();

        let authority = parts
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| Error::InvalidAddress(format!("URI missing host: {}", parts.uri)))?;
        let path = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let origin_form: Uri = path
            .parse()
            .map_err(|e| Error::InvalidAddress(format!("Invalid request path {}: {}", path, e)))?;

        if !parts.headers.contains_key(HOST) {
            let host = HeaderValue::from_str(&authority)
                .map_err(|e| Error::InvalidAddress(format!("Invalid host {}: {}", authority, e)))?;
            parts.headers.insert(HOST, host);
        }
        parts
            .headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
        parts.uri = origin_form;

        let conn = self.dialer.dial_tls(cancel, "tcp", address).await?;
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(conn)).await?;
        spawn_supervised(&self.connections, "http-connection", async move {
            connection.await?;
            Ok(())
        });

        let response = sender
            .send_request(Request::from_parts(parts, Full::new(body)))
            .await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();

        Ok(HttpResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("timeout", &self.timeout)
            .finish()
    }
}
