//! HTTP transport seam.
//!
//! The pool only needs "send a request, get a status, headers and a body
//! stream back". [`ReqwestTransport`] does that over the network and
//! [`FakeTransport`] replays scripted replies for tests.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use thiserror::Error;

// ------------------------------------------------------------------ //
//  Errors                                                             //
// ------------------------------------------------------------------ //

/// Coarse classification of a failed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// No response within the effective timeout.
    Timeout,
    /// Connection refused, DNS failure, unreachable host.
    Connect,
    /// Connection reset or broken mid-exchange.
    Io,
    /// The request could not be built; retrying cannot help.
    Invalid,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Io      => "io",
            TransportErrorKind::Invalid => "invalid request",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("transport error ({}): {message}", .kind.as_str())]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            TransportErrorKind::Timeout,
            format!("no response after {}ms", after.as_millis()),
        )
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind != TransportErrorKind::Invalid
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_builder() {
            TransportErrorKind::Invalid
        } else if e.is_timeout() {
            TransportErrorKind::Timeout
        } else if e.is_connect() {
            TransportErrorKind::Connect
        } else {
            TransportErrorKind::Io
        };
        Self::new(kind, e.to_string())
    }
}

// ------------------------------------------------------------------ //
//  Request / response                                                 //
// ------------------------------------------------------------------ //

/// A fully resolved request for one host.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<String>,
    pub timeout: Duration,
}

impl HttpRequest {
    /// Value of the first query parameter called `name`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Response body delivered chunk by chunk.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Status, headers and a live body stream.
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    body: BodyStream,
}

impl HttpResponse {
    pub fn new(status: u16, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// A response whose body is already in memory.
    pub fn from_bytes(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self::new(status, headers, stream::once(async move { Ok(body) }).boxed())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn into_stream(self) -> BodyStream {
        self.body
    }

    /// Reads the whole body.
    pub async fn bytes(self) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::new();
        let mut body = self.body;
        while let Some(chunk) = body.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Reads the whole body as (lossy) UTF-8.
    pub async fn text(self) -> Result<String, TransportError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------ //
//  Trait                                                              //
// ------------------------------------------------------------------ //

/// Performs one HTTP exchange. Implementations do not retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

// ------------------------------------------------------------------ //
//  ReqwestTransport (production)                                      //
// ------------------------------------------------------------------ //

/// Network transport backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .http
            .request(request.method, request.url)
            .headers(request.headers)
            .timeout(request.timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.bytes_stream().map_err(TransportError::from).boxed();
        Ok(HttpResponse::new(status, headers, body))
    }
}

// ------------------------------------------------------------------ //
//  FakeTransport (for tests)                                          //
// ------------------------------------------------------------------ //

/// A scripted reply for [`FakeTransport`].
#[derive(Debug, Clone)]
pub enum FakeReply {
    Status {
        status: u16,
        headers: HeaderMap,
        body: String,
    },
    Error(TransportErrorKind),
    /// Never answers; the caller's timeout has to fire.
    Hang,
}

impl FakeReply {
    pub fn status(status: u16) -> Self {
        FakeReply::Status {
            status,
            headers: HeaderMap::new(),
            body: String::new(),
        }
    }

    pub fn body(status: u16, body: impl Into<String>) -> Self {
        FakeReply::Status {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::body(status, value.to_string())
            .with_header(reqwest::header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        if let FakeReply::Status { headers, .. } = &mut self {
            headers.insert(name, value);
        }
        self
    }
}

#[derive(Debug, Default)]
struct FakeState {
    queue: VecDeque<FakeReply>,
    routes: HashMap<String, FakeReply>,
    calls: Vec<HttpRequest>,
}

/// In-memory transport that records requests and replays scripted replies.
///
/// Host routes (keyed by `host:port`) answer every request to that host;
/// other requests consume the queue in order.
#[derive(Debug, Default, Clone)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply for the next unrouted request.
    pub fn push(&self, reply: FakeReply) -> &Self {
        self.lock().queue.push_back(reply);
        self
    }

    /// Answers every request to `authority` (e.g. `db1:8086`) with `reply`.
    pub fn route(&self, authority: &str, reply: FakeReply) -> &Self {
        self.lock().routes.insert(authority.to_string(), reply);
        self
    }

    /// Every request seen so far.
    pub fn calls(&self) -> Vec<HttpRequest> {
        self.lock().calls.clone()
    }

    /// `host:port` of every request seen so far, in order.
    pub fn called_hosts(&self) -> Vec<String> {
        self.lock().calls.iter().map(|r| authority(&r.url)).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn authority(url: &Url) -> String {
    format!(
        "{}:{}",
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or_default()
    )
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let reply = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let key = authority(&request.url);
            state.calls.push(request);
            match state.routes.get(&key) {
                Some(reply) => Some(reply.clone()),
                None => state.queue.pop_front(),
            }
        };

        match reply {
            Some(FakeReply::Status {
                status,
                headers,
                body,
            }) => Ok(HttpResponse::from_bytes(status, headers, body)),
            Some(FakeReply::Error(kind)) => Err(TransportError::new(kind, "scripted failure")),
            Some(FakeReply::Hang) => futures::future::pending().await,
            None => Err(TransportError::new(
                TransportErrorKind::Invalid,
                "no scripted reply left",
            )),
        }
    }
}
