//! Connection pool with host failover.
//!
//! Requests are spread round-robin over the available hosts. A retryable
//! failure (transport error or 5xx) quarantines the host for the delay its
//! backoff hands out and the request moves on to the next host, up to
//! `max_retries` extra attempts. A timer puts the host back afterwards.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolOptions;
use crate::error::{Error, Result};
use crate::host::{Host, HostOptions};
use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};

/// A request before a host has been chosen for it.
#[derive(Debug, Clone)]
pub struct PoolRequest {
    pub method: Method,
    /// Appended to the host's path prefix.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

impl PoolRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Outcome of pinging one host.
#[derive(Debug, Clone, PartialEq)]
pub struct PingStatus {
    pub url: Url,
    pub online: bool,
    /// `None` when no response arrived.
    pub rtt: Option<Duration>,
    /// `X-Influxdb-Version` header, empty when absent.
    pub version: String,
}

struct PoolState {
    hosts: Vec<Host>,
    /// Indices into `hosts`.
    available: Vec<usize>,
    disabled: Vec<usize>,
    /// Always `< available.len()` while `available` is non-empty.
    cursor: usize,
}

impl PoolState {
    fn urls(&self, ids: &[usize]) -> Vec<Url> {
        ids.iter().map(|&id| self.hosts[id].url().clone()).collect()
    }
}

/// Load-balancing, self-healing set of database hosts.
pub struct Pool {
    state: Arc<Mutex<PoolState>>,
    transport: Arc<dyn Transport>,
    options: PoolOptions,
}

impl Pool {
    pub fn new(options: PoolOptions, transport: Arc<dyn Transport>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                hosts: Vec::new(),
                available: Vec::new(),
                disabled: Vec::new(),
                cursor: 0,
            })),
            transport,
            options,
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Registers a host as available.
    pub fn add_host(&self, url: Url, options: HostOptions) {
        let host = Host::new(url, self.options.backoff.reset(), options);
        let mut state = lock(&self.state);
        let id = state.hosts.len();
        state.hosts.push(host);
        state.available.push(id);
    }

    pub fn hosts_available(&self) -> Vec<Url> {
        let state = lock(&self.state);
        state.urls(&state.available)
    }

    pub fn hosts_disabled(&self) -> Vec<Url> {
        let state = lock(&self.state);
        state.urls(&state.disabled)
    }

    pub fn host_is_available(&self) -> bool {
        !lock(&self.state).available.is_empty()
    }

    /// Sends `request`, failing over between hosts, and returns the live
    /// response of the first 2xx answer.
    pub async fn stream(&self, request: &PoolRequest) -> Result<HttpResponse> {
        let mut retries = 0;
        loop {
            let (id, http) = self.select(request).ok_or(Error::NoHostAvailable)?;
            let url = http.url.clone();
            let timeout = http.timeout;
            debug!(host = %url, method = %http.method, retries, "sending request");

            let err = match tokio::time::timeout(timeout, self.transport.send(http)).await {
                Err(_) => Error::Transport(TransportError::timeout(timeout)),
                Ok(Err(e)) => Error::Transport(e),
                Ok(Ok(resp)) if resp.status >= 500 => Error::ServiceUnavailable {
                    status: resp.status,
                    message: reason(resp.status),
                },
                Ok(Ok(resp)) if resp.status >= 300 => {
                    let status = resp.status;
                    let body = resp.text().await?;
                    return Err(Error::Request { status, body });
                }
                Ok(Ok(resp)) => {
                    self.mark_success(id);
                    return Ok(resp);
                }
            };

            if !err.is_retryable() {
                return Err(err);
            }
            self.disable_host(id, &err);
            if retries < self.options.max_retries && self.host_is_available() {
                retries += 1;
                continue;
            }
            return Err(err);
        }
    }

    /// Sends `request` and deserializes the JSON body.
    pub async fn json<T: DeserializeOwned>(&self, request: &PoolRequest) -> Result<T> {
        let bytes = self.stream(request).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn text(&self, request: &PoolRequest) -> Result<String> {
        Ok(self.stream(request).await?.text().await?)
    }

    /// Sends `request` and drains the body.
    pub async fn discard(&self, request: &PoolRequest) -> Result<()> {
        self.stream(request).await?.bytes().await?;
        Ok(())
    }

    /// Pings every host, disabled ones included, each with its own
    /// `timeout`. Never fails; unreachable hosts come back offline.
    pub async fn ping(&self, timeout: Duration) -> Vec<PingStatus> {
        self.ping_path(timeout, "/ping").await
    }

    pub async fn ping_path(&self, timeout: Duration, path: &str) -> Vec<PingStatus> {
        let targets: Vec<(Url, HttpRequest)> = {
            let state = lock(&self.state);
            state
                .hosts
                .iter()
                .map(|host| {
                    let request = HttpRequest {
                        method: Method::GET,
                        url: host.compose_url(path),
                        query: Vec::new(),
                        headers: host.options().headers.clone(),
                        body: None,
                        timeout,
                    };
                    (host.url().clone(), request)
                })
                .collect()
        };

        let checks = targets.into_iter().map(|(url, request)| {
            let transport = Arc::clone(&self.transport);
            async move {
                let start = Instant::now();
                match tokio::time::timeout(timeout, transport.send(request)).await {
                    Ok(Ok(resp)) => PingStatus {
                        url,
                        online: resp.status < 300,
                        rtt: Some(start.elapsed()),
                        version: resp.header("x-influxdb-version").unwrap_or_default().to_string(),
                    },
                    Ok(Err(e)) => {
                        debug!(host = %url, error = %e, "ping failed");
                        PingStatus::offline(url)
                    }
                    Err(_) => {
                        debug!(host = %url, "ping timed out");
                        PingStatus::offline(url)
                    }
                }
            }
        });
        join_all(checks).await
    }

    /// Picks the next available host and resolves `request` against it.
    fn select(&self, request: &PoolRequest) -> Option<(usize, HttpRequest)> {
        let mut state = lock(&self.state);
        if state.available.is_empty() {
            return None;
        }
        let id = state.available[state.cursor];
        state.cursor = (state.cursor + 1) % state.available.len();

        let host = &state.hosts[id];
        let mut headers = host.options().headers.clone();
        headers.extend(request.headers.clone());
        Some((
            id,
            HttpRequest {
                method: request.method.clone(),
                url: host.compose_url(&request.path),
                query: request.query.clone(),
                headers,
                body: request.body.clone(),
                timeout: host.options().timeout.unwrap_or(self.options.request_timeout),
            },
        ))
    }

    fn mark_success(&self, id: usize) {
        let mut state = lock(&self.state);
        if let Some(host) = state.hosts.get_mut(id) {
            host.success();
        }
    }

    /// Quarantines host `id` and schedules its return. Hosts that are
    /// already disabled are left alone.
    fn disable_host(&self, id: usize, cause: &Error) {
        let (url, delay) = {
            let mut state = lock(&self.state);
            let Some(pos) = state.available.iter().position(|&h| h == id) else {
                return;
            };
            let delay = state.hosts[id].fail();
            if delay.is_zero() {
                return;
            }
            state.available.remove(pos);
            state.disabled.push(id);
            let len = state.available.len().max(1);
            state.cursor %= len;
            (state.hosts[id].url().clone(), delay)
        };

        warn!(host = %url, delay_ms = delay.as_millis() as u64, error = %cause, "host disabled");

        let weak = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            enable_host(&weak, id);
        });
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Pool")
            .field("available", &state.urls(&state.available))
            .field("disabled", &state.urls(&state.disabled))
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl PingStatus {
    fn offline(url: Url) -> Self {
        Self {
            url,
            online: false,
            rtt: None,
            version: String::new(),
        }
    }
}

fn enable_host(state: &Weak<Mutex<PoolState>>, id: usize) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut state = lock(&state);
    if let Some(pos) = state.disabled.iter().position(|&h| h == id) {
        state.disabled.remove(pos);
        state.available.push(id);
        info!(host = %state.hosts[id].url(), "host re-enabled");
    }
}

fn lock(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reason(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("server error")
        .to_string()
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{ExponentialBackoff, ExponentialOptions};
    use crate::transport::{FakeReply, FakeTransport, TransportErrorKind};
    use reqwest::header::{HeaderName, HeaderValue};

    fn options() -> PoolOptions {
        PoolOptions {
            backoff: Arc::new(ExponentialBackoff::new(ExponentialOptions {
                initial: Duration::from_millis(300),
                max: Duration::from_secs(10),
                jitter: 0.0,
            })),
            ..PoolOptions::default()
        }
    }

    fn pool(fake: &FakeTransport, hosts: &[&str]) -> Pool {
        pool_with(fake, hosts, options())
    }

    fn pool_with(fake: &FakeTransport, hosts: &[&str], options: PoolOptions) -> Pool {
        let pool = Pool::new(options, Arc::new(fake.clone()));
        for h in hosts {
            pool.add_host(Url::parse(&format!("http://{h}")).unwrap(), HostOptions::default());
        }
        pool
    }

    fn authorities(urls: Vec<Url>) -> Vec<String> {
        urls.iter()
            .map(|u| format!("{}:{}", u.host_str().unwrap(), u.port().unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn fails_over_after_5xx_and_disables_host() {
        let fake = FakeTransport::new();
        fake.push(FakeReply::status(502)).push(FakeReply::body(200, "ok"));
        let pool = pool(&fake, &["a:8086", "b:8086"]);

        let body = pool.text(&PoolRequest::get("/query")).await.unwrap();
        assert_eq!(body, "ok");
        assert_eq!(fake.called_hosts(), vec!["a:8086", "b:8086"]);
        assert_eq!(authorities(pool.hosts_disabled()), vec!["a:8086"]);
        assert_eq!(authorities(pool.hosts_available()), vec!["b:8086"]);
    }

    #[tokio::test]
    async fn zero_backoff_fails_over_without_quarantine() {
        let fake = FakeTransport::new();
        fake.route("a:8086", FakeReply::status(503));
        fake.route("b:8086", FakeReply::body(200, "ok"));
        let pool = pool_with(
            &fake,
            &["a:8086", "b:8086"],
            PoolOptions {
                backoff: Arc::new(ExponentialBackoff::new(ExponentialOptions {
                    initial: Duration::ZERO,
                    max: Duration::from_secs(10),
                    jitter: 0.0,
                })),
                ..PoolOptions::default()
            },
        );

        let body = pool.text(&PoolRequest::get("/query")).await.unwrap();
        assert_eq!(body, "ok");
        assert_eq!(fake.called_hosts(), vec!["a:8086", "b:8086"]);
        assert!(pool.hosts_disabled().is_empty());
        assert_eq!(authorities(pool.hosts_available()), vec!["a:8086", "b:8086"]);
        assert!(pool.host_is_available());
    }

    #[tokio::test]
    async fn no_available_host_fails_without_network_call() {
        let fake = FakeTransport::new();
        fake.route("a:8086", FakeReply::status(503));
        let pool = pool(&fake, &["a:8086"]);

        let first = pool.discard(&PoolRequest::get("/ping")).await.unwrap_err();
        assert!(matches!(first, Error::ServiceUnavailable { status: 503, .. }));
        assert!(!pool.host_is_available());

        let second = pool.discard(&PoolRequest::get("/ping")).await.unwrap_err();
        assert!(matches!(second, Error::NoHostAvailable));
        assert_eq!(fake.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_host_returns_after_its_delay() {
        let fake = FakeTransport::new();
        fake.push(FakeReply::status(500));
        let pool = pool(&fake, &["a:8086"]);

        pool.discard(&PoolRequest::get("/query")).await.unwrap_err();
        assert!(!pool.host_is_available());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!pool.host_is_available());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(pool.host_is_available());
        assert!(pool.hosts_disabled().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_retried_on_next_host() {
        let fake = FakeTransport::new();
        fake.route("a:8086", FakeReply::Hang);
        fake.route("b:8086", FakeReply::status(204));
        let pool = pool_with(
            &fake,
            &["a:8086", "b:8086"],
            PoolOptions {
                request_timeout: Duration::from_secs(1),
                ..options()
            },
        );

        let resp = pool.stream(&PoolRequest::get("/ping")).await.unwrap();
        assert_eq!(resp.status, 204);
        assert_eq!(fake.called_hosts(), vec!["a:8086", "b:8086"]);
        assert_eq!(authorities(pool.hosts_disabled()), vec!["a:8086"]);
    }

    #[tokio::test]
    async fn client_errors_are_neither_retried_nor_quarantined() {
        let fake = FakeTransport::new();
        fake.push(FakeReply::body(400, "error parsing query"));
        let pool = pool(&fake, &["a:8086", "b:8086"]);

        let err = pool.discard(&PoolRequest::get("/query")).await.unwrap_err();
        match err {
            Error::Request { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "error parsing query");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fake.calls().len(), 1);
        assert!(pool.hosts_disabled().is_empty());
    }

    #[tokio::test]
    async fn invalid_requests_are_not_retried() {
        let fake = FakeTransport::new();
        fake.route("a:8086", FakeReply::Error(TransportErrorKind::Invalid));
        let pool = pool(&fake, &["a:8086", "b:8086"]);

        let err = pool.discard(&PoolRequest::get("/query")).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(fake.calls().len(), 1);
        assert!(pool.hosts_disabled().is_empty());
    }

    #[tokio::test]
    async fn retry_budget_is_shared_across_hosts() {
        let fake = FakeTransport::new();
        for h in ["a:8086", "b:8086", "c:8086"] {
            fake.route(h, FakeReply::status(503));
        }
        let pool = pool_with(
            &fake,
            &["a:8086", "b:8086", "c:8086"],
            PoolOptions {
                max_retries: 1,
                ..options()
            },
        );

        let err = pool.discard(&PoolRequest::get("/query")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(fake.calls().len(), 2);
        assert_eq!(authorities(pool.hosts_available()), vec!["c:8086"]);
    }

    #[tokio::test]
    async fn connection_errors_fail_over() {
        let fake = FakeTransport::new();
        fake.route("a:8086", FakeReply::Error(TransportErrorKind::Connect));
        fake.route("b:8086", FakeReply::body(200, "{}"));
        let pool = pool(&fake, &["a:8086", "b:8086"]);

        let value: serde_json::Value = pool.json(&PoolRequest::get("/query")).await.unwrap();
        assert_eq!(value, serde_json::json!({}));
    }

    #[tokio::test]
    async fn requests_rotate_round_robin() {
        let fake = FakeTransport::new();
        for _ in 0..4 {
            fake.push(FakeReply::status(204));
        }
        let pool = pool(&fake, &["a:8086", "b:8086", "c:8086"]);
        for _ in 0..4 {
            pool.discard(&PoolRequest::get("/ping")).await.unwrap();
        }
        assert_eq!(
            fake.called_hosts(),
            vec!["a:8086", "b:8086", "c:8086", "a:8086"]
        );
    }

    #[tokio::test]
    async fn failure_on_disabled_host_is_ignored() {
        let fake = FakeTransport::new();
        let pool = pool(&fake, &["a:8086", "b:8086"]);
        let cause = Error::ServiceUnavailable {
            status: 503,
            message: "Service Unavailable".into(),
        };

        pool.disable_host(0, &cause);
        pool.disable_host(0, &cause);

        assert_eq!(authorities(pool.hosts_disabled()), vec!["a:8086"]);
        let mut state = lock(&pool.state);
        assert_eq!(state.hosts[0].fail(), Duration::from_millis(600));
    }

    #[tokio::test]
    async fn host_options_shape_the_request() {
        let fake = FakeTransport::new();
        fake.push(FakeReply::status(204));
        let pool = Pool::new(options(), Arc::new(fake.clone()));
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-tenant"),
            HeaderValue::from_static("blue"),
        );
        pool.add_host(
            Url::parse("http://proxy:8080/influx/").unwrap(),
            HostOptions {
                headers,
                timeout: Some(Duration::from_secs(3)),
            },
        );

        pool.discard(&PoolRequest::post("/write").query("db", "metrics").body("m v=1"))
            .await
            .unwrap();

        let call = &fake.calls()[0];
        assert_eq!(call.url.as_str(), "http://proxy:8080/influx/write");
        assert_eq!(call.headers["x-tenant"], "blue");
        assert_eq!(call.timeout, Duration::from_secs(3));
        assert_eq!(call.query_param("db"), Some("metrics"));
        assert_eq!(call.body.as_deref(), Some("m v=1"));
    }

    #[tokio::test(start_paused = true)]
    async fn ping_reports_each_host() {
        let fake = FakeTransport::new();
        fake.route(
            "a:8086",
            FakeReply::status(204).with_header(
                HeaderName::from_static("x-influxdb-version"),
                HeaderValue::from_static("1.8.10"),
            ),
        );
        fake.route("b:8086", FakeReply::Error(TransportErrorKind::Connect));
        fake.route("c:8086", FakeReply::Hang);
        let pool = pool(&fake, &["a:8086", "b:8086", "c:8086"]);

        let statuses = pool.ping(Duration::from_secs(1)).await;
        assert_eq!(statuses.len(), 3);
        assert!(statuses[0].online);
        assert_eq!(statuses[0].version, "1.8.10");
        assert!(statuses[0].rtt.is_some());
        assert!(!statuses[1].online);
        assert!(statuses[1].rtt.is_none());
        assert!(!statuses[2].online);
        assert_eq!(statuses[2].url.as_str(), "http://c:8086/");
    }

    #[tokio::test]
    async fn ping_includes_disabled_hosts() {
        let fake = FakeTransport::new();
        fake.route("a:8086", FakeReply::status(204));
        let pool = pool(&fake, &["a:8086"]);
        let cause = Error::ServiceUnavailable {
            status: 502,
            message: "Bad Gateway".into(),
        };
        pool.disable_host(0, &cause);

        let statuses = pool.ping(Duration::from_secs(1)).await;
        assert!(statuses[0].online);
        assert!(!pool.host_is_available());
    }
}
