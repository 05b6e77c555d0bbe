//! A single database endpoint and its backoff state.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::Url;

use crate::backoff::BackoffStrategy;

/// Per-host request overrides.
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    /// Headers added to every request sent to this host.
    pub headers: HeaderMap,
    /// Overrides the pool's request timeout for this host.
    pub timeout: Option<Duration>,
}

/// One endpoint the pool can route requests to.
#[derive(Debug)]
pub struct Host {
    url: Url,
    options: HostOptions,
    backoff: Box<dyn BackoffStrategy>,
}

impl Host {
    pub fn new(url: Url, backoff: Box<dyn BackoffStrategy>, options: HostOptions) -> Self {
        Self {
            url,
            options,
            backoff,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    /// Records a failure and returns how long the host should be
    /// quarantined for.
    pub fn fail(&mut self) -> Duration {
        let delay = self.backoff.delay();
        self.backoff = self.backoff.next();
        delay
    }

    /// Records a success, clearing any accumulated backoff.
    pub fn success(&mut self) {
        self.backoff = self.backoff.reset();
    }

    /// Builds the request URL by appending `path` to the host's own path
    /// prefix.
    pub fn compose_url(&self, path: &str) -> Url {
        let mut url = self.url.clone();
        let prefix = self.url.path().trim_end_matches('/');
        let suffix = path.trim_start_matches('/');
        url.set_path(&format!("{prefix}/{suffix}"));
        url
    }
}
