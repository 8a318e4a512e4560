//! Outbound HTTP with egress rotation, request throttling and retry/backoff.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressRoute {
    Direct,
    Proxy(String),
}

impl fmt::Display for EgressRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EgressRoute::Direct => f.write_str("direct"),
            EgressRoute::Proxy(url) => write!(f, "proxy:{url}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },
    #[error("rate limited fetching {url}")]
    RateLimited { url: String },
    #[error("blocked with status {status} fetching {url}")]
    Blocked { status: u16, url: String },
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Network {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }

    fn from_status(url: &str, status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited {
                url: url.to_string(),
            },
            StatusCode::FORBIDDEN => FetchError::Blocked {
                status: status.as_u16(),
                url: url.to_string(),
            },
            _ => FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            },
        }
    }
}

/// Errors the retry policy is allowed to retry.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network { .. }
            | FetchError::RateLimited { .. }
            | FetchError::Blocked { .. }
            | FetchError::Timeout { .. } => true,
            FetchError::HttpStatus { status, .. } => *status >= 500,
        }
    }
}

/// Shared retry policy: multiplicative backoff, capped, with symmetric jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random, e.g. `0.1` for +/-10%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2000),
            backoff_factor: 1.5,
            max_delay: Duration::from_millis(10_000),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt_index.min(64) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 {
            return delay;
        }
        let offset = rand::rng().random_range(-spread..=spread);
        delay.mul_f64(1.0 + offset)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. `op` receives the zero-based attempt index.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let mut attempt = 0usize;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self.jittered_delay(attempt);
                    warn!(
                        label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Enforces a minimum spacing between consecutive requests.
#[derive(Debug)]
pub struct RequestThrottle {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub proxy_pool: Vec<String>,
    pub retry: RetryPolicy,
    pub min_request_interval: Option<Duration>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            proxy_pool: Vec::new(),
            retry: RetryPolicy::default(),
            min_request_interval: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub route: EgressRoute,
    pub body: Vec<u8>,
}

#[derive(Debug)]
struct EgressSlot {
    route: EgressRoute,
    client: reqwest::Client,
}

/// Outbound requester. Knows nothing about products.
#[derive(Debug)]
pub struct Fetcher {
    slots: Vec<EgressSlot>,
    cursor: AtomicUsize,
    throttle: Option<RequestThrottle>,
    retry: RetryPolicy,
}

impl Fetcher {
    /// One client per configured proxy plus a direct route. Proxies that fail
    /// to parse are skipped.
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut slots = Vec::with_capacity(config.proxy_pool.len() + 1);
        for proxy_url in config.proxy_pool.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            let proxy = match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => proxy,
                Err(err) => {
                    warn!(proxy = proxy_url, error = %err, "skipping invalid proxy route");
                    continue;
                }
            };
            let client = client_builder(&config)
                .proxy(proxy)
                .build()
                .with_context(|| format!("building client for proxy {proxy_url}"))?;
            slots.push(EgressSlot {
                route: EgressRoute::Proxy(proxy_url.to_string()),
                client,
            });
        }

        let direct = client_builder(&config)
            .no_proxy()
            .build()
            .context("building direct client")?;
        slots.push(EgressSlot {
            route: EgressRoute::Direct,
            client: direct,
        });

        Ok(Self {
            slots,
            cursor: AtomicUsize::new(0),
            throttle: config.min_request_interval.map(RequestThrottle::new),
            retry: config.retry,
        })
    }

    pub fn routes(&self) -> Vec<EgressRoute> {
        self.slots.iter().map(|s| s.route.clone()).collect()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Advances the round-robin pointer and returns the selected route.
    pub fn next_route(&self) -> &EgressRoute {
        &self.next_slot().route
    }

    fn next_slot(&self) -> &EgressSlot {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        &self.slots[idx]
    }

    pub async fn fetch(&self, source: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source, url);
        async {
            if let Some(throttle) = &self.throttle {
                throttle.wait().await;
            }
            self.retry
                .run(url, |attempt| {
                    let slot = self.next_slot();
                    debug!(attempt, route = %slot.route, "sending request");
                    send_once(slot, url)
                })
                .await
        }
        .instrument(span)
        .await
    }
}

fn client_builder(config: &FetcherConfig) -> reqwest::ClientBuilder {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder
}

async fn send_once(slot: &EgressSlot, url: &str) -> Result<FetchedResponse, FetchError> {
    let resp = slot
        .client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(url, e))?;
    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::from_status(&final_url, status));
    }
    let body = resp
        .bytes()
        .await
        .map_err(|e| FetchError::from_reqwest(url, e))?
        .to_vec();
    Ok(FetchedResponse {
        status,
        final_url,
        route: slot.route.clone(),
        body,
    })
}
