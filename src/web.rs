//! Shared HTTP plumbing: one cookie jar, transient-retry middleware and a
//! per-host token bucket for everything that talks to the web endpoints.

use reqwest::cookie::Jar;
use reqwest::header::{self, HeaderValue};
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use url::Url;

pub(crate) const COMMUNITY_HOST: &str = "https://steamcommunity.com";
pub(crate) const API_HOST: &str = "https://api.steampowered.com";

const USER_AGENT_STRING: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/67.0.3396.99 Safari/537.36";

#[derive(Debug, Error)]
pub enum WebError {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("reqwest middleware error: {0}")]
    Middleware(anyhow::Error),
    #[error("Error {0}")]
    StatusCode(StatusCode),
    #[error("Error parsing response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Not logged in")]
    NotLoggedIn,
    #[error("Response unsuccessful{}", .0.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Unsuccessful(Option<String>),
}

impl From<reqwest_middleware::Error> for WebError {
    fn from(error: reqwest_middleware::Error) -> WebError {
        match error {
            reqwest_middleware::Error::Reqwest(e) => WebError::Reqwest(e),
            reqwest_middleware::Error::Middleware(e) => WebError::Middleware(e),
        }
    }
}

pub type Result<T, E = WebError> = std::result::Result<T, E>;

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new() -> Self {
        TokenBucket {
            capacity: 10.0,
            tokens: 10.0,
            refill_per_second: 5.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, returning how long to wait if none is available.
    fn take(&mut self) -> Option<Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64(
                (1.0 - self.tokens) / self.refill_per_second,
            ))
        }
    }

    fn throttle(&mut self) {
        self.capacity = (self.capacity / 2.0).max(1.0);
        self.tokens = self.tokens.min(self.capacity);
    }
}

/// Token buckets keyed by host; 429 halves the offending host's bucket.
#[derive(Debug, Default)]
pub(crate) struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub(crate) async fn acquire(&self, host: &str) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                buckets
                    .entry(host.to_string())
                    .or_insert_with(TokenBucket::new)
                    .take()
            };
            match wait {
                None => return,
                Some(wait) => sleep(wait).await,
            }
        }
    }

    pub(crate) async fn throttle(&self, host: &str) {
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(host.to_string())
            .or_insert_with(TokenBucket::new)
            .throttle();
    }
}

/// HTTP client shared by the auth pipeline and the trade and confirmation
/// engines. The cookie jar is the single source of truth for web auth.
#[derive(Clone)]
pub struct WebClient {
    client: ClientWithMiddleware,
    pub(crate) cookies: Arc<Jar>,
    limiter: Arc<RateLimiter>,
    session_id: Arc<RwLock<Option<String>>>,
}

impl Default for WebClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WebClient {
    pub fn new() -> Self {
        let cookies = Arc::new(Jar::default());
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let mut headers = header::HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));

        let client = reqwest::ClientBuilder::new()
            .cookie_provider(Arc::clone(&cookies))
            .default_headers(headers)
            .build()
            .expect("default client configuration is valid");

        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        WebClient {
            client,
            cookies,
            limiter: Arc::new(RateLimiter::default()),
            session_id: Arc::new(RwLock::new(None)),
        }
    }

    /// The `sessionid` cookie minted during auth, required by the community
    /// POST endpoints.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().expect("not poisoned").clone()
    }

    /// Install the community session cookies.
    pub fn set_session(&self, session_id: &str, cookies: &[String]) {
        *self.session_id.write().expect("not poisoned") = Some(session_id.to_string());
        for host in [COMMUNITY_HOST, API_HOST] {
            let url: Url = host.parse().expect("static url");
            self.cookies
                .add_cookie_str(&format!("sessionid={session_id}"), &url);
            for cookie in cookies {
                self.cookies.add_cookie_str(cookie, &url);
            }
        }
    }

    async fn execute(&self, request: reqwest_middleware::RequestBuilder) -> Result<reqwest::Response> {
        let request = request.build().map_err(WebError::from)?;
        let host = request.url().host_str().unwrap_or_default().to_string();
        self.limiter.acquire(&host).await;

        let response = self.client.execute(request.try_clone().ok_or_else(|| {
            WebError::Middleware(anyhow::anyhow!("request body is not cloneable"))
        })?).await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            self.limiter.throttle(&host).await;
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(5));
            warn!(host = host.as_str(), ?retry_after, "rate limited, backing off");
            sleep(retry_after).await;
            return Ok(self.client.execute(request).await?);
        }

        Ok(response)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self.execute(self.client.get(url).query(query)).await?;
        parse_response(response).await
    }

    pub(crate) async fn post_form<T: DeserializeOwned>(
        &self,
        url: &str,
        form: &[(&str, String)],
    ) -> Result<T> {
        let response = self.execute(self.client.post(url).form(form)).await?;
        parse_response(response).await
    }

    /// POST a pre-encoded `application/x-www-form-urlencoded` body; used
    /// where values are raw bytes rather than strings.
    pub(crate) async fn post_raw_form<T: DeserializeOwned>(
        &self,
        url: &str,
        body: String,
    ) -> Result<T> {
        let response = self
            .execute(
                self.client
                    .post(url)
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(body),
            )
            .await?;
        parse_response(response).await
    }

    pub(crate) async fn get_with_headers<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&'static str, &'static str)],
    ) -> Result<T> {
        let mut request = self.client.get(url).query(query);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = self.execute(request).await?;
        parse_response(response).await
    }
}

fn is_login_redirect(location: Option<&HeaderValue>) -> bool {
    location
        .and_then(|location| location.to_str().ok())
        .map(|location| location.contains("/login"))
        .unwrap_or(false)
}

async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    match status.as_u16() {
        300..=399 if is_login_redirect(response.headers().get(header::LOCATION)) => {
            Err(WebError::NotLoggedIn)
        }
        400..=599 => Err(WebError::StatusCode(status)),
        _ => {
            let body = response.text().await?;
            debug!(len = body.len(), "parsing response body");
            Ok(serde_json::from_str(&body)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_throttles() {
        let mut bucket = TokenBucket::new();
        for _ in 0..10 {
            assert!(bucket.take().is_none());
        }
        let wait = bucket.take().expect("bucket exhausted");
        assert!(wait > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new();
        for _ in 0..10 {
            bucket.take();
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        // 5 tokens per second refill
        for _ in 0..5 {
            assert!(bucket.take().is_none());
        }
        assert!(bucket.take().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_halves_capacity() {
        let limiter = RateLimiter::default();
        limiter.acquire("example.com").await;
        limiter.throttle("example.com").await;
        let buckets = limiter.buckets.lock().await;
        assert_eq!(buckets.get("example.com").unwrap().capacity, 5.0);
    }

    #[test]
    fn login_redirect_detection() {
        let value = HeaderValue::from_static("https://steamcommunity.com/login/home/?goto=");
        assert!(is_login_redirect(Some(&value)));
        let value = HeaderValue::from_static("https://steamcommunity.com/market/");
        assert!(!is_login_redirect(Some(&value)));
        assert!(!is_login_redirect(None));
    }
}
