//! Fragment fetching.
//!
//! The [`Fetch`] trait is the seam between the composer and wherever
//! fragments come from; [`HttpFetcher`] is the production implementation
//! that issues one HTTP request per slot with `reqwest`.
//!
//! A fetch never outlives its slot's timeout: the whole attempt, retries and
//! backoff included, runs under `tokio::time::timeout`, and a slow upstream
//! yields [`Outcome::Timeout`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::compose::CompositionRequest;
use crate::context::Parameters;
use crate::router::WILDCARD_PARAM;
use crate::error::{ConfigError, FetchError};
use crate::template::Slot;

/// How a slot fetch ended.
#[derive(Debug)]
pub enum Outcome {
    Ok(Bytes),
    Timeout,
    Error(FetchError),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok(body) => write!(f, "ok ({} bytes)", body.len()),
            Outcome::Timeout => f.write_str("timeout"),
            Outcome::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// The result of fetching one slot; lives only as long as its request.
#[derive(Debug)]
pub struct FragmentResult {
    pub slot: String,
    pub outcome: Outcome,
    pub latency: Duration,
}

impl FragmentResult {
    pub fn new(slot: impl Into<String>, outcome: Outcome, latency: Duration) -> Self {
        Self {
            slot: slot.into(),
            outcome,
            latency,
        }
    }
}

/// A source of fragments.
///
/// Implementations must be shareable across tasks; the composer calls
/// `fetch` once per slot, concurrently.
pub trait Fetch: Send + Sync + 'static {
    /// Fetch the fragment for `slot` on behalf of `request`.
    fn fetch<'a>(
        &'a self,
        slot: &'a Slot,
        request: &'a CompositionRequest,
    ) -> Pin<Box<dyn Future<Output = FragmentResult> + Send + 'a>>;
}

/// Upper bound on [`RetryPolicy::max_retries`].
pub const MAX_RETRIES: u32 = 2;

/// Retry schedule for connection-level failures of idempotent fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// # Errors
    ///
    /// [`ConfigError::TooManyRetries`] if `max_retries` exceeds [`MAX_RETRIES`].
    pub fn new(max_retries: u32, base_delay: Duration) -> Result<Self, ConfigError> {
        if max_retries > MAX_RETRIES {
            return Err(ConfigError::TooManyRetries {
                max: MAX_RETRIES,
                got: max_retries,
            });
        }
        Ok(Self {
            max_retries,
            base_delay,
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1 << attempt.min(16))
    }
}

/// Fetches fragments over HTTP.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    /// # Errors
    ///
    /// [`ConfigError::Client`] if the HTTP client cannot be constructed.
    pub fn new(retry: RetryPolicy, connect_timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("tapestry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ConfigError::Client)?;
        Ok(Self { client, retry })
    }

    async fn fetch_with_retries(
        &self,
        slot: &Slot,
        request: &CompositionRequest,
    ) -> Result<Bytes, FetchError> {
        let url = expand_url(slot.url(), &request.params)?;
        let method = reqwest::Method::from_bytes(slot.http_method().as_str().as_bytes())
            .map_err(|_| FetchError::InvalidMethod(slot.http_method().to_string()))?;
        let headers = forwarded_headers(request);
        let may_retry = slot.http_method().is_idempotent();

        let mut attempt = 0;
        loop {
            match self.send(method.clone(), &url, headers.clone()).await {
                Ok(body) => return Ok(body),
                Err(e) if may_retry && e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    debug!(
                        slot = slot.name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying fragment fetch"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: HeaderMap,
    ) -> Result<Bytes, FetchError> {
        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    FetchError::InvalidUrl {
                        url: url.to_owned(),
                        source: e,
                    }
                } else if e.is_connect() {
                    FetchError::Connect(e)
                } else {
                    FetchError::Request(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        response.bytes().await.map_err(FetchError::Body)
    }
}

impl Fetch for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        slot: &'a Slot,
        request: &'a CompositionRequest,
    ) -> Pin<Box<dyn Future<Output = FragmentResult> + Send + 'a>> {
        Box::pin(async move {
            let started = Instant::now();
            let outcome =
                match tokio::time::timeout(slot.fetch_timeout(), self.fetch_with_retries(slot, request))
                    .await
                {
                    Ok(Ok(body)) => Outcome::Ok(body),
                    Ok(Err(e)) => Outcome::Error(e),
                    Err(_) => Outcome::Timeout,
                };
            let latency = started.elapsed();

            match &outcome {
                Outcome::Ok(_) => debug!(
                    slot = slot.name(),
                    latency_ms = latency.as_millis() as u64,
                    "fragment fetched"
                ),
                failed => warn!(
                    slot = slot.name(),
                    latency_ms = latency.as_millis() as u64,
                    outcome = %failed,
                    "fragment fetch failed"
                ),
            }

            FragmentResult::new(slot.name(), outcome, latency)
        })
    }
}

fn forwarded_headers(request: &CompositionRequest) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(request.headers.len());
    for (name, value) in request.headers.iter() {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => debug!(header = name, "skipping header that cannot be forwarded"),
        }
    }
    map
}

/// Substitutes `{name}` placeholders in `template` with percent-encoded
/// values from `params`.
///
/// Values are percent-encoded down to RFC 3986 unreserved characters, so a
/// value stays inside its path segment or query component. The router's
/// `wildcard` capture is the exception: it keeps its `/` separators. Within
/// the path, a value that would form a `.` or `..` segment is refused. A `{`
/// without a matching `}` is copied verbatim.
///
/// # Errors
///
/// - [`FetchError::MissingParam`] if a placeholder has no value.
/// - [`FetchError::UnsafeParam`] if a path value is a dot segment.
///
/// # Examples
///
/// ```
/// use tapestry::context::Parameters;
/// use tapestry::fetch::expand_url;
///
/// let params: Parameters = [("id", "han solo")].into_iter().collect();
/// let url = expand_url("http://chars/{id}/card", &params).unwrap();
/// assert_eq!(url, "http://chars/han%20solo/card");
/// ```
pub fn expand_url(template: &str, params: &Parameters) -> Result<String, FetchError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        let name = &rest[open + 1..open + close];
        out.push_str(&rest[..open]);
        let value = params.get(name).ok_or_else(|| FetchError::MissingParam {
            name: name.to_owned(),
        })?;

        let in_path = !out.contains(['?', '#']);
        let wildcard = name == WILDCARD_PARAM;
        if in_path && has_dot_segment(value, wildcard) {
            return Err(FetchError::UnsafeParam {
                name: name.to_owned(),
            });
        }
        let set = if wildcard { WILDCARD } else { COMPONENT };
        out.extend(utf8_percent_encode(value, set));
        rest = &rest[open + close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Everything but RFC 3986 unreserved characters.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// [`COMPONENT`] minus `/`, for multi-segment wildcard captures.
const WILDCARD: &AsciiSet = &COMPONENT.remove(b'/');

fn has_dot_segment(value: &str, wildcard: bool) -> bool {
    let is_dots = |s: &str| s == "." || s == "..";
    if wildcard {
        value.split('/').any(is_dots)
    } else {
        is_dots(value)
    }
}
