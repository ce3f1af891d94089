//! Request executor.
//!
//! Sends one logical request (possibly several attempts) and resolves every
//! per-request failure into a [`RequestOutcome`]. Only conditions that make
//! it impossible to send anything at all surface as [`FatalError`], and
//! [`HttpExecutor::new`] checks those before the first request goes out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::{self, Duration, Instant};
use tracing::debug;

use crate::errors::{categorize_status_code, ErrorKind, FatalError};
use crate::extractor::TokenExtractor;
use crate::metrics::{
    ATTEMPTS_TOTAL, CONCURRENT_REQUESTS, REQUEST_DURATION_SECONDS, REQUEST_FAILURES,
    REQUEST_STATUS_CODES, REQUEST_TOTAL, TOKENS_TOTAL,
};
use crate::template::{build_request, ApiProfile, TemplateError, TemplateVars};

/// Normalized result of one logical request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    /// Endpoint name within the API profile
    pub endpoint: String,

    /// Position of the request within its level (0-based, issue order)
    pub request_index: usize,

    pub issued_at: DateTime<Utc>,

    /// Duration of the final attempt, from send to last body byte or failure
    pub latency: Duration,

    /// Total time across all attempts and backoff delays
    pub elapsed: Duration,

    /// HTTP status of the final attempt, if a response arrived
    pub status: Option<u16>,

    pub error_kind: Option<ErrorKind>,

    pub error_message: Option<String>,

    /// 1-based attempt number of the final attempt
    pub attempt: u32,

    pub token_count: Option<u64>,

    pub success: bool,
}

impl RequestOutcome {
    /// A first-attempt success.
    pub fn succeeded(
        endpoint: &str,
        request_index: usize,
        latency: Duration,
        token_count: Option<u64>,
    ) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            request_index,
            issued_at: Utc::now(),
            latency,
            elapsed: latency,
            status: Some(200),
            error_kind: None,
            error_message: None,
            attempt: 1,
            token_count,
            success: true,
        }
    }

    /// A failure whose final attempt was `attempt`.
    pub fn failed(
        endpoint: &str,
        request_index: usize,
        latency: Duration,
        kind: ErrorKind,
        attempt: u32,
    ) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            request_index,
            issued_at: Utc::now(),
            latency,
            elapsed: latency,
            status: None,
            error_kind: Some(kind),
            error_message: Some(kind.description().to_string()),
            attempt,
            token_count: None,
            success: false,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Bounded retry policy with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after failed attempt `attempt` (1-based):
    /// `min(initial * 2^(attempt-1), max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Upper bound on the total time one outcome may take.
    pub fn outcome_budget(&self, timeout: Duration) -> Duration {
        timeout.saturating_mul(self.max_retries.saturating_add(2))
    }

    /// Backoff after failed attempt `attempt`, shortened so every remaining
    /// attempt still gets a full `timeout` within `remaining`.
    pub fn clamped_delay(&self, attempt: u32, timeout: Duration, remaining: Duration) -> Duration {
        let attempts_left = self.max_attempts().saturating_sub(attempt);
        let reserved = timeout.saturating_mul(attempts_left);
        self.delay_for(attempt).min(remaining.saturating_sub(reserved))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Issues requests for the level runner.
///
/// Implementations absorb every per-request failure into the returned
/// outcome. `Err` is reserved for conditions that make the whole level
/// meaningless.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(
        &self,
        request_index: usize,
        prompt: &str,
    ) -> Result<RequestOutcome, FatalError>;
}

/// Keeps the in-flight gauge accurate even when an attempt is cancelled.
struct InFlightGuard;

impl InFlightGuard {
    fn new() -> Self {
        CONCURRENT_REQUESTS.inc();
        InFlightGuard
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        CONCURRENT_REQUESTS.dec();
    }
}

struct Attempt {
    latency: Duration,
    status: Option<u16>,
    error: Option<(ErrorKind, String)>,
    token_count: Option<u64>,
}

/// [`RequestExecutor`] that talks HTTP to one endpoint of an API profile.
pub struct HttpExecutor {
    client: reqwest::Client,
    profile: Arc<ApiProfile>,
    endpoint: String,
    vars: TemplateVars,
    method: Method,
    url: String,
    headers: HeaderMap,
    extractor: TokenExtractor,
    timeout: Duration,
    retry: RetryPolicy,
}

impl HttpExecutor {
    /// Build an executor, resolving URL and headers once.
    ///
    /// Fails when the profile cannot produce a request at all: unknown
    /// endpoint, unresolved placeholder, invalid header, bad token rule.
    pub fn new(
        client: reqwest::Client,
        profile: Arc<ApiProfile>,
        endpoint: &str,
        vars: TemplateVars,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, FatalError> {
        let prepared = build_request(&profile, endpoint, "", &vars)?;

        let method = Method::from_bytes(prepared.method.as_bytes())
            .map_err(|e| FatalError::ClientBuild(format!("invalid HTTP method: {}", e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &prepared.headers {
            let header_name =
                HeaderName::from_str(name).map_err(|e| TemplateError::InvalidHeader {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
            let header_value =
                HeaderValue::from_str(value).map_err(|e| TemplateError::InvalidHeader {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
            headers.insert(header_name, header_value);
        }

        let extractor = TokenExtractor::new(&profile.token_usage)?;

        debug!(
            api = %profile.name,
            endpoint = endpoint,
            url = %prepared.url,
            method = %method,
            "Request executor ready"
        );

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            vars,
            method,
            url: prepared.url,
            headers,
            extractor,
            timeout,
            retry,
            profile,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn attempt(&self, prompt: &str, timeout: Duration) -> Attempt {
        let _in_flight = InFlightGuard::new();
        ATTEMPTS_TOTAL.inc();

        let mut builder = self
            .client
            .request(self.method.clone(), &self.url)
            .headers(self.headers.clone())
            .timeout(timeout);
        let body = self.profile.format_body(prompt, &self.vars);
        if !body.is_null() {
            builder = builder.json(&body);
        }

        let start = Instant::now();
        let result = match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                REQUEST_STATUS_CODES
                    .with_label_values(&[status_code_label(status)])
                    .inc();

                if let Some(kind) =
                    ErrorKind::from_status_code(status, &self.profile.retryable_statuses)
                {
                    // Drain so the connection can return to the pool.
                    let _ = response.bytes().await;
                    Attempt {
                        latency: start.elapsed(),
                        status: Some(status),
                        error: Some((
                            kind,
                            format!("HTTP {} {}", status, categorize_status_code(status)),
                        )),
                        token_count: None,
                    }
                } else {
                    match response.bytes().await {
                        Ok(body) => {
                            let latency = start.elapsed();
                            match self.extractor.extract(&body) {
                                Ok(token_count) => Attempt {
                                    latency,
                                    status: Some(status),
                                    error: None,
                                    token_count,
                                },
                                Err(e) => Attempt {
                                    latency,
                                    status: Some(status),
                                    error: Some((ErrorKind::MalformedResponse, e.to_string())),
                                    token_count: None,
                                },
                            }
                        }
                        Err(e) => Attempt {
                            latency: start.elapsed(),
                            status: Some(status),
                            error: Some((ErrorKind::from_reqwest_error(&e), e.to_string())),
                            token_count: None,
                        },
                    }
                }
            }
            Err(e) => {
                REQUEST_STATUS_CODES.with_label_values(&["error"]).inc();
                Attempt {
                    latency: start.elapsed(),
                    status: None,
                    error: Some((ErrorKind::from_reqwest_error(&e), e.to_string())),
                    token_count: None,
                }
            }
        };

        REQUEST_DURATION_SECONDS.observe(result.latency.as_secs_f64());
        result
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(
        &self,
        request_index: usize,
        prompt: &str,
    ) -> Result<RequestOutcome, FatalError> {
        let issued_at = Utc::now();
        let started = Instant::now();
        let deadline = started + self.retry.outcome_budget(self.timeout);
        let max_attempts = self.retry.max_attempts();
        let mut attempt_no = 0;

        let (last, attempt_no) = loop {
            attempt_no += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = self.attempt(prompt, self.timeout.min(remaining)).await;

            let kind = match result.error.as_ref().map(|(kind, _)| *kind) {
                None => break (result, attempt_no),
                Some(kind) => kind,
            };

            if !kind.is_retryable() || attempt_no >= max_attempts {
                break (result, attempt_no);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let delay = self.retry.clamped_delay(attempt_no, self.timeout, remaining);

            debug!(
                request_index = request_index,
                attempt = attempt_no,
                error_kind = kind.label(),
                delay_ms = delay.as_millis() as u64,
                "Retrying request"
            );
            time::sleep(delay).await;
        };

        let (error_kind, error_message) = match last.error {
            Some((kind, message)) => (Some(kind), Some(message)),
            None => (None, None),
        };

        REQUEST_TOTAL.inc();
        match error_kind {
            Some(kind) => {
                REQUEST_FAILURES.with_label_values(&[kind.label()]).inc();
                debug!(
                    request_index = request_index,
                    attempt = attempt_no,
                    error_kind = kind.label(),
                    status = ?last.status,
                    "Request failed"
                );
            }
            None => {
                if let Some(tokens) = last.token_count {
                    TOKENS_TOTAL.inc_by(tokens);
                }
            }
        }

        Ok(RequestOutcome {
            endpoint: self.endpoint.clone(),
            request_index,
            issued_at,
            latency: last.latency,
            elapsed: started.elapsed(),
            status: last.status,
            success: error_kind.is_none(),
            error_kind,
            error_message,
            attempt: attempt_no,
            token_count: last.token_count,
        })
    }
}

/// Returns a static string label for common HTTP status codes.
fn status_code_label(code: u16) -> &'static str {
    match code {
        200 => "200",
        201 => "201",
        204 => "204",
        400 => "400",
        401 => "401",
        403 => "403",
        404 => "404",
        408 => "408",
        413 => "413",
        422 => "422",
        429 => "429",
        500 => "500",
        502 => "502",
        503 => "503",
        504 => "504",
        529 => "529",
        _ => "other",
    }
}
