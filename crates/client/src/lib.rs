//! HTTP fetch client with exponential-backoff retry (§4.1, C1).
//!
//! The "last cause" tracking the original Python implementation does via
//! `aiohttp` trace hooks keyed by URL
//! (`examples/original_source/src/shared/api_utils.py`) is expressed here as
//! a plain `Arc<AtomicU32>` attempt counter shared between the retried
//! operation and its `notify` callback — each `FetchClient::fetch_*` call
//! owns its own counter, so there is no shared map to key by URL. A sibling
//! `Arc<AtomicBool>` carries whether the last network-level failure was a
//! connect/DNS failure, the one network-level kind this client retries
//! (§4.1) — everything else (timeouts mid-read, TLS errors, decode errors)
//! is surfaced as `NotifierError::Network` but is not retried.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::future::retry_notify;
use backoff::ExponentialBackoff;
use marketwatch_core::NotifierError;
use tracing::warn;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/116.0.0.0 Safari/537.36";

/// Status codes retried by default on the main query fetch.
pub const DEFAULT_RETRY_STATUSES: &[u16] = &[500, 502, 503, 504];

/// Enrichment additionally retries 404 — items may briefly 404 due to CDN
/// propagation lag (§4.5).
pub const ENRICH_RETRY_STATUSES: &[u16] = &[404, 500, 502, 503, 504];

#[derive(Debug, Clone)]
pub struct FetchClient {
    http: reqwest::Client,
    user_agent: String,
    attempts: u32,
    start_timeout: Duration,
    max_body_bytes: usize,
}

impl FetchClient {
    pub fn new(user_agent: Option<String>, attempts: u32, start_timeout_seconds: f64) -> anyhow::Result<Self> {
        Self::with_max_body_bytes(user_agent, attempts, start_timeout_seconds, 10 * 1024 * 1024)
    }

    pub fn with_max_body_bytes(
        user_agent: Option<String>,
        attempts: u32,
        start_timeout_seconds: f64,
        max_body_bytes: usize,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            user_agent: user_agent.unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            attempts: attempts.max(1),
            start_timeout: Duration::from_secs_f64(start_timeout_seconds.max(0.001)),
            max_body_bytes,
        })
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.start_timeout,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// GET `url`, returning the body as text. Empty string on 204 (§4.1).
    pub async fn fetch_text(&self, url: &str, retry_statuses: &[u16]) -> Result<String, NotifierError> {
        let attempt = Arc::new(AtomicU32::new(0));
        let network_retryable = Arc::new(AtomicBool::new(false));
        let backoff = self.backoff();
        let retry_statuses = retry_statuses.to_vec();

        let notify = {
            let attempt = Arc::clone(&attempt);
            let attempts_total = self.attempts;
            let url = url.to_string();
            move |err: NotifierError, _dur: Duration| {
                warn!(
                    attempt = attempt.load(Ordering::SeqCst),
                    total = attempts_total,
                    url = %url,
                    cause = %err,
                    "retrying request"
                );
            }
        };

        let attempts_budget = self.attempts;
        retry_notify(
            backoff,
            || async {
                let raw = self.attempt_once(url, &attempt, &network_retryable).await;
                let exhausted = attempt.load(Ordering::SeqCst) >= attempts_budget;
                op_with_retry_gate(raw, &retry_statuses, exhausted, network_retryable.load(Ordering::SeqCst))
            },
            notify,
        )
        .await
    }

    /// GET `url`, returning parsed JSON. `null` on 204 (§4.1).
    pub async fn fetch_json(&self, url: &str, retry_statuses: &[u16]) -> Result<serde_json::Value, NotifierError> {
        let body = self.fetch_text(url, retry_statuses).await?;
        if body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| NotifierError::Parse(e.to_string()))
    }

    async fn attempt_once(
        &self,
        url: &str,
        attempt: &Arc<AtomicU32>,
        network_retryable: &Arc<AtomicBool>,
    ) -> Result<RawResponse, NotifierError> {
        attempt.fetch_add(1, Ordering::SeqCst);
        let resp = self
            .http
            .get(url)
            .header("user-agent", &self.user_agent)
            .send()
            .await
            .map_err(|e| map_network_error(e, network_retryable))?;

        let status = resp.status().as_u16();
        if status == 204 {
            return Ok(RawResponse { status, body: String::new() });
        }
        if status == 200 {
            if let Some(len) = resp.content_length() {
                if len as usize > self.max_body_bytes {
                    return Err(NotifierError::Parse(format!(
                        "response body of {len} bytes exceeds max_body_bytes ({})",
                        self.max_body_bytes
                    )));
                }
            }
            let body = resp
                .text()
                .await
                .map_err(|e| map_network_error(e, network_retryable))?;
            if body.len() > self.max_body_bytes {
                return Err(NotifierError::Parse(format!(
                    "response body of {} bytes exceeds max_body_bytes ({})",
                    body.len(),
                    self.max_body_bytes
                )));
            }
            return Ok(RawResponse { status, body });
        }
        Err(NotifierError::ResponseStatus { status })
    }
}

/// Maps a `reqwest::Error` to `NotifierError::Network` and records whether it
/// is a connect/DNS failure — the only network-level kind this client
/// retries (§4.1, matching `reqwest::Error::is_connect`).
fn map_network_error(e: reqwest::Error, network_retryable: &Arc<AtomicBool>) -> NotifierError {
    network_retryable.store(e.is_connect(), Ordering::SeqCst);
    NotifierError::Network(e.to_string())
}

struct RawResponse {
    status: u16,
    body: String,
}

/// Bridges our attempt-counted retry gate into `backoff`'s transient/permanent
/// distinction: retry only while under the attempts budget and the failure
/// kind is in the caller's retry set. A `Network` error is retryable only
/// when it was a connect/DNS failure (`network_retryable`, set from
/// `reqwest::Error::is_connect` in `map_network_error`) — DNS resolution
/// failure is the retryable network kind named in §4.1, not every
/// network-level error (a read timeout or TLS failure is not retried).
fn op_with_retry_gate(
    result: Result<RawResponse, NotifierError>,
    retry_statuses: &[u16],
    attempts_exhausted: bool,
    network_retryable: bool,
) -> Result<String, backoff::Error<NotifierError>> {
    match result {
        Ok(raw) => Ok(raw.body),
        Err(err) => {
            let retryable = !attempts_exhausted
                && match &err {
                    NotifierError::Network(_) => network_retryable,
                    NotifierError::ResponseStatus { status } => retry_statuses.contains(status),
                    _ => false,
                };
            if retryable {
                Err(backoff::Error::transient(err))
            } else {
                Err(backoff::Error::permanent(err))
            }
        }
    }
}
