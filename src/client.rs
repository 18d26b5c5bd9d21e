use crate::config::{ModelDetails, ProviderConfig};
use crate::datam::{Completion, CompletionRequest};
use crate::error::CoreError;
use crate::providers::{ProviderAdapter, ResponseParser};

use log::{debug, warn};
use rand::Rng;
use reqwest::blocking::Client;
use reqwest::{header, StatusCode};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Defines the retry strategy for rate-limited API calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Upper bound for any single backoff sleep, hinted or computed.
    pub max_delay_ms: u64,
    pub jitter: Jitter,
}

/// Defines the type of jitter to apply to retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    Full,
    None,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
            jitter: Jitter::Full,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let cap = Duration::from_millis(self.max_delay_ms);
        if let Some(hint) = retry_after {
            return hint.min(cap);
        }
        let mut delay_ms = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        if let Jitter::Full = self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..=delay_ms / 4);
            delay_ms = delay_ms.saturating_add(jitter_ms);
        }
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Blocking wait used between retries. Swapped out in tests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// How a single provider call failed.
#[derive(Debug)]
pub enum CallFailure {
    /// HTTP 429 or a provider rate-limit code; `retry_after` is the server's hint.
    RateLimited { retry_after: Option<Duration> },
    /// Anything else. Never retried.
    Fatal(String),
}

/// Anything that can turn a completion request into a completion.
pub trait CompletionTransport: Send + Sync {
    fn send(&self, request: &CompletionRequest, api_key: &str) -> Result<Completion, CallFailure>;
}

/// Runs `call` until it succeeds, fails fatally, or the policy's attempt ceiling is hit.
///
/// `call` receives the 1-based attempt number. Rate-limit failures sleep through
/// `sleeper` before the next attempt; there is no sleep after the last one.
pub fn call_with_retry<T, F>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut call: F,
) -> Result<T, CoreError>
where
    F: FnMut(u32) -> Result<T, CallFailure>,
{
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 0..max_attempts {
        match call(attempt + 1) {
            Ok(value) => return Ok(value),
            Err(CallFailure::Fatal(message)) => {
                warn!("Provider call failed without retry: {}", message);
                return Err(CoreError::LlmUnavailable(message));
            }
            Err(CallFailure::RateLimited { retry_after }) => {
                warn!(
                    "Rate limit exceeded. Retrying... (Attempt {}/{})",
                    attempt + 1,
                    max_attempts
                );
                if attempt + 1 < max_attempts {
                    sleeper.sleep(policy.delay_for(attempt, retry_after));
                }
            }
        }
    }
    Err(CoreError::LlmRateLimited {
        attempts: max_attempts,
    })
}

/// Reads a `Retry-After` header given in (possibly fractional) seconds.
pub fn parse_retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(header::RETRY_AFTER)?.to_str().ok()?;
    let seconds: f64 = raw.trim().parse().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

/// A blocking HTTP transport bound to one provider and one model's pricing.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    adapter: Arc<dyn ProviderAdapter>,
    parser: Arc<dyn ResponseParser>,
    input_price: f32,
    output_price: f32,
}

impl HttpTransport {
    pub fn new(
        base_url: String,
        adapter: Arc<dyn ProviderAdapter>,
        parser: Arc<dyn ResponseParser>,
        details: &ModelDetails,
    ) -> Result<Self, CoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url,
            adapter,
            parser,
            input_price: details.input_price,
            output_price: details.output_price,
        })
    }

    pub fn for_provider(
        provider_name: &str,
        provider: &ProviderConfig,
        details: &ModelDetails,
    ) -> Result<Self, CoreError> {
        let (adapter, parser) = crate::providers::resolve_provider(provider_name);
        let base_url = crate::config::get_env_var(&provider.base_url)?;
        Self::new(base_url, adapter, parser, details)
    }

    pub fn adapter(&self) -> &dyn ProviderAdapter {
        self.adapter.as_ref()
    }

    fn post_json(
        &self,
        url: &str,
        api_key: &str,
        body: &JsonValue,
    ) -> Result<String, CallFailure> {
        let headers = self
            .adapter
            .get_request_headers(api_key)
            .map_err(|e| CallFailure::Fatal(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(body)
            .send()
            .map_err(|e| CallFailure::Fatal(format!("Request error: {}", e)))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response
            .text()
            .map_err(|e| CallFailure::Fatal(format!("Request error: {}", e)))?;

        if status.is_success() {
            return Ok(text);
        }
        if status == StatusCode::TOO_MANY_REQUESTS || self.adapter.is_rate_limit_body(&text) {
            return Err(CallFailure::RateLimited { retry_after });
        }
        Err(CallFailure::Fatal(format!(
            "API error (status {}): {}",
            status.as_u16(),
            text
        )))
    }

    /// Requests embeddings for `texts`. One attempt; callers wrap it in `call_with_retry`.
    pub fn embed(
        &self,
        model_tag: &str,
        texts: &[String],
        api_key: &str,
    ) -> Result<Vec<Vec<f32>>, CallFailure> {
        let url = self.adapter.get_embedding_url(&self.base_url, model_tag);
        let payload = self.adapter.prepare_embedding_request(model_tag, texts);
        let raw = self.post_json(&url, api_key, &payload)?;
        self.parser
            .parse_embedding_response(&raw)
            .map_err(|e| CallFailure::Fatal(e.to_string()))
    }
}

impl CompletionTransport for HttpTransport {
    fn send(&self, request: &CompletionRequest, api_key: &str) -> Result<Completion, CallFailure> {
        let url = self.adapter.get_request_url(&self.base_url, &request.model_tag);
        let payload = self.adapter.prepare_request_payload(request);
        debug!("POST {} (model {})", url, request.model_tag);
        let raw = self.post_json(&url, api_key, &payload)?;
        self.parser
            .parse_response(&raw, self.input_price, self.output_price)
            .map_err(|e| CallFailure::Fatal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper(Mutex<Vec<Duration>>);

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: Jitter::None,
        }
    }

    #[test]
    fn exponential_schedule_is_capped() {
        let policy = no_jitter();
        let delays: Vec<u128> = (0..5).map(|n| policy.delay_for(n, None).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000]);
    }

    #[test]
    fn retry_after_hint_wins_but_respects_the_cap() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(3, Some(Duration::from_millis(250))), Duration::from_millis(250));
        assert_eq!(policy.delay_for(0, Some(Duration::from_secs(60))), Duration::from_secs(1));
    }

    #[test]
    fn jitter_never_exceeds_the_cap() {
        let policy = RetryPolicy {
            jitter: Jitter::Full,
            ..no_jitter()
        };
        for attempt in 0..10 {
            assert!(policy.delay_for(attempt, None) <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn exhaustion_reports_rate_limited_without_trailing_sleep() {
        let sleeper = RecordingSleeper::default();
        let mut calls = 0;
        let result: Result<(), CoreError> = call_with_retry(&no_jitter(), &sleeper, |_| {
            calls += 1;
            Err(CallFailure::RateLimited { retry_after: None })
        });
        assert!(matches!(result, Err(CoreError::LlmRateLimited { attempts: 5 })));
        assert_eq!(calls, 5);
        assert_eq!(sleeper.0.lock().unwrap().len(), 4);
    }

    #[test]
    fn fatal_failure_is_not_retried() {
        let sleeper = RecordingSleeper::default();
        let mut calls = 0;
        let result: Result<(), CoreError> = call_with_retry(&no_jitter(), &sleeper, |_| {
            calls += 1;
            Err(CallFailure::Fatal("API error (status 401): bad key".to_string()))
        });
        assert!(matches!(result, Err(CoreError::LlmUnavailable(_))));
        assert_eq!(calls, 1);
        assert!(sleeper.0.lock().unwrap().is_empty());
    }

    #[test]
    fn retry_after_header_accepts_fractions() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::RETRY_AFTER, header::HeaderValue::from_static("1.5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(1_500)));
        headers.insert(header::RETRY_AFTER, header::HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);
    }
}
