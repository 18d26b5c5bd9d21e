use crate::client::{self, CompletionTransport, HttpTransport, RetryPolicy, Sleeper, ThreadSleeper};
use crate::config;
use crate::datam::{format_user_message, Completion, CompletionRequest, SamplingParams};
use crate::error::CoreError;

use log::debug;
use std::sync::Arc;

/// The shared LLM-call primitive.
///
/// An `Orchestra` is bound to one catalogue model. Every call goes through the
/// same rate-limit aware retry policy, so the SQL generator and the contextual
/// answerer inherit identical backoff behaviour.
#[derive(Clone)]
pub struct Orchestra {
    pub user_facing_model_name: String,
    model_tag: String,
    transport: Arc<dyn CompletionTransport>,
    retry_policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl Orchestra {
    /// Creates an `Orchestra` for a model listed in `models.json`, talking HTTP.
    pub fn new(model_name: &str) -> Result<Self, CoreError> {
        let (provider_name, provider_data, model_details) = config::MODEL_LIBRARY
            .find_model(model_name)
            .ok_or_else(|| {
                CoreError::Config(format!("Model '{}' not found in `models.json`", model_name))
            })?;

        let transport = HttpTransport::for_provider(provider_name, provider_data, model_details)?;
        Ok(Self::with_transport(
            model_name,
            &model_details.model_tag,
            Arc::new(transport),
        ))
    }

    /// Creates an `Orchestra` over an arbitrary transport.
    pub fn with_transport(
        model_name: &str,
        model_tag: &str,
        transport: Arc<dyn CompletionTransport>,
    ) -> Self {
        Self {
            user_facing_model_name: model_name.to_string(),
            model_tag: model_tag.to_string(),
            transport,
            retry_policy: RetryPolicy::default(),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn model_tag(&self) -> &str {
        &self.model_tag
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Sends `prompt` as a single user message.
    ///
    /// Rate limits are retried per the policy; exhaustion is `LlmRateLimited`,
    /// any other provider failure is `LlmUnavailable`.
    pub fn complete(
        &self,
        prompt: &str,
        api_key: &str,
        sampling: SamplingParams,
    ) -> Result<Completion, CoreError> {
        let request = CompletionRequest {
            model_tag: self.model_tag.clone(),
            messages: vec![format_user_message(prompt.to_string())],
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
        };

        debug!(
            "Querying LLM using model: {} ({} prompt chars)",
            self.user_facing_model_name,
            prompt.len()
        );

        let completion = client::call_with_retry(&self.retry_policy, self.sleeper.as_ref(), |_| {
            self.transport.send(&request, api_key)
        })?;

        debug!("LLM response received: {}", completion.text);
        Ok(completion)
    }
}
