use std::sync::Arc;

use crate::client::{self, HttpTransport, Jitter, RetryPolicy, Sleeper, ThreadSleeper};
use crate::config;
use crate::error::CoreError;

/// Anything that turns text into fixed-width vectors.
pub trait TextEmbedder: Send + Sync {
    fn dimensions(&self) -> usize;

    /// One vector per input, in input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError>;
}

/// Calls a provider's embeddings endpoint for a catalogue embedder.
pub struct Embedder {
    api_key: String,
    model_tag: String,
    dimensions: usize,
    transport: HttpTransport,
    retry_policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl Embedder {
    /// Creates a new `Embedder` instance for a specific embedding model.
    pub fn new(model_name: &str) -> Result<Self, CoreError> {
        let (provider_name, provider_data, model_details) =
            config::MODEL_LIBRARY.find_embedder(model_name).ok_or_else(|| {
                CoreError::Config(format!("Embedder '{}' not found in config", model_name))
            })?;

        let api_key = config::get_env_var(&provider_data.api_key)?;
        let transport = HttpTransport::for_provider(provider_name, provider_data, model_details)?;

        if !transport.adapter().supports_embeddings(&model_details.model_tag) {
            return Err(CoreError::Config(format!(
                "Model '{}' via provider '{}' does not support embeddings.",
                model_name, provider_name
            )));
        }

        Ok(Self {
            api_key,
            model_tag: model_details.model_tag.clone(),
            dimensions: model_details.dimensions,
            transport,
            retry_policy: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 200,
                max_delay_ms: 2_000,
                jitter: Jitter::Full,
            },
            sleeper: Arc::new(ThreadSleeper),
        })
    }
}

impl TextEmbedder for Embedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = client::call_with_retry(&self.retry_policy, self.sleeper.as_ref(), |_| {
            self.transport.embed(&self.model_tag, texts, &self.api_key)
        })?;
        if vectors.len() != texts.len() {
            return Err(CoreError::ResponseParse(format!(
                "Expected {} embeddings, received {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}
