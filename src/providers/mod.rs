use crate::datam::{Completion, CompletionRequest};
use crate::error::CoreError;

use reqwest::header;
use serde_json::{json, Value as JsonValue};

/// A trait for provider-specific payload adjustments and request building.
///
/// Each provider family will have its own implementation of this
/// trait to handle its unique API format.
pub trait ProviderAdapter: Send + Sync {
    /// Returns the friendly name of the provider (e.g., "Groq").
    fn get_provider_name(&self) -> &str;

    /// Prepares the chat completion payload specific to the provider's API.
    fn prepare_request_payload(&self, request: &CompletionRequest) -> JsonValue;

    /// Prepares the payload for an embedding request.
    fn prepare_embedding_request(&self, _model_tag: &str, _texts: &[String]) -> JsonValue {
        json!({ "error": "Embeddings not supported by this provider." })
    }

    /// Returns the full, provider-specific chat completion URL.
    fn get_request_url(&self, base_url: &str, model_tag: &str) -> String;

    /// Returns the full URL for an embedding request.
    fn get_embedding_url(&self, base_url: &str, _model_tag: &str) -> String {
        format!("{}/embeddings", base_url.trim_end_matches('/'))
    }

    /// Returns the provider-specific request headers, including authentication.
    fn get_request_headers(&self, api_key: &str) -> Result<header::HeaderMap, CoreError>;

    /// Returns `true` when an error body carries the provider's rate-limit code,
    /// even if the HTTP status was not 429.
    fn is_rate_limit_body(&self, body: &str) -> bool {
        let Ok(value) = serde_json::from_str::<JsonValue>(body) else {
            return false;
        };
        let error = &value["error"];
        [&error["code"], &error["type"], &error["status"]]
            .iter()
            .filter_map(|v| v.as_str())
            .any(|code| {
                matches!(
                    code,
                    "rate_limit_exceeded" | "RATE_LIMIT_EXCEEDED" | "RESOURCE_EXHAUSTED"
                )
            })
    }

    /// Returns `true` if the provider supports embeddings for a given model.
    fn supports_embeddings(&self, _model_tag: &str) -> bool {
        false
    }
}

/// A trait for provider-specific response parsing.
pub trait ResponseParser: Send + Sync {
    /// Parses a raw response body into a `Completion`, pricing its usage.
    fn parse_response(
        &self,
        raw_response_text: &str,
        input_price: f32,
        output_price: f32,
    ) -> Result<Completion, CoreError>;

    /// Parses the response from an embedding call into a list of vectors.
    fn parse_embedding_response(&self, _raw_response_text: &str) -> Result<Vec<Vec<f32>>, CoreError> {
        Err(CoreError::ResponseParse(
            "Embedding parsing not supported by this provider.".to_string(),
        ))
    }
}

pub mod openai;
pub mod unsupported;

use std::sync::Arc;

/// Picks the adapter/parser pair for a catalogue provider name.
pub fn resolve_provider(provider_name: &str) -> (Arc<dyn ProviderAdapter>, Arc<dyn ResponseParser>) {
    match provider_name {
        "OpenAI" | "Groq" => (
            Arc::new(openai::OpenAIAdapter {
                provider_name: provider_name.to_string(),
            }),
            Arc::new(openai::OpenAIParser),
        ),
        _ => (
            Arc::new(unsupported::UnsupportedAdapter {
                provider_name: provider_name.to_string(),
            }),
            Arc::new(unsupported::UnsupportedParser {
                provider_name: provider_name.to_string(),
            }),
        ),
    }
}
