use super::{ProviderAdapter, ResponseParser};
use crate::datam::{Completion, CompletionRequest};
use crate::error::CoreError;

use log::warn;
use reqwest::header;
use serde_json::{json, Value as JsonValue};

/// An adapter for unsupported providers, providing graceful fallbacks and warnings.
pub struct UnsupportedAdapter {
    pub provider_name: String,
}

impl ProviderAdapter for UnsupportedAdapter {
    fn get_provider_name(&self) -> &str {
        &self.provider_name
    }

    fn prepare_request_payload(&self, request: &CompletionRequest) -> JsonValue {
        warn!(
            "Preparing a generic payload for unsupported provider: {}. This might not work.",
            self.provider_name
        );
        json!({
            "model": request.model_tag,
            "messages": request.messages,
            "temperature": request.temperature,
        })
    }

    fn get_request_url(&self, base_url: &str, _model_tag: &str) -> String {
        warn!("Using generic request URL for unsupported provider: {}.", self.provider_name);
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
    }

    fn get_request_headers(&self, api_key: &str) -> Result<header::HeaderMap, CoreError> {
        let mut headers = header::HeaderMap::new();
        let bearer = header::HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| CoreError::Config(format!("API key is not a valid header value: {}", e)))?;
        headers.insert(header::AUTHORIZATION, bearer);
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        Ok(headers)
    }
}

/// A parser for unsupported providers, which will always return an error.
pub struct UnsupportedParser {
    pub provider_name: String,
}

impl ResponseParser for UnsupportedParser {
    fn parse_response(
        &self,
        raw_response_text: &str,
        _input_price: f32,
        _output_price: f32,
    ) -> Result<Completion, CoreError> {
        Err(CoreError::Config(format!(
            "Provider '{}' is not supported. Raw response: {}",
            self.provider_name, raw_response_text
        )))
    }
}
