use crate::datam::{Completion, CompletionRequest, ResponsePayload};
use crate::error::CoreError;

use super::{ProviderAdapter, ResponseParser};
use reqwest::header;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

/// Adapter for OpenAI-compatible chat APIs. Groq speaks the same dialect
/// under `/openai/v1`, so both catalogue providers route here.
pub struct OpenAIAdapter {
    pub provider_name: String,
}

/// Parser for OpenAI-compatible responses.
pub struct OpenAIParser;

impl ProviderAdapter for OpenAIAdapter {
    fn get_provider_name(&self) -> &str {
        &self.provider_name
    }

    fn prepare_request_payload(&self, request: &CompletionRequest) -> JsonValue {
        json!({
            "model": request.model_tag,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "top_p": 1,
            "stream": false,
        })
    }

    fn prepare_embedding_request(&self, model_tag: &str, texts: &[String]) -> JsonValue {
        json!({
            "model": model_tag,
            "input": texts,
        })
    }

    fn get_request_url(&self, base_url: &str, _model_tag: &str) -> String {
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

    fn supports_embeddings(&self, _model_tag: &str) -> bool {
        self.provider_name == "OpenAI"
    }
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

impl ResponseParser for OpenAIParser {
    fn parse_response(
        &self,
        raw_response_text: &str,
        input_price: f32,
        output_price: f32,
    ) -> Result<Completion, CoreError> {
        let payload: ResponsePayload = serde_json::from_str(raw_response_text).map_err(|e| {
            CoreError::ResponseParse(format!("Failed to parse completion: {}. Raw: {}", e, raw_response_text))
        })?;

        let text = payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .unwrap_or_default();

        let usage = payload.usage.map(|mut usage| {
            usage.calculate_cost(input_price, output_price);
            usage
        });

        Ok(Completion {
            text,
            model: payload.model,
            usage,
        })
    }

    fn parse_embedding_response(&self, raw_response_text: &str) -> Result<Vec<Vec<f32>>, CoreError> {
        let mut response: EmbeddingResponse = serde_json::from_str(raw_response_text)?;
        // The API may return items out of input order.
        response.data.sort_by_key(|item| item.index);
        Ok(response.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_and_prices_usage() {
        let raw = r#"{
            "id": "chatcmpl-1",
            "model": "llama-3.1-8b-instant",
            "choices": [{"message": {"role": "assistant", "content": "  SQL: SELECT 1;  "}}],
            "usage": {"prompt_tokens": 2000000, "completion_tokens": 0, "total_tokens": 2000000}
        }"#;
        let completion = OpenAIParser.parse_response(raw, 0.05, 0.08).unwrap();
        assert_eq!(completion.text, "SQL: SELECT 1;");
        let cost = completion.usage.unwrap().cost.unwrap();
        assert!((cost.total - 0.1).abs() < 1e-6);
    }

    #[test]
    fn embeddings_are_reordered_by_index() {
        let raw = r#"{"data": [
            {"index": 1, "embedding": [0.0, 1.0]},
            {"index": 0, "embedding": [1.0, 0.0]}
        ]}"#;
        let vectors = OpenAIParser.parse_embedding_response(raw).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn recognises_groq_rate_limit_body() {
        let adapter = OpenAIAdapter {
            provider_name: "Groq".to_string(),
        };
        let body = r#"{"error": {"message": "Rate limit reached", "type": "tokens", "code": "rate_limit_exceeded"}}"#;
        assert!(adapter.is_rate_limit_body(body));
        assert!(!adapter.is_rate_limit_body(r#"{"error": {"code": "invalid_api_key"}}"#));
        assert!(!adapter.is_rate_limit_body("not json"));
    }
}
