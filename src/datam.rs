use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Represents a single message in a conversation.
/// This struct is compatible with OpenAI's format and serves as our standard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Sampling knobs for one completion call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Everything a transport needs to issue one chat completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model_tag: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// The text the model produced, plus what it cost.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub usage: Option<Usage>,
}

/// A single choice within the API response.
#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: Message,
}

/// Cost details for a specific API call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Cost {
    pub input_price: f32,
    pub output_price: f32,
    pub total: f32,
}

/// Token usage statistics for a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<Cost>,
}

impl Usage {
    // Prices are per million tokens.
    pub fn calculate_cost(&mut self, input_price: f32, output_price: f32) {
        let input_cost = (self.prompt_tokens as f32 / 1_000_000.0) * input_price;
        let output_cost = (self.completion_tokens as f32 / 1_000_000.0) * output_price;
        self.cost = Some(Cost {
            input_price,
            output_price,
            total: input_cost + output_cost,
        });
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        if let Some(other_cost) = other.cost {
            if let Some(self_cost) = &mut self.cost {
                self_cost.total += other_cost.total;
            } else {
                self.cost = Some(other_cost);
            }
        }
    }
}

/// Represents the overall structure of a response from a chat completion API.
/// This is based on the standard OpenAI response format.
#[derive(Debug, Deserialize)]
pub struct ResponsePayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Creates a new Message with the "user" role.
pub fn format_user_message(content: String) -> Message {
    Message {
        role: "user".to_string(),
        content: Some(content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates_tokens_and_cost() {
        let mut total = Usage::default();
        let mut first = Usage {
            prompt_tokens: 1_000_000,
            completion_tokens: 0,
            total_tokens: 1_000_000,
            cost: None,
        };
        first.calculate_cost(0.05, 0.08);
        total += first;
        total += Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            cost: None,
        };

        assert_eq!(total.prompt_tokens, 1_000_010);
        assert_eq!(total.total_tokens, 1_000_015);
        let cost = total.cost.expect("cost carried over");
        assert!((cost.total - 0.05).abs() < 1e-6);
    }
}
