//! Retrieval-grounded answers for contextual questions.

use crate::datam::{SamplingParams, Usage};
use crate::error::CoreError;
use crate::orchestra::Orchestra;
use crate::retrieval::RetrievedChunk;

use log::debug;
use serde::Serialize;
use std::sync::Arc;

pub const PREVIEW_CHARS: usize = 400;
pub const SNIPPET_CHARS: usize = 200;

pub const ANSWER_SAMPLING: SamplingParams = SamplingParams {
    temperature: 0.3,
    max_tokens: 512,
};

/// Where part of an answer came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub source: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextualAnswer {
    pub response: String,
    pub sources: Vec<SourceRef>,
    #[serde(skip)]
    pub usage: Option<Usage>,
}

/// First `n` characters of `text`, on a char boundary.
fn prefix_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn in_rank_order(chunks: &[RetrievedChunk]) -> Vec<&RetrievedChunk> {
    let mut ordered: Vec<&RetrievedChunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.rank);
    ordered
}

/// Chunk previews in rank order, separated by blank lines.
pub fn build_context(chunks: &[RetrievedChunk]) -> String {
    in_rank_order(chunks)
        .iter()
        .map(|c| format!("{}...", prefix_chars(&c.text, PREVIEW_CHARS)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn build_prompt(question: &str, context: &str) -> String {
    format!(
        "You are a financial AI assistant that provides concise answers based on retrieved documents.\n\
         Based on the following retrieved information, answer the question:\n\n\
         {}\n\nQuestion: {}",
        context, question
    )
}

/// Sources in the same rank order as the context.
pub fn source_refs(chunks: &[RetrievedChunk]) -> Vec<SourceRef> {
    in_rank_order(chunks)
        .into_iter()
        .map(|c| SourceRef {
            source: c.source.clone(),
            snippet: prefix_chars(&c.text, SNIPPET_CHARS).to_string(),
        })
        .collect()
}

pub struct ContextualAnswerer {
    orchestra: Arc<Orchestra>,
}

impl ContextualAnswerer {
    pub fn new(orchestra: Arc<Orchestra>) -> Self {
        Self { orchestra }
    }

    pub fn model_name(&self) -> &str {
        &self.orchestra.user_facing_model_name
    }

    pub fn answer(
        &self,
        question: &str,
        chunks: &[RetrievedChunk],
        api_key: &str,
    ) -> Result<ContextualAnswer, CoreError> {
        let context = build_context(chunks);
        debug!("Answering from {} chunks ({} context chars)", chunks.len(), context.len());
        let completion = self
            .orchestra
            .complete(&build_prompt(question, &context), api_key, ANSWER_SAMPLING)?;
        Ok(ContextualAnswer {
            response: completion.text.trim().to_string(),
            sources: source_refs(chunks),
            usage: completion.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, rank: usize) -> RetrievedChunk {
        RetrievedChunk {
            text: text.to_string(),
            source: format!("doc{}.txt", rank),
            rank,
        }
    }

    #[test]
    fn context_truncates_previews_and_follows_rank() {
        let long = "x".repeat(500);
        let chunks = vec![chunk("second", 2), chunk(&long, 1)];
        let context = build_context(&chunks);
        let parts: Vec<&str> = context.split("\n\n").collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), PREVIEW_CHARS + 3);
        assert_eq!(parts[1], "second...");
    }

    #[test]
    fn snippets_are_char_safe_prefixes() {
        let text = "é".repeat(250);
        let refs = source_refs(&[chunk(&text, 1)]);
        assert_eq!(refs[0].snippet.chars().count(), SNIPPET_CHARS);
        assert_eq!(refs[0].source, "doc1.txt");
    }

    #[test]
    fn sources_follow_the_context_order() {
        let chunks = vec![chunk("second", 2), chunk("first", 1)];
        assert_eq!(build_context(&chunks), "first...\n\nsecond...");
        let sources: Vec<String> = source_refs(&chunks).into_iter().map(|s| s.source).collect();
        assert_eq!(sources, vec!["doc1.txt".to_string(), "doc2.txt".to_string()]);
    }

    #[test]
    fn prompt_embeds_context_then_question() {
        let prompt = build_prompt("What risks?", "ctx...");
        assert!(prompt.starts_with("You are a financial AI assistant"));
        assert!(prompt.ends_with("ctx...\n\nQuestion: What risks?"));
    }
}
